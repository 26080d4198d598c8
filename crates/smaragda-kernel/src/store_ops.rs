//! Low-level store operations: res creation, tessella append, replay with
//! branch visibility, and materialization.
//!
//! The `_tx` functions contain the real logic and take open table handles;
//! the async methods open tables and delegate, one transaction per call.

use std::collections::HashMap;

use smaragda_core::tessella::TessellaContent;
use smaragda_core::{ResId, Tessella, TessellaId, Timestamp};
use snafu::ResultExt as _;
use tracing::debug;

use crate::reducers::{
    default_reducer, genus_reducer, process_instance_reducer, EntityState, GenusState,
    ProcessInstanceState,
};
use crate::{
    branches, inputs, res, res_by_genus, tessellae, tessellae_by_res, BranchUnreachableSnafu,
    DbResult, InputRecord, Kernel, KernelResult, PayloadDecodeSnafu, ResNotFoundSnafu, ResRecord,
    TessellaRecord, LOG_TARGET,
};

/// Replay window and filters, applied after branch visibility resolution.
#[derive(Debug, Clone, Default)]
pub struct ReplayFilter {
    /// Branch to replay on; the kernel's current branch when unset.
    pub branch: Option<String>,
    /// Only tessellae with `id` strictly greater than this.
    pub after: Option<TessellaId>,
    /// Only tessellae with `id` less than or equal to this.
    pub up_to: Option<TessellaId>,
    /// Only these kinds.
    pub kinds: Option<Vec<String>>,
    /// Stop after this many.
    pub limit: Option<usize>,
}

impl ReplayFilter {
    pub fn on_branch(branch: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            ..Self::default()
        }
    }

    pub fn up_to(up_to: TessellaId) -> Self {
        Self {
            up_to: Some(up_to),
            ..Self::default()
        }
    }
}

/// Optional knobs for [`Kernel::append`] and the typed wrappers.
#[derive(Debug, Clone, Default)]
pub struct AppendOpts {
    pub branch: Option<String>,
    pub source: Option<String>,
}

impl Kernel {
    // ========================================================================
    // _tx helpers
    // ========================================================================

    pub(crate) fn get_res_tx(
        res_id: ResId,
        res_table: &impl res::ReadableTable,
    ) -> DbResult<Option<ResRecord>> {
        Ok(res_table.get(&res_id)?.map(|g| g.value()))
    }

    /// Highest tessella id in the store; 0 on an empty log.
    pub(crate) fn head_tx(
        tessellae_table: &impl tessellae::ReadableTable,
    ) -> DbResult<TessellaId> {
        Ok(tessellae_table
            .last()?
            .map(|(k, _)| k.value())
            .unwrap_or(0))
    }

    pub(crate) fn load_tessella(id: TessellaId, record: TessellaRecord) -> DbResult<Tessella> {
        let data =
            serde_json::from_str(&record.payload).context(PayloadDecodeSnafu { id })?;
        Ok(Tessella {
            id,
            res_id: record.res_id,
            branch_id: record.branch_id,
            kind: record.kind,
            data,
            created_at: record.created_at,
            source: record.source,
        })
    }

    pub(crate) fn get_tessella_tx(
        id: TessellaId,
        tessellae_table: &impl tessellae::ReadableTable,
    ) -> DbResult<Option<Tessella>> {
        match tessellae_table.get(&id)?.map(|g| g.value()) {
            Some(record) => Ok(Some(Self::load_tessella(id, record)?)),
            None => Ok(None),
        }
    }

    /// Insert a res row with a freshly generated id.
    pub(crate) fn create_res_tx(
        genus_id: ResId,
        branch: &str,
        workspace: Option<&str>,
        now: Timestamp,
        res_table: &mut res::Table,
        res_by_genus_table: &mut res_by_genus::Table,
    ) -> DbResult<ResId> {
        let id = ResId::generate_at(now);
        Self::insert_res_tx(id, genus_id, branch, workspace, now, res_table, res_by_genus_table)?;
        Ok(id)
    }

    /// Insert a res row under a caller-chosen id (sentinel bootstrap, sync
    /// pull). The self-referential `META` row is written like any other;
    /// references are not enforced at this layer.
    pub(crate) fn insert_res_tx(
        id: ResId,
        genus_id: ResId,
        branch: &str,
        workspace: Option<&str>,
        now: Timestamp,
        res_table: &mut res::Table,
        res_by_genus_table: &mut res_by_genus::Table,
    ) -> DbResult<()> {
        res_table.insert(
            &id,
            &ResRecord {
                genus_id,
                branch_id: branch.to_owned(),
                workspace_id: workspace.map(str::to_owned),
                created_at: now,
            },
        )?;
        res_by_genus_table.insert(&(genus_id, id), &())?;
        Ok(())
    }

    /// Append one tessella. Fails with `ResNotFound` when the res does not
    /// exist; otherwise allocates the next global id and updates the
    /// per-res index.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn append_tx(
        res_id: ResId,
        kind: &str,
        data: serde_json::Value,
        branch: &str,
        source: Option<&str>,
        now: Timestamp,
        res_table: &impl res::ReadableTable,
        tessellae_table: &mut tessellae::Table,
        by_res_table: &mut tessellae_by_res::Table,
    ) -> KernelResult<Tessella> {
        if Self::get_res_tx(res_id, res_table)?.is_none() {
            return ResNotFoundSnafu { res_id }.fail();
        }

        let id = Self::head_tx(tessellae_table)? + 1;
        let record = TessellaRecord {
            res_id,
            branch_id: branch.to_owned(),
            kind: kind.to_owned(),
            payload: serde_json::to_string(&data).expect("JSON serialization can't fail"),
            created_at: now,
            source: source.map(str::to_owned),
        };
        tessellae_table.insert(&id, &record)?;
        by_res_table.insert(&(res_id, id), &())?;

        debug!(target: LOG_TARGET, %res_id, id, kind, branch, "Appended tessella");

        Ok(Tessella {
            id,
            res_id,
            branch_id: record.branch_id,
            kind: record.kind,
            data,
            created_at: now,
            source: record.source,
        })
    }

    /// Append a typed payload.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn append_content_tx<T: TessellaContent>(
        res_id: ResId,
        payload: &T,
        branch: &str,
        source: Option<&str>,
        now: Timestamp,
        res_table: &impl res::ReadableTable,
        tessellae_table: &mut tessellae::Table,
        by_res_table: &mut tessellae_by_res::Table,
    ) -> KernelResult<Tessella> {
        Self::append_tx(
            res_id,
            T::KIND,
            payload.to_json(),
            branch,
            source,
            now,
            res_table,
            tessellae_table,
            by_res_table,
        )
    }

    /// Resolve which (branch, max tessella id) pairs are visible from
    /// `branch`: the branch itself unbounded, each ancestor up to the
    /// cumulative minimum of the branch points along the chain.
    pub(crate) fn branch_visibility_tx(
        branch: &str,
        branches_table: &impl branches::ReadableTable,
    ) -> KernelResult<HashMap<String, TessellaId>> {
        let mut visibility = HashMap::new();
        let mut cursor = branch.to_owned();
        let mut limit = TessellaId::MAX;

        loop {
            let Some(record) = branches_table.get(&cursor)?.map(|g| g.value()) else {
                return BranchUnreachableSnafu { branch: cursor }.fail();
            };
            visibility.insert(cursor.clone(), limit);
            match record.parent {
                Some(parent) => {
                    limit = limit.min(record.branch_point);
                    cursor = parent;
                }
                None => break,
            }
        }

        Ok(visibility)
    }

    /// Ordered, branch-visible tessellae of one res. Nonexistent res
    /// replay to an empty vector.
    pub(crate) fn replay_tx(
        res_id: ResId,
        branch: &str,
        filter: &ReplayFilter,
        branches_table: &impl branches::ReadableTable,
        tessellae_table: &impl tessellae::ReadableTable,
        by_res_table: &impl tessellae_by_res::ReadableTable,
    ) -> KernelResult<Vec<Tessella>> {
        let visibility = Self::branch_visibility_tx(branch, branches_table)?;

        let mut out = Vec::new();
        for row in by_res_table.range((res_id, 0)..=(res_id, TessellaId::MAX))? {
            let (key, _) = row?;
            let id = key.value().1;

            if let Some(after) = filter.after {
                if id <= after {
                    continue;
                }
            }
            if let Some(up_to) = filter.up_to {
                if up_to < id {
                    break;
                }
            }

            let record = tessellae_table
                .get(&id)?
                .map(|g| g.value())
                .expect("Indexed tessella must exist in the log");

            match visibility.get(&record.branch_id) {
                Some(limit) if id <= *limit => {}
                _ => continue,
            }

            if let Some(kinds) = &filter.kinds {
                if !kinds.iter().any(|k| *k == record.kind) {
                    continue;
                }
            }

            out.push(Self::load_tessella(id, record)?);

            if let Some(limit) = filter.limit {
                if limit <= out.len() {
                    break;
                }
            }
        }

        Ok(out)
    }

    pub(crate) fn materialize_tx(
        res_id: ResId,
        branch: &str,
        filter: &ReplayFilter,
        branches_table: &impl branches::ReadableTable,
        tessellae_table: &impl tessellae::ReadableTable,
        by_res_table: &impl tessellae_by_res::ReadableTable,
    ) -> KernelResult<EntityState> {
        let log = Self::replay_tx(
            res_id,
            branch,
            filter,
            branches_table,
            tessellae_table,
            by_res_table,
        )?;
        Ok(log.iter().fold(EntityState::default(), default_reducer))
    }

    pub(crate) fn materialize_genus_tx(
        genus_id: ResId,
        branch: &str,
        branches_table: &impl branches::ReadableTable,
        tessellae_table: &impl tessellae::ReadableTable,
        by_res_table: &impl tessellae_by_res::ReadableTable,
    ) -> KernelResult<GenusState> {
        let log = Self::replay_tx(
            genus_id,
            branch,
            &ReplayFilter::default(),
            branches_table,
            tessellae_table,
            by_res_table,
        )?;
        Ok(log.iter().fold(GenusState::default(), genus_reducer))
    }

    pub(crate) fn materialize_process_tx(
        instance_id: ResId,
        branch: &str,
        branches_table: &impl branches::ReadableTable,
        tessellae_table: &impl tessellae::ReadableTable,
        by_res_table: &impl tessellae_by_res::ReadableTable,
    ) -> KernelResult<ProcessInstanceState> {
        let log = Self::replay_tx(
            instance_id,
            branch,
            &ReplayFilter::default(),
            branches_table,
            tessellae_table,
            by_res_table,
        )?;
        Ok(log
            .iter()
            .fold(ProcessInstanceState::default(), process_instance_reducer))
    }

    pub(crate) fn record_input_tx(
        source: Option<&str>,
        kind: &str,
        data: &serde_json::Value,
        now: Timestamp,
        inputs_table: &mut inputs::Table,
    ) -> DbResult<u64> {
        let id = inputs_table.last()?.map(|(k, _)| k.value()).unwrap_or(0) + 1;
        inputs_table.insert(
            &id,
            &InputRecord {
                source: source.map(str::to_owned),
                kind: kind.to_owned(),
                data: serde_json::to_string(data).expect("JSON serialization can't fail"),
                created_at: now,
            },
        )?;
        Ok(id)
    }

    pub(crate) fn resolve_branch(&self, branch: Option<&str>) -> String {
        branch
            .map(str::to_owned)
            .unwrap_or_else(|| self.current_branch())
    }

    // ========================================================================
    // Public API
    // ========================================================================

    /// Create a bare res of the given genus on the current branch, stamped
    /// with the current workspace.
    pub async fn create_res(&self, genus_id: ResId) -> KernelResult<ResId> {
        let branch = self.current_branch();
        let workspace = self.current_workspace();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let mut res_table = tx.open_table(&res::TABLE)?;
            let mut res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
            Ok(Self::create_res_tx(
                genus_id,
                &branch,
                workspace.as_deref(),
                now,
                &mut res_table,
                &mut res_by_genus_table,
            )?)
        })
        .await
    }

    pub async fn get_res(&self, res_id: ResId) -> KernelResult<Option<ResRecord>> {
        self.read_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            Ok(Self::get_res_tx(res_id, &res_table)?)
        })
        .await
    }

    /// Current maximum tessella id (the store's high-water mark).
    pub async fn head(&self) -> KernelResult<TessellaId> {
        self.read_with(|tx| {
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;
            Ok(Self::head_tx(&tessellae_table)?)
        })
        .await
    }

    /// Fetch one tessella by its global id, regardless of branch.
    pub async fn get_tessella(&self, id: TessellaId) -> KernelResult<Option<Tessella>> {
        self.read_with(|tx| {
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;
            Ok(Self::get_tessella_tx(id, &tessellae_table)?)
        })
        .await
    }

    /// Append a raw tessella. The typed operations are preferable; this is
    /// the escape hatch for layers defining their own kinds.
    pub async fn append(
        &self,
        res_id: ResId,
        kind: &str,
        data: serde_json::Value,
        opts: AppendOpts,
    ) -> KernelResult<Tessella> {
        let branch = self.resolve_branch(opts.branch.as_deref());
        let now = Timestamp::now();
        self.write_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            let tessella = Self::append_tx(
                res_id,
                kind,
                data,
                &branch,
                opts.source.as_deref(),
                now,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?;
            self.notify_appended(tx, vec![tessella.clone()]);
            Ok(tessella)
        })
        .await
    }

    /// Ordered visible tessellae of a res under the filter.
    pub async fn replay(
        &self,
        res_id: ResId,
        filter: ReplayFilter,
    ) -> KernelResult<Vec<Tessella>> {
        let branch = self.resolve_branch(filter.branch.as_deref());
        self.read_with(|tx| {
            let branches_table = tx.open_table(&branches::TABLE)?;
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            Self::replay_tx(
                res_id,
                &branch,
                &filter,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )
        })
        .await
    }

    /// Fold the visible tessellae of a res through the default reducer.
    pub async fn materialize(
        &self,
        res_id: ResId,
        filter: ReplayFilter,
    ) -> KernelResult<EntityState> {
        let branch = self.resolve_branch(filter.branch.as_deref());
        self.read_with(|tx| {
            let branches_table = tx.open_table(&branches::TABLE)?;
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            Self::materialize_tx(
                res_id,
                &branch,
                &filter,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )
        })
        .await
    }

    pub async fn materialize_genus(&self, genus_id: ResId) -> KernelResult<GenusState> {
        let branch = self.current_branch();
        self.read_with(|tx| {
            let branches_table = tx.open_table(&branches::TABLE)?;
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            Self::materialize_genus_tx(
                genus_id,
                &branch,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )
        })
        .await
    }

    pub async fn materialize_process_instance(
        &self,
        instance_id: ResId,
    ) -> KernelResult<ProcessInstanceState> {
        let branch = self.current_branch();
        self.read_with(|tx| {
            let branches_table = tx.open_table(&branches::TABLE)?;
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            Self::materialize_process_tx(
                instance_id,
                &branch,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )
        })
        .await
    }

    /// Record a raw external input. Forensic only; nothing reads this on a
    /// hot path.
    pub async fn record_input(
        &self,
        source: Option<&str>,
        kind: &str,
        data: serde_json::Value,
    ) -> KernelResult<u64> {
        let now = Timestamp::now();
        self.write_with(|tx| {
            let mut inputs_table = tx.open_table(&inputs::TABLE)?;
            Ok(Self::record_input_tx(source, kind, &data, now, &mut inputs_table)?)
        })
        .await
    }
}
