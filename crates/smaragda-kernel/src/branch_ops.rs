//! Branch lifecycle, conflict detection, and merge.
//!
//! A branch records its parent and the log head at creation time (the
//! branch point). Merging copies the branch-native tessellae onto the
//! target with fresh ids, upserts res rows created on the branch, rebuilds
//! the derived indexes, and retires the source branch. Conflicts are data,
//! not errors: the expected-failure case returns them for inspection, and
//! `force` overrides.

use std::collections::{BTreeMap, HashMap};

use itertools::Itertools as _;
use serde_json::Value;
use smaragda_core::tessella::kind;
use smaragda_core::{ResId, Tessella, TessellaId, Timestamp};
use tracing::{debug, info};

use crate::{
    branches, res, tessellae, tessellae_by_res, BranchRecord, BranchStatus,
    BranchUnreachableSnafu, DuplicateNameSnafu, InvalidDefinitionSnafu, Kernel, KernelResult,
    TessellaRecord, WriteTransactionCtx, MAIN_BRANCH,
};

pub(crate) const LOG_TARGET: &str = "smaragda::branch";

/// One conflicting field between a branch and its merge target.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MergeConflictInfo {
    pub res_id: ResId,
    /// Which piece of state both sides wrote: an attribute key, `status`,
    /// `<feature_id>.<key>`, `member:<role>:<entity>`, or `meta:<key>`.
    pub field: String,
    pub source_value: Value,
    pub target_value: Value,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "merged", rename_all = "snake_case")]
pub enum MergeOutcome {
    #[serde(rename = "true")]
    Merged { copied: usize },
    #[serde(rename = "false")]
    Conflicted { conflicts: Vec<MergeConflictInfo> },
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, Self::Merged { .. })
    }

    pub fn conflicts(&self) -> &[MergeConflictInfo] {
        match self {
            Self::Conflicted { conflicts } => conflicts,
            Self::Merged { .. } => &[],
        }
    }
}

/// Pure observation of what a merge would do.
#[derive(Debug, Clone)]
pub struct BranchComparison {
    pub source_branch: String,
    pub target_branch: String,
    /// Branch-native tessellae that a merge would copy.
    pub candidate_tessellae: Vec<TessellaId>,
    pub conflicts: Vec<MergeConflictInfo>,
}

/// Which piece of state a tessella mutates, for conflict grouping.
fn mutated_field(tessella: &Tessella) -> Option<(String, Value)> {
    let data = &tessella.data;
    let str_of = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_owned);
    match tessella.kind.as_str() {
        kind::ATTRIBUTE_SET => {
            Some((str_of("key")?, data.get("value").cloned().unwrap_or(Value::Null)))
        }
        kind::ATTRIBUTE_REMOVED => Some((str_of("key")?, Value::Null)),
        kind::STATUS_CHANGED => Some((
            "status".to_owned(),
            data.get("status").cloned().unwrap_or(Value::Null),
        )),
        kind::FEATURE_ATTRIBUTE_SET => Some((
            format!("{}.{}", str_of("feature_id")?, str_of("key")?),
            data.get("value").cloned().unwrap_or(Value::Null),
        )),
        kind::FEATURE_STATUS_CHANGED => Some((
            format!("{}.status", str_of("feature_id")?),
            data.get("status").cloned().unwrap_or(Value::Null),
        )),
        kind::MEMBER_ADDED | kind::MEMBER_REMOVED => Some((
            format!("member:{}:{}", str_of("role")?, str_of("entity_id")?),
            Value::String(tessella.kind.clone()),
        )),
        kind::GENUS_META_SET => Some((
            format!("meta:{}", str_of("key")?),
            data.get("value").cloned().unwrap_or(Value::Null),
        )),
        _ => None,
    }
}

impl Kernel {
    pub(crate) fn get_branch_tx(
        name: &str,
        branches_table: &impl branches::ReadableTable,
    ) -> KernelResult<BranchRecord> {
        branches_table
            .get(&name.to_owned())?
            .map(|g| g.value())
            .ok_or_else(|| BranchUnreachableSnafu { branch: name }.build())
    }

    /// Branch-native tessellae past the branch point, plus conflicts
    /// against same-field writes on the target.
    fn detect_conflicts_tx(
        source: &str,
        target: &str,
        branches_table: &impl branches::ReadableTable,
        tessellae_table: &impl tessellae::ReadableTable,
    ) -> KernelResult<(Vec<Tessella>, Vec<MergeConflictInfo>)> {
        let source_record = Self::get_branch_tx(source, branches_table)?;
        Self::get_branch_tx(target, branches_table)?;
        let branch_point = source_record.branch_point;

        let mut candidates = Vec::new();
        let mut target_writes: HashMap<(ResId, String), Value> = HashMap::new();

        for row in tessellae_table.range(branch_point + 1..)? {
            let (key, value) = row?;
            let id = key.value();
            let record: TessellaRecord = value.value();
            if record.branch_id == source {
                candidates.push(Self::load_tessella(id, record)?);
            } else if record.branch_id == target {
                let tessella = Self::load_tessella(id, record)?;
                if let Some((field, value)) = mutated_field(&tessella) {
                    target_writes.insert((tessella.res_id, field), value);
                }
            }
        }

        let mut conflicts: BTreeMap<(ResId, String), MergeConflictInfo> = BTreeMap::new();
        for tessella in &candidates {
            let Some((field, source_value)) = mutated_field(tessella) else {
                continue;
            };
            if let Some(target_value) = target_writes.get(&(tessella.res_id, field.clone())) {
                conflicts.insert(
                    (tessella.res_id, field.clone()),
                    MergeConflictInfo {
                        res_id: tessella.res_id,
                        field,
                        source_value,
                        target_value: target_value.clone(),
                    },
                );
            }
        }

        Ok((candidates, conflicts.into_values().collect()))
    }

    // ========================================================================
    // Public API
    // ========================================================================

    /// Fork a branch off `parent` (the current branch by default),
    /// recording the current log head as the branch point.
    pub async fn create_branch(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> KernelResult<ResId> {
        let parent = self.resolve_branch(parent);
        let workspace = self.current_workspace();
        let now = Timestamp::now();
        let name = name.to_owned();
        self.write_with(|tx| {
            {
                let branches_table = tx.open_table(&branches::TABLE)?;
                if branches_table.get(&name)?.is_some() {
                    return DuplicateNameSnafu {
                        kind: "branch",
                        name,
                    }
                    .fail();
                }
                let parent_record = Self::get_branch_tx(&parent, &branches_table)?;
                if parent_record.status.is_terminal() {
                    return BranchUnreachableSnafu { branch: parent }.fail();
                }
            }

            let branch_point = {
                let tessellae_table = tx.open_table(&tessellae::TABLE)?;
                Self::head_tx(&tessellae_table)?
            };

            let mut attributes = BTreeMap::new();
            attributes.insert("name".to_owned(), Value::String(name.clone()));
            attributes.insert("parent_branch".to_owned(), Value::String(parent.clone()));
            attributes.insert("branch_point".to_owned(), Value::from(branch_point));

            let mut produced = Vec::new();
            let branch_res = Self::create_entity_tx(
                ResId::BRANCH,
                &attributes,
                &parent,
                workspace.as_deref(),
                None,
                now,
                tx,
                &mut produced,
            )?;

            {
                let mut branches_table = tx.open_table(&branches::TABLE)?;
                branches_table.insert(
                    &name,
                    &BranchRecord {
                        res_id: Some(branch_res),
                        parent: Some(parent.clone()),
                        branch_point,
                        status: BranchStatus::Active,
                        created_at: now,
                    },
                )?;
            }

            info!(target: LOG_TARGET, branch = %name, %parent, branch_point, "Branch created");
            self.notify_appended(tx, produced);
            Ok(branch_res)
        })
        .await
    }

    /// Point unqualified operations at another branch. Merged and
    /// discarded branches cannot be switched to.
    pub async fn switch_branch(&self, name: &str) -> KernelResult<()> {
        let record = self
            .read_with(|tx| {
                let branches_table = tx.open_table(&branches::TABLE)?;
                Self::get_branch_tx(name, &branches_table)
            })
            .await?;
        if record.status.is_terminal() {
            return BranchUnreachableSnafu { branch: name }.fail();
        }
        *self.current_branch.write().expect("Locking failed") = name.to_owned();
        Ok(())
    }

    pub async fn discard_branch(&self, name: &str) -> KernelResult<()> {
        if name == MAIN_BRANCH {
            return InvalidDefinitionSnafu {
                reason: "the main branch cannot be discarded",
            }
            .fail();
        }
        let now = Timestamp::now();
        let name = name.to_owned();
        self.write_with(|tx| {
            let (mut record, parent) = {
                let branches_table = tx.open_table(&branches::TABLE)?;
                let record = Self::get_branch_tx(&name, &branches_table)?;
                if record.status.is_terminal() {
                    return BranchUnreachableSnafu { branch: name.clone() }.fail();
                }
                let parent = record.parent.clone().unwrap_or_else(|| MAIN_BRANCH.to_owned());
                (record, parent)
            };

            let mut produced = Vec::new();
            if let Some(branch_res) = record.res_id {
                produced.push(Self::transition_status_tx(
                    branch_res,
                    "discarded",
                    &parent,
                    None,
                    now,
                    tx,
                )?);
            }

            record.status = BranchStatus::Discarded;
            {
                let mut branches_table = tx.open_table(&branches::TABLE)?;
                branches_table.insert(&name, &record)?;
            }

            info!(target: LOG_TARGET, branch = %name, "Branch discarded");
            self.notify_appended(tx, produced);
            Ok(())
        })
        .await?;

        let mut current = self.current_branch.write().expect("Locking failed");
        if *current == name {
            *current = MAIN_BRANCH.to_owned();
        }
        Ok(())
    }

    /// Pure observer: the conflicts a merge of `source` into `target`
    /// would hit.
    pub async fn detect_conflicts(
        &self,
        source: &str,
        target: Option<&str>,
    ) -> KernelResult<Vec<MergeConflictInfo>> {
        Ok(self.compare_branches(source, target).await?.conflicts)
    }

    pub async fn compare_branches(
        &self,
        source: &str,
        target: Option<&str>,
    ) -> KernelResult<BranchComparison> {
        let target = target.unwrap_or(MAIN_BRANCH).to_owned();
        let source = source.to_owned();
        self.read_with(|tx| {
            let branches_table = tx.open_table(&branches::TABLE)?;
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let (candidates, conflicts) =
                Self::detect_conflicts_tx(&source, &target, &branches_table, &tessellae_table)?;
            Ok(BranchComparison {
                source_branch: source.clone(),
                target_branch: target.clone(),
                candidate_tessellae: candidates.iter().map(|t| t.id).collect(),
                conflicts,
            })
        })
        .await
    }

    /// Merge `source` into `target` (`"main"` by default).
    ///
    /// Unless `force` is set, same-field writes on both sides past the
    /// branch point abort the merge and are returned as conflicts. On
    /// success the source's native tessellae are copied onto the target
    /// with fresh ids (payload, timestamps and provenance preserved), res
    /// rows born on the source are upserted onto the target's view, the
    /// relationship and palace indexes are rebuilt, and the source branch
    /// is marked merged.
    pub async fn merge_branch(
        &self,
        source: &str,
        target: Option<&str>,
        force: bool,
    ) -> KernelResult<MergeOutcome> {
        let target = target.unwrap_or(MAIN_BRANCH).to_owned();
        let source = source.to_owned();
        let now = Timestamp::now();
        let outcome = self
            .write_with(|tx| {
                let (candidates, conflicts) = {
                    let branches_table = tx.open_table(&branches::TABLE)?;
                    let tessellae_table = tx.open_table(&tessellae::TABLE)?;

                    let source_record = Self::get_branch_tx(&source, &branches_table)?;
                    if source_record.status.is_terminal() {
                        return BranchUnreachableSnafu { branch: source.clone() }.fail();
                    }
                    let target_record = Self::get_branch_tx(&target, &branches_table)?;
                    if target_record.status.is_terminal() {
                        return BranchUnreachableSnafu { branch: target.clone() }.fail();
                    }

                    Self::detect_conflicts_tx(
                        &source,
                        &target,
                        &branches_table,
                        &tessellae_table,
                    )?
                };

                if !conflicts.is_empty() && !force {
                    debug!(
                        target: LOG_TARGET,
                        %source,
                        target_branch = %target,
                        conflicts = conflicts.len(),
                        "Merge aborted on conflicts"
                    );
                    return Ok(MergeOutcome::Conflicted { conflicts });
                }

                // Copy the branch-native tessellae onto the target.
                let copied = {
                    let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
                    let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
                    let mut next_id = Self::head_tx(&tessellae_table)? + 1;
                    let mut copied = 0usize;
                    for tessella in &candidates {
                        tessellae_table.insert(
                            &next_id,
                            &TessellaRecord {
                                res_id: tessella.res_id,
                                branch_id: target.clone(),
                                kind: tessella.kind.clone(),
                                payload: serde_json::to_string(&tessella.data)
                                    .expect("JSON serialization can't fail"),
                                created_at: tessella.created_at,
                                source: tessella.source.clone(),
                            },
                        )?;
                        by_res_table.insert(&(tessella.res_id, next_id), &())?;
                        next_id += 1;
                        copied += 1;
                    }
                    copied
                };

                // Res rows born on the source become visible on the target.
                {
                    let mut res_table = tx.open_table(&res::TABLE)?;
                    let mut moved = Vec::new();
                    for row in res_table.range(..)? {
                        let (key, value) = row?;
                        let record = value.value();
                        if record.branch_id == source {
                            moved.push((key.value(), record));
                        }
                    }
                    for (res_id, mut record) in moved {
                        record.branch_id = target.clone();
                        res_table.insert(&res_id, &record)?;
                    }
                }

                Self::rebuild_relationship_index_tx(&target, tx)?;
                Self::rebuild_palace_indexes_tx(&target, tx)?;

                // Retire the source branch.
                let branch_res = {
                    let mut branches_table = tx.open_table(&branches::TABLE)?;
                    let mut record = Self::get_branch_tx(&source, &branches_table)?;
                    record.status = BranchStatus::Merged;
                    branches_table.insert(&source, &record)?;
                    record.res_id
                };
                let mut produced = Vec::new();
                if let Some(branch_res) = branch_res {
                    produced.push(Self::transition_status_tx(
                        branch_res, "merged", &target, None, now, tx,
                    )?);
                }

                info!(target: LOG_TARGET, %source, target_branch = %target, copied, "Branch merged");
                self.notify_appended(tx, produced);
                Ok(MergeOutcome::Merged { copied })
            })
            .await?;

        if outcome.is_merged() {
            let mut current = self.current_branch.write().expect("Locking failed");
            if *current == source {
                *current = target;
            }
        }
        Ok(outcome)
    }

    /// Rebuild the relationship member indexes from the log, as seen from
    /// `branch`. Idempotent: every row is reconstructible by replay.
    pub(crate) fn rebuild_relationship_index_tx(
        branch: &str,
        tx: &WriteTransactionCtx,
    ) -> KernelResult<()> {
        use crate::{relationship_members, relationship_members_rev, RelationshipMemberRecord};

        let mut members_table = tx.open_table(&relationship_members::TABLE)?;
        let mut members_rev_table = tx.open_table(&relationship_members_rev::TABLE)?;
        let res_table = tx.open_table(&res::TABLE)?;
        let branches_table = tx.open_table(&branches::TABLE)?;
        let tessellae_table = tx.open_table(&tessellae::TABLE)?;
        let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;

        let stale: Vec<(ResId, ResId)> = members_table
            .range(..)?
            .map_ok(|(k, _)| k.value())
            .collect::<Result<_, _>>()?;
        for key in &stale {
            members_table.remove(key)?;
            members_rev_table.remove(&(key.1, key.0))?;
        }

        // Genus kinds are cached per genus id; most res share few genera.
        let mut genus_kinds: HashMap<ResId, bool> = HashMap::new();
        let all_res: Vec<(ResId, ResId)> = res_table
            .range(..)?
            .map_ok(|(k, v)| (k.value(), v.value().genus_id))
            .collect::<Result<_, _>>()?;

        for (res_id, genus_id) in all_res {
            let is_relationship = match genus_kinds.get(&genus_id) {
                Some(flag) => *flag,
                None => {
                    let genus = Self::materialize_genus_tx(
                        genus_id,
                        branch,
                        &branches_table,
                        &tessellae_table,
                        &by_res_table,
                    )?;
                    let flag = genus.kind() == Some("relationship");
                    genus_kinds.insert(genus_id, flag);
                    flag
                }
            };
            if !is_relationship {
                continue;
            }

            let state = Self::materialize_tx(
                res_id,
                branch,
                &crate::store_ops::ReplayFilter::default(),
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;
            for (role, entities) in &state.members {
                for entity_id in entities {
                    let mut record = members_table
                        .get(&(res_id, *entity_id))?
                        .map(|g| g.value())
                        .unwrap_or_else(RelationshipMemberRecord::default);
                    if !record.roles.iter().any(|r| r == role) {
                        record.roles.push(role.clone());
                    }
                    members_table.insert(&(res_id, *entity_id), &record)?;
                    members_rev_table.insert(&(*entity_id, res_id), &record)?;
                }
            }
        }

        Ok(())
    }
}
