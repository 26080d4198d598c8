//! Sync primitives: unpushed selection, pulled insertion, and the opaque
//! sync-state scratch pad.
//!
//! The kernel only provides the pull/push building blocks; the wire
//! protocol lives elsewhere. Pulled tessellae are appended with fresh
//! local ids (the local log stays strictly increasing); the peer's ids
//! survive only as its high-water mark in `sync_state`.

use serde::{Deserialize, Serialize};
use smaragda_core::{ResId, Tessella, TessellaId, Timestamp};
use tracing::info;

use crate::{
    res, res_by_genus, sync_state, tessellae, tessellae_by_res, Kernel, KernelResult, ResRecord,
};

pub(crate) const LOG_TARGET: &str = "smaragda::sync";

/// Key tracking the highest local tessella id pushed upstream.
const LAST_PUSHED_KEY: &str = "last_pushed_local_id";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResRow {
    pub id: ResId,
    pub genus_id: ResId,
    pub branch_id: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTessellaRow {
    pub id: TessellaId,
    pub res_id: ResId,
    pub branch_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Payload of one pull from a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPullPayload {
    pub res: Vec<SyncResRow>,
    pub tessellae: Vec<SyncTessellaRow>,
    pub high_water_mark: TessellaId,
}

impl Kernel {
    pub async fn get_sync_state(&self, key: &str) -> KernelResult<Option<String>> {
        let key = key.to_owned();
        self.read_with(|tx| {
            let sync_state_table = tx.open_table(&sync_state::TABLE)?;
            Ok(sync_state_table.get(&key)?.map(|g| g.value()))
        })
        .await
    }

    pub async fn set_sync_state(&self, key: &str, value: &str) -> KernelResult<()> {
        let key = key.to_owned();
        let value = value.to_owned();
        self.write_with(|tx| {
            let mut sync_state_table = tx.open_table(&sync_state::TABLE)?;
            sync_state_table.insert(&key, &value)?;
            Ok(())
        })
        .await
    }

    /// Locally-authored tessellae past the last-pushed watermark: anything
    /// whose source does not carry a `sync:` tag.
    pub async fn get_unpushed_tessellae(&self) -> KernelResult<Vec<Tessella>> {
        self.read_with(|tx| {
            let sync_state_table = tx.open_table(&sync_state::TABLE)?;
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;

            let last_pushed: TessellaId = sync_state_table
                .get(&LAST_PUSHED_KEY.to_owned())?
                .map(|g| g.value())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);

            let mut out = Vec::new();
            for row in tessellae_table.range(last_pushed + 1..)? {
                let (key, value) = row?;
                let record = value.value();
                if record
                    .source
                    .as_deref()
                    .is_some_and(|s| s.starts_with("sync:"))
                {
                    continue;
                }
                out.push(Self::load_tessella(key.value(), record)?);
            }
            Ok(out)
        })
        .await
    }

    /// Res rows referenced by unpushed tessellae, sentinels excluded (the
    /// peer bootstraps its own).
    pub async fn get_unpushed_res(
        &self,
        unpushed: &[Tessella],
    ) -> KernelResult<Vec<(ResId, ResRecord)>> {
        let mut ids: Vec<ResId> = unpushed.iter().map(|t| t.res_id).collect();
        ids.sort_unstable();
        ids.dedup();
        self.read_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let mut out = Vec::new();
            for res_id in ids {
                if res_id.is_sentinel() {
                    continue;
                }
                if let Some(record) = Self::get_res_tx(res_id, &res_table)? {
                    out.push((res_id, record));
                }
            }
            Ok(out)
        })
        .await
    }

    /// Record that everything up to `up_to` has been pushed.
    pub async fn mark_pushed(&self, up_to: TessellaId) -> KernelResult<()> {
        self.set_sync_state(LAST_PUSHED_KEY, &up_to.to_string())
            .await
    }

    /// Insert a pull from a peer atomically: upsert res rows (existing
    /// rows are kept), append tessellae tagged with `source_tag`, and
    /// store the peer's high-water mark.
    pub async fn insert_pulled_data(
        &self,
        payload: SyncPullPayload,
        source_tag: &str,
    ) -> KernelResult<(usize, usize)> {
        let source_tag = source_tag.to_owned();
        self.write_with(|tx| {
            let mut res_table = tx.open_table(&res::TABLE)?;
            let mut res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
            let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            let mut sync_state_table = tx.open_table(&sync_state::TABLE)?;

            let mut res_inserted = 0usize;
            for row in &payload.res {
                if Self::get_res_tx(row.id, &res_table)?.is_some() {
                    continue;
                }
                Self::insert_res_tx(
                    row.id,
                    row.genus_id,
                    &row.branch_id,
                    None,
                    row.created_at,
                    &mut res_table,
                    &mut res_by_genus_table,
                )?;
                res_inserted += 1;
            }

            let mut rows = payload.tessellae.clone();
            rows.sort_by_key(|t| t.id);

            let mut produced = Vec::new();
            for row in rows {
                produced.push(Self::append_tx(
                    row.res_id,
                    &row.kind,
                    row.data,
                    &row.branch_id,
                    Some(source_tag.as_str()),
                    row.created_at,
                    &res_table,
                    &mut tessellae_table,
                    &mut by_res_table,
                )?);
            }
            let tessellae_inserted = produced.len();

            sync_state_table.insert(
                &format!("last_pulled_{source_tag}"),
                &payload.high_water_mark.to_string(),
            )?;

            info!(
                target: LOG_TARGET,
                source = %source_tag,
                res = res_inserted,
                tessellae = tessellae_inserted,
                high_water_mark = payload.high_water_mark,
                "Pulled data inserted"
            );
            self.notify_appended(tx, produced);
            Ok((res_inserted, tessellae_inserted))
        })
        .await
    }
}
