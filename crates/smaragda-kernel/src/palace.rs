//! The three palace index tables.
//!
//! The Palace layer (out of kernel scope) maintains these during normal
//! operation through `upsert`/`remove`; the kernel owns the schema and
//! rebuilds all three on branch merge so entities that became visible
//! appear and archived ones disappear.

use itertools::Itertools as _;
use smaragda_core::ResId;
use tracing::debug;

use crate::store_ops::ReplayFilter;
use crate::{
    branches, palace_npcs, palace_rooms, palace_scrolls, res_by_genus, tessellae,
    tessellae_by_res, Kernel, KernelResult, PalaceIndexRecord, WriteTransactionCtx,
};

pub(crate) const LOG_TARGET: &str = "smaragda::palace";

/// (sentinel genus, index table) pairs, in rebuild order.
const PALACE_INDEXES: [(ResId, &str); 3] = [
    (ResId::PALACE_ROOM, "palace_rooms"),
    (ResId::PALACE_SCROLL, "palace_scrolls"),
    (ResId::PALACE_NPC, "palace_npcs"),
];

impl Kernel {
    fn rebuild_one_palace_index_tx(
        genus_id: ResId,
        index_table: &mut redb_bincode::Table<'_, ResId, PalaceIndexRecord>,
        branch: &str,
        tx: &WriteTransactionCtx,
    ) -> KernelResult<usize> {
        let res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
        let branches_table = tx.open_table(&branches::TABLE)?;
        let tessellae_table = tx.open_table(&tessellae::TABLE)?;
        let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;

        let stale: Vec<ResId> = index_table
            .range(..)?
            .map_ok(|(k, _)| k.value())
            .collect::<Result<_, _>>()?;
        for key in &stale {
            index_table.remove(key)?;
        }

        let mut count = 0usize;
        for row in res_by_genus_table.range((genus_id, ResId::ZERO)..=(genus_id, ResId::MAX))? {
            let (key, _) = row?;
            let res_id = key.value().1;
            let state = Self::materialize_tx(
                res_id,
                branch,
                &ReplayFilter::default(),
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;
            // Archival tombstones are respected: archived entities stay
            // out of the index.
            if state.archived {
                continue;
            }
            index_table.insert(
                &res_id,
                &PalaceIndexRecord {
                    name: state.attr_str("name").unwrap_or_default().to_owned(),
                    branch_id: branch.to_owned(),
                },
            )?;
            count += 1;
        }
        Ok(count)
    }

    /// Rebuild all three palace indexes from the log as seen from `branch`.
    pub(crate) fn rebuild_palace_indexes_tx(
        branch: &str,
        tx: &WriteTransactionCtx,
    ) -> KernelResult<()> {
        for (genus_id, table_name) in PALACE_INDEXES {
            let count = match table_name {
                "palace_rooms" => {
                    let mut table = tx.open_table(&palace_rooms::TABLE)?;
                    Self::rebuild_one_palace_index_tx(genus_id, &mut table, branch, tx)?
                }
                "palace_scrolls" => {
                    let mut table = tx.open_table(&palace_scrolls::TABLE)?;
                    Self::rebuild_one_palace_index_tx(genus_id, &mut table, branch, tx)?
                }
                _ => {
                    let mut table = tx.open_table(&palace_npcs::TABLE)?;
                    Self::rebuild_one_palace_index_tx(genus_id, &mut table, branch, tx)?
                }
            };
            debug!(target: LOG_TARGET, table = table_name, entries = count, "Palace index rebuilt");
        }
        Ok(())
    }

    /// Palace-layer hook: upsert one entry in a palace index outside a
    /// merge. The record's branch tag is the kernel's current branch.
    pub async fn palace_index_upsert(
        &self,
        genus_id: ResId,
        res_id: ResId,
        name: &str,
    ) -> KernelResult<()> {
        let branch = self.current_branch();
        let record = PalaceIndexRecord {
            name: name.to_owned(),
            branch_id: branch,
        };
        self.write_with(|tx| {
            match genus_id {
                ResId::PALACE_ROOM => {
                    tx.open_table(&palace_rooms::TABLE)?.insert(&res_id, &record)?;
                }
                ResId::PALACE_SCROLL => {
                    tx.open_table(&palace_scrolls::TABLE)?.insert(&res_id, &record)?;
                }
                _ => {
                    tx.open_table(&palace_npcs::TABLE)?.insert(&res_id, &record)?;
                }
            }
            Ok(())
        })
        .await
    }

    /// Palace-layer hook: drop one entry (e.g. when a room is archived
    /// between merges).
    pub async fn palace_index_remove(
        &self,
        genus_id: ResId,
        res_id: ResId,
    ) -> KernelResult<()> {
        self.write_with(|tx| {
            match genus_id {
                ResId::PALACE_ROOM => {
                    tx.open_table(&palace_rooms::TABLE)?.remove(&res_id)?;
                }
                ResId::PALACE_SCROLL => {
                    tx.open_table(&palace_scrolls::TABLE)?.remove(&res_id)?;
                }
                _ => {
                    tx.open_table(&palace_npcs::TABLE)?.remove(&res_id)?;
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn palace_index_get(
        &self,
        genus_id: ResId,
        res_id: ResId,
    ) -> KernelResult<Option<PalaceIndexRecord>> {
        self.read_with(|tx| {
            Ok(match genus_id {
                ResId::PALACE_ROOM => tx
                    .open_table(&palace_rooms::TABLE)?
                    .get(&res_id)?
                    .map(|g| g.value()),
                ResId::PALACE_SCROLL => tx
                    .open_table(&palace_scrolls::TABLE)?
                    .get(&res_id)?
                    .map(|g| g.value()),
                _ => tx
                    .open_table(&palace_npcs::TABLE)?
                    .get(&res_id)?
                    .map(|g| g.value()),
            })
        })
        .await
    }
}
