//! Workspace scoping: an opaque tag on res rows plus a small registry.
//!
//! "No workspace" means globally visible. Assignment rewrites the res row
//! only; the log is untouched, so workspace moves are cheap and carry no
//! history.

use std::collections::BTreeMap;

use serde_json::Value;
use smaragda_core::{ResId, Timestamp};
use tracing::{debug, info};

use crate::{
    res, res_by_genus, tessellae, tessellae_by_res, branches, workspaces, DuplicateNameSnafu,
    Kernel, KernelResult, WorkspaceNotEmptySnafu, WorkspaceNotFoundSnafu, WorkspaceRecord,
};

pub(crate) const LOG_TARGET: &str = "smaragda::workspace";

impl Kernel {
    fn require_workspace_tx(
        name: &str,
        workspaces_table: &impl workspaces::ReadableTable,
    ) -> KernelResult<WorkspaceRecord> {
        workspaces_table
            .get(&name.to_owned())?
            .map(|g| g.value())
            .ok_or_else(|| WorkspaceNotFoundSnafu { workspace: name }.build())
    }

    fn res_in_workspace_tx(
        name: &str,
        res_table: &impl res::ReadableTable,
    ) -> KernelResult<Vec<ResId>> {
        let mut out = Vec::new();
        for row in res_table.range(..)? {
            let (key, value) = row?;
            if value.value().workspace_id.as_deref() == Some(name) {
                out.push(key.value());
            }
        }
        Ok(out)
    }

    fn set_res_workspace_tx(
        res_id: ResId,
        workspace: Option<&str>,
        res_table: &mut res::Table,
    ) -> KernelResult<()> {
        let mut record = Self::require_res_tx(res_id, res_table)?;
        record.workspace_id = workspace.map(str::to_owned);
        res_table.insert(&res_id, &record)?;
        Ok(())
    }

    pub async fn create_workspace(&self, name: &str) -> KernelResult<ResId> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        let name = name.to_owned();
        self.write_with(|tx| {
            {
                let workspaces_table = tx.open_table(&workspaces::TABLE)?;
                if workspaces_table.get(&name)?.is_some() {
                    return DuplicateNameSnafu {
                        kind: "workspace",
                        name,
                    }
                    .fail();
                }
            }

            let mut attributes = BTreeMap::new();
            attributes.insert("name".to_owned(), Value::String(name.clone()));
            let mut produced = Vec::new();
            let res_id = Self::create_entity_tx(
                ResId::WORKSPACE,
                &attributes,
                &branch,
                None,
                None,
                now,
                tx,
                &mut produced,
            )?;

            {
                let mut workspaces_table = tx.open_table(&workspaces::TABLE)?;
                workspaces_table.insert(
                    &name,
                    &WorkspaceRecord {
                        res_id,
                        created_at: now,
                    },
                )?;
            }

            info!(target: LOG_TARGET, workspace = %name, "Workspace created");
            self.notify_appended(tx, produced);
            Ok(res_id)
        })
        .await
    }

    /// Workspace stamped onto new entities and used to scope listing.
    /// `None` clears the scope.
    pub async fn set_current_workspace(&self, name: Option<&str>) -> KernelResult<()> {
        if let Some(name) = name {
            self.read_with(|tx| {
                let workspaces_table = tx.open_table(&workspaces::TABLE)?;
                Self::require_workspace_tx(name, &workspaces_table)?;
                Ok(())
            })
            .await?;
        }
        *self.current_workspace.write().expect("Locking failed") = name.map(str::to_owned);
        Ok(())
    }

    /// Move one res into a workspace (or back to global with `None`).
    pub async fn assign_workspace(
        &self,
        res_id: ResId,
        workspace: Option<&str>,
    ) -> KernelResult<()> {
        self.write_with(|tx| {
            if let Some(workspace) = workspace {
                let workspaces_table = tx.open_table(&workspaces::TABLE)?;
                Self::require_workspace_tx(workspace, &workspaces_table)?;
            }
            let mut res_table = tx.open_table(&res::TABLE)?;
            Self::set_res_workspace_tx(res_id, workspace, &mut res_table)
        })
        .await
    }

    /// Move every res of a genus into a workspace. Returns how many moved.
    pub async fn assign_workspace_by_genus(
        &self,
        genus_id: ResId,
        workspace: Option<&str>,
    ) -> KernelResult<usize> {
        self.write_with(|tx| {
            if let Some(workspace) = workspace {
                let workspaces_table = tx.open_table(&workspaces::TABLE)?;
                Self::require_workspace_tx(workspace, &workspaces_table)?;
            }
            let targets: Vec<ResId> = {
                let res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
                res_by_genus_table
                    .range((genus_id, ResId::ZERO)..=(genus_id, ResId::MAX))?
                    .map(|row| row.map(|(k, _)| k.value().1))
                    .collect::<Result<_, _>>()?
            };
            let mut res_table = tx.open_table(&res::TABLE)?;
            for res_id in &targets {
                Self::set_res_workspace_tx(*res_id, workspace, &mut res_table)?;
            }
            debug!(target: LOG_TARGET, genus = %genus_id, moved = targets.len(), "Workspace assignment by genus");
            Ok(targets.len())
        })
        .await
    }

    /// Move every entity of every genus in a taxonomy into a workspace.
    pub async fn assign_workspace_by_taxonomy(
        &self,
        taxonomy_id: ResId,
        workspace: Option<&str>,
    ) -> KernelResult<usize> {
        let branch = self.current_branch();
        self.write_with(|tx| {
            if let Some(workspace) = workspace {
                let workspaces_table = tx.open_table(&workspaces::TABLE)?;
                Self::require_workspace_tx(workspace, &workspaces_table)?;
            }

            let genera: Vec<ResId> = {
                let res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
                let branches_table = tx.open_table(&branches::TABLE)?;
                let tessellae_table = tx.open_table(&tessellae::TABLE)?;
                let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;

                let mut genera = Vec::new();
                for row in res_by_genus_table
                    .range((ResId::META, ResId::ZERO)..=(ResId::META, ResId::MAX))?
                {
                    let (key, _) = row?;
                    let genus_id = key.value().1;
                    let state = Self::materialize_genus_tx(
                        genus_id,
                        &branch,
                        &branches_table,
                        &tessellae_table,
                        &by_res_table,
                    )?;
                    if state.taxonomy_id() == Some(taxonomy_id) {
                        genera.push(genus_id);
                    }
                }
                genera
            };

            let mut moved = 0usize;
            for genus_id in genera {
                let targets: Vec<ResId> = {
                    let res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
                    res_by_genus_table
                        .range((genus_id, ResId::ZERO)..=(genus_id, ResId::MAX))?
                        .map(|row| row.map(|(k, _)| k.value().1))
                        .collect::<Result<_, _>>()?
                };
                let mut res_table = tx.open_table(&res::TABLE)?;
                for res_id in &targets {
                    Self::set_res_workspace_tx(*res_id, workspace, &mut res_table)?;
                }
                moved += targets.len();
            }
            Ok(moved)
        })
        .await
    }

    /// Reassign everything in `src` to `tgt` and delete `src`.
    pub async fn merge_workspaces(&self, src: &str, tgt: &str) -> KernelResult<usize> {
        let src = src.to_owned();
        let tgt = tgt.to_owned();
        self.write_with(|tx| {
            {
                let workspaces_table = tx.open_table(&workspaces::TABLE)?;
                Self::require_workspace_tx(&src, &workspaces_table)?;
                Self::require_workspace_tx(&tgt, &workspaces_table)?;
            }

            let mut res_table = tx.open_table(&res::TABLE)?;
            let targets = Self::res_in_workspace_tx(&src, &res_table)?;
            for res_id in &targets {
                Self::set_res_workspace_tx(*res_id, Some(&tgt), &mut res_table)?;
            }
            drop(res_table);

            let mut workspaces_table = tx.open_table(&workspaces::TABLE)?;
            workspaces_table.remove(&src)?;

            info!(target: LOG_TARGET, %src, %tgt, moved = targets.len(), "Workspaces merged");
            Ok(targets.len())
        })
        .await
    }

    /// Delete an empty workspace. Rejects one that still scopes any res.
    pub async fn delete_workspace(&self, name: &str) -> KernelResult<()> {
        let name = name.to_owned();
        self.write_with(|tx| {
            {
                let workspaces_table = tx.open_table(&workspaces::TABLE)?;
                Self::require_workspace_tx(&name, &workspaces_table)?;
            }
            let count = {
                let res_table = tx.open_table(&res::TABLE)?;
                Self::res_in_workspace_tx(&name, &res_table)?.len()
            };
            if 0 < count {
                return WorkspaceNotEmptySnafu {
                    workspace: name.clone(),
                    count,
                }
                .fail();
            }
            let mut workspaces_table = tx.open_table(&workspaces::TABLE)?;
            workspaces_table.remove(&name)?;
            Ok(())
        })
        .await?;

        let mut current = self.current_workspace.write().expect("Locking failed");
        if current.as_deref() == Some(&name) {
            *current = None;
        }
        Ok(())
    }
}
