//! Health: fold the invariants a res should uphold into an issue list.

use serde::Serialize;
use smaragda_core::defs::AttrType;
use smaragda_core::{ResId, Tessella};

use crate::store_ops::ReplayFilter;
use crate::{
    branches, res, res_by_genus, tessellae, tessellae_by_res, Kernel, KernelResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthIssue {
    pub kind: String,
    pub severity: IssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub issues: Vec<HealthIssue>,
}

impl Kernel {
    fn evaluate_health_tx(
        res_id: ResId,
        branch: &str,
        res_table: &impl res::ReadableTable,
        res_by_genus_table: &impl res_by_genus::ReadableTable,
        branches_table: &impl branches::ReadableTable,
        tessellae_table: &impl tessellae::ReadableTable,
        by_res_table: &impl tessellae_by_res::ReadableTable,
    ) -> KernelResult<HealthReport> {
        let record = Self::require_res_tx(res_id, res_table)?;
        let genus = Self::materialize_genus_tx(
            record.genus_id,
            branch,
            branches_table,
            tessellae_table,
            by_res_table,
        )?;
        let state = Self::materialize_tx(
            res_id,
            branch,
            &ReplayFilter::default(),
            branches_table,
            tessellae_table,
            by_res_table,
        )?;

        let mut issues = Vec::new();

        for (name, def) in &genus.attributes {
            match state.attributes.get(name) {
                None if def.required => issues.push(HealthIssue {
                    kind: "missing_required_attribute".to_owned(),
                    severity: IssueSeverity::Error,
                    message: format!("required attribute {name:?} is not set"),
                }),
                Some(value) if !def.attr_type.matches(value) => issues.push(HealthIssue {
                    kind: "attribute_type_mismatch".to_owned(),
                    severity: IssueSeverity::Error,
                    message: format!(
                        "attribute {name:?} should be {}, found {}",
                        def.attr_type.name(),
                        AttrType::describe(value)
                    ),
                }),
                _ => {}
            }
        }

        if let Some(status) = &state.status {
            if !genus.states.is_empty() && !genus.has_state(status) {
                issues.push(HealthIssue {
                    kind: "undefined_status".to_owned(),
                    severity: IssueSeverity::Error,
                    message: format!("status {status:?} is not a defined state"),
                });
            }
        }

        // Unacknowledged Error entities pointing at this res.
        let res_id_str = res_id.to_string();
        for row in res_by_genus_table
            .range((ResId::ERROR, ResId::ZERO)..=(ResId::ERROR, ResId::MAX))?
        {
            let (key, _) = row?;
            let error_id = key.value().1;
            let error_state = Self::materialize_tx(
                error_id,
                branch,
                &ReplayFilter::default(),
                branches_table,
                tessellae_table,
                by_res_table,
            )?;
            if error_state.attr_str("res_id") != Some(res_id_str.as_str()) {
                continue;
            }
            if error_state.status.as_deref() == Some("unacknowledged") {
                issues.push(HealthIssue {
                    kind: "unacknowledged_error".to_owned(),
                    severity: IssueSeverity::Warning,
                    message: format!(
                        "error {error_id} is unacknowledged: {}",
                        error_state.attr_str("message").unwrap_or_default()
                    ),
                });
            }
        }

        Ok(HealthReport {
            healthy: issues.is_empty(),
            issues,
        })
    }

    pub async fn evaluate_health(&self, res_id: ResId) -> KernelResult<HealthReport> {
        let branch = self.current_branch();
        self.read_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            Self::evaluate_health_tx(
                res_id,
                &branch,
                &res_table,
                &res_by_genus_table,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )
        })
        .await
    }

    /// Every failing entity, optionally narrowed to one genus.
    pub async fn list_unhealthy(
        &self,
        genus_id: Option<ResId>,
    ) -> KernelResult<Vec<(ResId, HealthReport)>> {
        let branch = self.current_branch();
        self.read_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;

            let candidates: Vec<ResId> = match genus_id {
                Some(genus_id) => res_by_genus_table
                    .range((genus_id, ResId::ZERO)..=(genus_id, ResId::MAX))?
                    .map(|row| row.map(|(k, _)| k.value().1))
                    .collect::<Result<_, _>>()?,
                None => {
                    let mut out = Vec::new();
                    for row in res_table.range(..)? {
                        let (key, value) = row?;
                        if value.value().genus_id != ResId::META {
                            out.push(key.value());
                        }
                    }
                    out
                }
            };

            let mut unhealthy = Vec::new();
            for res_id in candidates {
                if !Self::visible_on_branch_tx(
                    res_id,
                    &branch,
                    &branches_table,
                    &tessellae_table,
                    &by_res_table,
                )? {
                    continue;
                }
                let report = Self::evaluate_health_tx(
                    res_id,
                    &branch,
                    &res_table,
                    &res_by_genus_table,
                    &branches_table,
                    &tessellae_table,
                    &by_res_table,
                )?;
                if !report.healthy {
                    unhealthy.push((res_id, report));
                }
            }
            Ok(unhealthy)
        })
        .await
    }

    /// Acknowledge an Error entity. A second acknowledgement has no valid
    /// transition and fails accordingly.
    pub async fn acknowledge_error(&self, error_id: ResId) -> KernelResult<Tessella> {
        self.transition_status(error_id, "acknowledged").await
    }
}
