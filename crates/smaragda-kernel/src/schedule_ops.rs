//! Cron schedules: entities under the `CRON_SCHEDULE` sentinel and the
//! tick loop that fires them.
//!
//! Recurring schedules fire when their expression matches the tick's UTC
//! minute, at most once per minute (guarded by `last_fired_at`, written in
//! the same transaction as the firing). One-shot schedules fire once their
//! `scheduled_at` arrives, then retire. Per-schedule failures are data in
//! the tick report; the loop always finishes the batch.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use smaragda_core::cron::CronExpr;
use smaragda_core::{ResId, Timestamp};
use snafu::ResultExt as _;
use tracing::{debug, info, warn};

use crate::action_ops::ActionOutcome;
use crate::reducers::EntityState;
use crate::store_ops::ReplayFilter;
use crate::{
    branches, res_by_genus, tessellae, tessellae_by_res, DuplicateNameSnafu,
    InvalidCronExpressionSnafu, InvalidDefinitionSnafu, Kernel, KernelResult,
    WriteTransactionCtx, WrongGenusKindSnafu,
};

pub(crate) const LOG_TARGET: &str = "smaragda::cron";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleTarget {
    Action,
    Process,
}

impl ScheduleTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Process => "process",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "action" => Some(Self::Action),
            "process" => Some(Self::Process),
            _ => None,
        }
    }
}

/// Input to [`Kernel::create_schedule`]. One of `expression` (recurring)
/// or `scheduled_at` (one-shot) must be set.
#[derive(Debug, Clone, bon::Builder)]
pub struct ScheduleDef {
    #[builder(into)]
    pub name: String,
    #[builder(into)]
    pub expression: Option<String>,
    pub scheduled_at: Option<Timestamp>,
    pub target_type: ScheduleTarget,
    pub target_genus_id: ResId,
    pub target_config: Option<Value>,
}

/// What firing one schedule did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TickOutcome {
    Action(ActionOutcome),
    ProcessStarted { instance_id: ResId },
    Error { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FiredSchedule {
    pub schedule_id: ResId,
    pub name: String,
    pub target_type: ScheduleTarget,
    pub outcome: TickOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    /// Active schedules examined.
    pub checked: usize,
    pub fired: Vec<FiredSchedule>,
    /// Active schedules that did not fire this tick.
    pub skipped: usize,
}

impl Kernel {
    fn scan_schedules_tx(
        branch: &str,
        tx: &WriteTransactionCtx,
    ) -> KernelResult<Vec<(ResId, EntityState)>> {
        let res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
        let branches_table = tx.open_table(&branches::TABLE)?;
        let tessellae_table = tx.open_table(&tessellae::TABLE)?;
        let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;

        let mut out = Vec::new();
        for row in res_by_genus_table
            .range((ResId::CRON_SCHEDULE, ResId::ZERO)..=(ResId::CRON_SCHEDULE, ResId::MAX))?
        {
            let (key, _) = row?;
            let schedule_id = key.value().1;
            let state = Self::materialize_tx(
                schedule_id,
                branch,
                &ReplayFilter::default(),
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;
            out.push((schedule_id, state));
        }
        Ok(out)
    }

    /// Create a schedule entity. Names are unique among schedules; the
    /// expression is parsed up front so a bad one never reaches the tick
    /// loop.
    pub async fn create_schedule(&self, def: ScheduleDef) -> KernelResult<ResId> {
        if let Some(expression) = &def.expression {
            expression
                .parse::<CronExpr>()
                .context(InvalidCronExpressionSnafu)?;
        }
        if def.expression.is_none() && def.scheduled_at.is_none() {
            return InvalidDefinitionSnafu {
                reason: "schedule needs an expression or a scheduled_at",
            }
            .fail();
        }

        let branch = self.current_branch();
        let workspace = self.current_workspace();
        let now = Timestamp::now();
        self.write_with(|tx| {
            for (_, state) in Self::scan_schedules_tx(&branch, tx)? {
                if state.attr_str("name") == Some(def.name.as_str()) {
                    return DuplicateNameSnafu {
                        kind: "schedule",
                        name: def.name.clone(),
                    }
                    .fail();
                }
            }

            // The target genus must exist and be of the declared kind.
            let target_genus = Self::scoped_genus_state(tx, def.target_genus_id, &branch)?;
            let expected = def.target_type.as_str();
            if target_genus.kind() != Some(expected) {
                return WrongGenusKindSnafu {
                    res_id: def.target_genus_id,
                    expected,
                }
                .fail();
            }

            let mut attributes = BTreeMap::new();
            attributes.insert("name".to_owned(), Value::String(def.name.clone()));
            if let Some(expression) = &def.expression {
                attributes
                    .insert("expression".to_owned(), Value::String(expression.clone()));
            }
            if let Some(scheduled_at) = def.scheduled_at {
                attributes.insert(
                    "scheduled_at".to_owned(),
                    Value::String(scheduled_at.to_string()),
                );
            }
            attributes.insert(
                "target_type".to_owned(),
                Value::String(def.target_type.as_str().to_owned()),
            );
            attributes.insert(
                "target_genus_id".to_owned(),
                Value::String(def.target_genus_id.to_string()),
            );
            if let Some(config) = &def.target_config {
                attributes.insert("target_config".to_owned(), config.clone());
            }

            let mut produced = Vec::new();
            let schedule_id = Self::create_entity_tx(
                ResId::CRON_SCHEDULE,
                &attributes,
                &branch,
                workspace.as_deref(),
                None,
                now,
                tx,
                &mut produced,
            )?;

            info!(target: LOG_TARGET, schedule = %schedule_id, name = %def.name, "Schedule created");
            self.notify_appended(tx, produced);
            Ok(schedule_id)
        })
        .await
    }

    pub async fn pause_schedule(&self, schedule_id: ResId) -> KernelResult<()> {
        self.transition_status(schedule_id, "paused").await?;
        Ok(())
    }

    pub async fn resume_schedule(&self, schedule_id: ResId) -> KernelResult<()> {
        self.transition_status(schedule_id, "active").await?;
        Ok(())
    }

    pub async fn retire_schedule(&self, schedule_id: ResId) -> KernelResult<()> {
        self.transition_status(schedule_id, "retired").await?;
        Ok(())
    }

    fn fire_schedule_tx(
        &self,
        schedule_id: ResId,
        state: &EntityState,
        target: ScheduleTarget,
        branch: &str,
        now: Timestamp,
        tx: &WriteTransactionCtx,
    ) -> TickOutcome {
        let Some(target_genus_id) = state
            .attr_str("target_genus_id")
            .and_then(|s| s.parse::<ResId>().ok())
        else {
            return TickOutcome::Error {
                error: "schedule has no valid target_genus_id".to_owned(),
            };
        };
        let config = state
            .attributes
            .get("target_config")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        match target {
            ScheduleTarget::Action => {
                let mut bindings = BTreeMap::new();
                if let Some(map) = config.get("resource_bindings").and_then(Value::as_object) {
                    for (role, value) in map {
                        let Some(res_id) =
                            value.as_str().and_then(|s| s.parse::<ResId>().ok())
                        else {
                            return TickOutcome::Error {
                                error: format!("binding {role:?} is not a res id"),
                            };
                        };
                        bindings.insert(role.clone(), res_id);
                    }
                }
                let params: BTreeMap<String, Value> = config
                    .get("params")
                    .and_then(Value::as_object)
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();

                match self.execute_action_tx(
                    target_genus_id,
                    &bindings,
                    &params,
                    branch,
                    Some("cron"),
                    now,
                    tx,
                ) {
                    Ok(outcome) => TickOutcome::Action(outcome),
                    Err(err) => TickOutcome::Error {
                        error: err.to_string(),
                    },
                }
            }
            ScheduleTarget::Process => {
                let context_res_id = config
                    .get("context_res_id")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok());
                match self.start_process_tx(
                    target_genus_id,
                    context_res_id,
                    branch,
                    None,
                    now,
                    tx,
                ) {
                    Ok(instance_id) => TickOutcome::ProcessStarted { instance_id },
                    Err(err) => {
                        warn!(target: LOG_TARGET, schedule = %schedule_id, %err, "Schedule target failed");
                        TickOutcome::Error {
                            error: err.to_string(),
                        }
                    }
                }
            }
        }
    }

    /// One pass over the active schedules at instant `now`.
    ///
    /// Recurring schedules fire when their expression matches `now` and
    /// they have not already fired in the same UTC minute; one-shot
    /// schedules fire once `now` reaches `scheduled_at` and then retire.
    pub async fn tick_cron(&self, now: Timestamp) -> KernelResult<TickReport> {
        let branch = self.current_branch();
        self.write_with(|tx| {
            let schedules = Self::scan_schedules_tx(&branch, tx)?;

            let mut checked = 0usize;
            let mut fired = Vec::new();
            let mut skipped = 0usize;

            for (schedule_id, state) in schedules {
                if state.status.as_deref() != Some("active") {
                    continue;
                }
                checked += 1;

                let name = state.attr_str("name").unwrap_or_default().to_owned();
                let Some(target) = state
                    .attr_str("target_type")
                    .and_then(ScheduleTarget::parse)
                else {
                    fired.push(FiredSchedule {
                        schedule_id,
                        name,
                        target_type: ScheduleTarget::Action,
                        outcome: TickOutcome::Error {
                            error: "schedule has no valid target_type".to_owned(),
                        },
                    });
                    continue;
                };

                let scheduled_at: Option<Timestamp> = state
                    .attr_str("scheduled_at")
                    .and_then(|s| s.parse().ok());
                let last_fired: Option<Timestamp> = state
                    .attr_str("last_fired_at")
                    .and_then(|s| s.parse().ok());

                let one_shot = scheduled_at.is_some();
                let should_fire = if let Some(scheduled_at) = scheduled_at {
                    scheduled_at <= now
                } else {
                    let Some(expression) = state.attr_str("expression") else {
                        skipped += 1;
                        continue;
                    };
                    let Ok(expr) = expression.parse::<CronExpr>() else {
                        fired.push(FiredSchedule {
                            schedule_id,
                            name,
                            target_type: target,
                            outcome: TickOutcome::Error {
                                error: format!("invalid cron expression {expression:?}"),
                            },
                        });
                        continue;
                    };
                    expr.matches(now)
                        && !last_fired.is_some_and(|last| last.same_utc_minute(now))
                };

                if !should_fire {
                    skipped += 1;
                    continue;
                }

                let outcome =
                    self.fire_schedule_tx(schedule_id, &state, target, &branch, now, tx);

                // last_fired_at guards the once-per-minute contract; it is
                // written in the same transaction as the firing.
                let mark = Self::set_attribute_tx(
                    schedule_id,
                    "last_fired_at",
                    Value::String(now.to_string()),
                    &branch,
                    Some("cron"),
                    now,
                    tx,
                )?;
                self.notify_appended(tx, vec![mark]);

                if one_shot {
                    let retired = Self::transition_status_tx(
                        schedule_id,
                        "retired",
                        &branch,
                        Some("cron"),
                        now,
                        tx,
                    )?;
                    self.notify_appended(tx, vec![retired]);
                }

                debug!(target: LOG_TARGET, schedule = %schedule_id, name = %name, "Schedule fired");
                fired.push(FiredSchedule {
                    schedule_id,
                    name,
                    target_type: target,
                    outcome,
                });
            }

            Ok(TickReport {
                checked,
                fired,
                skipped,
            })
        })
        .await
    }
}
