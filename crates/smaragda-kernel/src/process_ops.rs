//! Process instances: multi-lane workflow execution over the log.
//!
//! An instance is a res of its process genus whose state is folded by the
//! process-instance reducer. Advancing is a fixpoint loop: activate every
//! step whose lane predecessor is done, run the ones that run by
//! themselves (fetch, action, gate), and repeat until nothing moves. A
//! failed action step is recorded and advanced past; the process only
//! waits on `active` steps (tasks and unsatisfied gates with live
//! dependencies).

use std::collections::BTreeMap;

use serde_json::Value;
use smaragda_core::defs::{StepDef, StepKind};
use smaragda_core::tessella::{
    AttributeSet, Created, ProcessCancelled, ProcessCompleted, ProcessStarted,
    ProcessStepActivated, ProcessStepCompleted, ProcessStepFailed, TessellaContent,
};
use smaragda_core::{ResId, Tessella, Timestamp};
use tracing::{debug, info};

use crate::reducers::{EntityState, GenusState, ProcessInstanceState, ProcessStatus, StepStatus};
use crate::store_ops::ReplayFilter;
use crate::{
    branches, res, res_by_genus, tessellae, tessellae_by_res, DeprecatedGenusSnafu, Kernel,
    KernelResult, NoValidTransitionSnafu, WriteTransactionCtx, WrongGenusKindSnafu,
};

pub(crate) const LOG_TARGET: &str = "smaragda::process";

/// Result of [`Kernel::complete_task`]: the task itself plus the process
/// instance the completion advanced, if the task belonged to one.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub task_id: ResId,
    pub advanced_instance: Option<ResId>,
}

impl Kernel {
    // Scoped helpers: each opens its tables for the duration of one call,
    // so callers never hold handles across nested operations.

    pub(crate) fn scoped_append<T: TessellaContent>(
        tx: &WriteTransactionCtx,
        res_id: ResId,
        payload: &T,
        branch: &str,
        now: Timestamp,
    ) -> KernelResult<Tessella> {
        let res_table = tx.open_table(&res::TABLE)?;
        let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
        let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
        Self::append_content_tx(
            res_id,
            payload,
            branch,
            None,
            now,
            &res_table,
            &mut tessellae_table,
            &mut by_res_table,
        )
    }

    pub(crate) fn scoped_entity_state(
        tx: &WriteTransactionCtx,
        res_id: ResId,
        branch: &str,
    ) -> KernelResult<EntityState> {
        let branches_table = tx.open_table(&branches::TABLE)?;
        let tessellae_table = tx.open_table(&tessellae::TABLE)?;
        let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
        Self::materialize_tx(
            res_id,
            branch,
            &ReplayFilter::default(),
            &branches_table,
            &tessellae_table,
            &by_res_table,
        )
    }

    pub(crate) fn scoped_instance_state(
        tx: &WriteTransactionCtx,
        instance_id: ResId,
        branch: &str,
    ) -> KernelResult<ProcessInstanceState> {
        let branches_table = tx.open_table(&branches::TABLE)?;
        let tessellae_table = tx.open_table(&tessellae::TABLE)?;
        let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
        Self::materialize_process_tx(
            instance_id,
            branch,
            &branches_table,
            &tessellae_table,
            &by_res_table,
        )
    }

    pub(crate) fn scoped_genus_state(
        tx: &WriteTransactionCtx,
        genus_id: ResId,
        branch: &str,
    ) -> KernelResult<GenusState> {
        let res_table = tx.open_table(&res::TABLE)?;
        let branches_table = tx.open_table(&branches::TABLE)?;
        let tessellae_table = tx.open_table(&tessellae::TABLE)?;
        let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
        Self::require_genus_tx(
            genus_id,
            branch,
            &res_table,
            &branches_table,
            &tessellae_table,
            &by_res_table,
        )
    }

    pub(crate) fn scoped_find_genus(
        tx: &WriteTransactionCtx,
        name: &str,
        branch: &str,
    ) -> KernelResult<Option<(ResId, GenusState)>> {
        let res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
        let branches_table = tx.open_table(&branches::TABLE)?;
        let tessellae_table = tx.open_table(&tessellae::TABLE)?;
        let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
        Self::find_genus_by_name_tx(
            name,
            branch,
            &res_by_genus_table,
            &branches_table,
            &tessellae_table,
            &by_res_table,
        )
    }

    // ========================================================================
    // Step activation
    // ========================================================================

    /// Activate one step whose dependencies are met. Returns `true` when
    /// the instance moved (a new activation, completion or failure was
    /// appended).
    #[allow(clippy::too_many_arguments)]
    fn run_step_tx(
        &self,
        instance_id: ResId,
        step: &StepDef,
        instance: &ProcessInstanceState,
        branch: &str,
        now: Timestamp,
        tx: &WriteTransactionCtx,
        produced: &mut Vec<Tessella>,
    ) -> KernelResult<bool> {
        match &step.kind {
            StepKind::TaskStep {
                task_title,
                priority,
            } => {
                if instance.steps.contains_key(&step.name) {
                    // Already active, waiting on task completion.
                    return Ok(false);
                }
                let mut attributes = BTreeMap::new();
                attributes.insert("title".to_owned(), Value::String(task_title.clone()));
                if let Some(priority) = priority {
                    attributes
                        .insert("priority".to_owned(), Value::String(priority.clone()));
                }
                attributes.insert("step_name".to_owned(), Value::String(step.name.clone()));
                attributes.insert("lane_name".to_owned(), Value::String(step.lane.clone()));

                let task_id = Self::create_entity_tx(
                    ResId::TASK,
                    &attributes,
                    branch,
                    None,
                    None,
                    now,
                    tx,
                    produced,
                )?;

                let mut context = vec![Value::String(instance_id.to_string())];
                if let Some(context_res) = instance.context_res_id {
                    context.push(Value::String(context_res.to_string()));
                }
                produced.push(Self::scoped_append(
                    tx,
                    task_id,
                    &AttributeSet {
                        key: "context_res_ids".to_owned(),
                        value: Value::Array(context),
                    },
                    branch,
                    now,
                )?);

                produced.push(Self::scoped_append(
                    tx,
                    instance_id,
                    &ProcessStepActivated {
                        step: step.name.clone(),
                        task_id: Some(task_id),
                    },
                    branch,
                    now,
                )?);
                Ok(true)
            }

            StepKind::FetchStep { fetch_source } => {
                if instance.steps.contains_key(&step.name) {
                    return Ok(false);
                }
                // Absent context or attribute yields a null result; the
                // step still completes.
                let result = match instance.context_res_id {
                    Some(context_id) => Self::scoped_entity_state(tx, context_id, branch)?
                        .attributes
                        .get(fetch_source)
                        .cloned()
                        .unwrap_or(Value::Null),
                    None => Value::Null,
                };
                produced.push(Self::scoped_append(
                    tx,
                    instance_id,
                    &ProcessStepActivated {
                        step: step.name.clone(),
                        task_id: None,
                    },
                    branch,
                    now,
                )?);
                produced.push(Self::scoped_append(
                    tx,
                    instance_id,
                    &ProcessStepCompleted {
                        step: step.name.clone(),
                        result,
                    },
                    branch,
                    now,
                )?);
                Ok(true)
            }

            StepKind::ActionStep {
                action_name,
                action_resource_bindings,
            } => {
                if instance.steps.contains_key(&step.name) {
                    return Ok(false);
                }
                produced.push(Self::scoped_append(
                    tx,
                    instance_id,
                    &ProcessStepActivated {
                        step: step.name.clone(),
                        task_id: None,
                    },
                    branch,
                    now,
                )?);

                let outcome =
                    self.run_action_step_tx(instance, action_name, action_resource_bindings, branch, now, tx);

                match outcome {
                    Ok(tessella_ids) => {
                        produced.push(Self::scoped_append(
                            tx,
                            instance_id,
                            &ProcessStepCompleted {
                                step: step.name.clone(),
                                result: serde_json::json!({ "tessella_ids": tessella_ids }),
                            },
                            branch,
                            now,
                        )?);
                    }
                    Err(error) => {
                        // Failed steps are recorded and advanced past; the
                        // process does not halt.
                        produced.push(Self::scoped_append(
                            tx,
                            instance_id,
                            &ProcessStepFailed {
                                step: step.name.clone(),
                                error,
                            },
                            branch,
                            now,
                        )?);
                    }
                }
                Ok(true)
            }

            StepKind::GateStep { gate_conditions } => {
                if instance.steps.contains_key(&step.name) {
                    return Ok(false);
                }
                let all_met = gate_conditions.iter().all(|condition| {
                    instance
                        .steps
                        .get(condition)
                        .is_some_and(|s| s.status == StepStatus::Completed)
                });
                if !all_met {
                    return Ok(false);
                }
                produced.push(Self::scoped_append(
                    tx,
                    instance_id,
                    &ProcessStepActivated {
                        step: step.name.clone(),
                        task_id: None,
                    },
                    branch,
                    now,
                )?);
                produced.push(Self::scoped_append(
                    tx,
                    instance_id,
                    &ProcessStepCompleted {
                        step: step.name.clone(),
                        result: Value::Null,
                    },
                    branch,
                    now,
                )?);
                Ok(true)
            }
        }
    }

    /// Resolve bindings and run the named action. Returns the produced
    /// tessella ids, or the failure as a plain string.
    fn run_action_step_tx(
        &self,
        instance: &ProcessInstanceState,
        action_name: &str,
        bindings: &BTreeMap<String, String>,
        branch: &str,
        now: Timestamp,
        tx: &WriteTransactionCtx,
    ) -> Result<Vec<smaragda_core::TessellaId>, String> {
        let Some((action_id, _)) = Self::scoped_find_genus(tx, action_name, branch)
            .map_err(|e| e.to_string())?
        else {
            return Err(format!("action {action_name:?} is not defined"));
        };

        let mut resolved = BTreeMap::new();
        for (role, target) in bindings {
            let res_id = if target == "$context.res_id" {
                instance
                    .context_res_id
                    .ok_or_else(|| format!("binding {role:?} needs a context res"))?
            } else {
                target
                    .parse()
                    .map_err(|_| format!("binding {role:?} is not a res id: {target:?}"))?
            };
            resolved.insert(role.clone(), res_id);
        }

        match self.execute_action_tx(
            action_id,
            &resolved,
            &BTreeMap::new(),
            branch,
            None,
            now,
            tx,
        ) {
            Ok(outcome) => match outcome {
                crate::ActionOutcome::Completed { tessella_ids, .. } => Ok(tessella_ids),
                crate::ActionOutcome::Failed { error } => Err(error),
            },
            Err(err) => Err(err.to_string()),
        }
    }

    /// Drive the instance to a fixpoint: activate/run every step whose
    /// lane predecessor is done, until nothing moves; then complete the
    /// instance if nothing is active anymore.
    fn advance_instance_tx(
        &self,
        instance_id: ResId,
        genus: &GenusState,
        branch: &str,
        now: Timestamp,
        tx: &WriteTransactionCtx,
        produced: &mut Vec<Tessella>,
    ) -> KernelResult<()> {
        let mut lanes: Vec<_> = genus.lanes.values().collect();
        lanes.sort_by_key(|l| l.position);

        loop {
            let instance = Self::scoped_instance_state(tx, instance_id, branch)?;
            if instance.status != ProcessStatus::Running {
                return Ok(());
            }

            let mut progressed = false;
            for lane in &lanes {
                let mut steps: Vec<&StepDef> = genus
                    .steps
                    .values()
                    .filter(|s| s.lane == lane.name)
                    .collect();
                steps.sort_by_key(|s| s.position);

                for step in steps {
                    let step_state = instance.steps.get(&step.name);
                    let done = step_state.is_some_and(|s| {
                        matches!(s.status, StepStatus::Completed | StepStatus::Failed)
                    });
                    if done {
                        continue;
                    }

                    // First unfinished step of the lane; everything after
                    // it waits for it.
                    if self.run_step_tx(
                        instance_id,
                        step,
                        &instance,
                        branch,
                        now,
                        tx,
                        produced,
                    )? {
                        progressed = true;
                    }
                    break;
                }
            }

            if !progressed {
                break;
            }
        }

        let instance = Self::scoped_instance_state(tx, instance_id, branch)?;
        if instance.status == ProcessStatus::Running {
            let any_active = instance
                .steps
                .values()
                .any(|s| s.status == StepStatus::Active);
            if !any_active {
                produced.push(Self::scoped_append(
                    tx,
                    instance_id,
                    &ProcessCompleted {},
                    branch,
                    now,
                )?);
                info!(target: LOG_TARGET, instance = %instance_id, "Process completed");
            }
        }

        Ok(())
    }

    // ========================================================================
    // Public API
    // ========================================================================

    /// Start an instance inside an existing transaction. Callers must not
    /// hold any open table handles.
    pub(crate) fn start_process_tx(
        &self,
        process_genus_id: ResId,
        context_res_id: Option<ResId>,
        branch: &str,
        workspace: Option<&str>,
        now: Timestamp,
        tx: &WriteTransactionCtx,
    ) -> KernelResult<ResId> {
        let genus = Self::scoped_genus_state(tx, process_genus_id, branch)?;
        if genus.kind() != Some("process") {
            return WrongGenusKindSnafu {
                res_id: process_genus_id,
                expected: "process",
            }
            .fail();
        }
        if genus.is_deprecated() {
            return DeprecatedGenusSnafu {
                genus: genus.name().unwrap_or_default().to_owned(),
            }
            .fail();
        }

        let instance_id = {
            let mut res_table = tx.open_table(&res::TABLE)?;
            let mut res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
            Self::create_res_tx(
                process_genus_id,
                branch,
                workspace,
                now,
                &mut res_table,
                &mut res_by_genus_table,
            )?
        };

        let mut produced = vec![
            Self::scoped_append(tx, instance_id, &Created {}, branch, now)?,
            Self::scoped_append(
                tx,
                instance_id,
                &ProcessStarted {
                    process_genus_id,
                    context_res_id,
                },
                branch,
                now,
            )?,
        ];

        debug!(
            target: LOG_TARGET,
            instance = %instance_id,
            genus = %process_genus_id,
            "Process started"
        );

        self.advance_instance_tx(instance_id, &genus, branch, now, tx, &mut produced)?;
        self.notify_appended(tx, produced);
        Ok(instance_id)
    }

    /// Start an instance of a process genus and advance it as far as it
    /// will go on its own.
    pub async fn start_process(
        &self,
        process_genus_id: ResId,
        context_res_id: Option<ResId>,
    ) -> KernelResult<ResId> {
        let branch = self.current_branch();
        let workspace = self.current_workspace();
        let now = Timestamp::now();
        self.write_with(|tx| {
            self.start_process_tx(
                process_genus_id,
                context_res_id,
                &branch,
                workspace.as_deref(),
                now,
                tx,
            )
        })
        .await
    }

    /// Re-run the advance fixpoint; a no-op on instances with nothing to
    /// do.
    pub async fn advance_process(&self, instance_id: ResId) -> KernelResult<()> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let instance = Self::scoped_instance_state(tx, instance_id, &branch)?;
            let Some(genus_id) = instance.process_genus_id else {
                return WrongGenusKindSnafu {
                    res_id: instance_id,
                    expected: "process",
                }
                .fail();
            };
            let genus = Self::scoped_genus_state(tx, genus_id, &branch)?;
            let mut produced = Vec::new();
            self.advance_instance_tx(instance_id, &genus, &branch, now, tx, &mut produced)?;
            self.notify_appended(tx, produced);
            Ok(())
        })
        .await
    }

    /// Complete a task, and when the task belongs to a process instance,
    /// mark the owning step completed and advance the instance.
    pub async fn complete_task(
        &self,
        task_id: ResId,
        result: Option<Value>,
    ) -> KernelResult<TaskCompletion> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let mut produced = vec![Self::transition_status_tx(
                task_id,
                "completed",
                &branch,
                None,
                now,
                tx,
            )?];

            // Locate the owning instance via the task's context.
            let task_state = Self::scoped_entity_state(tx, task_id, &branch)?;
            let context_ids: Vec<ResId> = task_state
                .attributes
                .get("context_res_ids")
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .filter_map(|s| s.parse().ok())
                        .collect()
                })
                .unwrap_or_default();

            let mut advanced_instance = None;
            for candidate in context_ids {
                let instance = Self::scoped_instance_state(tx, candidate, &branch)?;
                let Some(genus_id) = instance.process_genus_id else {
                    continue;
                };
                let Some((step_name, _)) = instance
                    .steps
                    .iter()
                    .find(|(_, s)| s.task_id == Some(task_id))
                else {
                    continue;
                };

                produced.push(Self::scoped_append(
                    tx,
                    candidate,
                    &ProcessStepCompleted {
                        step: step_name.clone(),
                        result: result.clone().unwrap_or(Value::Null),
                    },
                    &branch,
                    now,
                )?);

                let genus = Self::scoped_genus_state(tx, genus_id, &branch)?;
                self.advance_instance_tx(candidate, &genus, &branch, now, tx, &mut produced)?;
                advanced_instance = Some(candidate);
                break;
            }

            self.notify_appended(tx, produced);
            Ok(TaskCompletion {
                task_id,
                advanced_instance,
            })
        })
        .await
    }

    /// Cancel a running instance. Tasks it spawned are untouched; the
    /// consumer may cancel them separately.
    pub async fn cancel_process(
        &self,
        instance_id: ResId,
        reason: Option<&str>,
    ) -> KernelResult<()> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let instance = Self::scoped_instance_state(tx, instance_id, &branch)?;
            if instance.process_genus_id.is_none() {
                return WrongGenusKindSnafu {
                    res_id: instance_id,
                    expected: "process",
                }
                .fail();
            }
            if instance.status != ProcessStatus::Running {
                return NoValidTransitionSnafu {
                    genus: "process instance",
                    from: match instance.status {
                        ProcessStatus::Completed => "completed",
                        ProcessStatus::Cancelled => "cancelled",
                        ProcessStatus::Running => "running",
                    },
                    to: "cancelled",
                }
                .fail();
            }
            let tessella = Self::scoped_append(
                tx,
                instance_id,
                &ProcessCancelled {
                    reason: reason.map(str::to_owned),
                },
                &branch,
                now,
            )?;
            self.notify_appended(tx, vec![tessella]);
            Ok(())
        })
        .await
    }
}
