//! Action execution: resource binding, parameter checks, token
//! substitution, and the typed side-effect executor.
//!
//! `execute_action` validates everything it can before the first append,
//! then runs handler steps sequentially. A failing step aborts the run and
//! surfaces as `ActionOutcome::Failed`; tessellae already written stay in
//! the log (it is append-only) but the invocation is not recorded in
//! `actions_taken`, so history never points at a half-run action.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::{json, Value};
use smaragda_core::defs::SideEffectDef;
use smaragda_core::tessella::AttributeSet;
use smaragda_core::{ResId, Tessella, TessellaId, Timestamp};
use smaragda_util_error::FmtCompact as _;
use tracing::{debug, warn};

use crate::store_ops::ReplayFilter;
use crate::{
    actions_taken, branches, res, res_by_genus, tessella_actions, tessellae, tessellae_by_res,
    ActionTakenRecord, DeprecatedGenusSnafu, GenusNotFoundSnafu, Kernel, KernelResult,
    MissingRequiredParameterSnafu, MissingResourceBindingSnafu, ResourceGenusMismatchSnafu,
    ResourceStatusMismatchSnafu, TypeMismatchSnafu, UndefinedTokenReferenceSnafu,
    WriteTransactionCtx, WrongGenusKindSnafu,
};

pub(crate) const LOG_TARGET: &str = "smaragda::action";

/// Result of one action invocation. Failures are data, not errors: batch
/// callers (schedules, processes) keep going.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Completed {
        action_taken_id: u64,
        tessella_ids: Vec<TessellaId>,
    },
    Failed {
        error: String,
    },
}

impl ActionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { error } => Some(error),
            Self::Completed { .. } => None,
        }
    }
}

/// One replayed tessella labeled with the action that produced it, if any.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub tessella: Tessella,
    pub action_taken_id: Option<u64>,
    pub action_genus_id: Option<ResId>,
}

// ============================================================================
// Token grammar: $now, $res.<name>.id, $param.<name>
// ============================================================================

fn ident_len(s: &str) -> usize {
    s.bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-')
        .count()
}

fn collect_tokens_str(s: &str, res_refs: &mut BTreeSet<String>, param_refs: &mut BTreeSet<String>) {
    let mut i = 0;
    while let Some(offset) = s[i..].find('$') {
        let at = i + offset;
        let rest = &s[at..];
        if let Some(tail) = rest.strip_prefix("$res.") {
            let n = ident_len(tail);
            if n > 0 && tail[n..].starts_with(".id") {
                res_refs.insert(tail[..n].to_owned());
                i = at + 5 + n + 3;
                continue;
            }
        } else if let Some(tail) = rest.strip_prefix("$param.") {
            let n = ident_len(tail);
            if n > 0 {
                param_refs.insert(tail[..n].to_owned());
                i = at + 7 + n;
                continue;
            }
        }
        i = at + 1;
    }
}

/// All `$res.*`/`$param.*` references anywhere inside a JSON value.
/// Definition-time validation rejects names the action does not declare.
pub(crate) fn handler_tokens(value: &Value) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut res_refs = BTreeSet::new();
    let mut param_refs = BTreeSet::new();
    let mut stack = vec![value];
    while let Some(value) = stack.pop() {
        match value {
            Value::String(s) => collect_tokens_str(s, &mut res_refs, &mut param_refs),
            Value::Object(map) => stack.extend(map.values()),
            Value::Array(items) => stack.extend(items.iter()),
            _ => {}
        }
    }
    (res_refs, param_refs)
}

struct TokenCtx<'a> {
    now: String,
    resources: &'a BTreeMap<String, ResId>,
    params: &'a BTreeMap<String, Value>,
}

impl TokenCtx<'_> {
    fn value_to_text(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Textual interpolation for tokens embedded in a larger string.
    /// Unknown tokens stay literal.
    fn interpolate(&self, s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        let mut i = 0;
        while let Some(offset) = s[i..].find('$') {
            let at = i + offset;
            out.push_str(&s[i..at]);
            let rest = &s[at..];

            if let Some(after) = rest.strip_prefix("$now") {
                // "$nowhere" is not a token
                if after.bytes().next().is_none_or(|b| !b.is_ascii_alphanumeric()) {
                    out.push_str(&self.now);
                    i = at + 4;
                    continue;
                }
            }
            if let Some(tail) = rest.strip_prefix("$res.") {
                let n = ident_len(tail);
                if n > 0 && tail[n..].starts_with(".id") {
                    if let Some(res_id) = self.resources.get(&tail[..n]) {
                        out.push_str(&res_id.to_string());
                        i = at + 5 + n + 3;
                        continue;
                    }
                }
            }
            if let Some(tail) = rest.strip_prefix("$param.") {
                let n = ident_len(tail);
                if n > 0 {
                    if let Some(value) = self.params.get(&tail[..n]) {
                        out.push_str(&Self::value_to_text(value));
                        i = at + 7 + n;
                        continue;
                    }
                }
            }

            out.push('$');
            i = at + 1;
        }
        out.push_str(&s[i..]);
        out
    }

    fn substitute_string(&self, s: &str) -> Value {
        // A string that is exactly one token keeps the substituted type
        // (number params stay numbers).
        if let Some(name) = s.strip_prefix("$param.") {
            if ident_len(name) == name.len() && !name.is_empty() {
                if let Some(value) = self.params.get(name) {
                    return value.clone();
                }
            }
        }
        Value::String(self.interpolate(s))
    }

    /// Substitute inside any string field, recursing through maps and
    /// arrays alike.
    fn substitute(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.substitute_string(s),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.substitute(v)))
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.substitute(v)).collect())
            }
            other => other.clone(),
        }
    }
}

impl Kernel {
    // ========================================================================
    // Execution
    // ========================================================================

    fn resolve_res_target(
        target: &str,
        bound: &BTreeMap<String, ResId>,
    ) -> KernelResult<ResId> {
        if let Some(res_id) = bound.get(target) {
            return Ok(*res_id);
        }
        if let Ok(res_id) = target.parse() {
            return Ok(res_id);
        }
        UndefinedTokenReferenceSnafu { token: target }.fail()
    }

    /// Run one handler step. Each step may produce zero or more tessellae.
    #[allow(clippy::too_many_arguments)]
    fn execute_side_effect_tx(
        &self,
        step: &SideEffectDef,
        bound: &BTreeMap<String, ResId>,
        branch: &str,
        source: Option<&str>,
        now: Timestamp,
        tx: &WriteTransactionCtx,
        produced: &mut Vec<Tessella>,
    ) -> KernelResult<()> {
        match step {
            SideEffectDef::SetAttribute { res, key, value } => {
                let res_id = Self::resolve_res_target(res, bound)?;
                produced.push(Self::set_attribute_tx(
                    res_id,
                    key,
                    value.clone(),
                    branch,
                    source,
                    now,
                    tx,
                )?);
            }
            SideEffectDef::TransitionStatus { res, target } => {
                let res_id = Self::resolve_res_target(res, bound)?;
                produced.push(Self::transition_status_tx(
                    res_id, target, branch, source, now, tx,
                )?);
            }
            SideEffectDef::CreateLog {
                res,
                message,
                severity,
            } => {
                let mut attributes = BTreeMap::new();
                attributes.insert("message".to_owned(), Value::String(message.clone()));
                if let Some(severity) = severity {
                    attributes
                        .insert("severity".to_owned(), Value::String(severity.clone()));
                }
                if let Some(res) = res {
                    let res_id = Self::resolve_res_target(res, bound)?;
                    attributes
                        .insert("res_id".to_owned(), Value::String(res_id.to_string()));
                }
                Self::create_entity_tx(
                    ResId::LOG,
                    &attributes,
                    branch,
                    None,
                    source,
                    now,
                    tx,
                    produced,
                )?;
            }
            SideEffectDef::CreateError {
                res,
                message,
                severity,
            } => {
                let mut attributes = BTreeMap::new();
                attributes.insert("message".to_owned(), Value::String(message.clone()));
                if let Some(severity) = severity {
                    attributes
                        .insert("severity".to_owned(), Value::String(severity.clone()));
                }
                if let Some(res) = res {
                    let res_id = Self::resolve_res_target(res, bound)?;
                    attributes
                        .insert("res_id".to_owned(), Value::String(res_id.to_string()));
                }
                Self::create_entity_tx(
                    ResId::ERROR,
                    &attributes,
                    branch,
                    None,
                    source,
                    now,
                    tx,
                    produced,
                )?;
            }
            SideEffectDef::CreateTask {
                title,
                res,
                priority,
                context_res_ids,
            } => {
                let mut attributes = BTreeMap::new();
                attributes.insert("title".to_owned(), Value::String(title.clone()));
                if let Some(priority) = priority {
                    attributes
                        .insert("priority".to_owned(), Value::String(priority.clone()));
                }
                let task_id = Self::create_entity_tx(
                    ResId::TASK,
                    &attributes,
                    branch,
                    None,
                    source,
                    now,
                    tx,
                    produced,
                )?;

                let mut context: Vec<Value> = context_res_ids
                    .iter()
                    .map(|id| Value::String(id.clone()))
                    .collect();
                if let Some(res) = res {
                    let res_id = Self::resolve_res_target(res, bound)?;
                    context.push(Value::String(res_id.to_string()));
                }
                if !context.is_empty() {
                    let res_table = tx.open_table(&res::TABLE)?;
                    let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
                    let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
                    produced.push(Self::append_content_tx(
                        task_id,
                        &AttributeSet {
                            key: "context_res_ids".to_owned(),
                            value: Value::Array(context),
                        },
                        branch,
                        source,
                        now,
                        &res_table,
                        &mut tessellae_table,
                        &mut by_res_table,
                    )?);
                }
            }
            SideEffectDef::CreateRes {
                genus_name,
                attributes,
            } => {
                let genus_id = {
                    let res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
                    let branches_table = tx.open_table(&branches::TABLE)?;
                    let tessellae_table = tx.open_table(&tessellae::TABLE)?;
                    let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
                    Self::find_genus_by_name_tx(
                        genus_name,
                        branch,
                        &res_by_genus_table,
                        &branches_table,
                        &tessellae_table,
                        &by_res_table,
                    )?
                    .ok_or_else(|| {
                        GenusNotFoundSnafu {
                            genus: genus_name.clone(),
                        }
                        .build()
                    })?
                    .0
                };
                Self::create_entity_tx(
                    genus_id, attributes, branch, None, source, now, tx, produced,
                )?;
            }
        }
        Ok(())
    }

    pub(crate) fn execute_action_tx(
        &self,
        action_id: ResId,
        resource_bindings: &BTreeMap<String, ResId>,
        params: &BTreeMap<String, Value>,
        branch: &str,
        source: Option<&str>,
        now: Timestamp,
        tx: &WriteTransactionCtx,
    ) -> KernelResult<ActionOutcome> {
        // Validation phase: all table handles dropped before side effects
        // run, which open their own.
        let (handler, bound) = {
            let res_table = tx.open_table(&res::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;

            let genus = Self::require_genus_tx(
                action_id,
                branch,
                &res_table,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;
            if genus.kind() != Some("action") {
                return WrongGenusKindSnafu {
                    res_id: action_id,
                    expected: "action",
                }
                .fail();
            }
            if genus.is_deprecated() {
                return DeprecatedGenusSnafu {
                    genus: genus.name().unwrap_or_default().to_owned(),
                }
                .fail();
            }

            let mut bound = BTreeMap::new();
            for (name, resource) in &genus.resources {
                let Some(res_id) = resource_bindings.get(name) else {
                    return MissingResourceBindingSnafu { resource: name }.fail();
                };
                let record = Self::require_res_tx(*res_id, &res_table)?;
                let res_genus = Self::materialize_genus_tx(
                    record.genus_id,
                    branch,
                    &branches_table,
                    &tessellae_table,
                    &by_res_table,
                )?;
                let actual_name = res_genus.name().unwrap_or_default();
                if !actual_name.eq_ignore_ascii_case(&resource.genus_name) {
                    return ResourceGenusMismatchSnafu {
                        resource: name,
                        expected: resource.genus_name.clone(),
                        actual: actual_name,
                    }
                    .fail();
                }
                if let Some(required) = &resource.required_status {
                    let state = Self::materialize_tx(
                        *res_id,
                        branch,
                        &ReplayFilter::default(),
                        &branches_table,
                        &tessellae_table,
                        &by_res_table,
                    )?;
                    let actual = state.status.unwrap_or_default();
                    if actual != *required {
                        return ResourceStatusMismatchSnafu {
                            resource: name,
                            required: required.clone(),
                            actual,
                        }
                        .fail();
                    }
                }
                bound.insert(name.clone(), *res_id);
            }

            for (name, parameter) in &genus.parameters {
                match params.get(name) {
                    Some(value) => {
                        if !parameter.param_type.matches(value) {
                            return TypeMismatchSnafu {
                                attribute: name,
                                expected: parameter.param_type.name(),
                                actual: smaragda_core::defs::AttrType::describe(value),
                            }
                            .fail();
                        }
                    }
                    None if parameter.required => {
                        return MissingRequiredParameterSnafu { parameter: name }.fail();
                    }
                    None => {}
                }
            }

            (genus.handler.clone(), bound)
        };

        // Forensic input record.
        {
            let mut inputs_table = tx.open_table(&crate::inputs::TABLE)?;
            Self::record_input_tx(
                source,
                "action_invocation",
                &json!({
                    "action_genus_id": action_id.to_string(),
                    "resources": bound
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                    "params": params,
                }),
                now,
                &mut inputs_table,
            )?;
        }

        let ctx = TokenCtx {
            now: now.to_string(),
            resources: &bound,
            params,
        };

        let mut produced = Vec::new();
        for step in &handler {
            let raw = serde_json::to_value(step).expect("Step serialization can't fail");
            let substituted = ctx.substitute(&raw);
            let step: SideEffectDef = match serde_json::from_value(substituted) {
                Ok(step) => step,
                Err(err) => {
                    return Ok(ActionOutcome::Failed {
                        error: format!("handler step does not deserialize after substitution: {err}"),
                    });
                }
            };
            self.execute_side_effect_tx(&step, &bound, branch, source, now, tx, &mut produced)?;
        }

        let tessella_ids: Vec<TessellaId> = produced.iter().map(|t| t.id).collect();

        let action_taken_id = {
            let mut actions_table = tx.open_table(&actions_taken::TABLE)?;
            let mut tessella_actions_table = tx.open_table(&tessella_actions::TABLE)?;
            let action_taken_id = actions_table
                .last()?
                .map(|(k, _)| k.value())
                .unwrap_or(0)
                + 1;
            actions_table.insert(
                &action_taken_id,
                &ActionTakenRecord {
                    action_genus_id: action_id,
                    resources: bound.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                    params: serde_json::to_string(params)
                        .expect("JSON serialization can't fail"),
                    tessella_ids: tessella_ids.clone(),
                    created_at: now,
                },
            )?;
            for id in &tessella_ids {
                tessella_actions_table.insert(id, &action_taken_id)?;
            }
            action_taken_id
        };

        debug!(
            target: LOG_TARGET,
            action = %action_id,
            action_taken_id,
            tessellae = tessella_ids.len(),
            "Action executed"
        );

        self.notify_appended(tx, produced);

        Ok(ActionOutcome::Completed {
            action_taken_id,
            tessella_ids,
        })
    }

    /// Execute an action genus against bound resources and parameters.
    ///
    /// Errors are caught and returned as [`ActionOutcome::Failed`] so batch
    /// callers survive a bad handler. Tessellae written before a mid-handler
    /// failure stay in the log; the invocation is then not recorded in
    /// `actions_taken` ("last writer's error"; there is no rollback in an
    /// append-only log).
    pub async fn execute_action(
        &self,
        action_id: ResId,
        resource_bindings: BTreeMap<String, ResId>,
        params: BTreeMap<String, Value>,
        source: Option<&str>,
    ) -> KernelResult<ActionOutcome> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            match self.execute_action_tx(
                action_id,
                &resource_bindings,
                &params,
                &branch,
                source,
                now,
                tx,
            ) {
                Ok(outcome) => Ok(outcome),
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        action = %action_id,
                        err = %err.fmt_compact(),
                        "Action failed"
                    );
                    Ok(ActionOutcome::Failed {
                        error: err.to_string(),
                    })
                }
            }
        })
        .await
    }

    /// Replay a res with each tessella labeled by the action invocation
    /// that produced it, if any.
    pub async fn get_history(&self, res_id: ResId) -> KernelResult<Vec<HistoryEntry>> {
        let branch = self.current_branch();
        self.read_with(|tx| {
            let branches_table = tx.open_table(&branches::TABLE)?;
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            let tessella_actions_table = tx.open_table(&tessella_actions::TABLE)?;
            let actions_table = tx.open_table(&actions_taken::TABLE)?;

            let log = Self::replay_tx(
                res_id,
                &branch,
                &ReplayFilter::default(),
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;

            let mut entries = Vec::with_capacity(log.len());
            for tessella in log {
                let action_taken_id = tessella_actions_table
                    .get(&tessella.id)?
                    .map(|g| g.value());
                let action_genus_id = match action_taken_id {
                    Some(id) => actions_table
                        .get(&id)?
                        .map(|g| g.value().action_genus_id),
                    None => None,
                };
                entries.push(HistoryEntry {
                    tessella,
                    action_taken_id,
                    action_genus_id,
                });
            }
            Ok(entries)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_collected_from_nested_payloads() {
        let value = json!({
            "res": "server",
            "value": "$param.version",
            "nested": {"deep": ["Deployed $param.version to $res.server.id at $now"]},
        });
        let (res_refs, param_refs) = handler_tokens(&value);
        assert!(res_refs.contains("server"));
        assert!(param_refs.contains("version"));
    }

    #[test]
    fn whole_token_substitution_keeps_the_type() {
        let resources = BTreeMap::new();
        let mut params = BTreeMap::new();
        params.insert("count".to_owned(), json!(3));
        let ctx = TokenCtx {
            now: "2024-03-01T12:30:45.123Z".to_owned(),
            resources: &resources,
            params: &params,
        };
        assert_eq!(ctx.substitute(&json!("$param.count")), json!(3));
        assert_eq!(
            ctx.substitute(&json!("have $param.count items")),
            json!("have 3 items")
        );
    }

    #[test]
    fn unknown_tokens_stay_literal() {
        let resources = BTreeMap::new();
        let params = BTreeMap::new();
        let ctx = TokenCtx {
            now: "2024-03-01T12:30:45.123Z".to_owned(),
            resources: &resources,
            params: &params,
        };
        assert_eq!(
            ctx.substitute(&json!("$param.missing and $mystery")),
            json!("$param.missing and $mystery")
        );
    }

    #[test]
    fn now_and_res_tokens_interpolate() {
        let mut resources = BTreeMap::new();
        let server = ResId::generate();
        resources.insert("server".to_owned(), server);
        let params = BTreeMap::new();
        let ctx = TokenCtx {
            now: "2024-03-01T12:30:45.123Z".to_owned(),
            resources: &resources,
            params: &params,
        };
        assert_eq!(
            ctx.substitute(&json!("$res.server.id")),
            json!(server.to_string())
        );
        assert_eq!(
            ctx.substitute(&json!("at $now")),
            json!("at 2024-03-01T12:30:45.123Z")
        );
    }
}
