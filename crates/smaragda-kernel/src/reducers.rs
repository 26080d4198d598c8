//! Pure reducers folding tessellae into state.
//!
//! Each reducer is a plain `fn(state, &Tessella) -> state`; materialization
//! folds a replay window left-to-right. Reducers are tolerant: a tessella
//! kind a reducer does not know passes through without effect, so old
//! kernels can replay logs written by newer layers.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use smaragda_core::defs::{
    AttributeDef, HandlerSteps, LaneDef, ParameterDef, ResourceDef, RoleDef,
    SerializationInputDef, SerializationOutputDef, SideEffectDef, StateDef, StepDef,
    TransitionDef, TreeNodeDef, TriggerDef,
};
use smaragda_core::tessella::{
    kind, AttributeRemoved, AttributeSet, FeatureAttributeSet, FeatureCreated,
    FeatureStatusChanged, GenusMetaSet, MemberAdded, MemberRemoved, ProcessCancelled,
    ProcessStarted, ProcessStepActivated, ProcessStepCompleted, ProcessStepFailed,
    SerializationTreeDef, StatusChanged,
};
use smaragda_core::{ResId, Tessella, Timestamp};

// ============================================================================
// Default entity state
// ============================================================================

/// A feature embedded in its parent entity's stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureState {
    pub feature_genus: String,
    pub attributes: BTreeMap<String, Value>,
    pub status: Option<String>,
}

/// Materialized state of an entity (or relationship) res.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityState {
    pub attributes: BTreeMap<String, Value>,
    pub status: Option<String>,
    pub archived: bool,
    pub features: BTreeMap<String, FeatureState>,
    /// Role name -> member entity ids, in add order.
    pub members: BTreeMap<String, Vec<ResId>>,
}

impl EntityState {
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

pub fn default_reducer(mut state: EntityState, tessella: &Tessella) -> EntityState {
    match tessella.kind.as_str() {
        kind::CREATED => {
            state = EntityState::default();
        }
        kind::ATTRIBUTE_SET => {
            if let Some(AttributeSet { key, value }) = tessella.decode() {
                state.attributes.insert(key, value);
            }
        }
        kind::ATTRIBUTE_REMOVED => {
            if let Some(AttributeRemoved { key }) = tessella.decode() {
                state.attributes.remove(&key);
            }
        }
        kind::STATUS_CHANGED => {
            if let Some(StatusChanged { status }) = tessella.decode() {
                state.status = Some(status);
            }
        }
        kind::ARCHIVED => {
            state.archived = true;
        }
        kind::RESTORED => {
            state.archived = false;
        }
        kind::FEATURE_CREATED => {
            if let Some(FeatureCreated {
                feature_id,
                feature_genus,
                attributes,
            }) = tessella.decode()
            {
                state.features.insert(
                    feature_id,
                    FeatureState {
                        feature_genus,
                        attributes,
                        status: None,
                    },
                );
            }
        }
        kind::FEATURE_ATTRIBUTE_SET => {
            if let Some(FeatureAttributeSet {
                feature_id,
                key,
                value,
            }) = tessella.decode()
            {
                if let Some(feature) = state.features.get_mut(&feature_id) {
                    feature.attributes.insert(key, value);
                }
            }
        }
        kind::FEATURE_STATUS_CHANGED => {
            if let Some(FeatureStatusChanged { feature_id, status }) = tessella.decode() {
                if let Some(feature) = state.features.get_mut(&feature_id) {
                    feature.status = Some(status);
                }
            }
        }
        kind::MEMBER_ADDED => {
            if let Some(MemberAdded { role, entity_id }) = tessella.decode() {
                let members = state.members.entry(role).or_default();
                if !members.contains(&entity_id) {
                    members.push(entity_id);
                }
            }
        }
        kind::MEMBER_REMOVED => {
            if let Some(MemberRemoved { role, entity_id }) = tessella.decode() {
                if let Some(members) = state.members.get_mut(&role) {
                    members.retain(|m| *m != entity_id);
                    if members.is_empty() {
                        state.members.remove(&role);
                    }
                }
            }
        }
        // Unknown kinds pass through unchanged.
        _ => {}
    }
    state
}

// ============================================================================
// Genus state
// ============================================================================

/// Materialized schema of a genus res, accumulated from its definition
/// tessellae. All sections are carried; which of them is populated depends
/// on `meta.kind`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenusState {
    pub attributes: BTreeMap<String, AttributeDef>,
    pub states: BTreeMap<String, StateDef>,
    pub transitions: Vec<TransitionDef>,
    pub roles: BTreeMap<String, RoleDef>,
    pub meta: BTreeMap<String, Value>,

    pub resources: BTreeMap<String, ResourceDef>,
    pub parameters: BTreeMap<String, ParameterDef>,
    pub handler: Vec<SideEffectDef>,

    pub lanes: BTreeMap<String, LaneDef>,
    pub steps: BTreeMap<String, StepDef>,
    pub triggers: Vec<TriggerDef>,

    pub input: Option<SerializationInputDef>,
    pub output: Option<SerializationOutputDef>,
    pub tree: Vec<TreeNodeDef>,
}

impl GenusState {
    pub fn name(&self) -> Option<&str> {
        self.meta.get("name").and_then(Value::as_str)
    }

    pub fn kind(&self) -> Option<&str> {
        self.meta.get("kind").and_then(Value::as_str)
    }

    pub fn is_deprecated(&self) -> bool {
        self.meta
            .get("deprecated")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn taxonomy_id(&self) -> Option<ResId> {
        self.meta
            .get("taxonomy_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    pub fn initial_state(&self) -> Option<&str> {
        self.states
            .values()
            .find(|s| s.initial)
            .map(|s| s.name.as_str())
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }

    pub fn has_transition(&self, from: &str, to: &str) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Parent statuses under which features of this genus may be edited;
    /// `None` means unrestricted.
    pub fn editable_parent_statuses(&self) -> Option<Vec<String>> {
        let list = self.meta.get("editable_parent_statuses")?.as_array()?;
        Some(
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect(),
        )
    }
}

pub fn genus_reducer(mut state: GenusState, tessella: &Tessella) -> GenusState {
    match tessella.kind.as_str() {
        kind::CREATED => {
            state = GenusState::default();
        }
        kind::GENUS_ATTRIBUTE_DEFINED => {
            if let Some(def) = tessella.decode::<AttributeDef>() {
                state.attributes.insert(def.name.clone(), def);
            }
        }
        kind::GENUS_STATE_DEFINED => {
            if let Some(def) = tessella.decode::<StateDef>() {
                state.states.insert(def.name.clone(), def);
            }
        }
        kind::GENUS_TRANSITION_DEFINED => {
            if let Some(def) = tessella.decode::<TransitionDef>() {
                if !state.transitions.contains(&def) {
                    state.transitions.push(def);
                }
            }
        }
        kind::GENUS_ROLE_DEFINED => {
            if let Some(def) = tessella.decode::<RoleDef>() {
                match state.roles.get_mut(&def.name) {
                    Some(existing) => {
                        // Evolution: cardinality is replaced, member genera
                        // merge as a case-insensitive set.
                        existing.cardinality = def.cardinality;
                        for genus in def.valid_member_genera {
                            if !existing
                                .valid_member_genera
                                .iter()
                                .any(|g| g.eq_ignore_ascii_case(&genus))
                            {
                                existing.valid_member_genera.push(genus);
                            }
                        }
                    }
                    None => {
                        state.roles.insert(def.name.clone(), def);
                    }
                }
            }
        }
        kind::GENUS_META_SET => {
            if let Some(GenusMetaSet { key, value }) = tessella.decode() {
                state.meta.insert(key, value);
            }
        }
        kind::ACTION_RESOURCE_DEFINED => {
            if let Some(def) = tessella.decode::<ResourceDef>() {
                state.resources.insert(def.name.clone(), def);
            }
        }
        kind::ACTION_PARAMETER_DEFINED => {
            if let Some(def) = tessella.decode::<ParameterDef>() {
                state.parameters.insert(def.name.clone(), def);
            }
        }
        kind::ACTION_HANDLER_DEFINED => {
            if let Some(HandlerSteps { steps }) = tessella.decode() {
                state.handler = steps;
            }
        }
        kind::PROCESS_LANE_DEFINED => {
            if let Some(def) = tessella.decode::<LaneDef>() {
                state.lanes.insert(def.name.clone(), def);
            }
        }
        kind::PROCESS_STEP_DEFINED => {
            if let Some(def) = tessella.decode::<StepDef>() {
                state.steps.insert(def.name.clone(), def);
            }
        }
        kind::PROCESS_TRIGGER_DEFINED => {
            if let Some(def) = tessella.decode::<TriggerDef>() {
                state.triggers.push(def);
            }
        }
        kind::SERIALIZATION_INPUT_DEFINED => {
            if let Some(def) = tessella.decode::<SerializationInputDef>() {
                state.input = Some(def);
            }
        }
        kind::SERIALIZATION_OUTPUT_DEFINED => {
            if let Some(def) = tessella.decode::<SerializationOutputDef>() {
                state.output = Some(def);
            }
        }
        kind::SERIALIZATION_TREE_DEFINED => {
            if let Some(SerializationTreeDef { tree }) = tessella.decode() {
                state.tree = tree;
            }
        }
        _ => {}
    }
    state
}

// ============================================================================
// Process instance state
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    #[default]
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepState {
    pub status: StepStatus,
    pub task_id: Option<ResId>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Materialized state of one process instance res.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessInstanceState {
    pub process_genus_id: Option<ResId>,
    pub context_res_id: Option<ResId>,
    pub status: ProcessStatus,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub steps: BTreeMap<String, StepState>,
    pub cancel_reason: Option<String>,
}

pub fn process_instance_reducer(
    mut state: ProcessInstanceState,
    tessella: &Tessella,
) -> ProcessInstanceState {
    match tessella.kind.as_str() {
        kind::CREATED => {
            state = ProcessInstanceState::default();
        }
        kind::PROCESS_STARTED => {
            if let Some(ProcessStarted {
                process_genus_id,
                context_res_id,
            }) = tessella.decode()
            {
                state.process_genus_id = Some(process_genus_id);
                state.context_res_id = context_res_id;
                state.status = ProcessStatus::Running;
                state.started_at = Some(tessella.created_at);
            }
        }
        kind::PROCESS_STEP_ACTIVATED => {
            if let Some(ProcessStepActivated { step, task_id }) = tessella.decode() {
                state.steps.insert(
                    step,
                    StepState {
                        status: StepStatus::Active,
                        task_id,
                        result: None,
                        error: None,
                    },
                );
            }
        }
        kind::PROCESS_STEP_COMPLETED => {
            if let Some(ProcessStepCompleted { step, result }) = tessella.decode() {
                let entry = state.steps.entry(step).or_insert(StepState {
                    status: StepStatus::Completed,
                    task_id: None,
                    result: None,
                    error: None,
                });
                entry.status = StepStatus::Completed;
                entry.result = Some(result);
            }
        }
        kind::PROCESS_STEP_FAILED => {
            if let Some(ProcessStepFailed { step, error }) = tessella.decode() {
                let entry = state.steps.entry(step).or_insert(StepState {
                    status: StepStatus::Failed,
                    task_id: None,
                    result: None,
                    error: None,
                });
                entry.status = StepStatus::Failed;
                entry.error = Some(error);
            }
        }
        kind::PROCESS_COMPLETED => {
            state.status = ProcessStatus::Completed;
            state.completed_at = Some(tessella.created_at);
        }
        kind::PROCESS_CANCELLED => {
            if let Some(ProcessCancelled { reason }) = tessella.decode() {
                state.cancel_reason = reason;
            }
            state.status = ProcessStatus::Cancelled;
            state.completed_at = Some(tessella.created_at);
        }
        _ => {}
    }
    state
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use smaragda_core::tessella::TessellaContent as _;

    use super::*;

    fn tessella(id: u64, kind: &str, data: Value) -> Tessella {
        Tessella {
            id,
            res_id: ResId::ZERO,
            branch_id: "main".to_owned(),
            kind: kind.to_owned(),
            data,
            created_at: Timestamp::from_millis(id * 1_000),
            source: None,
        }
    }

    #[test]
    fn default_reducer_folds_attributes_and_status() {
        let log = vec![
            tessella(1, kind::CREATED, json!({})),
            tessella(
                2,
                kind::ATTRIBUTE_SET,
                AttributeSet {
                    key: "title".into(),
                    value: json!("first"),
                }
                .to_json(),
            ),
            tessella(
                3,
                kind::ATTRIBUTE_SET,
                AttributeSet {
                    key: "title".into(),
                    value: json!("second"),
                }
                .to_json(),
            ),
            tessella(
                4,
                kind::STATUS_CHANGED,
                StatusChanged {
                    status: "active".into(),
                }
                .to_json(),
            ),
            tessella(5, "somebody_elses_kind", json!({"x": 1})),
        ];

        let state = log
            .iter()
            .fold(EntityState::default(), default_reducer);

        assert_eq!(state.attr_str("title"), Some("second"));
        assert_eq!(state.status.as_deref(), Some("active"));
    }

    #[test]
    fn default_reducer_is_deterministic() {
        let log = vec![
            tessella(1, kind::CREATED, json!({})),
            tessella(
                2,
                kind::ATTRIBUTE_SET,
                AttributeSet {
                    key: "k".into(),
                    value: json!(42),
                }
                .to_json(),
            ),
        ];
        let a = log.iter().fold(EntityState::default(), default_reducer);
        let b = log.iter().fold(EntityState::default(), default_reducer);
        assert_eq!(a, b);
    }

    #[test]
    fn member_add_remove_projection() {
        let alice = ResId::generate();
        let bob = ResId::generate();
        let log = vec![
            tessella(1, kind::CREATED, json!({})),
            tessella(
                2,
                kind::MEMBER_ADDED,
                MemberAdded {
                    role: "crew".into(),
                    entity_id: alice,
                }
                .to_json(),
            ),
            tessella(
                3,
                kind::MEMBER_ADDED,
                MemberAdded {
                    role: "crew".into(),
                    entity_id: bob,
                }
                .to_json(),
            ),
            tessella(
                4,
                kind::MEMBER_REMOVED,
                MemberRemoved {
                    role: "crew".into(),
                    entity_id: alice,
                }
                .to_json(),
            ),
        ];
        let state = log.iter().fold(EntityState::default(), default_reducer);
        assert_eq!(state.members.get("crew"), Some(&vec![bob]));
    }

    #[test]
    fn genus_reducer_merges_role_evolution() {
        use smaragda_core::defs::Cardinality;

        let log = vec![
            tessella(1, kind::CREATED, json!({})),
            tessella(
                2,
                kind::GENUS_ROLE_DEFINED,
                RoleDef {
                    name: "crew".into(),
                    cardinality: Cardinality::One,
                    valid_member_genera: vec!["Person".into()],
                }
                .to_json(),
            ),
            tessella(
                3,
                kind::GENUS_ROLE_DEFINED,
                RoleDef {
                    name: "crew".into(),
                    cardinality: Cardinality::OneOrMore,
                    valid_member_genera: vec!["person".into(), "Robot".into()],
                }
                .to_json(),
            ),
        ];
        let state = log.iter().fold(GenusState::default(), genus_reducer);
        let role = &state.roles["crew"];
        assert_eq!(role.cardinality, Cardinality::OneOrMore);
        // "person" deduplicated case-insensitively against "Person"
        assert_eq!(role.valid_member_genera, vec!["Person", "Robot"]);
    }

    #[test]
    fn process_reducer_tracks_steps() {
        let genus = ResId::generate();
        let log = vec![
            tessella(1, kind::CREATED, json!({})),
            tessella(
                2,
                kind::PROCESS_STARTED,
                ProcessStarted {
                    process_genus_id: genus,
                    context_res_id: None,
                }
                .to_json(),
            ),
            tessella(
                3,
                kind::PROCESS_STEP_ACTIVATED,
                ProcessStepActivated {
                    step: "draft".into(),
                    task_id: None,
                }
                .to_json(),
            ),
            tessella(
                4,
                kind::PROCESS_STEP_COMPLETED,
                ProcessStepCompleted {
                    step: "draft".into(),
                    result: json!(null),
                }
                .to_json(),
            ),
            tessella(5, kind::PROCESS_COMPLETED, json!({})),
        ];
        let state = log
            .iter()
            .fold(ProcessInstanceState::default(), process_instance_reducer);
        assert_eq!(state.status, ProcessStatus::Completed);
        assert_eq!(state.steps["draft"].status, StepStatus::Completed);
        assert!(state.completed_at.is_some());
    }
}
