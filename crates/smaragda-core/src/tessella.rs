//! The tessella: one append-only fact belonging to exactly one res.
//!
//! A tessella is a `(kind, data)` pair plus bookkeeping. Known kinds have a
//! typed payload struct implementing [`TessellaContent`]; the generic JSON
//! form exists so reducers stay tolerant of kinds they don't know.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::defs::{
    AttributeDef, HandlerSteps, LaneDef, ResourceDef, ParameterDef, RoleDef,
    SerializationInputDef, SerializationOutputDef, StateDef, StepDef, TransitionDef, TriggerDef,
    TreeNodeDef,
};
use crate::{ResId, Timestamp};

/// Monotonic append-order identifier, global across the store.
pub type TessellaId = u64;

/// Tessella kind tags. String-valued so third-party layers can introduce
/// kinds the kernel reducers pass through untouched.
pub mod kind {
    pub const CREATED: &str = "created";
    pub const ATTRIBUTE_SET: &str = "attribute_set";
    pub const ATTRIBUTE_REMOVED: &str = "attribute_removed";
    pub const STATUS_CHANGED: &str = "status_changed";
    pub const ARCHIVED: &str = "archived";
    pub const RESTORED: &str = "restored";
    pub const FEATURE_CREATED: &str = "feature_created";
    pub const FEATURE_ATTRIBUTE_SET: &str = "feature_attribute_set";
    pub const FEATURE_STATUS_CHANGED: &str = "feature_status_changed";
    pub const MEMBER_ADDED: &str = "member_added";
    pub const MEMBER_REMOVED: &str = "member_removed";
    pub const GENUS_ATTRIBUTE_DEFINED: &str = "genus_attribute_defined";
    pub const GENUS_STATE_DEFINED: &str = "genus_state_defined";
    pub const GENUS_TRANSITION_DEFINED: &str = "genus_transition_defined";
    pub const GENUS_ROLE_DEFINED: &str = "genus_role_defined";
    pub const GENUS_META_SET: &str = "genus_meta_set";
    pub const ACTION_RESOURCE_DEFINED: &str = "action_resource_defined";
    pub const ACTION_PARAMETER_DEFINED: &str = "action_parameter_defined";
    pub const ACTION_HANDLER_DEFINED: &str = "action_handler_defined";
    pub const SERIALIZATION_INPUT_DEFINED: &str = "serialization_input_defined";
    pub const SERIALIZATION_OUTPUT_DEFINED: &str = "serialization_output_defined";
    pub const SERIALIZATION_TREE_DEFINED: &str = "serialization_tree_defined";
    pub const PROCESS_LANE_DEFINED: &str = "process_lane_defined";
    pub const PROCESS_STEP_DEFINED: &str = "process_step_defined";
    pub const PROCESS_TRIGGER_DEFINED: &str = "process_trigger_defined";
    pub const PROCESS_STARTED: &str = "process_started";
    pub const PROCESS_STEP_ACTIVATED: &str = "process_step_activated";
    pub const PROCESS_STEP_COMPLETED: &str = "process_step_completed";
    pub const PROCESS_STEP_FAILED: &str = "process_step_failed";
    pub const PROCESS_COMPLETED: &str = "process_completed";
    pub const PROCESS_CANCELLED: &str = "process_cancelled";
    pub const TEMPORAL_ANCHOR_SET: &str = "temporal_anchor_set";
}

/// A single append-only fact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tessella {
    pub id: TessellaId,
    pub res_id: ResId,
    pub branch_id: String,
    pub kind: String,
    pub data: Value,
    pub created_at: Timestamp,
    pub source: Option<String>,
}

impl Tessella {
    /// Decode the payload as a typed content kind; `None` when the kind tag
    /// doesn't match or the payload doesn't deserialize.
    pub fn decode<T: TessellaContent>(&self) -> Option<T> {
        if self.kind != T::KIND {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// A typed tessella payload with its kind tag.
pub trait TessellaContent: Serialize + DeserializeOwned {
    const KIND: &'static str;

    fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("Payload serialization can't fail")
    }
}

// ============================================================================
// Entity-level payloads
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Created {}

impl TessellaContent for Created {
    const KIND: &'static str = kind::CREATED;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSet {
    pub key: String,
    pub value: Value,
}

impl TessellaContent for AttributeSet {
    const KIND: &'static str = kind::ATTRIBUTE_SET;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRemoved {
    pub key: String,
}

impl TessellaContent for AttributeRemoved {
    const KIND: &'static str = kind::ATTRIBUTE_REMOVED;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub status: String,
}

impl TessellaContent for StatusChanged {
    const KIND: &'static str = kind::STATUS_CHANGED;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Archived {}

impl TessellaContent for Archived {
    const KIND: &'static str = kind::ARCHIVED;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Restored {}

impl TessellaContent for Restored {
    const KIND: &'static str = kind::RESTORED;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCreated {
    pub feature_id: String,
    pub feature_genus: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl TessellaContent for FeatureCreated {
    const KIND: &'static str = kind::FEATURE_CREATED;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureAttributeSet {
    pub feature_id: String,
    pub key: String,
    pub value: Value,
}

impl TessellaContent for FeatureAttributeSet {
    const KIND: &'static str = kind::FEATURE_ATTRIBUTE_SET;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStatusChanged {
    pub feature_id: String,
    pub status: String,
}

impl TessellaContent for FeatureStatusChanged {
    const KIND: &'static str = kind::FEATURE_STATUS_CHANGED;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberAdded {
    pub role: String,
    pub entity_id: ResId,
}

impl TessellaContent for MemberAdded {
    const KIND: &'static str = kind::MEMBER_ADDED;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRemoved {
    pub role: String,
    pub entity_id: ResId,
}

impl TessellaContent for MemberRemoved {
    const KIND: &'static str = kind::MEMBER_REMOVED;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenusMetaSet {
    pub key: String,
    pub value: Value,
}

impl TessellaContent for GenusMetaSet {
    const KIND: &'static str = kind::GENUS_META_SET;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalAnchorSet {
    pub start_year: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_year: Option<i32>,
    pub precision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_note: Option<String>,
}

impl TessellaContent for TemporalAnchorSet {
    const KIND: &'static str = kind::TEMPORAL_ANCHOR_SET;
}

// ============================================================================
// Process instance payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStarted {
    pub process_genus_id: ResId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_res_id: Option<ResId>,
}

impl TessellaContent for ProcessStarted {
    const KIND: &'static str = kind::PROCESS_STARTED;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStepActivated {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<ResId>,
}

impl TessellaContent for ProcessStepActivated {
    const KIND: &'static str = kind::PROCESS_STEP_ACTIVATED;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStepCompleted {
    pub step: String,
    #[serde(default)]
    pub result: Value,
}

impl TessellaContent for ProcessStepCompleted {
    const KIND: &'static str = kind::PROCESS_STEP_COMPLETED;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStepFailed {
    pub step: String,
    pub error: String,
}

impl TessellaContent for ProcessStepFailed {
    const KIND: &'static str = kind::PROCESS_STEP_FAILED;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessCompleted {}

impl TessellaContent for ProcessCompleted {
    const KIND: &'static str = kind::PROCESS_COMPLETED;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessCancelled {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TessellaContent for ProcessCancelled {
    const KIND: &'static str = kind::PROCESS_CANCELLED;
}

// ============================================================================
// Definition payloads reuse the def structs directly
// ============================================================================

impl TessellaContent for AttributeDef {
    const KIND: &'static str = kind::GENUS_ATTRIBUTE_DEFINED;
}

impl TessellaContent for StateDef {
    const KIND: &'static str = kind::GENUS_STATE_DEFINED;
}

impl TessellaContent for TransitionDef {
    const KIND: &'static str = kind::GENUS_TRANSITION_DEFINED;
}

impl TessellaContent for RoleDef {
    const KIND: &'static str = kind::GENUS_ROLE_DEFINED;
}

impl TessellaContent for ResourceDef {
    const KIND: &'static str = kind::ACTION_RESOURCE_DEFINED;
}

impl TessellaContent for ParameterDef {
    const KIND: &'static str = kind::ACTION_PARAMETER_DEFINED;
}

impl TessellaContent for HandlerSteps {
    const KIND: &'static str = kind::ACTION_HANDLER_DEFINED;
}

impl TessellaContent for SerializationInputDef {
    const KIND: &'static str = kind::SERIALIZATION_INPUT_DEFINED;
}

impl TessellaContent for SerializationOutputDef {
    const KIND: &'static str = kind::SERIALIZATION_OUTPUT_DEFINED;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerializationTreeDef {
    pub tree: Vec<TreeNodeDef>,
}

impl TessellaContent for SerializationTreeDef {
    const KIND: &'static str = kind::SERIALIZATION_TREE_DEFINED;
}

impl TessellaContent for LaneDef {
    const KIND: &'static str = kind::PROCESS_LANE_DEFINED;
}

impl TessellaContent for StepDef {
    const KIND: &'static str = kind::PROCESS_STEP_DEFINED;
}

impl TessellaContent for TriggerDef {
    const KIND: &'static str = kind::PROCESS_TRIGGER_DEFINED;
}
