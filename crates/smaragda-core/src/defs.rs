//! Definition types carried inside genus tessellae.
//!
//! These are the serde payloads of the `genus_*`, `action_*`, `process_*`
//! and `serialization_*` tessella kinds, and double as the input specs for
//! the kernel's define/evolve operations. They cross the storage boundary
//! as JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Attribute value types. `filetree` is an arbitrary JSON object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrType {
    Text,
    Number,
    Boolean,
    Filetree,
}

impl AttrType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Filetree => "filetree",
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::Text => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Filetree => value.is_object(),
        }
    }

    /// Describe a JSON value's type for error messages.
    pub fn describe(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenusKind {
    #[default]
    Entity,
    Feature,
    Action,
    Relationship,
    Process,
    Serialization,
    Taxonomy,
    Science,
}

impl GenusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Feature => "feature",
            Self::Action => "action",
            Self::Relationship => "relationship",
            Self::Process => "process",
            Self::Serialization => "serialization",
            Self::Taxonomy => "taxonomy",
            Self::Science => "science",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    pub attr_type: AttrType,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDef {
    pub name: String,
    #[serde(default)]
    pub initial: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionDef {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    One,
    OneOrMore,
    ZeroOrMore,
}

impl Cardinality {
    /// Roles with this cardinality must be bound at creation.
    pub fn requires_member(self) -> bool {
        matches!(self, Self::One | Self::OneOrMore)
    }

    pub fn at_most_one(self) -> bool {
        matches!(self, Self::One)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::One => "one",
            Self::OneOrMore => "one_or_more",
            Self::ZeroOrMore => "zero_or_more",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDef {
    pub name: String,
    pub cardinality: Cardinality,
    /// Genus names allowed as members; empty means unconstrained.
    #[serde(default)]
    pub valid_member_genera: Vec<String>,
}

// ============================================================================
// Actions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDef {
    pub name: String,
    pub genus_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    pub param_type: AttrType,
    #[serde(default)]
    pub required: bool,
}

/// One typed side effect of an action handler.
///
/// String fields may carry `$now`, `$res.<resource>.id` and `$param.<name>`
/// tokens, substituted at execution time. `res` fields name a declared
/// resource, or hold a literal res id after substitution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffectDef {
    SetAttribute {
        res: String,
        key: String,
        value: Value,
    },
    TransitionStatus {
        res: String,
        target: String,
    },
    CreateLog {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        res: Option<String>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        severity: Option<String>,
    },
    CreateError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        res: Option<String>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        severity: Option<String>,
    },
    CreateTask {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        res: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<String>,
        #[serde(default)]
        context_res_ids: Vec<String>,
    },
    CreateRes {
        genus_name: String,
        #[serde(default)]
        attributes: BTreeMap<String, Value>,
    },
}

/// Payload of `action_handler_defined`: the full ordered step list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerSteps {
    pub steps: Vec<SideEffectDef>,
}

// ============================================================================
// Processes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneDef {
    pub name: String,
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    TaskStep {
        task_title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<String>,
    },
    GateStep {
        gate_conditions: Vec<String>,
    },
    ActionStep {
        action_name: String,
        #[serde(default)]
        action_resource_bindings: BTreeMap<String, String>,
    },
    FetchStep {
        fetch_source: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    pub name: String,
    pub lane: String,
    pub position: u32,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDef {
    pub event: String,
    #[serde(default)]
    pub config: Value,
}

// ============================================================================
// Serialization
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    ByGenus,
    ById,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializationInputDef {
    pub query_type: QueryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genus_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializationOutputDef {
    pub format: String,
    pub output_shape: String,
}

/// Template tree evaluated per exported entity. `name` and `template`
/// fields may carry `{{entity.*}}` / `{{feature.*}}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeNodeDef {
    File {
        name: String,
        template: String,
    },
    Directory {
        name: String,
        children: Vec<TreeNodeDef>,
    },
    /// Replicates its children once per feature of the entity, with the
    /// `{{feature.*}}` namespace bound.
    ForEachFeature {
        children: Vec<TreeNodeDef>,
    },
}

// ============================================================================
// Define / evolve inputs
// ============================================================================

use crate::ResId;

/// Input to `define_genus` and its kind-specific wrappers.
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct GenusDef {
    #[builder(into)]
    pub name: String,
    #[builder(default = GenusKind::Entity)]
    pub kind: GenusKind,
    #[builder(default)]
    pub attributes: Vec<AttributeDef>,
    #[builder(default)]
    pub states: Vec<StateDef>,
    #[builder(default)]
    pub transitions: Vec<TransitionDef>,
    #[builder(default)]
    pub roles: Vec<RoleDef>,
    #[builder(default)]
    pub meta: BTreeMap<String, Value>,
    pub taxonomy_id: Option<ResId>,
    #[builder(default)]
    pub resources: Vec<ResourceDef>,
    #[builder(default)]
    pub parameters: Vec<ParameterDef>,
    #[builder(default)]
    pub handler: Vec<SideEffectDef>,
    #[builder(default)]
    pub lanes: Vec<LaneDef>,
    #[builder(default)]
    pub steps: Vec<StepDef>,
    #[builder(default)]
    pub triggers: Vec<TriggerDef>,
    pub input: Option<SerializationInputDef>,
    pub output: Option<SerializationOutputDef>,
    #[builder(default)]
    pub tree: Vec<TreeNodeDef>,
}

/// Additive evolution of an existing genus. Values already present on the
/// genus append nothing.
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct GenusEvolution {
    #[builder(default)]
    pub attributes: Vec<AttributeDef>,
    #[builder(default)]
    pub states: Vec<StateDef>,
    #[builder(default)]
    pub transitions: Vec<TransitionDef>,
    #[builder(default)]
    pub roles: Vec<RoleDef>,
    #[builder(default)]
    pub meta: BTreeMap<String, Value>,
}
