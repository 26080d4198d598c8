//! The genus layer: define, evolve, deprecate and restore genera of every
//! kind, plus the taxonomy/science grouping layers.
//!
//! A genus is itself a res whose `genus_id` is the `META` sentinel; its
//! schema is carried in its own tessella stream. Definition validators run
//! before the first append, so a rejected definition leaves no trace.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use smaragda_core::defs::{
    AttributeDef, GenusDef, GenusEvolution, GenusKind, HandlerSteps, LaneDef, ParameterDef,
    ResourceDef, SideEffectDef, StateDef, StepDef, StepKind, TransitionDef,
};
use smaragda_core::tessella::{Created, GenusMetaSet};
use smaragda_core::{ResId, Tessella, Timestamp};
use tracing::debug;

use crate::action_ops::handler_tokens;
use crate::reducers::GenusState;
use crate::store_ops::ReplayFilter;
use crate::{
    branches, res, res_by_genus, tessellae, tessellae_by_res, ArchivedTaxonomySnafu,
    GenusNotFoundSnafu, InvalidDefinitionSnafu, Kernel, KernelResult, ResNotFoundSnafu,
    SentinelProtectedSnafu, UndefinedTokenReferenceSnafu, WriteTransactionCtx,
};

pub(crate) const LOG_TARGET: &str = "smaragda::genus";

#[derive(Debug, Clone)]
pub struct GenusListing {
    pub genus_id: ResId,
    pub state: GenusState,
}

/// Uniform view of a taxonomy, whether it is the sentinel default (a
/// meta-object) or a user taxonomy (an entity under the Taxonomy genus).
#[derive(Debug, Clone, Default)]
pub struct TaxonomyInfo {
    pub name: Option<String>,
    pub science_id: Option<ResId>,
    pub shared_science_ids: Vec<ResId>,
    pub archived: bool,
}

#[derive(Debug, Clone)]
pub struct TaxonomyListing {
    pub taxonomy_id: ResId,
    pub info: TaxonomyInfo,
}

#[derive(Debug, Clone)]
pub struct ScienceDescription {
    pub science_id: ResId,
    pub name: Option<String>,
    pub taxonomies: Vec<TaxonomyListing>,
}

impl Kernel {
    // ========================================================================
    // Definition validators. All throw before anything is appended.
    // ========================================================================

    pub(crate) fn validate_attributes(attributes: &[AttributeDef]) -> KernelResult<()> {
        let mut seen = std::collections::BTreeSet::new();
        for def in attributes {
            if def.name.is_empty() {
                return InvalidDefinitionSnafu {
                    reason: "attribute with empty name",
                }
                .fail();
            }
            if !seen.insert(def.name.as_str()) {
                return InvalidDefinitionSnafu {
                    reason: format!("duplicate attribute {:?}", def.name),
                }
                .fail();
            }
        }
        Ok(())
    }

    pub(crate) fn validate_state_machine(
        states: &[StateDef],
        transitions: &[TransitionDef],
    ) -> KernelResult<()> {
        if states.is_empty() {
            if !transitions.is_empty() {
                return InvalidDefinitionSnafu {
                    reason: "transitions without states",
                }
                .fail();
            }
            return Ok(());
        }

        let initial_count = states.iter().filter(|s| s.initial).count();
        if initial_count != 1 {
            return InvalidDefinitionSnafu {
                reason: format!("state machine needs exactly one initial state, got {initial_count}"),
            }
            .fail();
        }

        let names: std::collections::BTreeSet<&str> =
            states.iter().map(|s| s.name.as_str()).collect();
        if names.len() != states.len() {
            return InvalidDefinitionSnafu {
                reason: "duplicate state name",
            }
            .fail();
        }
        for t in transitions {
            for end in [&t.from, &t.to] {
                if !names.contains(end.as_str()) {
                    return InvalidDefinitionSnafu {
                        reason: format!("transition references undefined state {end:?}"),
                    }
                    .fail();
                }
            }
        }
        Ok(())
    }

    /// Reject handlers referencing resources or parameters the action does
    /// not declare.
    pub(crate) fn validate_action_handler(
        resources: &[ResourceDef],
        parameters: &[ParameterDef],
        handler: &[SideEffectDef],
    ) -> KernelResult<()> {
        let resource_names: std::collections::BTreeSet<&str> =
            resources.iter().map(|r| r.name.as_str()).collect();
        let parameter_names: std::collections::BTreeSet<&str> =
            parameters.iter().map(|p| p.name.as_str()).collect();

        for step in handler {
            let step_json = serde_json::to_value(step).expect("Step serialization can't fail");
            let (res_refs, param_refs) = handler_tokens(&step_json);
            for name in res_refs {
                if !resource_names.contains(name.as_str()) {
                    return UndefinedTokenReferenceSnafu {
                        token: format!("$res.{name}.id"),
                    }
                    .fail();
                }
            }
            for name in param_refs {
                if !parameter_names.contains(name.as_str()) {
                    return UndefinedTokenReferenceSnafu {
                        token: format!("$param.{name}"),
                    }
                    .fail();
                }
            }

            // `res` fields must name a declared resource (tokens and
            // literal ids are handled above / at run time).
            let target = match step {
                SideEffectDef::SetAttribute { res, .. }
                | SideEffectDef::TransitionStatus { res, .. } => Some(res),
                SideEffectDef::CreateLog { res, .. }
                | SideEffectDef::CreateError { res, .. }
                | SideEffectDef::CreateTask { res, .. } => res.as_ref(),
                SideEffectDef::CreateRes { .. } => None,
            };
            if let Some(target) = target {
                let is_token = target.starts_with('$');
                let is_literal_id = target.parse::<ResId>().is_ok();
                if !is_token && !is_literal_id && !resource_names.contains(target.as_str()) {
                    return UndefinedTokenReferenceSnafu {
                        token: target.clone(),
                    }
                    .fail();
                }
            }
        }
        Ok(())
    }

    pub(crate) fn validate_process_definition(
        lanes: &[LaneDef],
        steps: &[StepDef],
    ) -> KernelResult<()> {
        let lane_names: std::collections::BTreeSet<&str> =
            lanes.iter().map(|l| l.name.as_str()).collect();
        let step_names: std::collections::BTreeSet<&str> =
            steps.iter().map(|s| s.name.as_str()).collect();

        if step_names.len() != steps.len() {
            return InvalidDefinitionSnafu {
                reason: "duplicate step name",
            }
            .fail();
        }

        for step in steps {
            if !lane_names.contains(step.lane.as_str()) {
                return InvalidDefinitionSnafu {
                    reason: format!(
                        "step {:?} references undefined lane {:?}",
                        step.name, step.lane
                    ),
                }
                .fail();
            }
            if let StepKind::GateStep { gate_conditions } = &step.kind {
                for condition in gate_conditions {
                    if !step_names.contains(condition.as_str()) {
                        return InvalidDefinitionSnafu {
                            reason: format!(
                                "gate {:?} waits on undefined step {condition:?}",
                                step.name
                            ),
                        }
                        .fail();
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Define
    // ========================================================================

    pub(crate) fn define_genus_tx(
        &self,
        def: &GenusDef,
        branch: &str,
        now: Timestamp,
        tx: &WriteTransactionCtx,
    ) -> KernelResult<ResId> {
        let mut res_table = tx.open_table(&res::TABLE)?;
        let mut res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
        let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
        let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
        let branches_table = tx.open_table(&branches::TABLE)?;

        Self::validate_attributes(&def.attributes)?;
        Self::validate_state_machine(&def.states, &def.transitions)?;
        match def.kind {
            GenusKind::Action => {
                Self::validate_action_handler(&def.resources, &def.parameters, &def.handler)?
            }
            GenusKind::Process => {
                Self::validate_process_definition(&def.lanes, &def.steps)?
            }
            _ => {}
        }

        let taxonomy_id = def.taxonomy_id.unwrap_or(ResId::DEFAULT_TAXONOMY);
        let taxonomy = Self::read_taxonomy_tx(
            taxonomy_id,
            branch,
            &res_table,
            &branches_table,
            &tessellae_table,
            &by_res_table,
        )?
        .ok_or_else(|| ResNotFoundSnafu { res_id: taxonomy_id }.build())?;
        if taxonomy.archived {
            return ArchivedTaxonomySnafu {
                taxonomy: taxonomy_id.to_string(),
            }
            .fail();
        }

        let genus_id = Self::create_res_tx(
            ResId::META,
            branch,
            None,
            now,
            &mut res_table,
            &mut res_by_genus_table,
        )?;

        let mut produced = Vec::new();
        let push = |payload_kind: &str,
                        data: Value,
                        produced: &mut Vec<Tessella>,
                        res_table: &res::Table,
                        tessellae_table: &mut tessellae::Table,
                        by_res_table: &mut tessellae_by_res::Table|
         -> KernelResult<()> {
            produced.push(Self::append_tx(
                genus_id,
                payload_kind,
                data,
                branch,
                None,
                now,
                res_table,
                tessellae_table,
                by_res_table,
            )?);
            Ok(())
        };

        use smaragda_core::tessella::{kind, TessellaContent as _};

        push(
            kind::CREATED,
            Created {}.to_json(),
            &mut produced,
            &res_table,
            &mut tessellae_table,
            &mut by_res_table,
        )?;

        let mut meta: Vec<(String, Value)> = vec![
            ("name".to_owned(), Value::String(def.name.clone())),
            ("kind".to_owned(), json!(def.kind)),
            (
                "taxonomy_id".to_owned(),
                Value::String(taxonomy_id.to_string()),
            ),
        ];
        for (key, value) in &def.meta {
            meta.push((key.clone(), value.clone()));
        }
        for (key, value) in meta {
            push(
                kind::GENUS_META_SET,
                GenusMetaSet { key, value }.to_json(),
                &mut produced,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?;
        }

        for d in &def.attributes {
            push(kind::GENUS_ATTRIBUTE_DEFINED, d.to_json(), &mut produced, &res_table, &mut tessellae_table, &mut by_res_table)?;
        }
        for d in &def.states {
            push(kind::GENUS_STATE_DEFINED, d.to_json(), &mut produced, &res_table, &mut tessellae_table, &mut by_res_table)?;
        }
        for d in &def.transitions {
            push(kind::GENUS_TRANSITION_DEFINED, d.to_json(), &mut produced, &res_table, &mut tessellae_table, &mut by_res_table)?;
        }
        for d in &def.roles {
            push(kind::GENUS_ROLE_DEFINED, d.to_json(), &mut produced, &res_table, &mut tessellae_table, &mut by_res_table)?;
        }
        for d in &def.resources {
            push(kind::ACTION_RESOURCE_DEFINED, d.to_json(), &mut produced, &res_table, &mut tessellae_table, &mut by_res_table)?;
        }
        for d in &def.parameters {
            push(kind::ACTION_PARAMETER_DEFINED, d.to_json(), &mut produced, &res_table, &mut tessellae_table, &mut by_res_table)?;
        }
        if !def.handler.is_empty() {
            push(
                kind::ACTION_HANDLER_DEFINED,
                HandlerSteps {
                    steps: def.handler.clone(),
                }
                .to_json(),
                &mut produced,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?;
        }
        for d in &def.lanes {
            push(kind::PROCESS_LANE_DEFINED, d.to_json(), &mut produced, &res_table, &mut tessellae_table, &mut by_res_table)?;
        }
        for d in &def.steps {
            push(kind::PROCESS_STEP_DEFINED, d.to_json(), &mut produced, &res_table, &mut tessellae_table, &mut by_res_table)?;
        }
        for d in &def.triggers {
            push(kind::PROCESS_TRIGGER_DEFINED, d.to_json(), &mut produced, &res_table, &mut tessellae_table, &mut by_res_table)?;
        }
        if let Some(input) = &def.input {
            push(kind::SERIALIZATION_INPUT_DEFINED, input.to_json(), &mut produced, &res_table, &mut tessellae_table, &mut by_res_table)?;
        }
        if let Some(output) = &def.output {
            push(kind::SERIALIZATION_OUTPUT_DEFINED, output.to_json(), &mut produced, &res_table, &mut tessellae_table, &mut by_res_table)?;
        }
        if !def.tree.is_empty() {
            push(
                kind::SERIALIZATION_TREE_DEFINED,
                smaragda_core::tessella::SerializationTreeDef {
                    tree: def.tree.clone(),
                }
                .to_json(),
                &mut produced,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?;
        }

        debug!(
            target: LOG_TARGET,
            %genus_id,
            name = %def.name,
            kind = def.kind.as_str(),
            "Defined genus"
        );

        self.notify_appended(tx, produced);
        Ok(genus_id)
    }

    /// Define a genus of any kind. Validation runs first; a rejected
    /// definition appends nothing.
    pub async fn define_genus(&self, def: GenusDef) -> KernelResult<ResId> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| self.define_genus_tx(&def, &branch, now, tx))
            .await
    }

    async fn define_genus_as(&self, mut def: GenusDef, kind: GenusKind) -> KernelResult<ResId> {
        def.kind = kind;
        self.define_genus(def).await
    }

    pub async fn define_action_genus(&self, def: GenusDef) -> KernelResult<ResId> {
        self.define_genus_as(def, GenusKind::Action).await
    }

    pub async fn define_relationship_genus(&self, def: GenusDef) -> KernelResult<ResId> {
        self.define_genus_as(def, GenusKind::Relationship).await
    }

    pub async fn define_process_genus(&self, def: GenusDef) -> KernelResult<ResId> {
        self.define_genus_as(def, GenusKind::Process).await
    }

    pub async fn define_serialization_genus(&self, def: GenusDef) -> KernelResult<ResId> {
        self.define_genus_as(def, GenusKind::Serialization).await
    }

    // ========================================================================
    // Evolve / deprecate / restore
    // ========================================================================

    /// Additively evolve a genus. Values the genus already carries append
    /// nothing, so re-running an evolution is a no-op. A deprecated genus
    /// is restored first (rejected when its taxonomy is archived).
    pub async fn evolve_genus(
        &self,
        genus_id: ResId,
        evolution: GenusEvolution,
    ) -> KernelResult<Vec<Tessella>> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;

            let genus = Self::require_genus_tx(
                genus_id,
                &branch,
                &res_table,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;

            Self::validate_attributes(&evolution.attributes)?;

            let mut produced = Vec::new();

            if genus.is_deprecated() {
                Self::check_taxonomy_active_tx(
                    &genus,
                    &branch,
                    &res_table,
                    &branches_table,
                    &tessellae_table,
                    &by_res_table,
                )?;
                for (key, value) in
                    [("deprecated", json!(false)), ("deprecated_at", Value::Null)]
                {
                    produced.push(Self::append_content_tx(
                        genus_id,
                        &GenusMetaSet {
                            key: key.to_owned(),
                            value,
                        },
                        &branch,
                        None,
                        now,
                        &res_table,
                        &mut tessellae_table,
                        &mut by_res_table,
                    )?);
                }
            }

            for def in &evolution.attributes {
                if genus.attributes.contains_key(&def.name) {
                    continue;
                }
                produced.push(Self::append_content_tx(
                    genus_id, def, &branch, None, now,
                    &res_table, &mut tessellae_table, &mut by_res_table,
                )?);
            }

            for def in &evolution.states {
                if genus.states.contains_key(&def.name) {
                    continue;
                }
                if def.initial && genus.initial_state().is_some() {
                    return InvalidDefinitionSnafu {
                        reason: format!(
                            "state {:?} cannot be initial, the genus already has one",
                            def.name
                        ),
                    }
                    .fail();
                }
                produced.push(Self::append_content_tx(
                    genus_id, def, &branch, None, now,
                    &res_table, &mut tessellae_table, &mut by_res_table,
                )?);
            }

            let known_state = |name: &str| {
                genus.states.contains_key(name)
                    || evolution.states.iter().any(|s| s.name == name)
            };
            for def in &evolution.transitions {
                if genus.has_transition(&def.from, &def.to) {
                    continue;
                }
                for end in [&def.from, &def.to] {
                    if !known_state(end) {
                        return InvalidDefinitionSnafu {
                            reason: format!("transition references undefined state {end:?}"),
                        }
                        .fail();
                    }
                }
                produced.push(Self::append_content_tx(
                    genus_id, def, &branch, None, now,
                    &res_table, &mut tessellae_table, &mut by_res_table,
                )?);
            }

            for def in &evolution.roles {
                if let Some(existing) = genus.roles.get(&def.name) {
                    let new_genera: Vec<&String> = def
                        .valid_member_genera
                        .iter()
                        .filter(|g| {
                            !existing
                                .valid_member_genera
                                .iter()
                                .any(|e| e.eq_ignore_ascii_case(g))
                        })
                        .collect();
                    if existing.cardinality == def.cardinality && new_genera.is_empty() {
                        continue;
                    }
                }
                produced.push(Self::append_content_tx(
                    genus_id, def, &branch, None, now,
                    &res_table, &mut tessellae_table, &mut by_res_table,
                )?);
            }

            for (key, value) in &evolution.meta {
                if genus.meta.get(key) == Some(value) {
                    continue;
                }
                produced.push(Self::append_content_tx(
                    genus_id,
                    &GenusMetaSet {
                        key: key.clone(),
                        value: value.clone(),
                    },
                    &branch,
                    None,
                    now,
                    &res_table,
                    &mut tessellae_table,
                    &mut by_res_table,
                )?);
            }

            self.notify_appended(tx, produced.clone());
            Ok(produced)
        })
        .await
    }

    pub async fn deprecate_genus(&self, genus_id: ResId) -> KernelResult<()> {
        if genus_id.is_sentinel() {
            return SentinelProtectedSnafu { res_id: genus_id }.fail();
        }
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;

            Self::require_genus_tx(
                genus_id,
                &branch,
                &res_table,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;

            let mut produced = Vec::new();
            for (key, value) in [
                ("deprecated", json!(true)),
                ("deprecated_at", Value::String(now.to_string())),
            ] {
                produced.push(Self::append_content_tx(
                    genus_id,
                    &GenusMetaSet {
                        key: key.to_owned(),
                        value,
                    },
                    &branch,
                    None,
                    now,
                    &res_table,
                    &mut tessellae_table,
                    &mut by_res_table,
                )?);
            }
            self.notify_appended(tx, produced);
            Ok(())
        })
        .await
    }

    pub async fn restore_genus(&self, genus_id: ResId) -> KernelResult<()> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;

            let genus = Self::require_genus_tx(
                genus_id,
                &branch,
                &res_table,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;
            Self::check_taxonomy_active_tx(
                &genus,
                &branch,
                &res_table,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;

            let mut produced = Vec::new();
            for (key, value) in [("deprecated", json!(false)), ("deprecated_at", Value::Null)] {
                produced.push(Self::append_content_tx(
                    genus_id,
                    &GenusMetaSet {
                        key: key.to_owned(),
                        value,
                    },
                    &branch,
                    None,
                    now,
                    &res_table,
                    &mut tessellae_table,
                    &mut by_res_table,
                )?);
            }
            self.notify_appended(tx, produced);
            Ok(())
        })
        .await
    }

    // ========================================================================
    // Lookup & listing
    // ========================================================================

    /// Case-insensitive genus lookup by the `name` meta key.
    pub(crate) fn find_genus_by_name_tx(
        name: &str,
        branch: &str,
        res_by_genus_table: &impl res_by_genus::ReadableTable,
        branches_table: &impl branches::ReadableTable,
        tessellae_table: &impl tessellae::ReadableTable,
        by_res_table: &impl tessellae_by_res::ReadableTable,
    ) -> KernelResult<Option<(ResId, GenusState)>> {
        for row in
            res_by_genus_table.range((ResId::META, ResId::ZERO)..=(ResId::META, ResId::MAX))?
        {
            let (key, _) = row?;
            let genus_id = key.value().1;
            let state = Self::materialize_genus_tx(
                genus_id,
                branch,
                branches_table,
                tessellae_table,
                by_res_table,
            )?;
            if state
                .name()
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
            {
                return Ok(Some((genus_id, state)));
            }
        }
        Ok(None)
    }

    pub async fn find_genus_by_name(
        &self,
        name: &str,
    ) -> KernelResult<Option<(ResId, GenusState)>> {
        let branch = self.current_branch();
        self.read_with(|tx| {
            let res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            Self::find_genus_by_name_tx(
                name,
                &branch,
                &res_by_genus_table,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )
        })
        .await
    }

    /// Non-sentinel genera, optionally filtered to one taxonomy.
    pub async fn list_genera(
        &self,
        taxonomy: Option<ResId>,
    ) -> KernelResult<Vec<GenusListing>> {
        let branch = self.current_branch();
        self.read_with(|tx| {
            let res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;

            let mut out = Vec::new();
            for row in res_by_genus_table
                .range((ResId::META, ResId::ZERO)..=(ResId::META, ResId::MAX))?
            {
                let (key, _) = row?;
                let genus_id = key.value().1;
                if genus_id.is_sentinel() {
                    continue;
                }
                let state = Self::materialize_genus_tx(
                    genus_id,
                    &branch,
                    &branches_table,
                    &tessellae_table,
                    &by_res_table,
                )?;
                if let Some(taxonomy) = taxonomy {
                    if state.taxonomy_id() != Some(taxonomy) {
                        continue;
                    }
                }
                out.push(GenusListing { genus_id, state });
            }
            Ok(out)
        })
        .await
    }

    // ========================================================================
    // Taxonomy & science
    // ========================================================================

    /// Read a taxonomy uniformly: the sentinel default carries its data in
    /// genus meta, user taxonomies are entities under the Taxonomy genus.
    pub(crate) fn read_taxonomy_tx(
        taxonomy_id: ResId,
        branch: &str,
        res_table: &impl res::ReadableTable,
        branches_table: &impl branches::ReadableTable,
        tessellae_table: &impl tessellae::ReadableTable,
        by_res_table: &impl tessellae_by_res::ReadableTable,
    ) -> KernelResult<Option<TaxonomyInfo>> {
        let Some(record) = Self::get_res_tx(taxonomy_id, res_table)? else {
            return Ok(None);
        };

        if record.genus_id == ResId::META {
            let state = Self::materialize_genus_tx(
                taxonomy_id,
                branch,
                branches_table,
                tessellae_table,
                by_res_table,
            )?;
            if state.kind() != Some("taxonomy") {
                return Ok(None);
            }
            return Ok(Some(TaxonomyInfo {
                name: state.name().map(str::to_owned),
                science_id: state
                    .meta
                    .get("science_id")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok()),
                shared_science_ids: state
                    .meta
                    .get("shared_science_ids")
                    .and_then(Value::as_array)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(Value::as_str)
                            .filter_map(|s| s.parse().ok())
                            .collect()
                    })
                    .unwrap_or_default(),
                archived: state
                    .meta
                    .get("archived")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }));
        }

        if record.genus_id != ResId::TAXONOMY {
            return Ok(None);
        }

        let state = Self::materialize_tx(
            taxonomy_id,
            branch,
            &ReplayFilter::default(),
            branches_table,
            tessellae_table,
            by_res_table,
        )?;
        Ok(Some(TaxonomyInfo {
            name: state.attr_str("name").map(str::to_owned),
            science_id: state.attr_str("science_id").and_then(|s| s.parse().ok()),
            shared_science_ids: state
                .attributes
                .get("shared_science_ids")
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .filter_map(|s| s.parse().ok())
                        .collect()
                })
                .unwrap_or_default(),
            archived: state.status.as_deref() == Some("archived"),
        }))
    }

    /// Reject operations on genera whose owning taxonomy is archived.
    pub(crate) fn check_taxonomy_active_tx(
        genus: &GenusState,
        branch: &str,
        res_table: &impl res::ReadableTable,
        branches_table: &impl branches::ReadableTable,
        tessellae_table: &impl tessellae::ReadableTable,
        by_res_table: &impl tessellae_by_res::ReadableTable,
    ) -> KernelResult<()> {
        let Some(taxonomy_id) = genus.taxonomy_id() else {
            return Ok(());
        };
        let Some(taxonomy) = Self::read_taxonomy_tx(
            taxonomy_id,
            branch,
            res_table,
            branches_table,
            tessellae_table,
            by_res_table,
        )?
        else {
            return Ok(());
        };
        if taxonomy.archived {
            return ArchivedTaxonomySnafu {
                taxonomy: taxonomy
                    .name
                    .unwrap_or_else(|| taxonomy_id.to_string()),
            }
            .fail();
        }
        Ok(())
    }

    pub async fn create_taxonomy(
        &self,
        name: &str,
        science_id: Option<ResId>,
        shared_science_ids: Vec<ResId>,
    ) -> KernelResult<ResId> {
        let branch = self.current_branch();
        let workspace = self.current_workspace();
        let now = Timestamp::now();
        let science = science_id.unwrap_or(ResId::DEFAULT_SCIENCE);
        self.write_with(|tx| {
            let mut attributes = BTreeMap::new();
            attributes.insert("name".to_owned(), Value::String(name.to_owned()));
            attributes.insert(
                "science_id".to_owned(),
                Value::String(science.to_string()),
            );

            let mut produced = Vec::new();
            let taxonomy_id = Self::create_entity_tx(
                ResId::TAXONOMY,
                &attributes,
                &branch,
                workspace.as_deref(),
                None,
                now,
                tx,
                &mut produced,
            )?;

            if !shared_science_ids.is_empty() {
                let res_table = tx.open_table(&res::TABLE)?;
                let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
                let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
                produced.push(Self::append_content_tx(
                    taxonomy_id,
                    &smaragda_core::tessella::AttributeSet {
                        key: "shared_science_ids".to_owned(),
                        value: Value::Array(
                            shared_science_ids
                                .iter()
                                .map(|id| Value::String(id.to_string()))
                                .collect(),
                        ),
                    },
                    &branch,
                    None,
                    now,
                    &res_table,
                    &mut tessellae_table,
                    &mut by_res_table,
                )?);
            }

            self.notify_appended(tx, produced);
            Ok(taxonomy_id)
        })
        .await
    }

    pub async fn archive_taxonomy(&self, taxonomy_id: ResId) -> KernelResult<()> {
        if taxonomy_id.is_sentinel() {
            return SentinelProtectedSnafu { res_id: taxonomy_id }.fail();
        }
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let tessella =
                Self::transition_status_tx(taxonomy_id, "archived", &branch, None, now, tx)?;
            self.notify_appended(tx, vec![tessella]);
            Ok(())
        })
        .await
    }

    pub async fn restore_taxonomy(&self, taxonomy_id: ResId) -> KernelResult<()> {
        if taxonomy_id.is_sentinel() {
            return SentinelProtectedSnafu { res_id: taxonomy_id }.fail();
        }
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let tessella =
                Self::transition_status_tx(taxonomy_id, "active", &branch, None, now, tx)?;
            self.notify_appended(tx, vec![tessella]);
            Ok(())
        })
        .await
    }

    pub async fn create_science(&self, name: &str) -> KernelResult<ResId> {
        let branch = self.current_branch();
        let workspace = self.current_workspace();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let mut attributes = BTreeMap::new();
            attributes.insert("name".to_owned(), Value::String(name.to_owned()));
            let mut produced = Vec::new();
            let science_id = Self::create_entity_tx(
                ResId::SCIENCE,
                &attributes,
                &branch,
                workspace.as_deref(),
                None,
                now,
                tx,
                &mut produced,
            )?;
            self.notify_appended(tx, produced);
            Ok(science_id)
        })
        .await
    }

    /// Move a genus into a taxonomy.
    pub async fn assign_taxonomy(
        &self,
        genus_id: ResId,
        taxonomy_id: ResId,
    ) -> KernelResult<()> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;

            Self::require_genus_tx(
                genus_id,
                &branch,
                &res_table,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;
            Self::read_taxonomy_tx(
                taxonomy_id,
                &branch,
                &res_table,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?
            .ok_or_else(|| {
                GenusNotFoundSnafu {
                    genus: taxonomy_id.to_string(),
                }
                .build()
            })?;

            let tessella = Self::append_content_tx(
                genus_id,
                &GenusMetaSet {
                    key: "taxonomy_id".to_owned(),
                    value: Value::String(taxonomy_id.to_string()),
                },
                &branch,
                None,
                now,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?;
            self.notify_appended(tx, vec![tessella]);
            Ok(())
        })
        .await
    }

    /// A science with every taxonomy that belongs to it, directly or via
    /// `shared_science_ids`.
    pub async fn describe_science(
        &self,
        science_id: ResId,
    ) -> KernelResult<ScienceDescription> {
        let branch = self.current_branch();
        self.read_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;

            let name = if science_id.is_sentinel() {
                Self::materialize_genus_tx(
                    science_id,
                    &branch,
                    &branches_table,
                    &tessellae_table,
                    &by_res_table,
                )?
                .name()
                .map(str::to_owned)
            } else {
                Self::materialize_tx(
                    science_id,
                    &branch,
                    &ReplayFilter::default(),
                    &branches_table,
                    &tessellae_table,
                    &by_res_table,
                )?
                .attr_str("name")
                .map(str::to_owned)
            };

            let mut candidates = vec![ResId::DEFAULT_TAXONOMY];
            for row in res_by_genus_table
                .range((ResId::TAXONOMY, ResId::ZERO)..=(ResId::TAXONOMY, ResId::MAX))?
            {
                let (key, _) = row?;
                candidates.push(key.value().1);
            }

            let mut taxonomies = Vec::new();
            for taxonomy_id in candidates {
                let Some(info) = Self::read_taxonomy_tx(
                    taxonomy_id,
                    &branch,
                    &res_table,
                    &branches_table,
                    &tessellae_table,
                    &by_res_table,
                )?
                else {
                    continue;
                };
                let matches = info.science_id == Some(science_id)
                    || info.shared_science_ids.contains(&science_id);
                if matches {
                    taxonomies.push(TaxonomyListing { taxonomy_id, info });
                }
            }

            Ok(ScienceDescription {
                science_id,
                name,
                taxonomies,
            })
        })
        .await
    }
}
