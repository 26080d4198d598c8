//! Typed entity mutations: attribute writes, status transitions, archival,
//! features, temporal anchors, listing and search.
//!
//! Every mutation validates against the entity's genus before the first
//! append, so error paths leave the log untouched.

use std::collections::BTreeMap;

use serde_json::Value;
use smaragda_core::defs::AttrType;
use smaragda_core::tessella::{
    Archived, AttributeRemoved, AttributeSet, Created, FeatureAttributeSet, FeatureCreated,
    FeatureStatusChanged, Restored, StatusChanged, TemporalAnchorSet,
};
use smaragda_core::{ResId, Tessella, Timestamp};

use crate::reducers::{EntityState, GenusState};
use crate::store_ops::ReplayFilter;
use crate::{
    branches, res, res_by_genus, temporal_anchors, tessellae, tessellae_by_res,
    DeprecatedGenusSnafu, FeatureNotEditableSnafu, FeatureNotFoundSnafu, GenusNotFoundSnafu,
    Kernel, KernelResult, NoValidTransitionSnafu, ResNotFoundSnafu, ResRecord,
    SentinelProtectedSnafu, StateUndefinedSnafu, TemporalAnchorRecord, TypeMismatchSnafu,
    UnknownAttributeSnafu, WriteTransactionCtx,
};

/// Scoping and pagination for [`Kernel::list_entities`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Ignore workspace scoping entirely.
    pub all_workspaces: bool,
    pub include_archived: bool,
    /// Resume after this res id.
    pub cursor: Option<ResId>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct EntityListing {
    pub res_id: ResId,
    pub state: EntityState,
}

/// Options for [`Kernel::search_entities`].
#[derive(Debug, Clone, Default)]
pub struct SearchOpts {
    pub genus_id: Option<ResId>,
    pub all_workspaces: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub res_id: ResId,
    pub genus_id: ResId,
    pub matched_attributes: Vec<String>,
    pub state: EntityState,
}

impl Kernel {
    // ========================================================================
    // Genus-aware helpers
    // ========================================================================

    pub(crate) fn require_res_tx(
        res_id: ResId,
        res_table: &impl res::ReadableTable,
    ) -> KernelResult<ResRecord> {
        Self::get_res_tx(res_id, res_table)?
            .ok_or_else(|| ResNotFoundSnafu { res_id }.build())
    }

    /// Load a genus by id, verifying the res exists and actually is a
    /// genus (`genus_id == META`).
    pub(crate) fn require_genus_tx(
        genus_id: ResId,
        branch: &str,
        res_table: &impl res::ReadableTable,
        branches_table: &impl branches::ReadableTable,
        tessellae_table: &impl tessellae::ReadableTable,
        by_res_table: &impl tessellae_by_res::ReadableTable,
    ) -> KernelResult<GenusState> {
        let Some(record) = Self::get_res_tx(genus_id, res_table)? else {
            return GenusNotFoundSnafu {
                genus: genus_id.to_string(),
            }
            .fail();
        };
        if record.genus_id != ResId::META {
            return GenusNotFoundSnafu {
                genus: genus_id.to_string(),
            }
            .fail();
        }
        Self::materialize_genus_tx(
            genus_id,
            branch,
            branches_table,
            tessellae_table,
            by_res_table,
        )
    }

    /// Validate one attribute value against a genus.
    pub(crate) fn validate_attribute_value(
        genus: &GenusState,
        genus_label: &str,
        key: &str,
        value: &Value,
    ) -> KernelResult<()> {
        let Some(def) = genus.attributes.get(key) else {
            return UnknownAttributeSnafu {
                genus: genus_label,
                attribute: key,
            }
            .fail();
        };
        if !def.attr_type.matches(value) {
            return TypeMismatchSnafu {
                attribute: key,
                expected: def.attr_type.name(),
                actual: AttrType::describe(value),
            }
            .fail();
        }
        Ok(())
    }

    fn genus_label(genus: &GenusState, genus_id: ResId) -> String {
        genus
            .name()
            .map(str::to_owned)
            .unwrap_or_else(|| genus_id.to_string())
    }

    /// Whether the res has a `created` tessella visible on `branch`. Res
    /// born on an unmerged sibling branch exist as rows but have no
    /// visible stream; sweeps skip them.
    pub(crate) fn visible_on_branch_tx(
        res_id: ResId,
        branch: &str,
        branches_table: &impl branches::ReadableTable,
        tessellae_table: &impl tessellae::ReadableTable,
        by_res_table: &impl tessellae_by_res::ReadableTable,
    ) -> KernelResult<bool> {
        let filter = ReplayFilter {
            kinds: Some(vec![smaragda_core::tessella::kind::CREATED.to_owned()]),
            limit: Some(1),
            ..ReplayFilter::default()
        };
        Ok(!Self::replay_tx(
            res_id,
            branch,
            &filter,
            branches_table,
            tessellae_table,
            by_res_table,
        )?
        .is_empty())
    }

    // ========================================================================
    // Entity mutations (_tx forms, reused by the action executor)
    // ========================================================================

    /// Create a typed entity: validate attributes, write `created`, the
    /// initial attributes, and the genus's initial status if it has states.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_entity_tx(
        genus_id: ResId,
        attributes: &BTreeMap<String, Value>,
        branch: &str,
        workspace: Option<&str>,
        source: Option<&str>,
        now: Timestamp,
        tx: &WriteTransactionCtx,
        produced: &mut Vec<Tessella>,
    ) -> KernelResult<ResId> {
        let mut res_table = tx.open_table(&res::TABLE)?;
        let mut res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
        let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
        let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
        let branches_table = tx.open_table(&branches::TABLE)?;

        let genus = Self::require_genus_tx(
            genus_id,
            branch,
            &res_table,
            &branches_table,
            &tessellae_table,
            &by_res_table,
        )?;
        let label = Self::genus_label(&genus, genus_id);

        if genus.is_deprecated() {
            return DeprecatedGenusSnafu { genus: label }.fail();
        }
        for (key, value) in attributes {
            Self::validate_attribute_value(&genus, &label, key, value)?;
        }

        let res_id = Self::create_res_tx(
            genus_id,
            branch,
            workspace,
            now,
            &mut res_table,
            &mut res_by_genus_table,
        )?;

        produced.push(Self::append_content_tx(
            res_id,
            &Created {},
            branch,
            source,
            now,
            &res_table,
            &mut tessellae_table,
            &mut by_res_table,
        )?);

        for (key, value) in attributes {
            produced.push(Self::append_content_tx(
                res_id,
                &AttributeSet {
                    key: key.clone(),
                    value: value.clone(),
                },
                branch,
                source,
                now,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?);
        }

        if let Some(initial) = genus.initial_state() {
            produced.push(Self::append_content_tx(
                res_id,
                &StatusChanged {
                    status: initial.to_owned(),
                },
                branch,
                source,
                now,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?);
        }

        Ok(res_id)
    }

    pub(crate) fn set_attribute_tx(
        res_id: ResId,
        key: &str,
        value: Value,
        branch: &str,
        source: Option<&str>,
        now: Timestamp,
        tx: &WriteTransactionCtx,
    ) -> KernelResult<Tessella> {
        let res_table = tx.open_table(&res::TABLE)?;
        let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
        let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
        let branches_table = tx.open_table(&branches::TABLE)?;

        let record = Self::require_res_tx(res_id, &res_table)?;
        let genus = Self::require_genus_tx(
            record.genus_id,
            branch,
            &res_table,
            &branches_table,
            &tessellae_table,
            &by_res_table,
        )?;
        let label = Self::genus_label(&genus, record.genus_id);
        Self::validate_attribute_value(&genus, &label, key, &value)?;

        Self::append_content_tx(
            res_id,
            &AttributeSet {
                key: key.to_owned(),
                value,
            },
            branch,
            source,
            now,
            &res_table,
            &mut tessellae_table,
            &mut by_res_table,
        )
    }

    pub(crate) fn remove_attribute_tx(
        res_id: ResId,
        key: &str,
        branch: &str,
        source: Option<&str>,
        now: Timestamp,
        tx: &WriteTransactionCtx,
    ) -> KernelResult<Tessella> {
        let res_table = tx.open_table(&res::TABLE)?;
        let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
        let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
        let branches_table = tx.open_table(&branches::TABLE)?;

        let record = Self::require_res_tx(res_id, &res_table)?;
        let genus = Self::require_genus_tx(
            record.genus_id,
            branch,
            &res_table,
            &branches_table,
            &tessellae_table,
            &by_res_table,
        )?;
        let label = Self::genus_label(&genus, record.genus_id);
        if !genus.attributes.contains_key(key) {
            return UnknownAttributeSnafu {
                genus: label,
                attribute: key,
            }
            .fail();
        }

        Self::append_content_tx(
            res_id,
            &AttributeRemoved { key: key.to_owned() },
            branch,
            source,
            now,
            &res_table,
            &mut tessellae_table,
            &mut by_res_table,
        )
    }

    /// Transition an entity's status along a defined transition of its
    /// genus's state machine.
    pub(crate) fn transition_status_tx(
        res_id: ResId,
        target: &str,
        branch: &str,
        source: Option<&str>,
        now: Timestamp,
        tx: &WriteTransactionCtx,
    ) -> KernelResult<Tessella> {
        let res_table = tx.open_table(&res::TABLE)?;
        let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
        let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
        let branches_table = tx.open_table(&branches::TABLE)?;

        let record = Self::require_res_tx(res_id, &res_table)?;
        let genus = Self::require_genus_tx(
            record.genus_id,
            branch,
            &res_table,
            &branches_table,
            &tessellae_table,
            &by_res_table,
        )?;
        let label = Self::genus_label(&genus, record.genus_id);

        if !genus.has_state(target) {
            return StateUndefinedSnafu {
                genus: label,
                state: target,
            }
            .fail();
        }

        let state = Self::materialize_tx(
            res_id,
            branch,
            &ReplayFilter::default(),
            &branches_table,
            &tessellae_table,
            &by_res_table,
        )?;
        let from = state.status.unwrap_or_default();

        if !genus.has_transition(&from, target) {
            return NoValidTransitionSnafu {
                genus: label,
                from,
                to: target,
            }
            .fail();
        }

        Self::append_content_tx(
            res_id,
            &StatusChanged {
                status: target.to_owned(),
            },
            branch,
            source,
            now,
            &res_table,
            &mut tessellae_table,
            &mut by_res_table,
        )
    }

    // ========================================================================
    // Public entity API
    // ========================================================================

    pub async fn create_entity(
        &self,
        genus_id: ResId,
        attributes: BTreeMap<String, Value>,
    ) -> KernelResult<ResId> {
        let branch = self.current_branch();
        let workspace = self.current_workspace();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let mut produced = Vec::new();
            let res_id = Self::create_entity_tx(
                genus_id,
                &attributes,
                &branch,
                workspace.as_deref(),
                None,
                now,
                tx,
                &mut produced,
            )?;
            self.notify_appended(tx, produced);
            Ok(res_id)
        })
        .await
    }

    pub async fn set_attribute(
        &self,
        res_id: ResId,
        key: &str,
        value: Value,
    ) -> KernelResult<Tessella> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let tessella = Self::set_attribute_tx(res_id, key, value, &branch, None, now, tx)?;
            self.notify_appended(tx, vec![tessella.clone()]);
            Ok(tessella)
        })
        .await
    }

    pub async fn remove_attribute(&self, res_id: ResId, key: &str) -> KernelResult<Tessella> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let tessella = Self::remove_attribute_tx(res_id, key, &branch, None, now, tx)?;
            self.notify_appended(tx, vec![tessella.clone()]);
            Ok(tessella)
        })
        .await
    }

    pub async fn transition_status(
        &self,
        res_id: ResId,
        target: &str,
    ) -> KernelResult<Tessella> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let tessella = Self::transition_status_tx(res_id, target, &branch, None, now, tx)?;
            self.notify_appended(tx, vec![tessella.clone()]);
            Ok(tessella)
        })
        .await
    }

    /// Archive an entity. Archival is a meta flag, not a row removal: the
    /// res stays addressable and replayable.
    pub async fn archive_entity(&self, res_id: ResId) -> KernelResult<Tessella> {
        if res_id.is_sentinel() {
            return SentinelProtectedSnafu { res_id }.fail();
        }
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            let tessella = Self::append_content_tx(
                res_id,
                &Archived {},
                &branch,
                None,
                now,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?;
            self.notify_appended(tx, vec![tessella.clone()]);
            Ok(tessella)
        })
        .await
    }

    pub async fn restore_entity(&self, res_id: ResId) -> KernelResult<Tessella> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            let tessella = Self::append_content_tx(
                res_id,
                &Restored {},
                &branch,
                None,
                now,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?;
            self.notify_appended(tx, vec![tessella.clone()]);
            Ok(tessella)
        })
        .await
    }

    /// Set the temporal anchor of a res: the side table row plus the
    /// `temporal_anchor_set` tessella recording the change in the log.
    pub async fn set_temporal_anchor(
        &self,
        res_id: ResId,
        anchor: TemporalAnchorRecord,
    ) -> KernelResult<Tessella> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            let mut anchors_table = tx.open_table(&temporal_anchors::TABLE)?;

            let tessella = Self::append_content_tx(
                res_id,
                &TemporalAnchorSet {
                    start_year: anchor.start_year,
                    end_year: anchor.end_year,
                    precision: anchor.precision.clone(),
                    calendar_note: anchor.calendar_note.clone(),
                },
                &branch,
                None,
                now,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?;
            anchors_table.insert(&res_id, &anchor)?;
            self.notify_appended(tx, vec![tessella.clone()]);
            Ok(tessella)
        })
        .await
    }

    pub async fn get_temporal_anchor(
        &self,
        res_id: ResId,
    ) -> KernelResult<Option<TemporalAnchorRecord>> {
        self.read_with(|tx| {
            let anchors_table = tx.open_table(&temporal_anchors::TABLE)?;
            Ok(anchors_table.get(&res_id)?.map(|g| g.value()))
        })
        .await
    }

    // ========================================================================
    // Features
    // ========================================================================

    /// Resolve the genus of an existing feature and enforce the
    /// `editable_parent_statuses` gate.
    fn feature_genus_for_edit_tx(
        parent_id: ResId,
        feature_id: &str,
        branch: &str,
        res_table: &impl res::ReadableTable,
        branches_table: &impl branches::ReadableTable,
        tessellae_table: &impl tessellae::ReadableTable,
        by_res_table: &impl tessellae_by_res::ReadableTable,
    ) -> KernelResult<GenusState> {
        Self::require_res_tx(parent_id, res_table)?;
        let parent_state = Self::materialize_tx(
            parent_id,
            branch,
            &ReplayFilter::default(),
            branches_table,
            tessellae_table,
            by_res_table,
        )?;
        let Some(feature) = parent_state.features.get(feature_id) else {
            return FeatureNotFoundSnafu {
                res_id: parent_id,
                feature_id,
            }
            .fail();
        };

        let feature_genus_id: ResId = feature.feature_genus.parse().map_err(|_| {
            GenusNotFoundSnafu {
                genus: feature.feature_genus.clone(),
            }
            .build()
        })?;
        let genus = Self::require_genus_tx(
            feature_genus_id,
            branch,
            res_table,
            branches_table,
            tessellae_table,
            by_res_table,
        )?;

        if let Some(allowed) = genus.editable_parent_statuses() {
            let parent_status = parent_state.status.clone().unwrap_or_default();
            if !allowed.iter().any(|s| *s == parent_status) {
                return FeatureNotEditableSnafu {
                    feature_id,
                    parent_status,
                }
                .fail();
            }
        }

        Ok(genus)
    }

    /// Create a feature embedded in the parent's stream. Returns the new
    /// feature id.
    pub async fn create_feature(
        &self,
        parent_id: ResId,
        feature_genus_id: ResId,
        attributes: BTreeMap<String, Value>,
    ) -> KernelResult<String> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;

            Self::require_res_tx(parent_id, &res_table)?;
            let genus = Self::require_genus_tx(
                feature_genus_id,
                &branch,
                &res_table,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;
            let label = Self::genus_label(&genus, feature_genus_id);
            if genus.is_deprecated() {
                return DeprecatedGenusSnafu { genus: label }.fail();
            }
            for (key, value) in &attributes {
                Self::validate_attribute_value(&genus, &label, key, value)?;
            }

            let feature_id = ResId::generate_at(now).to_string();
            let mut produced = vec![Self::append_content_tx(
                parent_id,
                &FeatureCreated {
                    feature_id: feature_id.clone(),
                    feature_genus: feature_genus_id.to_string(),
                    attributes: attributes.clone(),
                },
                &branch,
                None,
                now,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?];

            if let Some(initial) = genus.initial_state() {
                produced.push(Self::append_content_tx(
                    parent_id,
                    &FeatureStatusChanged {
                        feature_id: feature_id.clone(),
                        status: initial.to_owned(),
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
            Ok(feature_id)
        })
        .await
    }

    pub async fn set_feature_attribute(
        &self,
        parent_id: ResId,
        feature_id: &str,
        key: &str,
        value: Value,
    ) -> KernelResult<Tessella> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;

            let genus = Self::feature_genus_for_edit_tx(
                parent_id,
                feature_id,
                &branch,
                &res_table,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;
            let label = Self::genus_label(&genus, parent_id);
            Self::validate_attribute_value(&genus, &label, key, &value)?;

            let tessella = Self::append_content_tx(
                parent_id,
                &FeatureAttributeSet {
                    feature_id: feature_id.to_owned(),
                    key: key.to_owned(),
                    value,
                },
                &branch,
                None,
                now,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?;
            self.notify_appended(tx, vec![tessella.clone()]);
            Ok(tessella)
        })
        .await
    }

    pub async fn transition_feature_status(
        &self,
        parent_id: ResId,
        feature_id: &str,
        target: &str,
    ) -> KernelResult<Tessella> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;

            let genus = Self::feature_genus_for_edit_tx(
                parent_id,
                feature_id,
                &branch,
                &res_table,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;
            let label = Self::genus_label(&genus, parent_id);

            if !genus.has_state(target) {
                return StateUndefinedSnafu {
                    genus: label,
                    state: target,
                }
                .fail();
            }

            let parent_state = Self::materialize_tx(
                parent_id,
                &branch,
                &ReplayFilter::default(),
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;
            let from = parent_state
                .features
                .get(feature_id)
                .and_then(|f| f.status.clone())
                .unwrap_or_default();

            if !genus.has_transition(&from, target) {
                return NoValidTransitionSnafu {
                    genus: label,
                    from,
                    to: target,
                }
                .fail();
            }

            let tessella = Self::append_content_tx(
                parent_id,
                &FeatureStatusChanged {
                    feature_id: feature_id.to_owned(),
                    status: target.to_owned(),
                },
                &branch,
                None,
                now,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?;
            self.notify_appended(tx, vec![tessella.clone()]);
            Ok(tessella)
        })
        .await
    }

    // ========================================================================
    // Listing & search
    // ========================================================================

    /// Entities of a genus, workspace-scoped ("no workspace" means
    /// globally visible), archived excluded unless asked for. Returns the
    /// page plus a resume cursor when the limit cut the scan short.
    pub async fn list_entities(
        &self,
        genus_id: ResId,
        filter: ListFilter,
    ) -> KernelResult<(Vec<EntityListing>, Option<ResId>)> {
        let branch = self.current_branch();
        let workspace = self.current_workspace();
        self.read_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;

            let mut listings = Vec::new();
            for row in
                res_by_genus_table.range((genus_id, ResId::ZERO)..=(genus_id, ResId::MAX))?
            {
                let (key, _) = row?;
                let res_id = key.value().1;

                if let Some(cursor) = filter.cursor {
                    if res_id <= cursor {
                        continue;
                    }
                }
                if let Some(limit) = filter.limit {
                    if limit <= listings.len() {
                        return Ok((listings, Some(res_id)));
                    }
                }

                let record = Self::require_res_tx(res_id, &res_table)?;
                if !filter.all_workspaces {
                    if let Some(ws) = &record.workspace_id {
                        if Some(ws) != workspace.as_ref() {
                            continue;
                        }
                    }
                }
                if !Self::visible_on_branch_tx(
                    res_id,
                    &branch,
                    &branches_table,
                    &tessellae_table,
                    &by_res_table,
                )? {
                    continue;
                }

                let state = Self::materialize_tx(
                    res_id,
                    &branch,
                    &ReplayFilter::default(),
                    &branches_table,
                    &tessellae_table,
                    &by_res_table,
                )?;
                if state.archived && !filter.include_archived {
                    continue;
                }

                listings.push(EntityListing { res_id, state });
            }

            Ok((listings, None))
        })
        .await
    }

    /// Case-insensitive substring search over string-typed attributes of
    /// materialized entities.
    pub async fn search_entities(
        &self,
        query: &str,
        opts: SearchOpts,
    ) -> KernelResult<Vec<SearchHit>> {
        let branch = self.current_branch();
        let workspace = self.current_workspace();
        let needle = query.to_lowercase();
        self.read_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;
            let tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;

            let mut hits = Vec::new();
            for row in res_table.range(..)? {
                let (key, value) = row?;
                let res_id = key.value();
                let record = value.value();

                // Genera are not entities; skip them and anything outside
                // the requested genus.
                if record.genus_id == ResId::META {
                    continue;
                }
                if let Some(genus_id) = opts.genus_id {
                    if record.genus_id != genus_id {
                        continue;
                    }
                }
                if !opts.all_workspaces {
                    if let Some(ws) = &record.workspace_id {
                        if Some(ws) != workspace.as_ref() {
                            continue;
                        }
                    }
                }
                if !Self::visible_on_branch_tx(
                    res_id,
                    &branch,
                    &branches_table,
                    &tessellae_table,
                    &by_res_table,
                )? {
                    continue;
                }

                let state = Self::materialize_tx(
                    res_id,
                    &branch,
                    &ReplayFilter::default(),
                    &branches_table,
                    &tessellae_table,
                    &by_res_table,
                )?;
                if state.archived {
                    continue;
                }

                let matched_attributes: Vec<String> = state
                    .attributes
                    .iter()
                    .filter_map(|(key, value)| {
                        let text = value.as_str()?;
                        text.to_lowercase().contains(&needle).then(|| key.clone())
                    })
                    .collect();

                if matched_attributes.is_empty() {
                    continue;
                }

                hits.push(SearchHit {
                    res_id,
                    genus_id: record.genus_id,
                    matched_attributes,
                    state,
                });

                if let Some(limit) = opts.limit {
                    if limit <= hits.len() {
                        break;
                    }
                }
            }

            Ok(hits)
        })
        .await
    }
}
