//! Relationships: full res whose materialized state carries a `members`
//! map, mirrored in a pair of secondary indexes (by relationship and by
//! entity) maintained in the same transaction as the membership tessellae.

use std::collections::BTreeMap;

use smaragda_core::tessella::{Created, MemberAdded, MemberRemoved};
use smaragda_core::{ResId, Tessella, Timestamp};

use crate::reducers::GenusState;
use crate::store_ops::ReplayFilter;
use crate::{
    branches, relationship_members, relationship_members_rev, res, res_by_genus, tessellae,
    tessellae_by_res, DbResult, Kernel, KernelResult, MemberGenusMismatchSnafu,
    MissingRequiredRoleSnafu, RelationshipMemberRecord, RoleCardinalityViolationSnafu,
    UnknownRoleSnafu, WriteTransactionCtx, WrongGenusKindSnafu,
};

/// One relationship an entity participates in, with the roles it fills.
#[derive(Debug, Clone)]
pub struct RelationshipRef {
    pub relationship_id: ResId,
    pub roles: Vec<String>,
}

impl Kernel {
    pub(crate) fn index_member_added_tx(
        relationship_id: ResId,
        role: &str,
        entity_id: ResId,
        members_table: &mut relationship_members::Table,
        members_rev_table: &mut relationship_members_rev::Table,
    ) -> DbResult<()> {
        let mut record = members_table
            .get(&(relationship_id, entity_id))?
            .map(|g| g.value())
            .unwrap_or_default();
        if !record.roles.iter().any(|r| r == role) {
            record.roles.push(role.to_owned());
        }
        members_table.insert(&(relationship_id, entity_id), &record)?;
        members_rev_table.insert(&(entity_id, relationship_id), &record)?;
        Ok(())
    }

    pub(crate) fn index_member_removed_tx(
        relationship_id: ResId,
        role: &str,
        entity_id: ResId,
        members_table: &mut relationship_members::Table,
        members_rev_table: &mut relationship_members_rev::Table,
    ) -> DbResult<()> {
        let Some(mut record) = members_table
            .get(&(relationship_id, entity_id))?
            .map(|g| g.value())
        else {
            return Ok(());
        };
        record.roles.retain(|r| r != role);
        if record.roles.is_empty() {
            members_table.remove(&(relationship_id, entity_id))?;
            members_rev_table.remove(&(entity_id, relationship_id))?;
        } else {
            members_table.insert(&(relationship_id, entity_id), &record)?;
            members_rev_table.insert(&(entity_id, relationship_id), &record)?;
        }
        Ok(())
    }

    /// Check one member against a role's `valid_member_genera` (empty list
    /// means unconstrained).
    fn check_member_genus_tx(
        role: &str,
        entity_id: ResId,
        allowed: &[String],
        branch: &str,
        res_table: &impl res::ReadableTable,
        branches_table: &impl branches::ReadableTable,
        tessellae_table: &impl tessellae::ReadableTable,
        by_res_table: &impl tessellae_by_res::ReadableTable,
    ) -> KernelResult<()> {
        let record = Self::require_res_tx(entity_id, res_table)?;
        if allowed.is_empty() {
            return Ok(());
        }
        let genus = Self::materialize_genus_tx(
            record.genus_id,
            branch,
            branches_table,
            tessellae_table,
            by_res_table,
        )?;
        let name = genus.name().unwrap_or_default();
        if !allowed.iter().any(|a| a.eq_ignore_ascii_case(name)) {
            return MemberGenusMismatchSnafu {
                role,
                entity_genus: name,
                allowed: allowed.join(", "),
            }
            .fail();
        }
        Ok(())
    }

    fn require_relationship_genus(genus: &GenusState, genus_id: ResId) -> KernelResult<()> {
        if genus.kind() != Some("relationship") {
            return WrongGenusKindSnafu {
                res_id: genus_id,
                expected: "relationship",
            }
            .fail();
        }
        Ok(())
    }

    /// Create a relationship res with its initial members.
    ///
    /// Every `one`/`one_or_more` role must be bound, `one` roles to exactly
    /// one member; every member must exist and be of an allowed genus; no
    /// unknown role may be bound.
    pub async fn create_relationship(
        &self,
        genus_id: ResId,
        members: BTreeMap<String, Vec<ResId>>,
    ) -> KernelResult<ResId> {
        let branch = self.current_branch();
        let workspace = self.current_workspace();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let mut res_table = tx.open_table(&res::TABLE)?;
            let mut res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
            let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;
            let mut members_table = tx.open_table(&relationship_members::TABLE)?;
            let mut members_rev_table = tx.open_table(&relationship_members_rev::TABLE)?;

            let genus = Self::require_genus_tx(
                genus_id,
                &branch,
                &res_table,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;
            Self::require_relationship_genus(&genus, genus_id)?;

            for role in members.keys() {
                if !genus.roles.contains_key(role) {
                    return UnknownRoleSnafu { role }.fail();
                }
            }
            for (role_name, role) in &genus.roles {
                let count = members.get(role_name).map(Vec::len).unwrap_or(0);
                if role.cardinality.requires_member() && count == 0 {
                    return MissingRequiredRoleSnafu { role: role_name }.fail();
                }
                if role.cardinality.at_most_one() && 1 < count {
                    return RoleCardinalityViolationSnafu {
                        role: role_name,
                        cardinality: role.cardinality.as_str(),
                        count,
                    }
                    .fail();
                }
                for entity_id in members.get(role_name).map(Vec::as_slice).unwrap_or(&[]) {
                    Self::check_member_genus_tx(
                        role_name,
                        *entity_id,
                        &role.valid_member_genera,
                        &branch,
                        &res_table,
                        &branches_table,
                        &tessellae_table,
                        &by_res_table,
                    )?;
                }
            }

            let relationship_id = Self::create_res_tx(
                genus_id,
                &branch,
                workspace.as_deref(),
                now,
                &mut res_table,
                &mut res_by_genus_table,
            )?;

            let mut produced = vec![Self::append_content_tx(
                relationship_id,
                &Created {},
                &branch,
                None,
                now,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?];

            for (role, entities) in &members {
                for entity_id in entities {
                    produced.push(Self::append_content_tx(
                        relationship_id,
                        &MemberAdded {
                            role: role.clone(),
                            entity_id: *entity_id,
                        },
                        &branch,
                        None,
                        now,
                        &res_table,
                        &mut tessellae_table,
                        &mut by_res_table,
                    )?);
                    Self::index_member_added_tx(
                        relationship_id,
                        role,
                        *entity_id,
                        &mut members_table,
                        &mut members_rev_table,
                    )?;
                }
            }

            self.notify_appended(tx, produced);
            Ok(relationship_id)
        })
        .await
    }

    pub async fn add_member(
        &self,
        relationship_id: ResId,
        role: &str,
        entity_id: ResId,
    ) -> KernelResult<Tessella> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;
            let mut members_table = tx.open_table(&relationship_members::TABLE)?;
            let mut members_rev_table = tx.open_table(&relationship_members_rev::TABLE)?;

            let record = Self::require_res_tx(relationship_id, &res_table)?;
            let genus = Self::require_genus_tx(
                record.genus_id,
                &branch,
                &res_table,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;
            Self::require_relationship_genus(&genus, record.genus_id)?;

            let Some(role_def) = genus.roles.get(role) else {
                return UnknownRoleSnafu { role }.fail();
            };

            let state = Self::materialize_tx(
                relationship_id,
                &branch,
                &ReplayFilter::default(),
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;
            let current = state.members.get(role).map(Vec::as_slice).unwrap_or(&[]);
            if role_def.cardinality.at_most_one()
                && !current.is_empty()
                && !current.contains(&entity_id)
            {
                return RoleCardinalityViolationSnafu {
                    role,
                    cardinality: role_def.cardinality.as_str(),
                    count: current.len() + 1,
                }
                .fail();
            }
            Self::check_member_genus_tx(
                role,
                entity_id,
                &role_def.valid_member_genera,
                &branch,
                &res_table,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;

            let tessella = Self::append_content_tx(
                relationship_id,
                &MemberAdded {
                    role: role.to_owned(),
                    entity_id,
                },
                &branch,
                None,
                now,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?;
            Self::index_member_added_tx(
                relationship_id,
                role,
                entity_id,
                &mut members_table,
                &mut members_rev_table,
            )?;

            self.notify_appended(tx, vec![tessella.clone()]);
            Ok(tessella)
        })
        .await
    }

    pub async fn remove_member(
        &self,
        relationship_id: ResId,
        role: &str,
        entity_id: ResId,
    ) -> KernelResult<Tessella> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let res_table = tx.open_table(&res::TABLE)?;
            let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
            let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
            let branches_table = tx.open_table(&branches::TABLE)?;
            let mut members_table = tx.open_table(&relationship_members::TABLE)?;
            let mut members_rev_table = tx.open_table(&relationship_members_rev::TABLE)?;

            let record = Self::require_res_tx(relationship_id, &res_table)?;
            let genus = Self::require_genus_tx(
                record.genus_id,
                &branch,
                &res_table,
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;
            Self::require_relationship_genus(&genus, record.genus_id)?;

            let Some(role_def) = genus.roles.get(role) else {
                return UnknownRoleSnafu { role }.fail();
            };

            let state = Self::materialize_tx(
                relationship_id,
                &branch,
                &ReplayFilter::default(),
                &branches_table,
                &tessellae_table,
                &by_res_table,
            )?;
            let current = state.members.get(role).map(Vec::as_slice).unwrap_or(&[]);
            if current.contains(&entity_id)
                && role_def.cardinality.requires_member()
                && current.len() == 1
            {
                return RoleCardinalityViolationSnafu {
                    role,
                    cardinality: role_def.cardinality.as_str(),
                    count: 0usize,
                }
                .fail();
            }

            let tessella = Self::append_content_tx(
                relationship_id,
                &MemberRemoved {
                    role: role.to_owned(),
                    entity_id,
                },
                &branch,
                None,
                now,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?;
            Self::index_member_removed_tx(
                relationship_id,
                role,
                entity_id,
                &mut members_table,
                &mut members_rev_table,
            )?;

            self.notify_appended(tx, vec![tessella.clone()]);
            Ok(tessella)
        })
        .await
    }

    /// O(1)-ish lookup of the relationships an entity participates in,
    /// optionally narrowed to one role.
    pub async fn relationships_for(
        &self,
        entity_id: ResId,
        role: Option<&str>,
    ) -> KernelResult<Vec<RelationshipRef>> {
        self.read_with(|tx| {
            let members_rev_table = tx.open_table(&relationship_members_rev::TABLE)?;
            let mut out = Vec::new();
            for row in
                members_rev_table.range((entity_id, ResId::ZERO)..=(entity_id, ResId::MAX))?
            {
                let (key, value) = row?;
                let record: RelationshipMemberRecord = value.value();
                if let Some(role) = role {
                    if !record.roles.iter().any(|r| r == role) {
                        continue;
                    }
                }
                out.push(RelationshipRef {
                    relationship_id: key.value().1,
                    roles: record.roles,
                });
            }
            Ok(out)
        })
        .await
    }
}
