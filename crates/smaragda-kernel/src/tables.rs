//! Database table definitions for the Smaragda kernel.
//!
//! # Data Model Overview
//!
//! The store holds an append-only log of [`tessellae`] attached to
//! addressable objects ([`res`]). Everything else is either part of the log
//! (genus definitions, entity mutations, process instance events) or a
//! derived index that can be rebuilt by replaying it.
//!
//! ## Key Concepts
//!
//! - **Res**: an addressable object. A res row records its genus, the
//!   branch it was created on, an optional workspace tag, and its creation
//!   time. Res rows are never deleted.
//! - **Tessella**: one append-only fact belonging to exactly one res. The
//!   `id` is the global append order. Payloads are JSON strings at this
//!   boundary; typed everywhere above it.
//! - **Genus**: a res whose `genus_id` is the `META` sentinel. Its schema
//!   (attributes, states, transitions, roles, handler, lanes, …) is built
//!   from its own tessella stream by the genus reducer.
//! - **Branch**: a named line of descent over the log. A branch sees its
//!   ancestors' tessellae up to the recorded branch point plus its own.
//!
//! ## Table Categories
//!
//! ### Log tables (`res`, `tessellae`, …)
//! The source of truth. Everything in the store is reconstructible from
//! these two plus `inputs`/`actions_taken` audit rows.
//!
//! ### Index tables (`*_by_*`, `relationship_members*`, `palace_*`)
//! Derived lookups maintained in the same transaction as the tessellae they
//! mirror; the merge path rebuilds the relationship and palace indexes
//! wholesale from the log.
//!
//! ### Registry tables (`branches`, `workspaces`, `sync_state`)
//! Small name-keyed caches of state that also lives in the log (branch and
//! workspace entities), kept so replay does not need to materialize an
//! entity per lookup.

use bincode::{Decode, Encode};
use serde::Serialize;
use smaragda_core::{ResId, TessellaId, Timestamp};

#[macro_export]
macro_rules! def_table {
    ($(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty) => {
        #[allow(unused)]
        $(#[$outer])*
        pub mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub trait ReadableTable: redb_bincode::ReadableTable<Key, Value> {}
            impl<RT> ReadableTable for RT where RT: redb_bincode::ReadableTable<Key, Value> {}
            pub type Table<'a> = redb_bincode::Table<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

// ============================================================================
// SYSTEM TABLES
// ============================================================================

def_table! {
    /// Tracks database/schema version for migrations.
    db_version: () => u64
}

// ============================================================================
// LOG TABLES
// ============================================================================

def_table! {
    /// Addressable objects.
    res: ResId => ResRecord
}

def_table! {
    /// Res listing by genus.
    ///
    /// Key: (genus_id, res_id)
    /// Maintained at res creation (and on merge upsert); drives
    /// `list_entities`, search, health sweeps and the cron tick.
    res_by_genus: (ResId, ResId) => ()
}

def_table! {
    /// The append-only tessella log, keyed by global append order.
    tessellae: TessellaId => TessellaRecord
}

def_table! {
    /// Per-res replay index.
    ///
    /// Key: (res_id, tessella_id)
    /// Replay scans this instead of the whole log; branch visibility is
    /// resolved per record afterwards.
    tessellae_by_res: (ResId, TessellaId) => ()
}

def_table! {
    /// Raw external input log: a forensic record of what caused action
    /// invocations. Never read on any hot path.
    inputs: u64 => InputRecord
}

def_table! {
    /// Completed action invocations, with every tessella they produced.
    ///
    /// Failed invocations are deliberately absent: the log keeps whatever
    /// was written before the failure, but the action did not "happen".
    actions_taken: u64 => ActionTakenRecord
}

def_table! {
    /// Reverse index: tessella id -> the action invocation that wrote it.
    tessella_actions: TessellaId => u64
}

// ============================================================================
// RELATIONSHIP INDEX TABLES
// ============================================================================

def_table! {
    /// Relationship membership by relationship.
    ///
    /// Key: (relationship_id, entity_id)
    /// Value: the roles the entity fills in this relationship.
    relationship_members: (ResId, ResId) => RelationshipMemberRecord
}

def_table! {
    /// Relationship membership by entity (reverse key order of
    /// `relationship_members`, same record).
    relationship_members_rev: (ResId, ResId) => RelationshipMemberRecord
}

// ============================================================================
// REGISTRY TABLES
// ============================================================================

def_table! {
    /// Branch registry, keyed by branch name.
    ///
    /// Caches the branch entity's state (parent, branch point, status) so
    /// replay visibility does not materialize an entity per query. `"main"`
    /// has no backing entity and is never terminal.
    branches: String => BranchRecord
}

def_table! {
    /// Workspace registry, keyed by workspace name.
    workspaces: String => WorkspaceRecord
}

def_table! {
    /// Opaque key-value scratch for sync bookkeeping (last pushed tessella
    /// id, per-peer high-water marks).
    sync_state: String => String
}

// ============================================================================
// SIDE TABLES
// ============================================================================

def_table! {
    /// Temporal anchors: coarse historical placement of a res.
    temporal_anchors: ResId => TemporalAnchorRecord
}

def_table! {
    /// Audit of serialization exports.
    serialization_runs: u64 => SerializationRunRecord
}

// ============================================================================
// PALACE INDEX TABLES
// The Palace layer maintains these during normal operation; the kernel owns
// the schema and rebuilds them on branch merge so newly-visible entities
// appear and archived ones disappear.
// ============================================================================

def_table! {
    /// Palace rooms by entity id.
    palace_rooms: ResId => PalaceIndexRecord
}

def_table! {
    /// Palace scrolls by entity id.
    palace_scrolls: ResId => PalaceIndexRecord
}

def_table! {
    /// Palace NPCs by entity id.
    palace_npcs: ResId => PalaceIndexRecord
}

// ============================================================================
// Records
// ============================================================================

/// Row of the `res` table.
#[derive(Debug, Encode, Decode, Clone, Serialize)]
pub struct ResRecord {
    /// Genus of this res. The `META` sentinel's own row points at itself.
    pub genus_id: ResId,
    /// Branch the res was created on.
    pub branch_id: String,
    /// Optional workspace scoping tag; `None` means visible everywhere.
    pub workspace_id: Option<String>,
    pub created_at: Timestamp,
}

/// Row of the `tessellae` table. The in-memory [`Tessella`] form carries
/// the payload as `serde_json::Value`; this record is the storage boundary
/// where it becomes a JSON string.
///
/// [`Tessella`]: smaragda_core::Tessella
#[derive(Debug, Encode, Decode, Clone, Serialize)]
pub struct TessellaRecord {
    pub res_id: ResId,
    pub branch_id: String,
    pub kind: String,
    pub payload: String,
    pub created_at: Timestamp,
    /// Provenance tag (`"user:alice"`, `"sync:<peer>"`); drives unpushed
    /// selection.
    pub source: Option<String>,
}

/// Row of the `inputs` table.
#[derive(Debug, Encode, Decode, Clone, Serialize)]
pub struct InputRecord {
    pub source: Option<String>,
    pub kind: String,
    pub data: String,
    pub created_at: Timestamp,
}

/// Row of the `actions_taken` table.
#[derive(Debug, Encode, Decode, Clone, Serialize)]
pub struct ActionTakenRecord {
    pub action_genus_id: ResId,
    /// Resource role name -> bound res.
    pub resources: Vec<(String, ResId)>,
    /// Parameter map as JSON.
    pub params: String,
    /// Every tessella this invocation produced, in write order.
    pub tessella_ids: Vec<TessellaId>,
    pub created_at: Timestamp,
}

/// Roles an entity fills within one relationship.
#[derive(Debug, Encode, Decode, Clone, Default, Serialize)]
pub struct RelationshipMemberRecord {
    pub roles: Vec<String>,
}

#[derive(Debug, Encode, Decode, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BranchStatus {
    Active,
    Merged,
    Discarded,
}

impl BranchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Merged => "merged",
            Self::Discarded => "discarded",
        }
    }

    /// Merged and discarded are terminal: no writes, no switching.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Row of the `branches` registry.
#[derive(Debug, Encode, Decode, Clone, Serialize)]
pub struct BranchRecord {
    /// Backing Branch entity; `None` only for `"main"`.
    pub res_id: Option<ResId>,
    /// Parent branch name; `None` only for `"main"`.
    pub parent: Option<String>,
    /// Highest tessella id at branch creation: ancestors are visible up to
    /// here.
    pub branch_point: TessellaId,
    pub status: BranchStatus,
    pub created_at: Timestamp,
}

/// Row of the `workspaces` registry.
#[derive(Debug, Encode, Decode, Clone, Serialize)]
pub struct WorkspaceRecord {
    /// Backing Workspace entity.
    pub res_id: ResId,
    pub created_at: Timestamp,
}

/// Row of the `temporal_anchors` side table.
#[derive(Debug, Encode, Decode, Clone, PartialEq, Serialize)]
pub struct TemporalAnchorRecord {
    pub start_year: i32,
    pub end_year: Option<i32>,
    pub precision: String,
    pub calendar_note: Option<String>,
}

/// Row of the `serialization_runs` audit table.
#[derive(Debug, Encode, Decode, Clone, Serialize)]
pub struct SerializationRunRecord {
    pub serialization_genus_id: ResId,
    pub entity_ids: Vec<ResId>,
    pub file_count: u64,
    pub created_at: Timestamp,
}

/// Row of the three palace index tables.
#[derive(Debug, Encode, Decode, Clone, PartialEq, Serialize)]
pub struct PalaceIndexRecord {
    pub name: String,
    pub branch_id: String,
}
