//! Table initialization, schema versioning, and the idempotent sentinel
//! bootstrap.
//!
//! Sentinel genera are written through the ordinary append path on first
//! open; a store that already has the `META` res row is left untouched, so
//! repeated opens produce no duplicates.

use serde_json::{json, Value};
use smaragda_core::defs::{AttrType, AttributeDef, GenusKind, StateDef, TransitionDef};
use smaragda_core::tessella::{Created, GenusMetaSet};
use smaragda_core::{ResId, Timestamp};
use tracing::info;

use crate::{
    actions_taken, branches, db_version, inputs, palace_npcs, palace_rooms, palace_scrolls,
    relationship_members, relationship_members_rev, res, res_by_genus, serialization_runs,
    sync_state, tessella_actions, tessellae, tessellae_by_res, temporal_anchors, workspaces,
    BranchRecord, BranchStatus, DbResult, DbVersionTooHighSnafu, Kernel, KernelResult,
    WriteTransactionCtx, LOG_TARGET, MAIN_BRANCH,
};

struct SentinelGenus {
    id: ResId,
    name: &'static str,
    kind: Option<GenusKind>,
    attributes: Vec<AttributeDef>,
    states: Vec<StateDef>,
    transitions: Vec<TransitionDef>,
    extra_meta: Vec<(&'static str, Value)>,
}

fn attr(name: &str, attr_type: AttrType, required: bool) -> AttributeDef {
    AttributeDef {
        name: name.to_owned(),
        attr_type,
        required,
    }
}

fn state(name: &str, initial: bool) -> StateDef {
    StateDef {
        name: name.to_owned(),
        initial,
    }
}

fn trans(from: &str, to: &str) -> TransitionDef {
    TransitionDef {
        from: from.to_owned(),
        to: to.to_owned(),
    }
}

fn sentinel_genera() -> Vec<SentinelGenus> {
    vec![
        SentinelGenus {
            id: ResId::META,
            name: "Meta",
            kind: None,
            attributes: vec![],
            states: vec![],
            transitions: vec![],
            extra_meta: vec![],
        },
        SentinelGenus {
            id: ResId::LOG,
            name: "Log",
            kind: Some(GenusKind::Entity),
            attributes: vec![
                attr("message", AttrType::Text, true),
                attr("severity", AttrType::Text, false),
                attr("res_id", AttrType::Text, false),
            ],
            states: vec![],
            transitions: vec![],
            extra_meta: vec![],
        },
        SentinelGenus {
            id: ResId::ERROR,
            name: "Error",
            kind: Some(GenusKind::Entity),
            attributes: vec![
                attr("message", AttrType::Text, true),
                attr("severity", AttrType::Text, false),
                attr("res_id", AttrType::Text, false),
            ],
            states: vec![state("unacknowledged", true), state("acknowledged", false)],
            transitions: vec![trans("unacknowledged", "acknowledged")],
            extra_meta: vec![],
        },
        SentinelGenus {
            id: ResId::TASK,
            name: "Task",
            kind: Some(GenusKind::Entity),
            attributes: vec![
                attr("title", AttrType::Text, true),
                attr("priority", AttrType::Text, false),
                attr("step_name", AttrType::Text, false),
                attr("lane_name", AttrType::Text, false),
            ],
            states: vec![
                state("open", true),
                state("in_progress", false),
                state("completed", false),
                state("cancelled", false),
            ],
            transitions: vec![
                trans("open", "in_progress"),
                trans("open", "completed"),
                trans("open", "cancelled"),
                trans("in_progress", "completed"),
                trans("in_progress", "cancelled"),
            ],
            extra_meta: vec![],
        },
        SentinelGenus {
            id: ResId::BRANCH,
            name: "Branch",
            kind: Some(GenusKind::Entity),
            attributes: vec![
                attr("name", AttrType::Text, true),
                attr("parent_branch", AttrType::Text, false),
                attr("branch_point", AttrType::Number, false),
            ],
            states: vec![
                state("active", true),
                state("merged", false),
                state("discarded", false),
            ],
            transitions: vec![trans("active", "merged"), trans("active", "discarded")],
            extra_meta: vec![],
        },
        SentinelGenus {
            id: ResId::TAXONOMY,
            name: "Taxonomy",
            kind: Some(GenusKind::Entity),
            // `shared_science_ids` is written internally as a raw id list
            // and deliberately not declared here.
            attributes: vec![
                attr("name", AttrType::Text, true),
                attr("science_id", AttrType::Text, false),
            ],
            states: vec![state("active", true), state("archived", false)],
            transitions: vec![trans("active", "archived"), trans("archived", "active")],
            extra_meta: vec![],
        },
        SentinelGenus {
            id: ResId::DEFAULT_TAXONOMY,
            name: "General",
            kind: Some(GenusKind::Taxonomy),
            attributes: vec![],
            states: vec![],
            transitions: vec![],
            extra_meta: vec![(
                "science_id",
                Value::String(ResId::DEFAULT_SCIENCE.to_string()),
            )],
        },
        SentinelGenus {
            id: ResId::SCIENCE,
            name: "Science",
            kind: Some(GenusKind::Entity),
            attributes: vec![attr("name", AttrType::Text, true)],
            states: vec![],
            transitions: vec![],
            extra_meta: vec![],
        },
        SentinelGenus {
            id: ResId::DEFAULT_SCIENCE,
            name: "General",
            kind: Some(GenusKind::Science),
            attributes: vec![],
            states: vec![],
            transitions: vec![],
            extra_meta: vec![],
        },
        SentinelGenus {
            id: ResId::CRON_SCHEDULE,
            name: "Cron Schedule",
            kind: Some(GenusKind::Entity),
            attributes: vec![
                attr("name", AttrType::Text, true),
                attr("expression", AttrType::Text, false),
                attr("scheduled_at", AttrType::Text, false),
                attr("target_type", AttrType::Text, true),
                attr("target_genus_id", AttrType::Text, true),
                attr("target_config", AttrType::Filetree, false),
                attr("last_fired_at", AttrType::Text, false),
            ],
            states: vec![
                state("active", true),
                state("paused", false),
                state("retired", false),
            ],
            transitions: vec![
                trans("active", "paused"),
                trans("paused", "active"),
                trans("active", "retired"),
                trans("paused", "retired"),
            ],
            extra_meta: vec![],
        },
        SentinelGenus {
            id: ResId::WORKSPACE,
            name: "Workspace",
            kind: Some(GenusKind::Entity),
            attributes: vec![attr("name", AttrType::Text, true)],
            states: vec![],
            transitions: vec![],
            extra_meta: vec![],
        },
        SentinelGenus {
            id: ResId::PALACE_ROOM,
            name: "Palace Room",
            kind: Some(GenusKind::Entity),
            attributes: vec![
                attr("name", AttrType::Text, true),
                attr("description", AttrType::Text, false),
            ],
            states: vec![],
            transitions: vec![],
            extra_meta: vec![],
        },
        SentinelGenus {
            id: ResId::PALACE_SCROLL,
            name: "Palace Scroll",
            kind: Some(GenusKind::Entity),
            attributes: vec![
                attr("name", AttrType::Text, true),
                attr("text", AttrType::Text, false),
            ],
            states: vec![],
            transitions: vec![],
            extra_meta: vec![],
        },
        SentinelGenus {
            id: ResId::PALACE_NPC,
            name: "Palace NPC",
            kind: Some(GenusKind::Entity),
            attributes: vec![
                attr("name", AttrType::Text, true),
                attr("description", AttrType::Text, false),
            ],
            states: vec![],
            transitions: vec![],
            extra_meta: vec![],
        },
    ]
}

impl Kernel {
    /// Initialize all current schema tables.
    pub(crate) fn init_tables_tx(tx: &WriteTransactionCtx) -> DbResult<()> {
        tx.open_table(&db_version::TABLE)?;

        tx.open_table(&res::TABLE)?;
        tx.open_table(&res_by_genus::TABLE)?;
        tx.open_table(&tessellae::TABLE)?;
        tx.open_table(&tessellae_by_res::TABLE)?;
        tx.open_table(&inputs::TABLE)?;
        tx.open_table(&actions_taken::TABLE)?;
        tx.open_table(&tessella_actions::TABLE)?;

        tx.open_table(&relationship_members::TABLE)?;
        tx.open_table(&relationship_members_rev::TABLE)?;

        tx.open_table(&branches::TABLE)?;
        tx.open_table(&workspaces::TABLE)?;
        tx.open_table(&sync_state::TABLE)?;

        tx.open_table(&temporal_anchors::TABLE)?;
        tx.open_table(&serialization_runs::TABLE)?;

        tx.open_table(&palace_rooms::TABLE)?;
        tx.open_table(&palace_scrolls::TABLE)?;
        tx.open_table(&palace_npcs::TABLE)?;
        Ok(())
    }

    /// Database version check.
    ///
    /// New stores are stamped with the current schema version; stores from
    /// a newer kernel refuse to open. There are no historical versions to
    /// migrate from yet.
    pub(crate) fn handle_db_ver_migrations(dbtx: &WriteTransactionCtx) -> DbResult<()> {
        /// Current schema version. Increment on schema changes that
        /// require migration.
        const DB_VER: u64 = 1;

        let mut table_db_ver = dbtx.open_table(&db_version::TABLE)?;

        let Some(cur_db_ver) = table_db_ver.first()?.map(|g| g.1.value()) else {
            info!(target: LOG_TARGET, "Initializing new database");
            table_db_ver.insert(&(), &DB_VER)?;
            return Ok(());
        };

        if DB_VER < cur_db_ver {
            return DbVersionTooHighSnafu {
                db_ver: cur_db_ver,
                code_ver: DB_VER,
            }
            .fail();
        }

        Ok(())
    }

    /// Write the sentinel genera and the `"main"` branch row, once.
    ///
    /// Returns `true` when the store was freshly bootstrapped, `false` when
    /// the `META` res already existed.
    pub(crate) fn bootstrap_sentinels_tx(tx: &WriteTransactionCtx) -> KernelResult<bool> {
        let mut res_table = tx.open_table(&res::TABLE)?;
        let mut res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
        let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
        let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
        let mut branches_table = tx.open_table(&branches::TABLE)?;

        if Self::get_res_tx(ResId::META, &res_table)?.is_some() {
            return Ok(false);
        }

        let now = Timestamp::now();

        branches_table.insert(
            &MAIN_BRANCH.to_owned(),
            &BranchRecord {
                res_id: None,
                parent: None,
                branch_point: 0,
                status: BranchStatus::Active,
                created_at: now,
            },
        )?;

        for genus in sentinel_genera() {
            Self::insert_res_tx(
                genus.id,
                ResId::META,
                MAIN_BRANCH,
                None,
                now,
                &mut res_table,
                &mut res_by_genus_table,
            )?;
            Self::append_content_tx(
                genus.id,
                &Created {},
                MAIN_BRANCH,
                None,
                now,
                &res_table,
                &mut tessellae_table,
                &mut by_res_table,
            )?;

            let mut meta: Vec<(&str, Value)> =
                vec![("name", Value::String(genus.name.to_owned()))];
            if let Some(kind) = genus.kind {
                meta.push(("kind", json!(kind)));
            }
            meta.extend(genus.extra_meta);

            for (key, value) in meta {
                Self::append_content_tx(
                    genus.id,
                    &GenusMetaSet {
                        key: key.to_owned(),
                        value,
                    },
                    MAIN_BRANCH,
                    None,
                    now,
                    &res_table,
                    &mut tessellae_table,
                    &mut by_res_table,
                )?;
            }

            for def in &genus.attributes {
                Self::append_content_tx(
                    genus.id,
                    def,
                    MAIN_BRANCH,
                    None,
                    now,
                    &res_table,
                    &mut tessellae_table,
                    &mut by_res_table,
                )?;
            }
            for def in &genus.states {
                Self::append_content_tx(
                    genus.id,
                    def,
                    MAIN_BRANCH,
                    None,
                    now,
                    &res_table,
                    &mut tessellae_table,
                    &mut by_res_table,
                )?;
            }
            for def in &genus.transitions {
                Self::append_content_tx(
                    genus.id,
                    def,
                    MAIN_BRANCH,
                    None,
                    now,
                    &res_table,
                    &mut tessellae_table,
                    &mut by_res_table,
                )?;
            }
        }

        info!(target: LOG_TARGET, "Bootstrapped sentinel genera");

        Ok(true)
    }
}
