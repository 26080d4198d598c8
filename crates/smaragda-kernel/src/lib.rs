//! The Smaragda kernel: an event-sourced knowledge store.
//!
//! Every piece of state is an append-only log of small facts ("tessellae")
//! attached to addressable objects ("res"). Higher-level concepts such as
//! typed entities, state machines, features, relationships, actions,
//! processes, branches, workspaces and schedules are defined *inside* the
//! same log by meta-objects ("genera") and folded back into current state
//! by a handful of pure reducers.
//!
//! The [`Kernel`] handle owns a single-writer redb database. All mutating
//! operations run serially, one write transaction per API call; validation
//! runs before the first append so error paths leave no partial writes.

mod action_ops;
mod bootstrap;
mod branch_ops;
mod entity_ops;
mod genus_ops;
mod health_ops;
mod palace;
mod process_ops;
mod reducers;
mod relationship_ops;
mod schedule_ops;
mod serialization_ops;
mod store_ops;
mod sync_ops;
mod tables;
mod workspace_ops;
#[cfg(test)]
mod tests;

use std::ops;
use std::path::PathBuf;
use std::{io, result};

use smaragda_core::cron::CronParseError;
use smaragda_core::{ResId, Tessella, TessellaId};
use smaragda_util_error::BoxedError;
use snafu::{Location, ResultExt as _, Snafu};
use tokio::sync::broadcast;
use tokio::task::JoinError;
use tracing::debug;

pub use self::action_ops::{ActionOutcome, HistoryEntry};
pub use self::branch_ops::{BranchComparison, MergeConflictInfo, MergeOutcome};
pub use self::entity_ops::{EntityListing, ListFilter, SearchHit, SearchOpts};
pub use self::genus_ops::{GenusListing, ScienceDescription, TaxonomyInfo, TaxonomyListing};
pub use self::health_ops::{HealthIssue, HealthReport, IssueSeverity};
pub use self::process_ops::TaskCompletion;
pub use self::relationship_ops::RelationshipRef;
pub use self::reducers::{
    default_reducer, genus_reducer, process_instance_reducer, EntityState, FeatureState,
    GenusState, ProcessInstanceState, ProcessStatus, StepState, StepStatus,
};
pub use self::schedule_ops::{FiredSchedule, ScheduleDef, ScheduleTarget, TickOutcome, TickReport};
pub use self::serialization_ops::{ImportReport, ImportWarning, SerializationRun};
pub use self::store_ops::{AppendOpts, ReplayFilter};
pub use self::sync_ops::{SyncPullPayload, SyncResRow, SyncTessellaRow};
pub use self::tables::*;

pub(crate) const LOG_TARGET: &str = "smaragda::db";

/// The root branch. Always present, never terminal.
pub const MAIN_BRANCH: &str = "main";

pub struct WriteTransactionCtx {
    dbtx: redb_bincode::WriteTransaction,
    on_commit: std::sync::Mutex<Vec<Box<dyn FnOnce() + 'static>>>,
}

impl From<redb_bincode::WriteTransaction> for WriteTransactionCtx {
    fn from(dbtx: redb_bincode::WriteTransaction) -> Self {
        Self {
            dbtx,
            on_commit: std::sync::Mutex::new(vec![]),
        }
    }
}

impl ops::Deref for WriteTransactionCtx {
    type Target = redb_bincode::WriteTransaction;

    fn deref(&self) -> &Self::Target {
        &self.dbtx
    }
}

impl ops::DerefMut for WriteTransactionCtx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.dbtx
    }
}

impl WriteTransactionCtx {
    pub fn on_commit(&self, f: impl FnOnce() + 'static) {
        self.on_commit
            .lock()
            .expect("Locking failed")
            .push(Box::new(f));
    }

    fn commit(self) -> result::Result<(), redb::CommitError> {
        let Self { dbtx, on_commit } = self;

        dbtx.commit()?;

        for hook in on_commit.lock().expect("Locking failed").drain(..) {
            hook();
        }
        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum TableDumpError {
    #[snafu(display("Unknown table `{name}`"))]
    UnknownTable { name: String },
}
pub type TableDumpResult<T> = std::result::Result<T, TableDumpError>;

/// Storage-layer failures. Everything else wraps these transparently.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DbError {
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    DbVersionTooHigh {
        db_ver: u64,
        code_ver: u64,
        #[snafu(implicit)]
        location: Location,
    },
    Join {
        source: JoinError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Corrupt payload on tessella {id}"))]
    PayloadDecode {
        id: TessellaId,
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    DbTxLogic {
        source: BoxedError,
        #[snafu(implicit)]
        location: Location,
    },
}
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Typed error surface of the kernel ops.
///
/// Every variant's message names the violated contract; `execute_action`
/// and `tick_cron` catch these and report them as `error` strings so batch
/// loops survive a bad handler.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum KernelError {
    #[snafu(transparent)]
    Db { source: DbError },

    #[snafu(display("Res {res_id} does not exist"))]
    ResNotFound { res_id: ResId },

    #[snafu(display("Genus {genus} does not exist"))]
    GenusNotFound { genus: String },

    #[snafu(display("Res {res_id} is not a {expected} genus"))]
    WrongGenusKind {
        res_id: ResId,
        expected: &'static str,
    },

    #[snafu(display("Unknown attribute {attribute:?} on genus {genus:?}"))]
    UnknownAttribute { genus: String, attribute: String },

    #[snafu(display(
        "Type mismatch for attribute {attribute:?}: expected {expected}, got {actual}"
    ))]
    TypeMismatch {
        attribute: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[snafu(display("State {state:?} is not defined on genus {genus:?}"))]
    StateUndefined { genus: String, state: String },

    #[snafu(display(
        "No valid transition from {from:?} to {to:?} on genus {genus:?}"
    ))]
    NoValidTransition {
        genus: String,
        from: String,
        to: String,
    },

    #[snafu(display("Feature {feature_id:?} not found on res {res_id}"))]
    FeatureNotFound { res_id: ResId, feature_id: String },

    #[snafu(display(
        "Feature {feature_id:?} is not editable while the parent is {parent_status:?}"
    ))]
    FeatureNotEditable {
        feature_id: String,
        parent_status: String,
    },

    #[snafu(display("Role {role:?} requires at least one member"))]
    MissingRequiredRole { role: String },

    #[snafu(display("Role {role:?} is not defined on this relationship genus"))]
    UnknownRole { role: String },

    #[snafu(display(
        "Role {role:?} with cardinality {cardinality} cannot hold {count} members"
    ))]
    RoleCardinalityViolation {
        role: String,
        cardinality: &'static str,
        count: usize,
    },

    #[snafu(display(
        "Entity of genus {entity_genus:?} is not allowed in role {role:?} (allowed: {allowed})"
    ))]
    MemberGenusMismatch {
        role: String,
        entity_genus: String,
        allowed: String,
    },

    #[snafu(display("Action resource {resource:?} has no binding"))]
    MissingResourceBinding { resource: String },

    #[snafu(display(
        "Resource {resource:?} must be a {expected:?}, bound res is a {actual:?}"
    ))]
    ResourceGenusMismatch {
        resource: String,
        expected: String,
        actual: String,
    },

    #[snafu(display(
        "Resource {resource:?} must be in status {required:?}, bound res is {actual:?}"
    ))]
    ResourceStatusMismatch {
        resource: String,
        required: String,
        actual: String,
    },

    #[snafu(display("Required parameter {parameter:?} is missing"))]
    MissingRequiredParameter { parameter: String },

    #[snafu(display("Handler references undefined {token:?}"))]
    UndefinedTokenReference { token: String },

    #[snafu(display("Invalid cron expression: {source}"))]
    InvalidCronExpression { source: CronParseError },

    #[snafu(display("A {kind} named {name:?} already exists"))]
    DuplicateName { kind: &'static str, name: String },

    #[snafu(display("Taxonomy {taxonomy} is archived"))]
    ArchivedTaxonomy { taxonomy: String },

    #[snafu(display("Genus {genus} is deprecated"))]
    DeprecatedGenus { genus: String },

    #[snafu(display("Res {res_id} is a protected sentinel"))]
    SentinelProtected { res_id: ResId },

    #[snafu(display("Branch {branch:?} does not exist or is not reachable"))]
    BranchUnreachable { branch: String },

    #[snafu(display("Workspace {workspace:?} does not exist"))]
    WorkspaceNotFound { workspace: String },

    #[snafu(display("Workspace {workspace:?} still holds {count} res"))]
    WorkspaceNotEmpty { workspace: String, count: usize },

    #[snafu(display("Invalid definition: {reason}"))]
    InvalidDefinition { reason: String },

    #[snafu(display("Filesystem error at {path:?}"))]
    Io {
        path: String,
        source: io::Error,
    },
}
pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Handle over one Smaragda store.
///
/// Cheap to share behind an `Arc`; all mutation is serialized by the
/// underlying single-writer database.
#[derive(Debug)]
pub struct Kernel {
    inner: redb_bincode::Database,

    /// Branch that unqualified operations read and write.
    current_branch: std::sync::RwLock<String>,
    /// Workspace stamped onto newly created entities; also scopes listing.
    current_workspace: std::sync::RwLock<Option<String>>,

    new_tessellae_tx: broadcast::Sender<Tessella>,
}

impl Kernel {
    pub async fn mk_db_path(data_dir: &std::path::Path, name: &str) -> result::Result<PathBuf, io::Error> {
        tokio::fs::create_dir_all(&data_dir).await?;
        Ok(data_dir.join(format!("{name}.redb")))
    }

    /// Open an in-memory kernel, bootstrap included. For tests and
    /// scratch work.
    pub async fn open_in_memory() -> KernelResult<Kernel> {
        debug!(target: LOG_TARGET, "Opening in-memory database");
        let inner = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(DatabaseSnafu)?;
        Self::open_inner(inner).await
    }

    /// Open (or create) a kernel at `path`. Repeated opens are no-ops with
    /// respect to bootstrap: sentinel genera are only written once.
    pub async fn open(path: impl Into<PathBuf>) -> KernelResult<Kernel> {
        let path = path.into();
        debug!(target: LOG_TARGET, path = %path.display(), "Opening database");

        let inner = tokio::task::spawn_blocking(move || redb::Database::create(path))
            .await
            .context(JoinSnafu)?
            .context(DatabaseSnafu)?;

        Self::open_inner(inner).await
    }

    async fn open_inner(inner: redb::Database) -> KernelResult<Kernel> {
        let inner = redb_bincode::Database::from(inner);

        Self::write_with_inner(&inner, |tx| {
            Self::init_tables_tx(tx)?;
            Self::handle_db_ver_migrations(tx)?;
            Self::bootstrap_sentinels_tx(tx)?;
            Ok(())
        })
        .await?;

        let (new_tessellae_tx, _) = broadcast::channel(1024);

        Ok(Self {
            inner,
            current_branch: std::sync::RwLock::new(MAIN_BRANCH.to_owned()),
            current_workspace: std::sync::RwLock::new(None),
            new_tessellae_tx,
        })
    }

    pub async fn compact(&mut self) -> Result<bool, redb::CompactionError> {
        tokio::task::block_in_place(|| self.inner.as_raw_mut().compact())
    }

    /// Observe every tessella appended from now on. Senders fire after the
    /// owning transaction commits.
    pub fn tessella_subscribe(&self) -> broadcast::Receiver<Tessella> {
        self.new_tessellae_tx.subscribe()
    }

    /// Branch that unqualified reads and writes go to.
    pub fn current_branch(&self) -> String {
        self.current_branch
            .read()
            .expect("Locking failed")
            .clone()
    }

    pub fn current_workspace(&self) -> Option<String> {
        self.current_workspace
            .read()
            .expect("Locking failed")
            .clone()
    }

    pub async fn dump_table(&self, name: &str) -> TableDumpResult<()> {
        self.read_with(|tx| {
            match name {
                "res" => Self::dump_table_dbtx(tx, &tables::res::TABLE)?,
                "tessellae" => Self::dump_table_dbtx(tx, &tables::tessellae::TABLE)?,
                "branches" => Self::dump_table_dbtx(tx, &tables::branches::TABLE)?,
                "workspaces" => Self::dump_table_dbtx(tx, &tables::workspaces::TABLE)?,
                "actions_taken" => Self::dump_table_dbtx(tx, &tables::actions_taken::TABLE)?,
                "relationship_members" => {
                    Self::dump_table_dbtx(tx, &tables::relationship_members::TABLE)?
                }
                "sync_state" => Self::dump_table_dbtx(tx, &tables::sync_state::TABLE)?,
                _ => {
                    return Ok(Err(UnknownTableSnafu {
                        name: name.to_string(),
                    }
                    .build()));
                }
            }
            Ok(Ok(()))
        })
        .await
        .expect("Database panic")
    }

    pub(crate) fn dump_table_dbtx<K, V>(
        dbtx: &redb_bincode::ReadTransaction,
        def: &redb_bincode::TableDefinition<'_, K, V>,
    ) -> DbResult<()>
    where
        V: bincode::Decode<()> + bincode::Encode + serde::Serialize,
        K: bincode::Decode<()> + bincode::Encode + serde::Serialize,
    {
        let tbl = dbtx.open_table(def)?;
        for record in tbl.range(..)? {
            let (k, v) = record?;
            println!(
                "{} => {}",
                serde_json::to_string(&k.value()).expect("Can't fail"),
                serde_json::to_string(&v.value()).expect("Can't fail")
            )
        }
        Ok(())
    }

    /// Queue appended tessellae for broadcast once the transaction commits.
    pub(crate) fn notify_appended(&self, tx: &WriteTransactionCtx, tessellae: Vec<Tessella>) {
        if tessellae.is_empty() {
            return;
        }
        let sender = self.new_tessellae_tx.clone();
        tx.on_commit(move || {
            for tessella in tessellae {
                let _ = sender.send(tessella);
            }
        });
    }
}

impl Kernel {
    pub async fn write_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> KernelResult<T>,
    ) -> KernelResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = WriteTransactionCtx::from(
                inner
                    .begin_write()
                    .context(TransactionSnafu)
                    .map_err(KernelError::from)?,
            );
            let res = f(&dbtx)?;

            dbtx.commit().context(CommitSnafu).map_err(KernelError::from)?;

            Ok(res)
        })
    }

    pub async fn write_with<T>(
        &self,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> KernelResult<T>,
    ) -> KernelResult<T> {
        Self::write_with_inner(&self.inner, f).await
    }

    pub async fn read_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ redb_bincode::ReadTransaction) -> KernelResult<T>,
    ) -> KernelResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = inner
                .begin_read()
                .context(TransactionSnafu)
                .map_err(KernelError::from)?;

            f(&dbtx)
        })
    }

    pub async fn read_with<T>(
        &self,
        f: impl FnOnce(&'_ redb_bincode::ReadTransaction) -> KernelResult<T>,
    ) -> KernelResult<T> {
        Self::read_with_inner(&self.inner, f).await
    }
}
