//! As-of query augmentation for bitemporal relational data.
//!
//! Entities declare one or more time dimensions, each physically stored as a
//! `<dimension>_from` / `<dimension>_to` interval. Queries can be pinned to an
//! instant per dimension, explicitly or through a per-session scope registry,
//! and every record loaded that way remembers the instant(s) it was resolved
//! at so that associations traversed from it resolve at the same point.

pub mod association;
pub mod backend;
pub mod config;
pub mod datastore;
pub mod manifest;
pub mod model;
pub mod predicate;
pub mod record;
pub mod registry;
pub mod relation;
pub mod session;
pub mod sql;
pub mod walker;

pub use aideon_tempo_core::*;
pub use association::{
    Association, AssociationScope, LoadStrategy, ScopeFn, ScopeOwner, TemporalScope, TimeOverride,
};
pub use backend::{Backend, MemoryBackend, Row, period_columns};
pub use config::{DatabaseConfig, PoolConfig, PreloadPolicy, TempoConfig};
pub use datastore::{default_sqlite_path, load_or_init_config, open_store, open_store_from_manifest};
pub use manifest::{load_model, load_model_manifest, parse_model_manifest};
pub use model::{EntityType, Model, ModelBuilder};
pub use predicate::{CompareOp, Predicate, RangePredicateBuilder};
pub use record::{Loaded, Record};
pub use registry::{ScopeGuard, ScopeRegistry, ScopeState};
pub use relation::Relation;
pub use session::{ScopedSession, Session, TempoStore, TempoStoreBuilder};
pub use sql::SqlBackend;
pub use walker::{AssociationGraphWalker, IncludeTree};
