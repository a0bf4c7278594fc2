//! System catalog model: entities, columns, hypertables, chunks
//!
//! These are the value objects the discovery layer hands to the rest of the
//! pipeline. Hypertables are TimescaleDB's time-partitioned tables, chunks
//! their physical child partitions, and vanilla tables everything else the
//! publication tracks.

use std::fmt;
use std::sync::Arc;

/// Schema reserved for chunk tables
pub const TIMESCALEDB_INTERNAL_SCHEMA: &str = "_timescaledb_internal";
/// Schema holding the TimescaleDB catalog tables
pub const TIMESCALEDB_CATALOG_SCHEMA: &str = "_timescaledb_catalog";

/// A `(schema, table)` pair identifying a relation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SystemEntity {
    schema_name: String,
    table_name: String,
}

impl SystemEntity {
    pub fn new(schema_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
        }
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Canonical, quoted `"schema"."table"` name
    pub fn canonical_name(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema_name, self.table_name)
    }
}

impl fmt::Display for SystemEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_name())
    }
}

/// Per-table replica identity configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    Default,
    Index,
    Full,
    Nothing,
}

impl ReplicaIdentity {
    /// Parse the single-character encoding used by `pg_class.relreplident`
    pub fn from_relreplident(c: char) -> Self {
        match c {
            'i' => ReplicaIdentity::Index,
            'f' => ReplicaIdentity::Full,
            'n' => ReplicaIdentity::Nothing,
            _ => ReplicaIdentity::Default,
        }
    }
}

impl fmt::Display for ReplicaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaIdentity::Default => write!(f, "DEFAULT"),
            ReplicaIdentity::Index => write!(f, "INDEX"),
            ReplicaIdentity::Full => write!(f, "FULL"),
            ReplicaIdentity::Nothing => write!(f, "NOTHING"),
        }
    }
}

/// A table column as seen by the discovery layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: String,
    data_type: u32,
    nullable: bool,
    primary_key: bool,
    replica_identity: bool,
}

impl Column {
    pub fn new(
        name: impl Into<String>,
        data_type: u32,
        nullable: bool,
        primary_key: bool,
        replica_identity: bool,
    ) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
            primary_key,
            replica_identity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// PostgreSQL type OID
    pub fn data_type(&self) -> u32 {
        self.data_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    pub fn is_replica_identity(&self) -> bool {
        self.replica_identity
    }
}

/// Helpers over a column list
pub trait Columns {
    fn has_primary_key(&self) -> bool;
    fn has_replica_identity(&self) -> bool;
    /// The columns forming the event key: primary key columns when present,
    /// replica identity index columns otherwise.
    fn key_columns(&self) -> Vec<&Column>;
}

impl Columns for [Column] {
    fn has_primary_key(&self) -> bool {
        self.iter().any(Column::is_primary_key)
    }

    fn has_replica_identity(&self) -> bool {
        self.iter().any(Column::is_replica_identity)
    }

    fn key_columns(&self) -> Vec<&Column> {
        if self.has_primary_key() {
            self.iter().filter(|c| c.is_primary_key()).collect()
        } else {
            self.iter().filter(|c| c.is_replica_identity()).collect()
        }
    }
}

/// A TimescaleDB hypertable, optionally backing a continuous aggregate
#[derive(Debug, Clone)]
pub struct Hypertable {
    id: i32,
    entity: SystemEntity,
    database_name: String,
    view_schema: Option<String>,
    view_name: Option<String>,
    replica_identity: ReplicaIdentity,
    columns: Vec<Column>,
}

impl Hypertable {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: i32,
        entity: SystemEntity,
        database_name: impl Into<String>,
        view_schema: Option<String>,
        view_name: Option<String>,
        replica_identity: ReplicaIdentity,
        columns: Vec<Column>,
    ) -> Self {
        Self {
            id,
            entity,
            database_name: database_name.into(),
            view_schema,
            view_name,
            replica_identity,
            columns,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn entity(&self) -> &SystemEntity {
        &self.entity
    }

    pub fn schema_name(&self) -> &str {
        self.entity.schema_name()
    }

    pub fn table_name(&self) -> &str {
        self.entity.table_name()
    }

    pub fn canonical_name(&self) -> String {
        self.entity.canonical_name()
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn view_schema(&self) -> Option<&str> {
        self.view_schema.as_deref()
    }

    pub fn view_name(&self) -> Option<&str> {
        self.view_name.as_deref()
    }

    /// A hypertable backs a continuous aggregate iff it resolves to a view
    pub fn is_continuous_aggregate(&self) -> bool {
        self.view_schema.is_some() && self.view_name.is_some()
    }

    pub fn replica_identity(&self) -> ReplicaIdentity {
        self.replica_identity
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn set_columns(&mut self, columns: Vec<Column>) {
        self.columns = columns;
    }
}

/// A non-TimescaleDB ("vanilla") table tracked by the publication
#[derive(Debug, Clone)]
pub struct BaseTable {
    entity: SystemEntity,
    database_name: String,
    replica_identity: ReplicaIdentity,
    columns: Vec<Column>,
}

impl BaseTable {
    pub fn new(
        entity: SystemEntity,
        database_name: impl Into<String>,
        replica_identity: ReplicaIdentity,
        columns: Vec<Column>,
    ) -> Self {
        Self {
            entity,
            database_name: database_name.into(),
            replica_identity,
            columns,
        }
    }

    pub fn entity(&self) -> &SystemEntity {
        &self.entity
    }

    pub fn schema_name(&self) -> &str {
        self.entity.schema_name()
    }

    pub fn table_name(&self) -> &str {
        self.entity.table_name()
    }

    pub fn canonical_name(&self) -> String {
        self.entity.canonical_name()
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn replica_identity(&self) -> ReplicaIdentity {
        self.replica_identity
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}

/// One physical partition of a hypertable
#[derive(Debug, Clone)]
pub struct Chunk {
    id: i32,
    hypertable_id: i32,
    entity: SystemEntity,
    compressed: bool,
    dropped: bool,
}

impl Chunk {
    pub fn new(
        id: i32,
        hypertable_id: i32,
        entity: SystemEntity,
        compressed: bool,
        dropped: bool,
    ) -> Self {
        Self {
            id,
            hypertable_id,
            entity,
            compressed,
            dropped,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn hypertable_id(&self) -> i32 {
        self.hypertable_id
    }

    pub fn entity(&self) -> &SystemEntity {
        &self.entity
    }

    pub fn schema_name(&self) -> &str {
        self.entity.schema_name()
    }

    pub fn table_name(&self) -> &str {
        self.entity.table_name()
    }

    pub fn canonical_name(&self) -> String {
        self.entity.canonical_name()
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped
    }
}

/// A table whose row changes flow through the emitter
#[derive(Debug, Clone)]
pub enum TrackedTable {
    Hypertable(Arc<Hypertable>),
    Vanilla(Arc<BaseTable>),
}

impl TrackedTable {
    pub fn schema_name(&self) -> &str {
        match self {
            TrackedTable::Hypertable(h) => h.schema_name(),
            TrackedTable::Vanilla(t) => t.schema_name(),
        }
    }

    pub fn table_name(&self) -> &str {
        match self {
            TrackedTable::Hypertable(h) => h.table_name(),
            TrackedTable::Vanilla(t) => t.table_name(),
        }
    }

    pub fn canonical_name(&self) -> String {
        match self {
            TrackedTable::Hypertable(h) => h.canonical_name(),
            TrackedTable::Vanilla(t) => t.canonical_name(),
        }
    }

    pub fn database_name(&self) -> &str {
        match self {
            TrackedTable::Hypertable(h) => h.database_name(),
            TrackedTable::Vanilla(t) => t.database_name(),
        }
    }

    pub fn replica_identity(&self) -> ReplicaIdentity {
        match self {
            TrackedTable::Hypertable(h) => h.replica_identity(),
            TrackedTable::Vanilla(t) => t.replica_identity(),
        }
    }

    pub fn columns(&self) -> &[Column] {
        match self {
            TrackedTable::Hypertable(h) => h.columns(),
            TrackedTable::Vanilla(t) => t.columns(),
        }
    }

    /// The identity the table filter matches against. Continuous aggregates
    /// match on their user-visible view; an aggregate with no resolvable
    /// view never matches.
    pub fn filter_identity(&self) -> Option<(&str, &str)> {
        match self {
            TrackedTable::Hypertable(h) if h.is_continuous_aggregate() => {
                match (h.view_schema(), h.view_name()) {
                    (Some(schema), Some(name)) => Some((schema, name)),
                    _ => None,
                }
            }
            TrackedTable::Hypertable(h) => Some((h.schema_name(), h.table_name())),
            TrackedTable::Vanilla(t) => Some((t.schema_name(), t.table_name())),
        }
    }
}
