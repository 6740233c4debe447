//! Configuration for databases, collections, transactions and the WAL
//!
//! All options are plain immutable structs handed in at construction time.
//! The structs that reach disk (collection config, index definitions) carry
//! serde derives matching the stored JSON shape.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DbError, Result};

/// Database name that forces the in-memory storage adapter for every
/// collection, regardless of the adapter configured per collection.
pub const MEMORY_DB_NAME: &str = ":memory:";

/// Default transaction timeout (30 s)
pub const DEFAULT_TX_TIMEOUT_MS: u64 = 30_000;

/// Sort order of a single index field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn is_desc(self) -> bool {
        matches!(self, SortOrder::Desc)
    }
}

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IsolationLevel {
    /// Reads may observe state committed by other transactions between
    /// statements. Writes keep the same per-transaction buffer semantics.
    #[serde(rename = "READ_COMMITTED")]
    ReadCommitted,

    /// Per-transaction view = committed base + own buffer; other
    /// transactions' buffers are never visible.
    #[default]
    #[serde(rename = "SNAPSHOT_ISOLATION")]
    SnapshotIsolation,
}

/// Per-transaction options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionOptions {
    /// Maximum transaction lifetime in milliseconds
    #[serde(default = "default_tx_timeout")]
    pub timeout: u64,

    #[serde(default, rename = "isolationLevel")]
    pub isolation_level: IsolationLevel,
}

fn default_tx_timeout() -> u64 {
    DEFAULT_TX_TIMEOUT_MS
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TX_TIMEOUT_MS,
            isolation_level: IsolationLevel::default(),
        }
    }
}

/// WAL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalOptions {
    /// Write a WAL entry for every transactional mutation
    #[serde(default, rename = "enableWAL")]
    pub enable_wal: bool,

    /// Replay the WAL on `Database::connect`
    #[serde(default = "default_true", rename = "autoRecovery")]
    pub auto_recovery: bool,

    /// WAL file path; defaults to `<root>/<dbName>.wal`
    #[serde(default, rename = "walPath")]
    pub wal_path: Option<PathBuf>,

    /// Maximum milliseconds between background flushes
    #[serde(default = "default_flush_interval", rename = "flushInterval")]
    pub flush_interval: u64,

    /// Entries buffered in memory before a flush is forced
    #[serde(default = "default_max_buffer", rename = "maxBufferSize")]
    pub max_buffer_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_flush_interval() -> u64 {
    1_000
}

fn default_max_buffer() -> usize {
    100
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            enable_wal: false,
            auto_recovery: true,
            wal_path: None,
            flush_interval: default_flush_interval(),
            max_buffer_size: default_max_buffer(),
        }
    }
}

/// Top-level database options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseOptions {
    /// Database name. `":memory:"` forces the memory adapter everywhere.
    #[serde(rename = "dbName")]
    pub db_name: String,

    /// Root directory for the schema manifest and collection data
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Enable the transaction manager and WAL integration
    #[serde(default, rename = "enableTransactions")]
    pub enable_transactions: bool,

    #[serde(default, rename = "walOptions")]
    pub wal: WalOptions,
}

fn default_root() -> PathBuf {
    PathBuf::from("./data")
}

impl DatabaseOptions {
    pub fn new(db_name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            db_name: db_name.into(),
            root: root.into(),
            enable_transactions: false,
            wal: WalOptions::default(),
        }
    }

    /// A throwaway in-memory database (memory adapters, no WAL file)
    pub fn in_memory() -> Self {
        Self::new(MEMORY_DB_NAME, "./data")
    }

    pub fn is_memory(&self) -> bool {
        self.db_name == MEMORY_DB_NAME
    }

    pub fn with_transactions(mut self) -> Self {
        self.enable_transactions = true;
        self
    }

    pub fn with_wal(mut self, wal: WalOptions) -> Self {
        self.enable_transactions = true;
        self.wal = wal;
        self
    }
}

/// Time-to-live for collection records
///
/// Deserializes from either a millisecond count or a human duration
/// string ("90s", "5m", "2h 30m").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ttl(pub u64);

impl Ttl {
    pub fn as_millis(self) -> u64 {
        self.0
    }
}

impl FromStr for Ttl {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(ms) = s.parse::<u64>() {
            return Ok(Ttl(ms));
        }
        let d: Duration = humantime::parse_duration(s)
            .map_err(|e| DbError::InvalidConfig(format!("bad ttl '{}': {}", s, e)))?;
        Ok(Ttl(d.as_millis() as u64))
    }
}

impl Serialize for Ttl {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for Ttl {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Ttl(ms)),
            Raw::Text(s) => Ttl::from_str(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// Which primary store backs a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    /// In-memory map persisted as one JSON file per collection
    #[default]
    List,
    /// One JSON file per record under `<root>/<collection>/`
    PerFile,
}

/// Which adapter persists collection snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    #[default]
    File,
    Memory,
}

/// Identity descriptor of a collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityDef {
    /// Name of the identity field inside each record
    #[serde(default = "default_id_field")]
    pub field: String,

    /// Generate a value when the field is absent on insert
    #[serde(default = "default_true")]
    pub auto: bool,

    /// Registry name of the generator (`autoIncIdGen`, `autoTimestamp`)
    #[serde(default = "default_id_gen")]
    pub gen: String,
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_id_gen() -> String {
    "autoIncIdGen".to_string()
}

impl Default for IdentityDef {
    fn default() -> Self {
        Self {
            field: default_id_field(),
            auto: true,
            gen: default_id_gen(),
        }
    }
}

/// One field of a composite index definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum KeySpec {
    /// Shorthand: field path only, ascending
    Name(String),
    /// Explicit field path with sort order
    Spec {
        key: String,
        #[serde(default)]
        order: SortOrder,
    },
}

impl KeySpec {
    pub fn path(&self) -> &str {
        match self {
            KeySpec::Name(s) => s,
            KeySpec::Spec { key, .. } => key,
        }
    }

    pub fn order(&self) -> SortOrder {
        match self {
            KeySpec::Name(_) => SortOrder::Asc,
            KeySpec::Spec { order, .. } => *order,
        }
    }
}

/// Stored form of an index definition (spec shape, serde camelCase)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IndexDef {
    /// Single-field index: dotted path of the key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Composite index: ordered list of fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<KeySpec>>,

    #[serde(default, skip_serializing_if = "is_default_order")]
    pub order: SortOrder,

    /// Auto-generate the key value on insert (identity indexes)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique: bool,

    /// Skip records whose key is null
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sparse: bool,

    /// Reject records whose key is null
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,

    #[serde(default, rename = "ignoreCase", skip_serializing_if = "std::ops::Not::not")]
    pub ignore_case: bool,

    /// Composite-key separator; NUL when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,

    /// Registry name of the identity generator backing an `auto` index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen: Option<String>,

    /// Registry name of the key transform (`identity`, `lowercase`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
}

fn is_default_order(order: &SortOrder) -> bool {
    *order == SortOrder::Asc
}

impl IndexDef {
    /// Single ascending field
    pub fn field(path: impl Into<String>) -> Self {
        Self {
            key: Some(path.into()),
            ..Default::default()
        }
    }

    /// Composite index over the given specs
    pub fn composite(keys: Vec<KeySpec>) -> Self {
        Self {
            keys: Some(keys),
            ..Default::default()
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn desc(mut self) -> Self {
        self.order = SortOrder::Desc;
        self
    }

    pub fn is_composite(&self) -> bool {
        self.keys.is_some()
    }
}

/// Collection configuration (persisted into the schema manifest)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionOptions {
    pub name: String,

    /// Storage path hint; defaults to `<db root>/<dbName>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Records older than this are removed by the TTL sweep
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Ttl>,

    /// Cron expression triggering scheduled archival
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate: Option<String>,

    /// Wrap records in versioned audit envelopes
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub audit: bool,

    #[serde(default, rename = "list")]
    pub storage: StorageKind,

    #[serde(default)]
    pub adapter: AdapterKind,

    #[serde(default)]
    pub id: IdentityDef,

    /// Index definitions keyed by index name
    #[serde(default, rename = "indexList", skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<(String, IndexDef)>,
}

impl CollectionOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: None,
            ttl: None,
            rotate: None,
            audit: false,
            storage: StorageKind::default(),
            adapter: AdapterKind::default(),
            id: IdentityDef::default(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, name: impl Into<String>, def: IndexDef) -> Self {
        self.indexes.push((name.into(), def));
        self
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_audit(mut self) -> Self {
        self.audit = true;
        self
    }

    pub fn with_rotation(mut self, cron_expr: impl Into<String>) -> Self {
        self.rotate = Some(cron_expr.into());
        self
    }

    pub fn per_file(mut self) -> Self {
        self.storage = StorageKind::PerFile;
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.adapter = AdapterKind::Memory;
        self
    }
}
