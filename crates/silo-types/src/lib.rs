//! Shared identifiers, enums, and encoding helpers used across the silo
//! workspace.

pub mod encoding;

use std::fmt;
use std::num::{NonZeroU32, NonZeroU64};

/// Unique session identifier.
///
/// Drawn from the monotonic counter in the main-region header; ids start at
/// 1 and are never reused for the lifetime of the region.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct SessionId(NonZeroU64);

impl SessionId {
    /// Construct a `SessionId` from a raw counter value.
    ///
    /// Returns `None` for 0 (ids start at 1).
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sid#{}", self.0)
    }
}

/// Event-pipe identifier: names a per-subscription notification channel.
///
/// The file-descriptor side of the channel lives outside the core; the id is
/// what subscription records and connection-state records carry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct EvpipeId(NonZeroU32);

impl EvpipeId {
    /// Construct an `EvpipeId`; 0 is not a valid id.
    #[inline]
    pub const fn new(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u32 value.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for EvpipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evpipe#{}", self.0)
    }
}

/// Per-attach connection handle, unique within its owning process.
///
/// Connection-state records in the arena are keyed by `(conn_id, pid)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ConnId(NonZeroU64);

impl ConnId {
    /// Construct a `ConnId`; 0 is reserved.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// The datastores a module's data can live in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum Datastore {
    /// Persisted configuration applied on first attach.
    Startup,
    /// The currently applied configuration.
    Running,
    /// Operational state data.
    Operational,
}

impl Datastore {
    /// Number of datastores (sizes the per-datastore tables).
    pub const COUNT: usize = 3;

    /// All datastores in index order.
    pub const ALL: [Self; Self::COUNT] = [Self::Startup, Self::Running, Self::Operational];

    /// Table index of this datastore.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Startup => 0,
            Self::Running => 1,
            Self::Operational => 2,
        }
    }

    /// Datastore for a table index; `None` for out-of-range values.
    #[must_use]
    pub const fn from_index(idx: usize) -> Option<Self> {
        match idx {
            0 => Some(Self::Startup),
            1 => Some(Self::Running),
            2 => Some(Self::Operational),
            _ => None,
        }
    }

    /// Short lowercase label used in paths and log lines.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Running => "running",
            Self::Operational => "operational",
        }
    }
}

impl fmt::Display for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock modes accepted by the main-region locking sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared read access; recursive acquisition is supported.
    Read,
    /// Exclusive write access.
    Write,
    /// Exclusive write access without per-connection bookkeeping, for the
    /// window before the caller's connection-state record exists.
    WriteNoState,
}

impl LockMode {
    /// Whether this mode takes the write side of the lock record.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::WriteNoState)
    }
}

/// The lock kind recorded in a connection-state held-lock descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LockKind {
    /// No main-region lock held.
    None = 0,
    /// Read lock held; the descriptor's depth counts recursion.
    Read = 1,
    /// Write lock held.
    Write = 2,
}

impl LockKind {
    /// Parse the stored discriminant; `None` for unknown values.
    #[must_use]
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            _ => None,
        }
    }
}

/// Data-dependency type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DepType {
    /// Plain reference to another module.
    Ref = 0,
    /// Instance-identifier dependency with an xpath and an optional
    /// default module.
    InstId = 1,
}

impl DepType {
    /// Parse the stored discriminant; `None` for unknown values.
    #[must_use]
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Ref),
            1 => Some(Self::InstId),
            _ => None,
        }
    }
}

/// Direction of a move-item operation on a user-ordered list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum MoveDirection {
    /// Move the item one position towards the head.
    Up,
    /// Move the item one position towards the tail.
    Down,
}

/// Option bitmask for set-item / delete-item requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct EditOptions(pub u32);

impl EditOptions {
    /// Default behavior.
    pub const DEFAULT: Self = Self(0);
    /// Fail instead of creating missing parent nodes.
    pub const NON_RECURSIVE: Self = Self(1);
    /// Fail if the item already exists (set) or does not exist (delete).
    pub const STRICT: Self = Self(2);

    /// Whether all bits of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Option bitmask carried by subscription records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct SubOptions(pub u32);

impl SubOptions {
    /// Default behavior.
    pub const DEFAULT: Self = Self(0);
    /// Subscriber only wants to be notified, never to veto.
    pub const DONE_ONLY: Self = Self(1);
    /// Subscriber is passive and does not affect the datastore.
    pub const PASSIVE: Self = Self(2);

    /// Whether all bits of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A datastore value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    /// String leaf.
    Str(String),
    /// Signed integer leaf.
    Int(i64),
    /// Unsigned integer leaf.
    Uint(u64),
    /// Boolean leaf.
    Bool(bool),
    /// Decimal leaf.
    Decimal(f64),
    /// Presence container or leaf of type `empty`.
    Empty,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(v) => write!(f, "{v}"),
            Self::Uint(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Decimal(v) => write!(f, "{v}"),
            Self::Empty => f.write_str("(empty)"),
        }
    }
}

/// One typed error descriptor attached to validate/commit responses.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorDesc {
    /// The xpath the error refers to, when known.
    pub xpath: Option<String>,
    /// Human-readable message.
    pub message: String,
}
