//! Byte-level layout of the main region and every arena record kind.
//!
//! Both regions are host files with a little-endian, offset-addressed
//! layout. All access goes through the explicit accessors below; there is no
//! `repr(C)` overlay of Rust structs onto region bytes.

use silo_error::{Result, SiloError};
use silo_types::encoding::{get_u16_at, get_u32_at, get_u64_at, put_u16_at, put_u32_at, put_u64_at};
use silo_types::Datastore;
use xxhash_rust::xxh3::xxh3_64;

/// Magic bytes identifying a valid silo main region.
pub const MAGIC: [u8; 8] = *b"SILOSHM\0";

/// Current layout version.
pub const LAYOUT_VERSION: u32 = 1;

/// Bound on the inline revision string (including its terminator).
pub const REV_MAX: usize = 32;

// ---------------------------------------------------------------------------
// Main-region header
// ---------------------------------------------------------------------------

/// Byte offsets of the main-region header fields.
///
/// The volatile block (`VOLATILE_START..VOLATILE_END`) holds the two lock
/// records, the schema mutex, and the id counters. It is mutated only by
/// direct file read-modify-write under the header guard byte and is synced
/// back before any bulk flush of the main image.
pub mod hdr {
    /// `[u8;8]` — `"SILOSHM\0"`.
    pub const MAGIC: usize = 0;
    pub const MAGIC_LEN: usize = 8;

    /// `u32` — layout version.
    pub const VERSION: usize = 8;

    /// `u32` — header size in bytes (sanity for attaching processes).
    pub const HEADER_BYTES: usize = 12;

    /// `u64` — xxh3_64 over the immutable prologue (`0..16`).
    pub const PROLOGUE_CHECKSUM: usize = 16;

    /// First byte of the volatile block.
    pub const VOLATILE_START: usize = 24;

    /// `u32` — main lock reader count.
    pub const MAIN_READERS: usize = 24;
    /// `u32` — main lock writer PID (0 = unlocked).
    pub const MAIN_WRITER: usize = 28;
    /// `u32` — remap-guard lock reader count.
    pub const REMAP_READERS: usize = 32;
    /// `u32` — remap-guard lock writer PID.
    pub const REMAP_WRITER: usize = 36;
    /// `u32` — schema-models mutex holder PID.
    pub const SCHEMA_HOLDER: usize = 40;
    /// `u32` — alignment padding (always 0).
    pub const ALIGN0: usize = 44;
    /// `u64` — next session id (monotonic, starts at 1).
    pub const NEXT_SESSION_ID: usize = 48;
    /// `u64` — next event-pipe id (monotonic, starts at 1).
    pub const NEXT_EVPIPE_ID: usize = 56;

    /// One past the last byte of the volatile block.
    pub const VOLATILE_END: usize = 64;

    /// `u64` — arena offset of the connection-state array.
    pub const CONNS: usize = 64;
    /// `u32` — connection-state count.
    pub const CONN_COUNT: usize = 72;
    /// `u32` — alignment padding.
    pub const ALIGN1: usize = 76;
    /// `u64` — arena offset of the RPC table.
    pub const RPCS: usize = 80;
    /// `u32` — RPC count.
    pub const RPC_COUNT: usize = 88;
    /// `u32` — alignment padding.
    pub const ALIGN2: usize = 92;

    /// Total header size; module records start here.
    pub const HEADER_SIZE: usize = 96;
}

/// Compute the checksum stored at [`hdr::PROLOGUE_CHECKSUM`].
#[must_use]
pub fn prologue_checksum() -> u64 {
    let mut data = Vec::with_capacity(16);
    data.extend_from_slice(&MAGIC);
    data.extend_from_slice(&LAYOUT_VERSION.to_le_bytes());
    data.extend_from_slice(&(hdr::HEADER_SIZE as u32).to_le_bytes());
    xxh3_64(&data)
}

/// One-time initialization of a freshly created main region.
pub fn init_main_header(buf: &mut [u8]) {
    buf[hdr::MAGIC..hdr::MAGIC + hdr::MAGIC_LEN].copy_from_slice(&MAGIC);
    put_u32_at(buf, hdr::VERSION, LAYOUT_VERSION);
    put_u32_at(buf, hdr::HEADER_BYTES, hdr::HEADER_SIZE as u32);
    put_u64_at(buf, hdr::PROLOGUE_CHECKSUM, prologue_checksum());
    // Lock records and table pointers are zero; counters start at 1.
    put_u64_at(buf, hdr::NEXT_SESSION_ID, 1);
    put_u64_at(buf, hdr::NEXT_EVPIPE_ID, 1);
}

/// Validate the prologue of an attached main region.
pub fn check_main_header(buf: &[u8]) -> Result<()> {
    if buf.len() < hdr::HEADER_SIZE {
        return Err(SiloError::ShmTooSmall { size: buf.len() });
    }
    if buf[hdr::MAGIC..hdr::MAGIC + hdr::MAGIC_LEN] != MAGIC {
        return Err(SiloError::ShmBadMagic);
    }
    let version = get_u32_at(buf, hdr::VERSION);
    if version != LAYOUT_VERSION {
        return Err(SiloError::ShmVersionMismatch { found: version });
    }
    if get_u64_at(buf, hdr::PROLOGUE_CHECKSUM) != prologue_checksum() {
        return Err(SiloError::ShmChecksumMismatch);
    }
    Ok(())
}

/// Number of module records in a main region of `size` bytes.
#[must_use]
pub fn module_count(size: usize) -> usize {
    size.saturating_sub(hdr::HEADER_SIZE) / modrec::SIZE
}

/// Base offset of module record `idx`.
#[must_use]
pub fn module_base(idx: usize) -> usize {
    hdr::HEADER_SIZE + idx * modrec::SIZE
}

// ---------------------------------------------------------------------------
// Module record
// ---------------------------------------------------------------------------

/// Field offsets inside one fixed-width module record.
pub mod modrec {
    /// `u64` — arena offset of the module name.
    pub const NAME: usize = 0;
    /// `[u8;32]` — revision, NUL-padded, inline.
    pub const REV: usize = 8;
    /// `u32` — flag bits.
    pub const FLAGS: usize = 40;
    /// `u32` — version counter, incremented on metadata change.
    pub const VER: usize = 44;
    /// `u64` + `u16` — feature-offset array.
    pub const FEATURES: usize = 48;
    pub const FEAT_COUNT: usize = 56;
    /// `u64` + `u16` — data-dependency array.
    pub const DATA_DEPS: usize = 64;
    pub const DATA_DEP_COUNT: usize = 72;
    /// `u64` + `u16` — inverse-dependency array.
    pub const INV_DEPS: usize = 80;
    pub const INV_DEP_COUNT: usize = 88;
    /// `u64` + `u16` — operation-dependency array.
    pub const OP_DEPS: usize = 96;
    pub const OP_DEP_COUNT: usize = 104;
    /// Per-datastore change-subscription tables: `u64` + `u16`, stride 16.
    pub const CHANGE_SUBS: usize = 112;
    pub const CHANGE_SUBS_STRIDE: usize = 16;
    /// `u64` + `u16` — operational-subscription array.
    pub const OPER_SUBS: usize = 160;
    pub const OPER_SUB_COUNT: usize = 168;
    /// `u64` + `u16` — notification-subscription array (explicit count).
    pub const NOTIF_SUBS: usize = 176;
    pub const NOTIF_SUB_COUNT: usize = 184;
    /// Per-datastore data-lock records: `u32` readers + `u32` writer PID,
    /// stride 8.
    pub const DATA_LOCKS: usize = 192;
    pub const DATA_LOCK_STRIDE: usize = 8;
    /// Replay-lock record: `u32` readers + `u32` writer PID.
    pub const REPLAY_LOCK: usize = 216;

    /// Record size.
    pub const SIZE: usize = 224;

    /// Replay-support flag bit.
    pub const FLAG_REPLAY_SUPPORT: u32 = 0x1;
}

/// Read accessors for the module record at `base`.
#[derive(Clone, Copy)]
pub struct ModView<'a> {
    buf: &'a [u8],
    base: usize,
}

impl<'a> ModView<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8], base: usize) -> Self {
        Self { buf, base }
    }

    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub fn name(&self) -> u64 {
        get_u64_at(self.buf, self.base + modrec::NAME)
    }

    /// Revision with the NUL padding stripped.
    #[must_use]
    pub fn revision(&self) -> &'a [u8] {
        let rev = &self.buf[self.base + modrec::REV..self.base + modrec::REV + REV_MAX];
        let end = rev.iter().position(|&b| b == 0).unwrap_or(REV_MAX);
        &rev[..end]
    }

    #[must_use]
    pub fn flags(&self) -> u32 {
        get_u32_at(self.buf, self.base + modrec::FLAGS)
    }

    #[must_use]
    pub fn ver(&self) -> u32 {
        get_u32_at(self.buf, self.base + modrec::VER)
    }

    #[must_use]
    pub fn features(&self) -> (u64, u16) {
        (
            get_u64_at(self.buf, self.base + modrec::FEATURES),
            get_u16_at(self.buf, self.base + modrec::FEAT_COUNT),
        )
    }

    #[must_use]
    pub fn data_deps(&self) -> (u64, u16) {
        (
            get_u64_at(self.buf, self.base + modrec::DATA_DEPS),
            get_u16_at(self.buf, self.base + modrec::DATA_DEP_COUNT),
        )
    }

    #[must_use]
    pub fn inv_deps(&self) -> (u64, u16) {
        (
            get_u64_at(self.buf, self.base + modrec::INV_DEPS),
            get_u16_at(self.buf, self.base + modrec::INV_DEP_COUNT),
        )
    }

    #[must_use]
    pub fn op_deps(&self) -> (u64, u16) {
        (
            get_u64_at(self.buf, self.base + modrec::OP_DEPS),
            get_u16_at(self.buf, self.base + modrec::OP_DEP_COUNT),
        )
    }

    #[must_use]
    pub fn change_subs(&self, ds: Datastore) -> (u64, u16) {
        let off = self.base + modrec::CHANGE_SUBS + ds.index() * modrec::CHANGE_SUBS_STRIDE;
        (get_u64_at(self.buf, off), get_u16_at(self.buf, off + 8))
    }

    #[must_use]
    pub fn oper_subs(&self) -> (u64, u16) {
        (
            get_u64_at(self.buf, self.base + modrec::OPER_SUBS),
            get_u16_at(self.buf, self.base + modrec::OPER_SUB_COUNT),
        )
    }

    #[must_use]
    pub fn notif_subs(&self) -> (u64, u16) {
        (
            get_u64_at(self.buf, self.base + modrec::NOTIF_SUBS),
            get_u16_at(self.buf, self.base + modrec::NOTIF_SUB_COUNT),
        )
    }
}

/// Write one field of the module record at `base`.
pub fn mod_set_u64(buf: &mut [u8], base: usize, field: usize, v: u64) {
    put_u64_at(buf, base + field, v);
}

/// Write one `u16` field of the module record at `base`.
pub fn mod_set_u16(buf: &mut [u8], base: usize, field: usize, v: u16) {
    put_u16_at(buf, base + field, v);
}

/// Write one `u32` field of the module record at `base`.
pub fn mod_set_u32(buf: &mut [u8], base: usize, field: usize, v: u32) {
    put_u32_at(buf, base + field, v);
}

/// Field offsets of a per-datastore change-subscription table entry.
#[must_use]
pub fn change_subs_field(ds: Datastore) -> (usize, usize) {
    let off = modrec::CHANGE_SUBS + ds.index() * modrec::CHANGE_SUBS_STRIDE;
    (off, off + 8)
}

// ---------------------------------------------------------------------------
// Arena records
// ---------------------------------------------------------------------------

/// Data-dependency record.
pub mod datadep {
    /// `u32` — dependency type tag.
    pub const TYPE: usize = 0;
    /// `u32` — alignment padding.
    pub const ALIGN0: usize = 4;
    /// `u64` — referenced module-name offset (0 = none).
    pub const MODULE: usize = 8;
    /// `u64` — xpath offset (0 = none).
    pub const XPATH: usize = 16;
    pub const SIZE: usize = 24;
}

/// Operation-dependency record with nested in/out dependency arrays.
pub mod opdep {
    /// `u64` — operation xpath offset.
    pub const XPATH: usize = 0;
    /// `u64` — input data-dependency array offset.
    pub const IN_DEPS: usize = 8;
    /// `u64` — output data-dependency array offset.
    pub const OUT_DEPS: usize = 16;
    /// `u16` — input dependency count.
    pub const IN_COUNT: usize = 24;
    /// `u16` — output dependency count.
    pub const OUT_COUNT: usize = 26;
    /// `u32` — alignment padding.
    pub const ALIGN0: usize = 28;
    pub const SIZE: usize = 32;
}

/// Change-subscription record.
pub mod changesub {
    /// `u64` — xpath offset (0 = whole module).
    pub const XPATH: usize = 0;
    /// `u32` — priority.
    pub const PRIORITY: usize = 8;
    /// `u32` — option bitmask.
    pub const OPTS: usize = 12;
    /// `u32` — event-pipe id.
    pub const EVPIPE: usize = 16;
    /// `u32` — alignment padding.
    pub const ALIGN0: usize = 20;
    pub const SIZE: usize = 24;
}

/// Operational-subscription record.
pub mod opersub {
    /// `u64` — xpath offset (mandatory).
    pub const XPATH: usize = 0;
    /// `u32` — option bitmask.
    pub const OPTS: usize = 8;
    /// `u32` — event-pipe id.
    pub const EVPIPE: usize = 12;
    pub const SIZE: usize = 16;
}

/// Notification-subscription record.
pub mod notifsub {
    /// `u32` — event-pipe id.
    pub const EVPIPE: usize = 0;
    pub const SIZE: usize = 4;
}

/// RPC record.
pub mod rpc {
    /// `u64` — operation-path offset.
    pub const OP_PATH: usize = 0;
    /// `u64` — subscription array offset.
    pub const SUBS: usize = 8;
    /// `u16` — subscription count.
    pub const SUB_COUNT: usize = 16;
    /// Padding to 24.
    pub const ALIGN0: usize = 18;
    pub const SIZE: usize = 24;
}

/// RPC-subscription record.
pub mod rpcsub {
    /// `u64` — xpath offset.
    pub const XPATH: usize = 0;
    /// `u32` — priority.
    pub const PRIORITY: usize = 8;
    /// `u32` — option bitmask.
    pub const OPTS: usize = 12;
    /// `u32` — event-pipe id.
    pub const EVPIPE: usize = 16;
    /// `u32` — alignment padding.
    pub const ALIGN0: usize = 20;
    pub const SIZE: usize = 24;
}

/// Connection-state record.
pub mod connstate {
    /// `u64` — owning connection handle.
    pub const CONN_ID: usize = 0;
    /// `u32` — owning PID.
    pub const PID: usize = 8;
    /// `u32` — alignment padding.
    pub const ALIGN0: usize = 12;
    /// `u64` — event-pipe array offset.
    pub const EVPIPES: usize = 16;
    /// `u32` — event-pipe count.
    pub const EVPIPE_COUNT: usize = 24;
    /// `u32` — held main-lock kind.
    pub const LOCK_KIND: usize = 28;
    /// `u32` — recursive read depth.
    pub const LOCK_RCOUNT: usize = 32;
    /// `u32` — alignment padding.
    pub const ALIGN1: usize = 36;
    pub const SIZE: usize = 40;
}

/// Size of one feature / inverse-dependency array entry (`u64` offset).
pub const OFFSET_ENTRY_SIZE: usize = 8;

/// Size of one event-pipe array entry (`u32` id).
pub const EVPIPE_ENTRY_SIZE: usize = 4;
