//! Append-only offset arena over the extension region.
//!
//! Everything past the leading wasted-bytes counter is addressed by
//! base-relative offsets; offset 0 means "absent". Allocation only ever
//! appends at the current tail, growing the region first when needed. There
//! is no free list: freed entries increment the wasted counter and stay in
//! place until defragmentation rewrites the arena.

use silo_error::{Result, SiloError};
use silo_types::encoding::{get_u64_at, put_u64_at};

use crate::region::ShmFile;

/// Size of the wasted-bytes counter at offset 0.
pub const WASTED_SIZE: usize = 8;

/// The extension region seen as an offset arena.
///
/// A thin wrapper over the region handle; it owns the wasted-bytes counter
/// and the append cursor (the region tail).
pub struct Arena {
    region: ShmFile,
}

impl Arena {
    /// Wrap an opened extension region.
    #[must_use]
    pub fn new(region: ShmFile) -> Self {
        Self { region }
    }

    /// The underlying region handle.
    #[must_use]
    pub fn region(&self) -> &ShmFile {
        &self.region
    }

    /// The underlying region handle, mutable.
    pub fn region_mut(&mut self) -> &mut ShmFile {
        &mut self.region
    }

    /// Current arena size (the append tail).
    #[must_use]
    pub fn size(&self) -> usize {
        self.region.size()
    }

    /// The arena bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.region.bytes()
    }

    /// The arena bytes, mutable.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.region.bytes_mut()
    }

    /// Current wasted-bytes tally.
    #[must_use]
    pub fn wasted(&self) -> u64 {
        get_u64_at(self.region.bytes(), 0)
    }

    /// Add freed bytes to the wasted tally.
    pub fn add_wasted(&mut self, bytes: u64) {
        let cur = self.wasted();
        put_u64_at(self.region.bytes_mut(), 0, cur + bytes);
    }

    /// Reset the wasted tally to zero (defragmentation only).
    pub fn reset_wasted(&mut self) {
        put_u64_at(self.region.bytes_mut(), 0, 0);
    }

    /// Allocate `len` bytes at the tail, growing the region first.
    /// Returns the offset of the allocation (zeroed). A zero `len` yields
    /// offset 0, the absent marker, so empty arrays are stored as absent.
    pub fn alloc(&mut self, len: usize) -> Result<u64> {
        if len == 0 {
            return Ok(0);
        }
        let off = self.region.size();
        self.region.remap(off + len)?;
        Ok(off as u64)
    }

    /// Copy `len` bytes from offset `src` within the arena to the tail.
    /// Returns the destination offset. A zero `len` yields offset 0
    /// (the absent marker), matching the empty-array convention.
    pub fn alloc_copy_within(&mut self, src: u64, len: usize) -> Result<u64> {
        if len == 0 {
            return Ok(0);
        }
        let dst = self.alloc(len)?;
        let src = usize::try_from(src).map_err(|_| SiloError::NoMemory)?;
        self.check_range(src as u64, len)?;
        self.region
            .bytes_mut()
            .copy_within(src..src + len, dst as usize);
        Ok(dst)
    }

    /// Copy a byte slice to the tail; returns the offset.
    pub fn put_bytes(&mut self, data: &[u8]) -> Result<u64> {
        if data.is_empty() {
            return Ok(0);
        }
        let off = self.alloc(data.len())?;
        let base = off as usize;
        self.region.bytes_mut()[base..base + data.len()].copy_from_slice(data);
        Ok(off)
    }

    /// Copy a string and its NUL terminator to the tail; returns the offset.
    pub fn put_string(&mut self, s: &str) -> Result<u64> {
        let off = self.alloc(s.len() + 1)?;
        let base = off as usize;
        let buf = self.region.bytes_mut();
        buf[base..base + s.len()].copy_from_slice(s.as_bytes());
        buf[base + s.len()] = 0;
        Ok(off)
    }

    /// Length of the NUL-terminated string at `offset`, including the
    /// terminator. Bounded by the mapping; an unterminated string is a
    /// consistency violation.
    pub fn strlen_at(&self, offset: u64) -> Result<usize> {
        let start = usize::try_from(offset).map_err(|_| SiloError::NoMemory)?;
        let buf = self.region.bytes();
        if start >= buf.len() {
            return Err(SiloError::OffsetOutOfBounds {
                offset,
                size: buf.len(),
            });
        }
        match buf[start..].iter().position(|&b| b == 0) {
            Some(pos) => Ok(pos + 1),
            None => Err(SiloError::internal(format!(
                "unterminated string at arena offset {offset}"
            ))),
        }
    }

    /// The NUL-terminated string at `offset`, without the terminator.
    pub fn str_at(&self, offset: u64) -> Result<&str> {
        let len = self.strlen_at(offset)?;
        let start = offset as usize;
        std::str::from_utf8(&self.region.bytes()[start..start + len - 1])
            .map_err(|_| SiloError::internal(format!("non-UTF-8 string at arena offset {offset}")))
    }

    /// Verify that `offset..offset+len` lies inside the current mapping.
    pub fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let start = usize::try_from(offset).map_err(|_| SiloError::NoMemory)?;
        let size = self.region.size();
        match start.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(SiloError::OffsetOutOfBounds { offset, size }),
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("size", &self.size())
            .field("wasted", &self.wasted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_arena() -> (tempfile::TempDir, Arena) {
        let dir = tempfile::tempdir().expect("tempdir");
        let (region, created) = ShmFile::open(&dir.path().join("ext.shm"), WASTED_SIZE, 0o600)
            .expect("open ext region");
        assert!(created);
        (dir, Arena::new(region))
    }

    #[test]
    fn test_new_arena_has_zero_wasted() {
        let (_dir, arena) = temp_arena();
        assert_eq!(arena.size(), WASTED_SIZE);
        assert_eq!(arena.wasted(), 0);
    }

    #[test]
    fn test_put_string_appends_at_tail() {
        let (_dir, mut arena) = temp_arena();
        let off1 = arena.put_string("ietf-interfaces").unwrap();
        let off2 = arena.put_string("f1").unwrap();

        assert_eq!(off1, WASTED_SIZE as u64);
        assert_eq!(off2, off1 + 16); // strlen + terminator
        assert_eq!(arena.str_at(off1).unwrap(), "ietf-interfaces");
        assert_eq!(arena.str_at(off2).unwrap(), "f1");
        assert_eq!(arena.strlen_at(off2).unwrap(), 3);
        assert_eq!(arena.size(), WASTED_SIZE + 16 + 3);
    }

    #[test]
    fn test_put_bytes_empty_is_absent() {
        let (_dir, mut arena) = temp_arena();
        assert_eq!(arena.put_bytes(&[]).unwrap(), 0);
        assert_eq!(arena.alloc_copy_within(0, 0).unwrap(), 0);
    }

    #[test]
    fn test_alloc_zeroes_growth() {
        let (_dir, mut arena) = temp_arena();
        let off = arena.alloc(16).unwrap();
        assert_eq!(off, WASTED_SIZE as u64);
        assert!(arena.bytes()[off as usize..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_wasted_accounting() {
        let (_dir, mut arena) = temp_arena();
        arena.add_wasted(24);
        arena.add_wasted(8);
        assert_eq!(arena.wasted(), 32);
        arena.reset_wasted();
        assert_eq!(arena.wasted(), 0);
    }

    #[test]
    fn test_alloc_copy_within_moves_array() {
        let (_dir, mut arena) = temp_arena();
        let src = arena.put_bytes(&[1, 2, 3, 4]).unwrap();
        let dst = arena.alloc_copy_within(src, 4).unwrap();
        assert_ne!(src, dst);
        let d = dst as usize;
        assert_eq!(&arena.bytes()[d..d + 4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_strlen_out_of_bounds() {
        let (_dir, arena) = temp_arena();
        assert!(matches!(
            arena.strlen_at(10_000),
            Err(SiloError::OffsetOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_check_range() {
        let (_dir, mut arena) = temp_arena();
        arena.alloc(8).unwrap();
        arena.check_range(8, 8).unwrap();
        assert!(arena.check_range(12, 8).is_err());
    }

    #[test]
    fn test_tail_equals_size_after_any_sequence() {
        let (_dir, mut arena) = temp_arena();
        let mut expected = WASTED_SIZE;
        for s in ["a", "bb", "ccc", "dddd"] {
            arena.put_string(s).unwrap();
            expected += s.len() + 1;
            assert_eq!(arena.size(), expected);
        }
        arena.alloc(24).unwrap();
        expected += 24;
        assert_eq!(arena.size(), expected);
    }
}
