//! Buffer allocation seam.
//!
//! The context never allocates memory directly. Every buffer comes from an
//! [`Allocator`] and is tagged with the [`AllocCategory`] it belongs to, so a
//! platform allocator can route categories to different memory tiers. The
//! order in which the context issues these requests is part of its contract
//! (see `SolutionContext::prepare`).
//!
//! The default [`MmapAllocator`] hands out anonymous memory maps, which are
//! page aligned and zero filled.

use std::fmt;
use std::mem::size_of;

use memmap2::MmapMut;

use crate::error::{Result, SolnError};

/// What a buffer is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocCategory {
    /// Persistent grid storage.
    Grid,
    /// Transient per-thread scratch space.
    Scratch,
    /// Halo-exchange communication buffers.
    Comm,
}

impl AllocCategory {
    /// Short name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Grid => "grid",
            Self::Scratch => "scratch",
            Self::Comm => "comm",
        }
    }
}

impl fmt::Display for AllocCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A block of `f64` elements backed by an anonymous memory map.
pub struct Buffer {
    map: MmapMut,
    len: usize,
}

impl Buffer {
    /// Maps a zero-filled buffer of `len` elements.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the mapping fails, or an
    /// out-of-memory error if the byte size does not fit in `usize`.
    pub fn map_anon(len: usize) -> std::io::Result<Self> {
        // An empty mapping is rejected by the OS; keep at least one element.
        let bytes = len
            .max(1)
            .checked_mul(size_of::<f64>())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::OutOfMemory))?;
        let map = MmapMut::map_anon(bytes)?;
        Ok(Self { map, len })
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the element region in bytes.
    pub fn num_bytes(&self) -> usize {
        self.len * size_of::<f64>()
    }

    /// The elements.
    pub fn as_slice(&self) -> &[f64] {
        bytemuck::cast_slice(&self.map[..self.num_bytes()])
    }

    /// The elements, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        let bytes = self.num_bytes();
        bytemuck::cast_slice_mut(&mut self.map[..bytes])
    }

    /// Sets every element to `value`.
    pub fn fill(&mut self, value: f64) {
        self.as_mut_slice().fill(value);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer").field("len", &self.len).finish()
    }
}

/// Source of all buffers used by a context.
pub trait Allocator: Send {
    /// Allocates `len` elements for `category`.
    ///
    /// # Errors
    ///
    /// Returns [`SolnError::Allocation`] if memory cannot be provided.
    fn alloc(&mut self, category: AllocCategory, len: usize) -> Result<Buffer>;

    /// Returns a buffer previously obtained from [`Allocator::alloc`].
    fn free(&mut self, category: AllocCategory, buffer: Buffer);
}

/// Allocator backed by anonymous memory maps.
///
/// Tracks live bytes per category so the context can report them.
#[derive(Debug, Default)]
pub struct MmapAllocator {
    live: [usize; 3],
}

impl MmapAllocator {
    /// Creates an allocator with nothing outstanding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently allocated for `category`.
    pub fn live_bytes(&self, category: AllocCategory) -> usize {
        self.live[category as usize]
    }
}

impl Allocator for MmapAllocator {
    fn alloc(&mut self, category: AllocCategory, len: usize) -> Result<Buffer> {
        let buffer = Buffer::map_anon(len).map_err(|source| SolnError::Allocation {
            category: category.as_str(),
            bytes: len.saturating_mul(size_of::<f64>()),
            source,
        })?;
        self.live[category as usize] += buffer.num_bytes();
        Ok(buffer)
    }

    fn free(&mut self, category: AllocCategory, buffer: Buffer) {
        let slot = &mut self.live[category as usize];
        *slot = slot.saturating_sub(buffer.num_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_is_zeroed_and_writable() {
        let mut buf = Buffer::map_anon(16).unwrap();
        assert_eq!(buf.len(), 16);
        assert_eq!(buf.num_bytes(), 128);
        assert!(buf.as_slice().iter().all(|&v| v == 0.0));

        buf.as_mut_slice()[3] = 2.5;
        buf.fill(1.0);
        assert!(buf.as_slice().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_empty_buffer() {
        let buf = Buffer::map_anon(0).unwrap();
        assert!(buf.is_empty());
        assert!(buf.as_slice().is_empty());
    }

    #[test]
    fn test_oversized_alloc_is_an_error() {
        let mut alloc = MmapAllocator::new();
        let err = alloc.alloc(AllocCategory::Grid, usize::MAX).unwrap_err();
        assert!(matches!(
            err,
            SolnError::Allocation { category: "grid", bytes: usize::MAX, .. }
        ));
        assert_eq!(alloc.live_bytes(AllocCategory::Grid), 0);
    }

    #[test]
    fn test_live_bytes_tracking() {
        let mut alloc = MmapAllocator::new();
        let grid = alloc.alloc(AllocCategory::Grid, 10).unwrap();
        let comm = alloc.alloc(AllocCategory::Comm, 4).unwrap();
        assert_eq!(alloc.live_bytes(AllocCategory::Grid), 80);
        assert_eq!(alloc.live_bytes(AllocCategory::Comm), 32);
        assert_eq!(alloc.live_bytes(AllocCategory::Scratch), 0);

        alloc.free(AllocCategory::Grid, grid);
        alloc.free(AllocCategory::Comm, comm);
        assert_eq!(alloc.live_bytes(AllocCategory::Grid), 0);
        assert_eq!(alloc.live_bytes(AllocCategory::Comm), 0);
    }
}
