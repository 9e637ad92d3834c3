//! Grids, their storage, and the per-context grid registry.
//!
//! # Storage ownership
//!
//! A grid starts with no storage. `prepare()` gives it an exclusively owned
//! [`Buffer`]. Storage sharing turns the source grid's buffer into a
//! reference-counted [`SharedBuffer`] and hands a clone of it to the target
//! grid; from then on both grids see the same elements, and the buffer lives
//! until the last holder releases it.
//!
//! ```text
//! Unallocated ──alloc──► Exclusive(Buffer)
//!      ▲                      │ share
//!      │ release              ▼
//!      └──────────────── Shared(Arc<RwLock<Buffer>>)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::alloc::{AllocCategory, Allocator, Buffer};
use crate::dims::{DimKind, DimMap};
use crate::error::{Result, SolnError};
use crate::settings::{Settings, SizeSetting};

/// Storage held jointly by grids of several contexts.
pub type SharedBuffer = Arc<RwLock<Buffer>>;

/// Reference-counted grid handle, as stored in the registry.
pub type GridPtr = Arc<Grid>;

/// Storage state of a grid.
#[derive(Debug, Default)]
pub enum GridStorage {
    /// No storage yet, or storage was released.
    #[default]
    Unallocated,
    /// Storage owned by this grid alone.
    Exclusive(Buffer),
    /// Storage aliased with at least one other grid.
    Shared(SharedBuffer),
}

/// A named multi-dimensional array of `f64` elements.
#[derive(Debug)]
pub struct Grid {
    name: String,
    dims: Vec<String>,
    fixed_extents: DimMap,
    num_elements: AtomicUsize,
    storage: RwLock<GridStorage>,
}

impl Grid {
    /// Creates a grid over the given dimensions with no storage.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use solnctx::grid::Grid;
    ///
    /// let grid = Grid::new("density", ["t", "x", "y"]);
    /// assert_eq!(grid.name(), "density");
    /// assert!(!grid.is_storage_allocated());
    /// ```
    pub fn new<'a>(name: &str, dims: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            name: name.to_string(),
            dims: dims.into_iter().map(str::to_string).collect(),
            fixed_extents: DimMap::new(),
            num_elements: AtomicUsize::new(0),
            storage: RwLock::new(GridStorage::Unallocated),
        }
    }

    /// Pins the extent of `dim`, overriding whatever the sizer would pick.
    ///
    /// Needed for misc dimensions, whose extent the settings do not describe.
    #[must_use]
    pub fn with_extent(mut self, dim: &str, extent: i64) -> Self {
        self.fixed_extents.insert(dim.to_string(), extent);
        self
    }

    /// Grid name, unique within a context.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dimension names in layout order.
    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    /// Extent pinned with [`Grid::with_extent`], if any.
    pub fn fixed_extent(&self, dim: &str) -> Option<i64> {
        self.fixed_extents.get(dim).copied()
    }

    /// Element count the next allocation will use.
    pub fn num_elements(&self) -> usize {
        self.num_elements.load(Ordering::Relaxed)
    }

    /// Sets the element count used by the next allocation.
    pub fn set_num_elements(&self, n: usize) {
        self.num_elements.store(n, Ordering::Relaxed);
    }

    /// Returns `true` if the grid currently holds storage.
    pub fn is_storage_allocated(&self) -> bool {
        !matches!(*self.storage.read(), GridStorage::Unallocated)
    }

    /// Returns `true` if the storage is aliased with another grid.
    pub fn is_shared(&self) -> bool {
        matches!(*self.storage.read(), GridStorage::Shared(_))
    }

    /// Bytes of storage currently held.
    pub fn num_storage_bytes(&self) -> usize {
        match &*self.storage.read() {
            GridStorage::Unallocated => 0,
            GridStorage::Exclusive(buf) => buf.num_bytes(),
            GridStorage::Shared(shared) => shared.read().num_bytes(),
        }
    }

    /// Element count of the storage currently held, if any.
    pub fn storage_len(&self) -> Option<usize> {
        self.read(<[f64]>::len)
    }

    /// Allocates exclusive storage if the grid has none.
    ///
    /// Returns the number of bytes allocated, zero if storage was already
    /// present.
    ///
    /// # Errors
    ///
    /// Propagates [`SolnError::Allocation`] from the allocator.
    pub fn alloc_storage(&self, allocator: &mut dyn Allocator) -> Result<usize> {
        let mut storage = self.storage.write();
        if !matches!(*storage, GridStorage::Unallocated) {
            return Ok(0);
        }
        let buffer = allocator.alloc(AllocCategory::Grid, self.num_elements())?;
        let bytes = buffer.num_bytes();
        *storage = GridStorage::Exclusive(buffer);
        Ok(bytes)
    }

    /// Drops this grid's hold on its storage.
    ///
    /// Exclusive storage goes back to the allocator. Shared storage goes back
    /// only when this grid was the last holder. Returns `true` if the grid
    /// held storage.
    pub fn release_storage(&self, allocator: &mut dyn Allocator) -> bool {
        let previous = std::mem::take(&mut *self.storage.write());
        release(previous, allocator)
    }

    /// Makes this grid alias the storage of `source`.
    ///
    /// The source's exclusive storage is promoted to shared storage in place.
    /// Any storage this grid held before is released.
    ///
    /// # Errors
    ///
    /// Returns [`SolnError::NoStorage`] if `source` has no storage.
    pub fn share_storage(&self, source: &Grid, allocator: &mut dyn Allocator) -> Result<()> {
        if std::ptr::eq(self, source) {
            return Ok(());
        }

        let shared = {
            let mut src = source.storage.write();
            match std::mem::take(&mut *src) {
                GridStorage::Unallocated => {
                    return Err(SolnError::NoStorage {
                        name: source.name.clone(),
                    });
                }
                GridStorage::Exclusive(buffer) => {
                    let shared = Arc::new(RwLock::new(buffer));
                    *src = GridStorage::Shared(Arc::clone(&shared));
                    shared
                }
                GridStorage::Shared(shared) => {
                    *src = GridStorage::Shared(Arc::clone(&shared));
                    shared
                }
            }
        };

        let previous = std::mem::replace(&mut *self.storage.write(), GridStorage::Shared(shared));
        release(previous, allocator);
        Ok(())
    }

    /// Runs `f` over the elements, or returns `None` without storage.
    pub fn read<R>(&self, f: impl FnOnce(&[f64]) -> R) -> Option<R> {
        match &*self.storage.read() {
            GridStorage::Unallocated => None,
            GridStorage::Exclusive(buf) => Some(f(buf.as_slice())),
            GridStorage::Shared(shared) => Some(f(shared.read().as_slice())),
        }
    }

    /// Runs `f` over the elements mutably, or returns `None` without storage.
    pub fn write<R>(&self, f: impl FnOnce(&mut [f64]) -> R) -> Option<R> {
        match &mut *self.storage.write() {
            GridStorage::Unallocated => None,
            GridStorage::Exclusive(buf) => Some(f(buf.as_mut_slice())),
            GridStorage::Shared(shared) => Some(f(shared.write().as_mut_slice())),
        }
    }
}

fn release(storage: GridStorage, allocator: &mut dyn Allocator) -> bool {
    match storage {
        GridStorage::Unallocated => false,
        GridStorage::Exclusive(buffer) => {
            allocator.free(AllocCategory::Grid, buffer);
            true
        }
        GridStorage::Shared(shared) => {
            if let Ok(lock) = Arc::try_unwrap(shared) {
                allocator.free(AllocCategory::Grid, lock.into_inner());
            }
            true
        }
    }
}

/// Grids registered with a context.
///
/// Keeps registration order; output grids are additionally listed in a
/// separate registry.
#[derive(Debug, Default)]
pub struct GridRegistry {
    grids: Vec<GridPtr>,
    by_name: HashMap<String, usize>,
    outputs: Vec<GridPtr>,
}

impl GridRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a grid.
    ///
    /// # Errors
    ///
    /// Returns [`SolnError::DuplicateName`] if a grid with the same name is
    /// already registered; the registry is left unchanged.
    pub fn add(&mut self, grid: GridPtr, is_output: bool) -> Result<()> {
        if self.by_name.contains_key(grid.name()) {
            return Err(SolnError::DuplicateName {
                name: grid.name().to_string(),
            });
        }
        self.by_name.insert(grid.name().to_string(), self.grids.len());
        if is_output {
            self.outputs.push(Arc::clone(&grid));
        }
        self.grids.push(grid);
        Ok(())
    }

    /// Looks up a grid by name.
    pub fn get(&self, name: &str) -> Option<&GridPtr> {
        self.by_name.get(name).map(|&i| &self.grids[i])
    }

    /// All grids in registration order.
    pub fn grids(&self) -> &[GridPtr] {
        &self.grids
    }

    /// Output grids in registration order.
    pub fn outputs(&self) -> &[GridPtr] {
        &self.outputs
    }

    /// Returns `true` if `name` is registered as an output grid.
    pub fn is_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|g| g.name() == name)
    }

    /// Number of registered grids.
    pub fn len(&self) -> usize {
        self.grids.len()
    }

    /// Returns `true` if no grids are registered.
    pub fn is_empty(&self) -> bool {
        self.grids.is_empty()
    }
}

/// Receives every settings change so grid sizes can follow.
pub trait GridSizer: Send {
    /// Recomputes the element count of every grid from `settings`.
    fn update_grid_info(&mut self, settings: &Settings, grids: &[GridPtr]);
}

/// Sizes grids as padded rank domains times the step allocation.
///
/// Each domain dimension contributes `rank_domain_size + 2 * min_pad_size`,
/// the step dimension contributes `step_alloc` slots, and misc dimensions
/// contribute their pinned extent (1 if none was pinned). A size that does
/// not fit in `usize` becomes `usize::MAX`, which no allocator can satisfy.
#[derive(Debug, Default, Clone, Copy)]
pub struct PaddedDomainSizer;

impl PaddedDomainSizer {
    fn extent(settings: &Settings, grid: &Grid, dim: &str) -> Option<usize> {
        if let Some(fixed) = grid.fixed_extent(dim) {
            return Some(usize::try_from(fixed).unwrap_or(0));
        }
        let extent = match settings.dims.kind_of(dim) {
            Some(DimKind::Domain) => {
                let pad = settings.value(SizeSetting::MinPadSize, dim);
                settings
                    .value(SizeSetting::RankDomainSize, dim)
                    .checked_add(pad.checked_mul(2)?)?
            }
            Some(DimKind::Step) => return Some(settings.run.step_alloc),
            Some(DimKind::Misc) | None => 1,
        };
        Some(usize::try_from(extent).unwrap_or(0))
    }

    fn num_elements(settings: &Settings, grid: &Grid) -> Option<usize> {
        grid.dims()
            .iter()
            .try_fold(1usize, |n, dim| n.checked_mul(Self::extent(settings, grid, dim)?))
    }
}

impl GridSizer for PaddedDomainSizer {
    fn update_grid_info(&mut self, settings: &Settings, grids: &[GridPtr]) {
        for grid in grids {
            grid.set_num_elements(Self::num_elements(settings, grid).unwrap_or(usize::MAX));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::MmapAllocator;
    use crate::dims::Dims;

    fn allocated(name: &str, n: usize, alloc: &mut MmapAllocator) -> GridPtr {
        let grid = Arc::new(Grid::new(name, ["x"]));
        grid.set_num_elements(n);
        grid.alloc_storage(alloc).unwrap();
        grid
    }

    #[test]
    fn test_registry_lookup_returns_same_instance() {
        let mut reg = GridRegistry::new();
        let grid = Arc::new(Grid::new("u", ["x"]));
        reg.add(Arc::clone(&grid), true).unwrap();
        assert!(Arc::ptr_eq(reg.get("u").unwrap(), &grid));
        assert!(reg.is_output("u"));
        assert_eq!(reg.outputs().len(), 1);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut reg = GridRegistry::new();
        let first = Arc::new(Grid::new("u", ["x"]));
        reg.add(Arc::clone(&first), false).unwrap();

        let err = reg.add(Arc::new(Grid::new("u", ["y"])), true).unwrap_err();
        assert!(matches!(err, SolnError::DuplicateName { ref name } if name == "u"));
        assert_eq!(reg.len(), 1);
        assert!(reg.outputs().is_empty());
        assert!(Arc::ptr_eq(reg.get("u").unwrap(), &first));
    }

    #[test]
    fn test_alloc_is_skipped_when_present() {
        let mut alloc = MmapAllocator::new();
        let grid = allocated("u", 8, &mut alloc);
        assert_eq!(grid.num_storage_bytes(), 64);
        grid.set_num_elements(100);
        assert_eq!(grid.alloc_storage(&mut alloc).unwrap(), 0);
        assert_eq!(grid.num_storage_bytes(), 64);
    }

    #[test]
    fn test_share_makes_writes_visible() {
        let mut alloc = MmapAllocator::new();
        let source = allocated("u", 4, &mut alloc);
        let target = allocated("u", 4, &mut alloc);

        target.share_storage(&source, &mut alloc).unwrap();
        assert!(source.is_shared());
        assert!(target.is_shared());
        // The target's own buffer went back to the allocator.
        assert_eq!(alloc.live_bytes(AllocCategory::Grid), 32);

        source.write(|data| data[2] = 7.0).unwrap();
        assert_eq!(target.read(|data| data[2]), Some(7.0));
    }

    #[test]
    fn test_shared_storage_freed_by_last_holder() {
        let mut alloc = MmapAllocator::new();
        let source = allocated("u", 4, &mut alloc);
        let target = Arc::new(Grid::new("u", ["x"]));
        target.share_storage(&source, &mut alloc).unwrap();

        assert!(source.release_storage(&mut alloc));
        assert_eq!(alloc.live_bytes(AllocCategory::Grid), 32);
        assert_eq!(target.read(|data| data.len()), Some(4));

        assert!(target.release_storage(&mut alloc));
        assert_eq!(alloc.live_bytes(AllocCategory::Grid), 0);
        assert!(!target.release_storage(&mut alloc));
    }

    #[test]
    fn test_share_from_unallocated_fails() {
        let mut alloc = MmapAllocator::new();
        let source = Grid::new("u", ["x"]);
        let target = Grid::new("u", ["x"]);
        assert!(matches!(
            target.share_storage(&source, &mut alloc),
            Err(SolnError::NoStorage { .. })
        ));
        assert!(!target.is_storage_allocated());
    }

    #[test]
    fn test_padded_domain_sizer() {
        let mut settings = Settings::new(Dims::new("t", ["x", "y"]).with_misc("c"));
        settings.set_value(SizeSetting::RankDomainSize, "x", 10);
        settings.set_value(SizeSetting::RankDomainSize, "y", 4);
        settings.set_value(SizeSetting::MinPadSize, "x", 1);
        settings.run.step_alloc = 3;

        let grids = vec![
            Arc::new(Grid::new("u", ["t", "x", "y"])),
            Arc::new(Grid::new("c", ["x", "c"]).with_extent("c", 5)),
        ];
        PaddedDomainSizer.update_grid_info(&settings, &grids);
        assert_eq!(grids[0].num_elements(), 3 * 12 * 4);
        assert_eq!(grids[1].num_elements(), 12 * 5);
    }

    #[test]
    fn test_padded_domain_sizer_saturates_on_overflow() {
        let mut settings = Settings::new(Dims::new("t", ["x", "y", "z"]));
        settings.set_value(SizeSetting::RankDomainSize, "x", i64::MAX / 4);
        settings.set_value(SizeSetting::RankDomainSize, "y", 3_000_000_000);
        settings.set_value(SizeSetting::RankDomainSize, "z", 3_000_000_000);

        let grids = vec![
            Arc::new(Grid::new("u", ["t", "x", "y", "z"])),
            Arc::new(Grid::new("w", ["y", "z"])),
        ];
        PaddedDomainSizer.update_grid_info(&settings, &grids);
        assert_eq!(grids[0].num_elements(), usize::MAX);
        assert_eq!(grids[1].num_elements(), 9_000_000_000_000_000_000);

        settings.set_value(SizeSetting::RankDomainSize, "x", 4);
        settings.set_value(SizeSetting::MinPadSize, "x", i64::MAX);
        PaddedDomainSizer.update_grid_info(&settings, &grids[..1]);
        assert_eq!(grids[0].num_elements(), usize::MAX);
    }
}
