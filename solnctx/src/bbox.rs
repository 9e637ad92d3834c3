//! Per-dimension coordinate extents.

use serde::{Deserialize, Serialize};

use crate::dims::DimMap;

/// Half-open extents `[begin, end)` over the domain dimensions.
///
/// The `valid` flag is owned by the setting store: it is raised when a
/// solution is prepared and dropped by any setting that changes the domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// First index in each dimension.
    pub begin: DimMap,
    /// One past the last index in each dimension.
    pub end: DimMap,
    /// Whether the extents reflect the current settings.
    pub valid: bool,
}

impl BoundingBox {
    /// Builds a box from per-dimension `begin` and `len`.
    pub fn from_sizes(begin: DimMap, sizes: &DimMap) -> Self {
        let end = begin
            .iter()
            .map(|(dim, b)| (dim.clone(), b.saturating_add(sizes.get(dim).copied().unwrap_or(0))))
            .collect();
        Self {
            begin,
            end,
            valid: false,
        }
    }

    /// Extent of `dim`, or zero if the dimension is not part of the box.
    pub fn len(&self, dim: &str) -> i64 {
        match (self.begin.get(dim), self.end.get(dim)) {
            (Some(b), Some(e)) => e.saturating_sub(*b).max(0),
            _ => 0,
        }
    }

    /// Number of points enclosed, saturating at `u64::MAX`. An empty box has
    /// zero points.
    pub fn num_points(&self) -> u64 {
        if self.begin.is_empty() {
            return 0;
        }
        self.begin
            .keys()
            .map(|dim| u64::try_from(self.len(dim)).unwrap_or(0))
            .fold(1, u64::saturating_mul)
    }
}
