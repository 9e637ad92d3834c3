//! Rank layout: bounding boxes and buffer sizes for this rank.
//!
//! Splitting the global domain is not the context's job. It asks a
//! [`Partitioner`] for the layout once per `prepare()` and then allocates what
//! the layout describes. [`UniformPartitioner`] lays ranks out on a regular
//! grid where every rank owns the same number of points.

use crate::bbox::BoundingBox;
use crate::dims::DimMap;
use crate::env::Environment;
use crate::settings::{RankBoxes, Settings, SizeSetting};

/// Everything `prepare()` needs to know about this rank's share of the work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankLayout {
    /// Bounding boxes and overall sizes.
    pub boxes: RankBoxes,
    /// Element counts of the scratch buffers to allocate.
    pub scratch_sizes: Vec<usize>,
    /// Element counts of the halo communication buffers to allocate.
    pub comm_sizes: Vec<usize>,
}

/// Computes the layout of this rank.
pub trait Partitioner: Send {
    /// Lays out this rank for the given settings and region thread count.
    fn setup_rank(
        &mut self,
        settings: &Settings,
        env: &dyn Environment,
        region_threads: usize,
    ) -> RankLayout;
}

/// Regular partition where every rank owns `rank_domain_size` points.
///
/// Communication buffers: for every domain dimension split over more than
/// one rank, each existing neighbor gets one send and one receive buffer
/// covering a face of depth `min_pad_size`. Scratch buffers: one per region
/// thread when a scratch size is configured.
///
/// Coordinates and sizes saturate instead of wrapping, so absurd settings
/// surface as an allocation failure rather than a bogus layout.
#[derive(Debug, Default, Clone)]
pub struct UniformPartitioner {
    scratch_elements: usize,
}

impl UniformPartitioner {
    /// Creates a partitioner without scratch buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests one scratch buffer of `n` elements per region thread.
    #[must_use]
    pub fn with_scratch_elements(mut self, n: usize) -> Self {
        self.scratch_elements = n;
        self
    }
}

fn to_usize(v: i64) -> usize {
    usize::try_from(v).unwrap_or(0)
}

impl Partitioner for UniformPartitioner {
    fn setup_rank(
        &mut self,
        settings: &Settings,
        env: &dyn Environment,
        region_threads: usize,
    ) -> RankLayout {
        let sizes = settings.values(SizeSetting::RankDomainSize);
        let pads = settings.values(SizeSetting::MinPadSize);
        let domain: Vec<&str> = settings.dims.domain_dims().collect();

        let mut begin = DimMap::new();
        let mut ext_begin = DimMap::new();
        let mut ext_sizes = DimMap::new();
        let mut overall = DimMap::new();
        let mut comm_sizes = Vec::new();
        let mut layout_ranks: i64 = 1;

        for &dim in &domain {
            let size = sizes.get(dim).copied().unwrap_or(0);
            let pad = pads.get(dim).copied().unwrap_or(0);
            let nr = settings.value(SizeSetting::NumRanks, dim).max(1);
            let ri = settings.value(SizeSetting::RankIndex, dim);
            layout_ranks = layout_ranks.saturating_mul(nr);

            let begin_at = ri.saturating_mul(size);
            begin.insert(dim.to_string(), begin_at);
            ext_begin.insert(dim.to_string(), begin_at.saturating_sub(pad));
            ext_sizes.insert(dim.to_string(), size.saturating_add(pad.saturating_mul(2)));
            overall.insert(dim.to_string(), nr.saturating_mul(size));

            if nr > 1 {
                let face = domain
                    .iter()
                    .filter(|&&other| other != dim)
                    .map(|&other| sizes.get(other).copied().unwrap_or(0))
                    .fold(1, i64::saturating_mul);
                let halo = to_usize(pad.max(1).saturating_mul(face));
                let neighbors = usize::from(ri > 0) + usize::from(ri < nr - 1);
                // One send and one receive buffer per neighbor.
                comm_sizes.extend(std::iter::repeat_n(halo, 2 * neighbors));
            }
        }

        if usize::try_from(layout_ranks).ok() != Some(env.num_ranks()) {
            tracing::warn!(
                layout_ranks,
                env_ranks = env.num_ranks(),
                "rank layout does not match the number of ranks in the environment"
            );
        }

        let scratch_sizes = if self.scratch_elements > 0 {
            vec![self.scratch_elements; region_threads.max(1)]
        } else {
            Vec::new()
        };

        RankLayout {
            boxes: RankBoxes {
                rank_bb: BoundingBox::from_sizes(begin, &sizes),
                ext_bb: BoundingBox::from_sizes(ext_begin, &ext_sizes),
                overall_domain_sizes: overall,
            },
            scratch_sizes,
            comm_sizes,
        }
    }
}
