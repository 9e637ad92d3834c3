//! Dimension-typed settings and the solution phase gate.
//!
//! The [`Settings`] object is the single source of configuration for a run.
//! It is owned by the context and handed by reference to every collaborator
//! that needs it; there is no process-wide copy.
//!
//! Access goes through two tables instead of one accessor per setting:
//!
//! - [`SizeSetting`] lists the writable per-dimension settings with the
//!   dimension kinds they accept and whether writing them invalidates a
//!   prepared solution.
//! - [`Query`] lists the readable values with their accepted kinds and
//!   whether they are only meaningful after `prepare()`.
//!
//! [`SettingStore`] combines the settings with the UNPREPARED/PREPARED phase
//! and the bounding boxes whose validity depends on it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bbox::BoundingBox;
use crate::dims::{DimKind, DimMap, Dims};
use crate::error::{Result, SolnError};

const DOMAIN: &[DimKind] = &[DimKind::Domain];
const STEP_OR_DOMAIN: &[DimKind] = &[DimKind::Step, DimKind::Domain];

/// Default rank-domain size for each domain dimension.
const DEFAULT_RANK_DOMAIN_SIZE: i64 = 128;

/// Writable per-dimension settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeSetting {
    /// Index of this rank along each domain dimension.
    RankIndex,
    /// Number of ranks along each domain dimension.
    NumRanks,
    /// Points owned by this rank along each domain dimension.
    RankDomainSize,
    /// Region (outer tile) size.
    RegionSize,
    /// Block (inner tile) size.
    BlockSize,
    /// Minimum padding around each grid.
    MinPadSize,
}

struct SettingSpec {
    api: &'static str,
    kinds: &'static [DimKind],
    resets_prepared: bool,
}

// Indexed by `SizeSetting as usize`.
const SETTING_TABLE: [SettingSpec; 6] = [
    SettingSpec { api: "set_rank_index", kinds: DOMAIN, resets_prepared: true },
    SettingSpec { api: "set_num_ranks", kinds: DOMAIN, resets_prepared: true },
    SettingSpec { api: "set_rank_domain_size", kinds: DOMAIN, resets_prepared: true },
    SettingSpec { api: "set_region_size", kinds: STEP_OR_DOMAIN, resets_prepared: true },
    SettingSpec { api: "set_block_size", kinds: STEP_OR_DOMAIN, resets_prepared: true },
    SettingSpec { api: "set_min_pad_size", kinds: DOMAIN, resets_prepared: false },
];

impl SizeSetting {
    /// Every writable setting, in table order.
    pub const ALL: [Self; 6] = [
        Self::RankIndex,
        Self::NumRanks,
        Self::RankDomainSize,
        Self::RegionSize,
        Self::BlockSize,
        Self::MinPadSize,
    ];

    fn spec(self) -> &'static SettingSpec {
        &SETTING_TABLE[self as usize]
    }

    /// Dimension kinds this setting accepts.
    pub fn allowed_kinds(self) -> &'static [DimKind] {
        self.spec().kinds
    }

    /// Whether writing this setting drops the solution back to UNPREPARED.
    pub fn resets_prepared(self) -> bool {
        self.spec().resets_prepared
    }

    /// Accessor name used in error messages.
    pub fn api(self) -> &'static str {
        self.spec().api
    }
}

/// Readable per-dimension values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Query {
    /// Number of ranks along a domain dimension.
    NumRanks,
    /// Size of the whole problem across all ranks.
    OverallDomainSize,
    /// Points owned by this rank.
    RankDomainSize,
    /// Region size.
    RegionSize,
    /// Block size.
    BlockSize,
    /// First global index owned by this rank.
    FirstRankDomainIndex,
    /// Last global index owned by this rank (inclusive).
    LastRankDomainIndex,
    /// Minimum padding.
    MinPadSize,
    /// Index of this rank.
    RankIndex,
}

#[derive(Clone, Copy)]
enum Source {
    Stored(SizeSetting),
    OverallDomain,
    RankFirst,
    RankLast,
}

struct QuerySpec {
    api: &'static str,
    kinds: &'static [DimKind],
    requires_prepared: bool,
    source: Source,
}

// Indexed by `Query as usize`.
const QUERY_TABLE: [QuerySpec; 9] = [
    QuerySpec { api: "get_num_ranks", kinds: DOMAIN, requires_prepared: false, source: Source::Stored(SizeSetting::NumRanks) },
    QuerySpec { api: "get_overall_domain_size", kinds: DOMAIN, requires_prepared: true, source: Source::OverallDomain },
    QuerySpec { api: "get_rank_domain_size", kinds: DOMAIN, requires_prepared: false, source: Source::Stored(SizeSetting::RankDomainSize) },
    QuerySpec { api: "get_region_size", kinds: STEP_OR_DOMAIN, requires_prepared: false, source: Source::Stored(SizeSetting::RegionSize) },
    QuerySpec { api: "get_block_size", kinds: STEP_OR_DOMAIN, requires_prepared: false, source: Source::Stored(SizeSetting::BlockSize) },
    QuerySpec { api: "get_first_rank_domain_index", kinds: DOMAIN, requires_prepared: true, source: Source::RankFirst },
    QuerySpec { api: "get_last_rank_domain_index", kinds: DOMAIN, requires_prepared: true, source: Source::RankLast },
    QuerySpec { api: "get_min_pad_size", kinds: DOMAIN, requires_prepared: false, source: Source::Stored(SizeSetting::MinPadSize) },
    QuerySpec { api: "get_rank_index", kinds: DOMAIN, requires_prepared: true, source: Source::Stored(SizeSetting::RankIndex) },
];

impl Query {
    fn spec(self) -> &'static QuerySpec {
        &QUERY_TABLE[self as usize]
    }

    /// Whether this query fails with `NotPrepared` before `prepare()`.
    pub fn requires_prepared(self) -> bool {
        self.spec().requires_prepared
    }

    /// Dimension kinds this query accepts.
    pub fn allowed_kinds(self) -> &'static [DimKind] {
        self.spec().kinds
    }
}

/// Non-dimensional run options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Upper bound on worker threads; 0 means use the hardware parallelism.
    pub max_threads: usize,
    /// Divides `max_threads` before the hierarchy is computed.
    pub thread_divisor: usize,
    /// Inner threads nested under every region thread.
    pub block_threads: usize,
    /// Overlap halo exchange with interior computation.
    pub overlap_comms: bool,
    /// Number of step-dimension slots allocated per grid.
    pub step_alloc: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_threads: 0,
            thread_divisor: 1,
            block_threads: 1,
            overlap_comms: true,
            step_alloc: 2,
        }
    }
}

/// The complete configuration of a run.
///
/// Cloning a `Settings` is how work packs take their local snapshot.
///
/// # Examples
///
/// ```rust
/// use solnctx::dims::Dims;
/// use solnctx::settings::{Settings, SizeSetting};
///
/// let mut settings = Settings::new(Dims::new("t", ["x", "y"]));
/// settings.set_value(SizeSetting::RankDomainSize, "x", 64);
/// assert_eq!(settings.value(SizeSetting::RankDomainSize, "x"), 64);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Declared dimensions.
    pub dims: Dims,
    /// Per-dimension values for every [`SizeSetting`].
    pub sizes: BTreeMap<SizeSetting, DimMap>,
    /// Non-dimensional options.
    #[serde(default)]
    pub run: RunOptions,
}

impl Settings {
    /// Creates settings with defaults for every declared dimension.
    pub fn new(dims: Dims) -> Self {
        let mut sizes = BTreeMap::new();
        for setting in SizeSetting::ALL {
            let values: DimMap = dims
                .of_kinds(setting.allowed_kinds())
                .map(|dim| {
                    let value = match setting {
                        SizeSetting::NumRanks => 1,
                        SizeSetting::RankDomainSize => DEFAULT_RANK_DOMAIN_SIZE,
                        _ => 0,
                    };
                    (dim.to_string(), value)
                })
                .collect();
            sizes.insert(setting, values);
        }
        Self {
            dims,
            sizes,
            run: RunOptions::default(),
        }
    }

    /// Parses settings from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`SolnError::Settings`] if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the settings as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`SolnError::Settings`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Stored value of `setting` for `dim`, zero if unset.
    pub fn value(&self, setting: SizeSetting, dim: &str) -> i64 {
        self.sizes
            .get(&setting)
            .and_then(|m| m.get(dim))
            .copied()
            .unwrap_or(0)
    }

    /// All stored values of `setting`.
    pub fn values(&self, setting: SizeSetting) -> DimMap {
        self.sizes.get(&setting).cloned().unwrap_or_default()
    }

    /// Stores a value without any kind check or phase side effect.
    pub fn set_value(&mut self, setting: SizeSetting, dim: &str, value: i64) {
        self.sizes
            .entry(setting)
            .or_default()
            .insert(dim.to_string(), value);
    }

    /// Fills unset tile sizes and enforces `block <= region <= rank size`.
    ///
    /// Returns `true` if any stored value changed.
    pub fn adjust(&mut self) -> bool {
        let before = self.sizes.clone();
        let domain: Vec<String> = self.dims.domain_dims().map(str::to_string).collect();

        for dim in &domain {
            let nr = self.value(SizeSetting::NumRanks, dim).max(1);
            self.set_value(SizeSetting::NumRanks, dim, nr);
            let ri = self.value(SizeSetting::RankIndex, dim).clamp(0, nr - 1);
            self.set_value(SizeSetting::RankIndex, dim, ri);

            let rank = self.value(SizeSetting::RankDomainSize, dim).max(0);
            self.set_value(SizeSetting::RankDomainSize, dim, rank);
            let mut region = self.value(SizeSetting::RegionSize, dim);
            if region <= 0 || region > rank {
                region = rank;
            }
            self.set_value(SizeSetting::RegionSize, dim, region);
            let mut block = self.value(SizeSetting::BlockSize, dim);
            if block <= 0 || block > region {
                block = region;
            }
            self.set_value(SizeSetting::BlockSize, dim, block);

            let pad = self.value(SizeSetting::MinPadSize, dim).max(0);
            self.set_value(SizeSetting::MinPadSize, dim, pad);
        }

        if let Some(step) = self.dims.step_dim().map(str::to_string) {
            let region = self.value(SizeSetting::RegionSize, &step).max(1);
            self.set_value(SizeSetting::RegionSize, &step, region);
            let mut block = self.value(SizeSetting::BlockSize, &step);
            if block <= 0 || block > region {
                block = region;
            }
            self.set_value(SizeSetting::BlockSize, &step, block);
        }

        self.run.thread_divisor = self.run.thread_divisor.max(1);
        self.run.block_threads = self.run.block_threads.max(1);
        self.run.step_alloc = self.run.step_alloc.max(1);

        self.sizes != before
    }
}

/// Solution phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Settings may have changed since the last `prepare()`.
    #[default]
    Unprepared,
    /// Resources and bounding boxes reflect the current settings.
    Prepared,
}

/// Extents computed for this rank during `prepare()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankBoxes {
    /// The part of the global domain this rank owns.
    pub rank_bb: BoundingBox,
    /// The rank box extended by halos.
    pub ext_bb: BoundingBox,
    /// Size of the whole problem in each domain dimension.
    pub overall_domain_sizes: DimMap,
}

/// Settings plus the UNPREPARED/PREPARED gate.
#[derive(Debug, Clone)]
pub struct SettingStore {
    settings: Settings,
    phase: Phase,
    boxes: RankBoxes,
}

impl SettingStore {
    /// Creates an unprepared store.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            phase: Phase::Unprepared,
            boxes: RankBoxes::default(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The global settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Mutable access to the run options.
    ///
    /// These options do not describe the domain, so changing them leaves the
    /// phase untouched; they take effect at the next `prepare()`.
    pub fn run_options_mut(&mut self) -> &mut RunOptions {
        &mut self.settings.run
    }

    /// Bounding boxes, which are only meaningful while prepared.
    pub fn boxes(&self) -> &RankBoxes {
        &self.boxes
    }

    /// Reads a value through the query table.
    ///
    /// # Errors
    ///
    /// - [`SolnError::UnknownDimension`] / [`SolnError::InvalidDimensionKind`]
    ///   if `dim` is not of an accepted kind
    /// - [`SolnError::NotPrepared`] if the query needs a prepared solution
    pub fn get(&self, query: Query, dim: &str) -> Result<i64> {
        let spec = query.spec();
        self.settings.dims.check(dim, spec.api, spec.kinds)?;
        if spec.requires_prepared && self.phase != Phase::Prepared {
            return Err(SolnError::NotPrepared { api: spec.api });
        }
        let value = match spec.source {
            Source::Stored(setting) => self.settings.value(setting, dim),
            Source::OverallDomain => self.boxes.overall_domain_sizes.get(dim).copied().unwrap_or(0),
            Source::RankFirst => self.boxes.rank_bb.begin.get(dim).copied().unwrap_or(0),
            Source::RankLast => self.boxes.rank_bb.end.get(dim).copied().unwrap_or(0).saturating_sub(1),
        };
        Ok(value)
    }

    /// Writes a value through the setting table.
    ///
    /// `notify` runs synchronously after the value is stored so grid sizes
    /// can follow the new settings. Settings that describe the domain drop
    /// the phase to UNPREPARED whatever it was before.
    ///
    /// # Errors
    ///
    /// Returns [`SolnError::UnknownDimension`] or
    /// [`SolnError::InvalidDimensionKind`] if `dim` is not of an accepted kind;
    /// nothing is stored in that case.
    pub fn set(
        &mut self,
        setting: SizeSetting,
        dim: &str,
        value: i64,
        notify: impl FnOnce(&Settings),
    ) -> Result<()> {
        let spec = setting.spec();
        self.settings.dims.check(dim, spec.api, spec.kinds)?;
        self.settings.set_value(setting, dim, value);
        notify(&self.settings);
        if spec.resets_prepared {
            self.invalidate();
        }
        Ok(())
    }

    /// Drops back to UNPREPARED and invalidates the bounding boxes.
    pub fn invalidate(&mut self) {
        self.phase = Phase::Unprepared;
        self.boxes.rank_bb.valid = false;
        self.boxes.ext_bb.valid = false;
    }

    /// Applies [`Settings::adjust`] to the global settings.
    pub fn adjust(&mut self) -> bool {
        self.settings.adjust()
    }

    /// Installs freshly computed boxes and enters PREPARED.
    pub fn mark_prepared(&mut self, mut boxes: RankBoxes) {
        boxes.rank_bb.valid = true;
        boxes.ext_bb.valid = true;
        self.boxes = boxes;
        self.phase = Phase::Prepared;
    }
}
