//! Work packs: named, separately timed units of computation.

use crate::settings::Settings;
use crate::timer::Timer;

/// Per-step cost of a work pack, declared by whoever built it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepCost {
    /// Grid-element reads per step over the rank domain.
    pub reads: u64,
    /// Grid-element writes per step over the rank domain.
    pub writes: u64,
    /// Estimated floating-point operations per step over the rank domain.
    pub fpops: u64,
}

/// A named unit of work with its own timer and step counter.
///
/// Packs are registered in a fixed order; the report attributes compute
/// time to packs in that order.
#[derive(Debug, Clone)]
pub struct WorkPack {
    name: String,
    cost: StepCost,
    /// Time spent evaluating this pack.
    pub timer: Timer,
    steps_done: u64,
    local_settings: Option<Settings>,
}

impl WorkPack {
    /// Creates a pack with the given per-step cost.
    pub fn new(name: &str, cost: StepCost) -> Self {
        Self {
            name: name.to_string(),
            cost,
            timer: Timer::new(),
            steps_done: 0,
            local_settings: None,
        }
    }

    /// Pack name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared per-step cost.
    pub fn cost(&self) -> StepCost {
        self.cost
    }

    /// Steps completed since the last report.
    pub fn steps_done(&self) -> u64 {
        self.steps_done
    }

    /// Counts `n` completed steps.
    pub fn add_steps(&mut self, n: u64) {
        self.steps_done += n;
    }

    /// Settings this pack runs with, once the solution was prepared.
    ///
    /// Tuning code may change them per pack; `prepare()` overwrites them with
    /// the global settings again.
    pub fn local_settings(&self) -> Option<&Settings> {
        self.local_settings.as_ref()
    }

    /// Mutable access to the local settings.
    pub fn local_settings_mut(&mut self) -> Option<&mut Settings> {
        self.local_settings.as_mut()
    }

    pub(crate) fn reset_local_settings(&mut self, settings: &Settings) {
        self.local_settings = Some(settings.clone());
    }

    /// Clears the timer and the step counter.
    pub fn clear_stats(&mut self) {
        self.timer.clear();
        self.steps_done = 0;
    }
}
