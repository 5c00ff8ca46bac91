//! Hierarchical progress reporting with time prediction.
//!
//! Three roles:
//!   - `Progress`: the sink interface. `step` is cheap and throttles calls
//!     to `refresh` to a few per second.
//!   - `FractionalProgress`: apportions one `init`/`done` budget across
//!     sequentially executed phases, weighting each phase by its predicted
//!     cost. Exactly one phase is active at a time; the active phase is a
//!     `SubProgress` borrowing the parent.
//!   - `TimePredictor`: persisted per-phase timing samples keyed by a stable
//!     uid, used both for weighting and for remaining-time estimates.
//!
//! `NullProgress` satisfies the interface for silent runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Target refresh rate of a throttled indicator, in Hz.
const REFRESH_HZ: f64 = 10.0;

/// Step resolution of the fractional parent's budget.
const FRACTION_RESOLUTION: u64 = 10_000;

/// Samples kept per phase uid in the predictor database.
const PREDICTOR_SAMPLES: usize = 5;

/// The sink interface for progress reporting.
pub trait Progress {
    /// Start a task that will take `steps` steps.
    fn init(&mut self, steps: u64);

    /// Record `n` steps of progress.
    fn step(&mut self, n: u64);

    /// Mark the task complete.
    fn done(&mut self);

    /// Render the current state. Called by `step` at a bounded rate.
    fn refresh(&mut self) {}

    /// Announce a nested task description.
    fn push_breadcrumb(&mut self, _name: &str) {}

    fn pop_breadcrumb(&mut self) {}
}

impl<P: Progress + ?Sized> Progress for &mut P {
    fn init(&mut self, steps: u64) {
        (**self).init(steps)
    }
    fn step(&mut self, n: u64) {
        (**self).step(n)
    }
    fn done(&mut self) {
        (**self).done()
    }
    fn refresh(&mut self) {
        (**self).refresh()
    }
    fn push_breadcrumb(&mut self, name: &str) {
        (**self).push_breadcrumb(name)
    }
    fn pop_breadcrumb(&mut self) {
        (**self).pop_breadcrumb()
    }
}

/// A sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl Progress for NullProgress {
    fn init(&mut self, _steps: u64) {}
    fn step(&mut self, _n: u64) {}
    fn done(&mut self) {}
}

// ── Throttle ─────────────────────────────────────────────────────────────────

/// Decides when a `step` should propagate to `refresh`.
///
/// The threshold is recomputed from the elapsed wall time so that refreshes
/// land near `REFRESH_HZ` regardless of per-step cost.
#[derive(Debug)]
struct Throttle {
    current: u64,
    next: u64,
    start: Instant,
}

impl Throttle {
    fn new() -> Self {
        Self {
            current: 0,
            next: 1,
            start: Instant::now(),
        }
    }

    /// Advance by `n`; returns true when the caller should refresh.
    fn tick(&mut self, n: u64) -> bool {
        self.current += n;
        if self.current <= self.next {
            return false;
        }
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let predicted = (self.current as f64) * (elapsed + 1.0 / REFRESH_HZ) / elapsed;
            // Early on the estimate is unreliable; never postpone past 2x.
            self.next = (predicted as u64).min(self.current * 2).max(self.current + 1);
        } else {
            self.next = self.current * 2;
        }
        true
    }
}

// ── Time predictor ───────────────────────────────────────────────────────────

/// Persisted timing samples: phase uid → up to `PREDICTOR_SAMPLES` recent
/// `(items, seconds)` pairs. The on-disk format is a single JSON object;
/// a missing or corrupt file simply predicts nothing.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PredictorDb {
    entries: HashMap<String, Vec<(u64, f64)>>,
}

/// Estimates phase durations from past runs.
#[derive(Debug, Default)]
pub struct TimePredictor {
    db: Mutex<PredictorDb>,
    path: Option<PathBuf>,
}

impl TimePredictor {
    /// An in-memory predictor that forgets everything on drop.
    pub fn ephemeral() -> Self {
        Self::default()
    }

    /// A predictor backed by the given database file. A missing or
    /// unreadable file starts empty.
    pub fn with_store(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let db = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            db: Mutex::new(db),
            path: Some(path),
        }
    }

    /// Predicted duration for `items` items of the phase `uid`, scaled
    /// linearly from the closest recorded sample. `None` when unseen.
    pub fn estimate(&self, uid: &str, items: u64) -> Option<Duration> {
        let db = self.db.lock();
        let samples = db.entries.get(uid)?;
        // Closest sample by item count; linear scale from there.
        let &(n, secs) = samples
            .iter()
            .min_by_key(|(n, _)| n.abs_diff(items))?;
        let scaled = if n == 0 {
            secs
        } else {
            secs * (items.max(1) as f64) / (n as f64)
        };
        Some(Duration::from_secs_f64(scaled.max(0.0)))
    }

    /// Record a measured run. Oldest samples fall out.
    pub fn record(&self, uid: &str, items: u64, elapsed: Duration) {
        let mut db = self.db.lock();
        let samples = db.entries.entry(uid.to_string()).or_default();
        samples.push((items, elapsed.as_secs_f64()));
        if samples.len() > PREDICTOR_SAMPLES {
            let drop = samples.len() - PREDICTOR_SAMPLES;
            samples.drain(..drop);
        }
    }

    /// Persist the database. Write-tmp-then-rename so readers never see a
    /// torn file. A predictor without a store path is a no-op.
    pub fn store(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let db = self.db.lock();
        let bytes = serde_json::to_vec(&*db).map_err(std::io::Error::other)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)
    }

    /// Location of the persisted database, if any.
    pub fn store_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

// ── Fractional parent ────────────────────────────────────────────────────────

struct PhaseBudget {
    uid: String,
    name: String,
    items: u64,
    /// Predicted cost in seconds; 1.0 when the predictor has no sample.
    weight: f64,
    /// Budget steps of the parent allotted to this phase.
    budget: u64,
}

/// Apportions a single progress budget across sequentially executed phases.
pub struct FractionalProgress<P: Progress> {
    base: P,
    phases: Vec<PhaseBudget>,
    consumed: u64,
    initialized: bool,
}

impl<P: Progress> FractionalProgress<P> {
    pub fn new(base: P) -> Self {
        Self {
            base,
            phases: Vec::new(),
            consumed: 0,
            initialized: false,
        }
    }

    /// Register a phase before `init`. Returns its index.
    pub fn add_phase(
        &mut self,
        uid: impl Into<String>,
        name: impl Into<String>,
        items: u64,
        predictor: &TimePredictor,
    ) -> usize {
        let uid = uid.into();
        let weight = predictor
            .estimate(&uid, items)
            .map(|d| d.as_secs_f64().max(1e-3))
            .unwrap_or(1.0);
        self.phases.push(PhaseBudget {
            uid,
            name: name.into(),
            items,
            weight,
            budget: 0,
        });
        self.phases.len() - 1
    }

    /// Distribute the budget and initialize the base sink. Must be called
    /// after all phases are registered and before `enter_phase`.
    pub fn init(&mut self) {
        let total: f64 = self.phases.iter().map(|p| p.weight).sum();
        let mut handed_out = 0u64;
        let n = self.phases.len();
        for (i, phase) in self.phases.iter_mut().enumerate() {
            phase.budget = if i + 1 == n {
                FRACTION_RESOLUTION - handed_out
            } else if total > 0.0 {
                ((phase.weight / total) * FRACTION_RESOLUTION as f64) as u64
            } else {
                0
            };
            handed_out += phase.budget;
        }
        self.base.init(FRACTION_RESOLUTION);
        self.initialized = true;
    }

    /// Begin phase `index`. The returned sub-indicator borrows the parent,
    /// so only one phase can be active at a time.
    pub fn enter_phase(&mut self, index: usize) -> SubProgress<'_, P> {
        debug_assert!(self.initialized, "enter_phase before init");
        let name = self.phases[index].name.clone();
        self.base.push_breadcrumb(&name);
        SubProgress {
            index,
            range: 0,
            current: 0,
            reported: 0,
            throttle: Throttle::new(),
            started: Instant::now(),
            parent: self,
        }
    }

    /// Finish the whole task.
    pub fn done(&mut self) {
        let remaining = FRACTION_RESOLUTION.saturating_sub(self.consumed);
        if remaining > 0 {
            self.base.step(remaining);
            self.consumed = FRACTION_RESOLUTION;
        }
        self.base.done();
    }

    /// The wrapped base sink.
    pub fn base_mut(&mut self) -> &mut P {
        &mut self.base
    }
}

/// The active phase's view of its parent's budget.
pub struct SubProgress<'a, P: Progress> {
    index: usize,
    range: u64,
    current: u64,
    /// Parent steps already forwarded for this phase.
    reported: u64,
    throttle: Throttle,
    started: Instant,
    parent: &'a mut FractionalProgress<P>,
}

impl<P: Progress> SubProgress<'_, P> {
    fn forward(&mut self) {
        let budget = self.parent.phases[self.index].budget;
        let due = if self.range == 0 {
            0
        } else {
            (budget as u128 * self.current.min(self.range) as u128 / self.range as u128) as u64
        };
        if due > self.reported {
            self.parent.base.step(due - self.reported);
            self.parent.consumed += due - self.reported;
            self.reported = due;
        }
        self.parent.base.refresh();
    }

    /// Record the measured duration and release the parent.
    pub fn finish(mut self, predictor: &TimePredictor) {
        let budget = self.parent.phases[self.index].budget;
        if budget > self.reported {
            self.parent.base.step(budget - self.reported);
            self.parent.consumed += budget - self.reported;
            self.reported = budget;
        }
        let phase = &self.parent.phases[self.index];
        predictor.record(&phase.uid, phase.items, self.started.elapsed());
        self.parent.base.pop_breadcrumb();
    }
}

impl<P: Progress> Progress for SubProgress<'_, P> {
    fn init(&mut self, steps: u64) {
        self.range = steps;
        self.current = 0;
    }

    fn step(&mut self, n: u64) {
        if self.throttle.tick(n) {
            self.current = self.throttle.current;
            self.forward();
        }
    }

    fn done(&mut self) {
        self.current = self.range;
        self.forward();
    }
}
