//! Fixed-pool progress aggregation.
//!
//! A long-running operation (enumerating records, unpacking a folder) is made
//! of nested sub-operations whose sizes only become known while parsing is
//! under way.  Each sub-operation claims one [`ProgressSlot`] from a pool
//! allocated once per top-level operation, reports `current / total` into
//! it, and releases it when done.
//!
//! # Aggregation
//!
//! ```text
//! local   = floor(100 * Σ current / Σ total)      over valid slots
//! percent = (phase * 100 + local) / phases
//! status  = non-empty slot statuses joined by "/" in slot order
//! ```
//!
//! Nothing is reported while `Σ total` is zero.  The reported percent never
//! decreases within one [`ProgressState`] and never exceeds 100.
//!
//! # Phases
//!
//! An operation that runs several slot-driven stages one after another
//! (enumerate, then unpack) splits the range with
//! [`ProgressState::begin_phase`].  Each phase owns an equal share, so a
//! finished first stage does not pin the line at 100 %.  The default is a
//! single phase.
//!
//! # Delivery
//!
//! Snapshots reach the registered [`ProgressObserver`] synchronously, at most
//! once per `min_interval`.  The first report of a slot (`begin_slot`) and its
//! last (`end_slot`) bypass the limit.
//!
//! # Cancellation
//!
//! Producers poll [`ProgressState::checkpoint`] between units of work.  The
//! flag lives in a [`CancelToken`] that can be cloned out and set from
//! elsewhere.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

pub mod line;

pub use line::LineObserver;

/// Pool size used by [`ProgressState::default`].
pub const DEFAULT_SLOT_COUNT:   usize    = 32;
/// Minimum spacing between two rate-limited observer calls.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(100);
/// Joins the statuses of concurrently active slots.
pub const STATUS_SEPARATOR:     &str     = "/";

// ── Slot ─────────────────────────────────────────────────────────────────────

/// One tracked sub-operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSlot {
    pub valid:   bool,
    pub current: u64,
    pub total:   u64,
    pub status:  String,
}

/// Aggregated view delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub percent: u8,
    pub status:  String,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.status.is_empty() {
            write!(f, "{:>3}%", self.percent)
        } else {
            write!(f, "{:>3}% {}", self.percent, self.status)
        }
    }
}

/// Receives aggregated snapshots from deep inside long-running calls.
pub trait ProgressObserver: Send {
    fn on_progress(&mut self, snapshot: &Snapshot);

    /// Called once a stage's output is complete (e.g. to end a status line).
    fn finish(&mut self) {}
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProgressError {
    #[error("progress slot {index} out of range (pool holds {capacity})")]
    OutOfRange { index: usize, capacity: usize },
    #[error("all {capacity} progress slots are in use")]
    Exhausted { capacity: usize },
}

/// Returned by [`ProgressState::checkpoint`] once cancellation was requested.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── State ────────────────────────────────────────────────────────────────────

pub struct ProgressState {
    slots:              Box<[ProgressSlot]>,
    last_callback_time: Option<Instant>,
    min_interval:       Duration,
    high_water:         u8,
    phase:              u32,
    phases:             u32,
    cancel:             CancelToken,
    observer:           Option<Box<dyn ProgressObserver>>,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_COUNT)
    }
}

impl fmt::Debug for ProgressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressState")
            .field("slots", &self.slots)
            .field("min_interval", &self.min_interval)
            .field("high_water", &self.high_water)
            .field("phase", &(self.phase, self.phases))
            .field("cancelled", &self.cancel.is_cancelled())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl ProgressState {
    /// Allocate a pool of `slot_count` slots.  The pool never grows.
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots:              vec![ProgressSlot::default(); slot_count].into_boxed_slice(),
            last_callback_time: None,
            min_interval:       DEFAULT_MIN_INTERVAL,
            high_water:         0,
            phase:              0,
            phases:             1,
            cancel:             CancelToken::new(),
            observer:           None,
        }
    }

    pub fn with_observer<O: ProgressObserver + 'static>(mut self, observer: O) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&ProgressSlot> {
        self.slots.get(index)
    }

    // ── Phases ───────────────────────────────────────────────────────────────

    /// Split the operation into `count` equal phases and enter phase `index`.
    /// Out-of-range values are clamped to the last phase.
    pub fn begin_phase(&mut self, index: u32, count: u32) {
        self.phases = count.max(1);
        self.phase  = index.min(self.phases - 1);
    }

    // ── Cancellation ─────────────────────────────────────────────────────────

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Poll point for producers between discrete units of work.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() { Err(Cancelled) } else { Ok(()) }
    }

    // ── Slot lifecycle ───────────────────────────────────────────────────────

    /// Allocate slot `index` with a known (possibly zero) total.
    /// Always delivers a snapshot, bypassing the rate limit.
    pub fn begin_slot(
        &mut self,
        index:  usize,
        total:  u64,
        status: impl Into<String>,
    ) -> Result<(), ProgressError> {
        let slot = self.slot_mut(index)?;
        *slot = ProgressSlot {
            valid:   true,
            current: 0,
            total,
            status:  status.into(),
        };
        self.emit(true);
        Ok(())
    }

    /// Allocate the lowest free slot and return its index.
    pub fn claim(&mut self, total: u64, status: impl Into<String>) -> Result<usize, ProgressError> {
        let index = self.slots
            .iter()
            .position(|s| !s.valid)
            .ok_or(ProgressError::Exhausted { capacity: self.slots.len() })?;
        self.begin_slot(index, total, status)?;
        Ok(index)
    }

    /// Set the total of a running slot once its size becomes known.
    pub fn resize_slot(&mut self, index: usize, total: u64) -> Result<(), ProgressError> {
        let slot = self.slot_mut(index)?;
        if slot.valid {
            slot.total   = total;
            slot.current = slot.current.min(total);
        }
        Ok(())
    }

    /// Move a slot forward and replace its status label.
    pub fn advance_slot(
        &mut self,
        index:   usize,
        current: u64,
        status:  impl Into<String>,
    ) -> Result<(), ProgressError> {
        let status = status.into();
        let slot = self.slot_mut(index)?;
        if slot.valid {
            slot.status = status;
        }
        self.advance(index, current)
    }

    /// Move a slot forward, keeping its status.  `current` never goes
    /// backwards and is clamped to the slot's total.
    pub fn advance(&mut self, index: usize, current: u64) -> Result<(), ProgressError> {
        let slot = self.slot_mut(index)?;
        if !slot.valid {
            return Ok(());
        }
        let mut current = current.max(slot.current);
        if slot.total > 0 {
            current = current.min(slot.total);
        }
        slot.current = current;
        self.emit(false);
        Ok(())
    }

    /// Complete a slot: report it at 100 % (always delivered), then release it.
    pub fn end_slot(&mut self, index: usize) -> Result<(), ProgressError> {
        let slot = self.slot_mut(index)?;
        if !slot.valid {
            return Ok(());
        }
        slot.current = slot.total;
        self.emit(true);
        self.slots[index] = ProgressSlot::default();
        Ok(())
    }

    // ── Aggregation ──────────────────────────────────────────────────────────

    /// Combined percentage and status over all valid slots.
    ///
    /// `None` while no valid slot has a non-zero total.
    pub fn report(&mut self) -> Option<Snapshot> {
        let (current, total) = self.slots
            .iter()
            .filter(|s| s.valid)
            .fold((0u128, 0u128), |(c, t), s| (c + s.current as u128, t + s.total as u128));
        if total == 0 {
            return None;
        }

        let local = (current * 100 / total).min(100);
        let computed = ((u128::from(self.phase) * 100 + local) / u128::from(self.phases)) as u8;
        self.high_water = self.high_water.max(computed);

        let status = self.slots
            .iter()
            .filter(|s| s.valid && !s.status.is_empty())
            .map(|s| s.status.as_str())
            .collect::<Vec<_>>()
            .join(STATUS_SEPARATOR);

        Some(Snapshot { percent: self.high_water, status })
    }

    /// Let the observer close its output (e.g. terminate the status line).
    pub fn finish(&mut self) {
        if let Some(observer) = self.observer.as_mut() {
            observer.finish();
        }
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut ProgressSlot, ProgressError> {
        let capacity = self.slots.len();
        self.slots
            .get_mut(index)
            .ok_or(ProgressError::OutOfRange { index, capacity })
    }

    fn emit(&mut self, force: bool) {
        if self.observer.is_none() {
            return;
        }
        let now = Instant::now();
        let throttled = matches!(self.last_callback_time,
            Some(last) if now.duration_since(last) < self.min_interval);

        let Some(snapshot) = self.report() else { return };
        if throttled && !force && snapshot.percent < 100 {
            return;
        }
        if let Some(observer) = self.observer.as_mut() {
            observer.on_progress(&snapshot);
        }
        self.last_callback_time = Some(now);
    }
}
