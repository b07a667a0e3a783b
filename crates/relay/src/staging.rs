//! Frame-budgeted staging
//!
//! Consumers with a rendering deadline stage incoming events instead of
//! applying them immediately. Each frame applies a small adaptive batch,
//! prepends it newest-first, and enforces a window cap so the model never
//! grows unbounded.

use nostr_core::Event;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Window cap; oldest entries beyond it are evicted.
pub const MAX_WINDOW: usize = 1000;

const FRAME_BUDGET: Duration = Duration::from_millis(12);
const ITEMS_PER_FRAME_INITIAL: usize = 3;
const ITEMS_PER_FRAME_MIN: usize = 1;
const ITEMS_PER_FRAME_MAX: usize = 5;

/// What a single frame did. `inserted` entries were prepended (one change
/// notification), `evicted` oldest entries fell off the window (a second,
/// separate notification when non-zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameChange {
    pub inserted: usize,
    pub evicted: usize,
}

struct StagedEntry {
    event: Event,
    /// Monotonic arrival time, kept for age-based policies.
    #[allow(dead_code)]
    arrived: Instant,
}

pub struct StagingBuffer {
    staged: VecDeque<StagedEntry>,
    /// Applied events, newest first.
    window: VecDeque<Event>,
    items_per_frame: usize,
}

impl Default for StagingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl StagingBuffer {
    pub fn new() -> Self {
        Self {
            staged: VecDeque::new(),
            window: VecDeque::new(),
            items_per_frame: ITEMS_PER_FRAME_INITIAL,
        }
    }

    pub fn stage(&mut self, event: Event) {
        self.staged.push_back(StagedEntry {
            event,
            arrived: Instant::now(),
        });
    }

    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    pub fn window(&self) -> &VecDeque<Event> {
        &self.window
    }

    pub fn items_per_frame(&self) -> usize {
        self.items_per_frame
    }

    /// Apply one frame's worth of staged entries. Returns `None` when
    /// nothing was staged.
    pub fn run_frame(&mut self) -> Option<FrameChange> {
        let start = Instant::now();
        let change = self.apply_batch()?;
        self.adapt(start.elapsed());
        Some(change)
    }

    fn apply_batch(&mut self) -> Option<FrameChange> {
        if self.staged.is_empty() {
            return None;
        }

        let take = self.items_per_frame.min(self.staged.len());
        let mut inserted = 0;
        for entry in self.staged.drain(..take) {
            self.window.push_front(entry.event);
            inserted += 1;
        }

        let mut evicted = 0;
        while self.window.len() > MAX_WINDOW {
            self.window.pop_back();
            evicted += 1;
        }

        Some(FrameChange { inserted, evicted })
    }

    fn adapt(&mut self, elapsed: Duration) {
        if elapsed > FRAME_BUDGET {
            if self.items_per_frame > ITEMS_PER_FRAME_MIN {
                self.items_per_frame -= 1;
            }
        } else if elapsed < FRAME_BUDGET / 2 && self.items_per_frame < ITEMS_PER_FRAME_MAX {
            self.items_per_frame += 1;
        }
    }
}
