//! Sliding-window frame rate

use std::collections::VecDeque;
use std::time::Duration;

/// Frame rate over the most recent timestamps
///
/// The window holds at most `max_frames` timestamps and never spans more
/// than `max_span`. Each push is amortised O(1).
#[derive(Debug, Clone)]
pub struct FpsWindow {
    timestamps_ns: VecDeque<u64>,
    max_frames: usize,
    max_span_ns: u64,
}

impl FpsWindow {
    pub fn new(max_frames: usize, max_span: Duration) -> Self {
        let max_frames = max_frames.max(2);
        Self {
            timestamps_ns: VecDeque::with_capacity(max_frames),
            max_frames,
            max_span_ns: max_span.as_nanos().min(u64::MAX as u128) as u64,
        }
    }

    /// Record a frame timestamp
    ///
    /// A timestamp earlier than the newest one restarts the window, since the
    /// source clock evidently jumped.
    pub fn push(&mut self, timestamp_ns: u64) {
        if let Some(&newest) = self.timestamps_ns.back() {
            if timestamp_ns < newest {
                self.timestamps_ns.clear();
            }
        }

        self.timestamps_ns.push_back(timestamp_ns);

        while self.timestamps_ns.len() > self.max_frames {
            self.timestamps_ns.pop_front();
        }
        while let Some(&oldest) = self.timestamps_ns.front() {
            if timestamp_ns - oldest > self.max_span_ns && self.timestamps_ns.len() > 2 {
                self.timestamps_ns.pop_front();
            } else {
                break;
            }
        }
    }

    /// Frames per second, `0.0` until two timestamps are known
    pub fn fps(&self) -> f64 {
        let (Some(&first), Some(&last)) = (self.timestamps_ns.front(), self.timestamps_ns.back())
        else {
            return 0.0;
        };
        let span_ns = last - first;
        if span_ns == 0 {
            return 0.0;
        }
        (self.timestamps_ns.len() - 1) as f64 / (span_ns as f64 / 1e9)
    }

    pub fn len(&self) -> usize {
        self.timestamps_ns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps_ns.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.timestamps_ns.len() == self.max_frames
    }

    pub fn clear(&mut self) {
        self.timestamps_ns.clear();
    }
}
