use std::collections::VecDeque;

/// Rolling record of eye-closed time over a trailing window.
///
/// The ratio is always closed time inside `[now - window, now]` divided by
/// the full window, so a session younger than the window reads low rather
/// than spiking on its first few closed frames.
#[derive(Debug, Clone)]
pub struct PerclosWindow {
    window_ms: u64,
    /// Disjoint closed intervals `[start, end]` in ascending order.
    closed: VecDeque<(i64, i64)>,
}

impl PerclosWindow {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            closed: VecDeque::new(),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Records `[start_ms, end_ms]` as eyes-closed time. Intervals must arrive
    /// in timestamp order; a touching interval is merged into the previous one.
    pub fn record_closed(&mut self, start_ms: i64, end_ms: i64) {
        if end_ms <= start_ms {
            return;
        }
        if let Some(last) = self.closed.back_mut() {
            if start_ms <= last.1 {
                last.1 = last.1.max(end_ms);
                return;
            }
        }
        self.closed.push_back((start_ms, end_ms));
    }

    /// Closed time inside the trailing window ending at `now_ms`.
    pub fn closed_ms_at(&mut self, now_ms: i64) -> u64 {
        let window_start = now_ms.saturating_sub(self.window_ms as i64);
        while matches!(self.closed.front(), Some(&(_, end)) if end <= window_start) {
            self.closed.pop_front();
        }

        self.closed
            .iter()
            .map(|&(start, end)| {
                let start = start.max(window_start);
                let end = end.min(now_ms);
                (end - start).max(0) as u64
            })
            .sum()
    }

    pub fn ratio_at(&mut self, now_ms: i64) -> f64 {
        if self.window_ms == 0 {
            return 0.0;
        }
        self.closed_ms_at(now_ms) as f64 / self.window_ms as f64
    }

    pub fn clear(&mut self) {
        self.closed.clear();
    }
}
