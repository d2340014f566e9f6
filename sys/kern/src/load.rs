// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CPU-load measurement.
//!
//! The dispatcher tells the monitor when its core leaves and enters the
//! idle loop; the monitor buckets the busy time into fixed windows of the
//! execution timer and reports the last completed window as a percentage,
//! plus the peak window since the last reset.

/// Per-core load meter.
pub struct LoadMonitor {
    /// Window length in execution-timer ticks.
    window: u64,
    window_start: u64,
    /// Busy time already accumulated in the open window.
    busy_acc: u64,
    /// Start of the current busy period; `None` while idle.
    busy_since: Option<u64>,
    /// Load of the last completed window, 0..=100.
    current: u8,
    peak: u8,
}

impl LoadMonitor {
    pub fn new(window: u64, now: u64) -> Self {
        LoadMonitor {
            window,
            window_start: now,
            busy_acc: 0,
            busy_since: None,
            current: 0,
            peak: 0,
        }
    }

    /// The core leaves the idle loop at `now`.
    pub fn busy(&mut self, now: u64) {
        self.roll(now);
        if self.busy_since.is_none() {
            self.busy_since = Some(now);
        }
    }

    /// The core enters the idle loop at `now`.
    pub fn idle(&mut self, now: u64) {
        self.roll(now);
        if let Some(b) = self.busy_since.take() {
            self.busy_acc += now - b;
        }
    }

    /// Load of the last completed window, in percent.
    pub fn current(&mut self, now: u64) -> u8 {
        self.roll(now);
        self.current
    }

    /// Highest completed-window load observed since the last reset.
    pub fn peak(&mut self, now: u64) -> u8 {
        self.roll(now);
        self.peak
    }

    /// Resets the peak to the current value.
    pub fn reset_peak(&mut self) {
        self.peak = self.current;
    }

    /// Closes every window boundary crossed up to `now`. An ongoing busy
    /// period is split at each boundary so fully busy windows read 100.
    fn roll(&mut self, now: u64) {
        loop {
            let end = self.window_start + self.window;
            if now < end {
                return;
            }
            let mut busy = self.busy_acc;
            if let Some(b) = &mut self.busy_since {
                busy += end - *b;
                *b = end;
            }
            self.current = (busy * 100 / self.window).min(100) as u8;
            self.peak = self.peak.max(self.current);
            self.busy_acc = 0;
            self.window_start = end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_busy_window_reads_fifty() {
        let mut m = LoadMonitor::new(100, 0);
        m.busy(10);
        m.idle(60);
        assert_eq!(m.current(100), 50);
    }

    #[test]
    fn fully_busy_spanning_windows_reads_hundred() {
        let mut m = LoadMonitor::new(100, 0);
        m.busy(0);
        // Still busy three windows later.
        assert_eq!(m.current(350), 100);
        m.idle(350);
        assert_eq!(m.current(400), 50);
    }

    #[test]
    fn idle_windows_read_zero() {
        let mut m = LoadMonitor::new(100, 0);
        m.busy(10);
        m.idle(20);
        // Two empty windows pass.
        assert_eq!(m.current(300), 0);
    }

    #[test]
    fn peak_survives_until_reset() {
        let mut m = LoadMonitor::new(100, 0);
        m.busy(0);
        m.idle(80);
        assert_eq!(m.peak(100), 80);
        m.busy(110);
        m.idle(120);
        assert_eq!(m.current(200), 10);
        assert_eq!(m.peak(200), 80);
        m.reset_peak();
        assert_eq!(m.peak(200), 10);
    }
}
