use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use log::{error, warn};
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{get_current_pid, Pid, ProcessExt, System, SystemExt};

use clubprint_settings::clubprint::MonitoringSettings;

const RING_CAPACITY: usize = 12;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemorySample {
    pub rss_mb: u64,
    pub virtual_mb: u64,
    pub sampled_at: DateTime<Utc>,
}

/// Periodic RSS sampling with a bounded ring of recent samples. Warns on
/// threshold breaches and on strict monotonic growth across a full ring,
/// which is how a slow leak looks over an hour of samples.
pub struct MemoryMonitor {
    system: Mutex<System>,
    pid: Option<Pid>,
    ring: Mutex<VecDeque<MemorySample>>,
    warn_mb: u64,
    high_mb: u64,
}

impl MemoryMonitor {
    pub fn new(settings: &MonitoringSettings) -> Self {
        let pid = match get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                error!("Cannot resolve own pid, memory monitoring disabled: {}", err);
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            warn_mb: settings.memory_warn_mb,
            high_mb: settings.rss_warn_mb,
        }
    }

    pub fn sample(&self) -> Option<MemorySample> {
        let pid = self.pid?;
        let sample = {
            let mut system = self.system.lock();
            system.refresh_process(pid);
            let process = system.process(pid)?;
            MemorySample {
                // sysinfo reports KiB
                rss_mb: process.memory() / 1024,
                virtual_mb: process.virtual_memory() / 1024,
                sampled_at: Utc::now(),
            }
        };
        self.push(sample);
        if sample.rss_mb > self.high_mb {
            warn!(
                "Process RSS {} MB exceeds the {} MB limit",
                sample.rss_mb, self.high_mb
            );
        } else if sample.rss_mb > self.warn_mb {
            warn!(
                "Process RSS {} MB exceeds the {} MB warning threshold",
                sample.rss_mb, self.warn_mb
            );
        }
        if self.growing_monotonically() {
            warn!(
                "Process RSS has grown across the last {} samples, possible leak",
                RING_CAPACITY
            );
        }
        Some(sample)
    }

    fn push(&self, sample: MemorySample) {
        let mut ring = self.ring.lock();
        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(sample);
    }

    fn growing_monotonically(&self) -> bool {
        let ring = self.ring.lock();
        if ring.len() < RING_CAPACITY {
            return false;
        }
        ring.iter()
            .zip(ring.iter().skip(1))
            .all(|(a, b)| b.rss_mb > a.rss_mb)
    }

    pub fn latest(&self) -> Option<MemorySample> {
        self.ring.lock().back().copied()
    }

    pub fn above_warning(&self) -> bool {
        self.latest()
            .map(|sample| sample.rss_mb > self.warn_mb)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> MemoryMonitor {
        MemoryMonitor::new(&MonitoringSettings::default())
    }

    fn push_rss(monitor: &MemoryMonitor, rss_mb: u64) {
        monitor.push(MemorySample {
            rss_mb,
            virtual_mb: rss_mb * 4,
            sampled_at: Utc::now(),
        });
    }

    #[test]
    fn test_sample_reads_own_process() {
        let monitor = monitor();
        let sample = monitor.sample().expect("own process is always visible");
        assert!(sample.rss_mb > 0);
        assert!(monitor.latest().is_some());
    }

    #[test]
    fn test_ring_is_bounded() {
        let monitor = monitor();
        for i in 0..40 {
            push_rss(&monitor, 100 + (i % 3));
        }
        assert_eq!(monitor.ring.lock().len(), RING_CAPACITY);
    }

    #[test]
    fn test_monotonic_growth_detection() {
        let monitor = monitor();
        for i in 0..RING_CAPACITY as u64 {
            push_rss(&monitor, 100 + i);
        }
        assert!(monitor.growing_monotonically());

        push_rss(&monitor, 50);
        assert!(!monitor.growing_monotonically());
    }

    #[test]
    fn test_partial_ring_never_flags_growth() {
        let monitor = monitor();
        for i in 0..3 {
            push_rss(&monitor, 100 + i);
        }
        assert!(!monitor.growing_monotonically());
    }

    #[test]
    fn test_above_warning_threshold() {
        let monitor = monitor();
        assert!(!monitor.above_warning());
        push_rss(&monitor, 299);
        assert!(!monitor.above_warning());
        push_rss(&monitor, 301);
        assert!(monitor.above_warning());
    }
}
