//! Resource Usage Monitoring
//!
//! Samples CPU and memory usage of a running child process so that a local
//! execution can report what the script consumed.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, System};

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    /// When this sample was taken
    pub timestamp: Instant,
    /// CPU usage percentage (0-100+)
    pub cpu_usage: f32,
    /// Memory usage in megabytes
    pub memory_mb: u64,
}

/// Aggregated usage of one execution.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceUsage {
    pub average_cpu: f32,
    pub peak_memory_mb: u64,
    pub samples: usize,
}

impl fmt::Display for ResourceUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.samples == 0 {
            return write!(f, "no resource data collected");
        }
        write!(
            f,
            "avg CPU {:.1}%, peak memory {} MB ({} samples)",
            self.average_cpu, self.peak_memory_mb, self.samples
        )
    }
}

/// Monitors resource usage of a single process.
///
/// # Example
///
/// ```rust,no_run
/// use std::process::Command;
/// use stagerun::monitoring::ResourceMonitor;
///
/// let mut child = Command::new("sleep").arg("1").spawn().unwrap();
/// let mut monitor = ResourceMonitor::for_pid(child.id());
///
/// while child.try_wait().unwrap().is_none() {
///     monitor.sample();
///     std::thread::sleep(std::time::Duration::from_millis(100));
/// }
/// println!("{}", monitor.usage());
/// ```
pub struct ResourceMonitor {
    system: System,
    process_id: Pid,
    samples: Vec<ResourceSample>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
}

impl ResourceMonitor {
    /// Creates a monitor for the process with the given OS id.
    pub fn for_pid(pid: u32) -> Self {
        Self {
            system: System::new(),
            process_id: Pid::from_u32(pid),
            samples: Vec::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
        }
    }

    /// Sets the minimum interval between samples.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Takes a resource usage sample.
    ///
    /// The first call only primes CPU accounting. Later calls are
    /// rate-limited by `min_interval`; calls after the process exited are
    /// silently ignored.
    pub fn sample(&mut self) {
        let now = Instant::now();
        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();

        if !self.warmup_done {
            self.system.refresh_processes_specifics(refresh_kind);
            self.warmup_done = true;
            self.last_sample = Some(now);
            return;
        }

        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }

        self.system.refresh_processes_specifics(refresh_kind);
        self.last_sample = Some(now);

        if let Some(process) = self.system.process(self.process_id) {
            self.samples.push(ResourceSample {
                timestamp: now,
                cpu_usage: process.cpu_usage(),
                memory_mb: process.memory() / (1024 * 1024),
            });
        }
    }

    /// Returns all collected samples.
    pub fn get_samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    /// Returns the peak memory usage in MB.
    pub fn peak_memory_mb(&self) -> u64 {
        self.samples.iter().map(|s| s.memory_mb).max().unwrap_or(0)
    }

    /// Returns the average CPU usage.
    pub fn average_cpu(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu_usage).sum::<f32>() / self.samples.len() as f32
    }

    /// Summarizes the samples collected so far.
    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            average_cpu: self.average_cpu(),
            peak_memory_mb: self.peak_memory_mb(),
            samples: self.samples.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::thread;

    #[test]
    fn test_monitor_creation() {
        let monitor = ResourceMonitor::for_pid(std::process::id());
        assert!(monitor.get_samples().is_empty());
        assert_eq!(monitor.usage(), ResourceUsage::default());
    }

    #[test]
    fn test_first_sample_is_warmup() {
        let mut monitor = ResourceMonitor::for_pid(std::process::id());
        monitor.sample();
        assert!(monitor.get_samples().is_empty());

        thread::sleep(Duration::from_millis(300));
        monitor.sample();
        assert_eq!(monitor.get_samples().len(), 1);
    }

    #[test]
    fn test_min_interval() {
        let mut monitor = ResourceMonitor::for_pid(std::process::id())
            .with_min_interval(Duration::from_millis(200));

        monitor.sample();
        monitor.sample();
        assert!(monitor.get_samples().is_empty());

        thread::sleep(Duration::from_millis(250));
        monitor.sample();
        assert!(!monitor.get_samples().is_empty());
    }

    #[test]
    fn test_samples_child_process() {
        let mut child = Command::new("sleep").arg("1").spawn().unwrap();
        let mut monitor =
            ResourceMonitor::for_pid(child.id()).with_min_interval(Duration::from_millis(50));

        monitor.sample();
        for _ in 0..3 {
            thread::sleep(Duration::from_millis(100));
            monitor.sample();
        }
        child.kill().ok();
        child.wait().unwrap();

        let usage = monitor.usage();
        assert!(usage.samples >= 1);
        assert!(usage.average_cpu >= 0.0);
    }

    #[test]
    fn test_exited_process_yields_no_samples() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let mut monitor = ResourceMonitor::for_pid(pid).with_min_interval(Duration::ZERO);
        monitor.sample();
        monitor.sample();
        assert!(monitor.get_samples().is_empty());
    }

    #[test]
    fn test_usage_display() {
        assert_eq!(ResourceUsage::default().to_string(), "no resource data collected");

        let usage = ResourceUsage {
            average_cpu: 12.34,
            peak_memory_mb: 48,
            samples: 5,
        };
        assert_eq!(usage.to_string(), "avg CPU 12.3%, peak memory 48 MB (5 samples)");
    }
}
