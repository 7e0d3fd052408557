//! CPU and memory sampling from the cgroup v2 hierarchy.
//!
//! Runs on its own thread for the lifetime of the traced command and owns
//! its sample list exclusively; the monitor is moved into the sampling
//! thread and handed back through the join once cancellation completes.
//! Anything that prevents sampling degrades the run to "no resource data"
//! rather than failing it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::event::{Category, Event, Phase};

const SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

/// One resource reading. Appended in increasing timestamp order, immutable
/// once appended.
#[derive(Debug, Clone)]
struct Sample {
    ts: SystemTime,
    cpu: f64,
    memory: u64,
}

/// Polls the calling process's cgroup counters and derives a CPU-utilization
/// and memory-usage timeseries that materializes as a counter track.
pub struct ResourceMonitor {
    cgroup_path: PathBuf,
    allotted_cpus: f64,
    last_instant: Instant,
    last_cpu_usage_usec: u64,
    samples: Vec<Sample>,
}

impl ResourceMonitor {
    /// Locate the cgroup, derive the allotted core count from the CPU
    /// quota/period pair, and record the baseline cumulative CPU counter.
    pub fn new() -> Result<Self> {
        Self::with_cgroup(current_cgroup_path()?)
    }

    fn with_cgroup(cgroup_path: PathBuf) -> Result<Self> {
        let cpu_max_path = cgroup_path.join("cpu.max");
        let cpu_max = fs::read_to_string(&cpu_max_path)
            .with_context(|| format!("error reading {}", cpu_max_path.display()))?;
        let (quota, period) = cpu_max
            .trim()
            .split_once(' ')
            .with_context(|| format!("invalid format for {}: {cpu_max:?}", cpu_max_path.display()))?;
        let quota = parse_counter(quota)
            .with_context(|| format!("error parsing {}", cpu_max_path.display()))?;
        let period = parse_counter(period)
            .with_context(|| format!("error parsing {}", cpu_max_path.display()))?;

        let baseline = read_flat_keyed(&cgroup_path.join("cpu.stat"), "usage_usec")?;

        Ok(Self {
            cgroup_path,
            allotted_cpus: quota as f64 / period as f64,
            last_instant: Instant::now(),
            last_cpu_usage_usec: baseline,
            samples: Vec::new(),
        })
    }

    /// Sampling loop. Re-reads the cumulative CPU and memory counters on a
    /// fixed tick until the stop flag is raised; the flag is checked at each
    /// interval boundary, never mid-read. A failed read ends sampling with a
    /// warning and leaves the samples gathered so far intact.
    pub fn run(&mut self, stop: &AtomicBool) {
        loop {
            thread::sleep(SAMPLE_INTERVAL);
            if stop.load(Ordering::Relaxed) {
                return;
            }

            let timestamp = SystemTime::now();
            let now = Instant::now();
            let cpu_usage_usec =
                match read_flat_keyed(&self.cgroup_path.join("cpu.stat"), "usage_usec") {
                    Ok(value) => value,
                    Err(err) => {
                        warn!("cpu sampling stopped: {err:#}");
                        return;
                    }
                };
            let memory = match read_flat_keyed(&self.cgroup_path.join("memory.stat"), "anon") {
                Ok(value) => value,
                Err(err) => {
                    warn!("memory sampling stopped: {err:#}");
                    return;
                }
            };

            let wall_usec = now.duration_since(self.last_instant).as_micros() as u64;
            let cpu = cpu_percent(
                cpu_usage_usec.saturating_sub(self.last_cpu_usage_usec),
                self.allotted_cpus,
                wall_usec,
            );
            self.samples.push(Sample {
                ts: timestamp,
                cpu,
                memory,
            });
            self.last_cpu_usage_usec = cpu_usage_usec;
            self.last_instant = now;
        }
    }

    /// Materialize the sample series as trace events: a metadata pair naming
    /// the track, then one counter event per sample. Timestamps are
    /// wall-clock microseconds, the same basis strace's `-ttt` stamps use.
    pub fn into_events(self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.samples.len() + 2);
        for name in ["process_name", "thread_name"] {
            let mut meta = Event::synthetic(name, Category::Metadata, Phase::Metadata, 0, 0, 0);
            meta.args.name = Some("System resources".to_string());
            events.push(meta);
        }
        for sample in self.samples {
            let ts = sample
                .ts
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_micros() as u64)
                .unwrap_or(0);
            let mut event = Event::synthetic("", Category::Counter, Phase::Counter, 0, 0, ts);
            event.args.cpu = Some(sample.cpu);
            event.args.memory = Some(sample.memory);
            events.push(event);
        }
        events
    }
}

/// Instantaneous utilization of the allotted cores over one interval.
fn cpu_percent(delta_usage_usec: u64, allotted_cpus: f64, delta_wall_usec: u64) -> f64 {
    100.0 * delta_usage_usec as f64 / allotted_cpus / delta_wall_usec as f64
}

/// Locate this process's cgroup directory. Only the v2 unified hierarchy
/// (a single `0::` entry) is supported; a legacy layout means no resource
/// data, not a failed run.
fn current_cgroup_path() -> Result<PathBuf> {
    let contents =
        fs::read_to_string("/proc/self/cgroup").context("error reading /proc/self/cgroup")?;
    for line in contents.trim().lines() {
        let mut fields = line.splitn(3, ':');
        let (Some(hierarchy), Some(controllers), Some(path)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if hierarchy != "0" || !controllers.is_empty() {
            continue;
        }
        return Ok(PathBuf::from(format!("/sys/fs/cgroup{path}")));
    }
    bail!("no cgroup v2 entry in /proc/self/cgroup")
}

/// cgroup counters are plain integers, with `max` standing in for no limit.
fn parse_counter(raw: &str) -> Result<u64> {
    if raw == "max" {
        return Ok(u64::MAX);
    }
    raw.parse()
        .with_context(|| format!("invalid cgroup counter {raw:?}"))
}

/// Pull one key out of a flat-keyed cgroup file (`name value` per line).
/// Each call is a single bounded read of the whole file.
fn read_flat_keyed(path: &Path, key: &str) -> Result<u64> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("error reading {}", path.display()))?;
    for line in contents.trim().lines() {
        let Some((name, value)) = line.split_once(' ') else {
            continue;
        };
        if name == key {
            return parse_counter(value)
                .with_context(|| format!("error parsing {key} in {}", path.display()));
        }
    }
    bail!("{} has no {key} entry", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn fake_cgroup(quota: &str, usage_usec: u64) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cpu.max"), quota).unwrap();
        fs::write(
            dir.path().join("cpu.stat"),
            format!("usage_usec {usage_usec}\nuser_usec 800\nsystem_usec 200\n"),
        )
        .unwrap();
        fs::write(dir.path().join("memory.stat"), "anon 4096\nfile 8192\n").unwrap();
        dir
    }

    #[test]
    fn test_cpu_percent_formula() {
        // 500 usec of usage across 2 cores over 500 usec of wall time
        assert_eq!(cpu_percent(500, 2.0, 500), 50.0);
    }

    #[test]
    fn test_parse_counter_max_is_unlimited() {
        assert_eq!(parse_counter("max").unwrap(), u64::MAX);
        assert_eq!(parse_counter("100000").unwrap(), 100_000);
        assert!(parse_counter("12ms").is_err());
    }

    #[test]
    fn test_read_flat_keyed() {
        let dir = fake_cgroup("max 100000", 1000);
        let stat = dir.path().join("cpu.stat");
        assert_eq!(read_flat_keyed(&stat, "usage_usec").unwrap(), 1000);
        assert_eq!(read_flat_keyed(&stat, "system_usec").unwrap(), 200);
        assert!(read_flat_keyed(&stat, "nr_throttled").is_err());
    }

    #[test]
    fn test_monitor_derives_allotted_cores() {
        let dir = fake_cgroup("200000 100000", 1000);
        let monitor = ResourceMonitor::with_cgroup(dir.path().to_path_buf()).unwrap();
        assert_eq!(monitor.allotted_cpus, 2.0);
        assert_eq!(monitor.last_cpu_usage_usec, 1000);
    }

    #[test]
    fn test_monitor_rejects_malformed_quota() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cpu.max"), "100000").unwrap();
        assert!(ResourceMonitor::with_cgroup(dir.path().to_path_buf()).is_err());
    }

    #[test]
    fn test_run_stops_cooperatively() {
        let dir = fake_cgroup("max 100000", 1000);
        let mut monitor = ResourceMonitor::with_cgroup(dir.path().to_path_buf()).unwrap();
        let stop = AtomicBool::new(true);
        monitor.run(&stop);
        assert!(monitor.samples.is_empty());
    }

    #[test]
    fn test_materialization_shape() {
        let dir = fake_cgroup("max 100000", 1000);
        let mut monitor = ResourceMonitor::with_cgroup(dir.path().to_path_buf()).unwrap();
        monitor.samples.push(Sample {
            ts: SystemTime::now(),
            cpu: 12.5,
            memory: 4096,
        });

        let events = monitor.into_events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].name, "process_name");
        assert_eq!(events[1].name, "thread_name");
        assert_eq!(events[0].args.name.as_deref(), Some("System resources"));
        let counter = &events[2];
        assert_eq!(counter.ph, Phase::Counter);
        assert_eq!(counter.cat, Category::Counter);
        assert_eq!(counter.args.cpu, Some(12.5));
        assert_eq!(counter.args.memory, Some(4096));
        assert!(counter.ts > 0);
    }
}
