//! Periodic host resource sampling.

use std::path::Path;
use std::time::Duration;

use sysinfo::{Disks, System};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::models::{DiskStats, MemoryStats, SystemStats};

fn percent(part: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        ((part as f64 / total as f64) * 100.0) as f32
    }
}

/// Take one sample. `system` must be reused between calls for CPU usage to be meaningful.
pub fn sample(system: &mut System) -> SystemStats {
    system.refresh_cpu_usage();
    system.refresh_memory();

    let total = system.total_memory();
    let available = system.available_memory();
    let memory = MemoryStats {
        total,
        available,
        percent: percent(total.saturating_sub(available), total),
    };

    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .or_else(|| disks.iter().next());
    let disk = match root {
        Some(d) => {
            let total = d.total_space();
            let free = d.available_space();
            DiskStats {
                total,
                free,
                percent: percent(total.saturating_sub(free), total),
            }
        }
        None => {
            tracing::debug!("no disks found when sampling telemetry");
            DiskStats::default()
        }
    };

    SystemStats {
        cpu_percent: system.global_cpu_usage().clamp(0.0, 100.0),
        memory,
        disk,
    }
}

/// Background sampler publishing the latest [`SystemStats`] on a watch channel.
pub struct TelemetrySampler {
    rx: watch::Receiver<SystemStats>,
    tx: watch::Sender<SystemStats>,
    interval: Duration,
}

impl TelemetrySampler {
    pub fn new(interval: Duration) -> Self {
        let (tx, rx) = watch::channel(SystemStats::default());
        Self { rx, tx, interval }
    }

    pub fn latest(&self) -> SystemStats {
        self.rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SystemStats> {
        self.rx.clone()
    }

    /// Spawn the sampling loop. Each refresh runs on the blocking pool; the
    /// loop ends when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let tx = self.tx.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            let mut system = System::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let handle = tokio::task::spawn_blocking(move || {
                    let stats = sample(&mut system);
                    (system, stats)
                });
                match handle.await {
                    Ok((returned, stats)) => {
                        system = returned;
                        tx.send_replace(stats);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "telemetry sample panicked");
                        system = System::new();
                    }
                }
            }
            tracing::debug!("telemetry sampler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
    }

    #[test]
    fn test_sample_ranges() {
        let mut system = System::new();
        let stats = sample(&mut system);
        assert!((0.0..=100.0).contains(&stats.cpu_percent));
        assert!((0.0..=100.0).contains(&stats.memory.percent));
        assert!((0.0..=100.0).contains(&stats.disk.percent));
        assert!(stats.memory.available <= stats.memory.total);
    }

    #[tokio::test]
    async fn test_sampler_publishes_and_stops() {
        let sampler = TelemetrySampler::new(Duration::from_millis(20));
        let mut rx = sampler.subscribe();
        let cancel = CancellationToken::new();
        let handle = sampler.start(cancel.clone());

        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("sample within timeout")
            .unwrap();
        assert!(sampler.latest().memory.total > 0);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sampler stops")
            .unwrap();
    }
}
