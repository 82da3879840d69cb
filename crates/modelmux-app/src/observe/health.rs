//! System health snapshot and background provider probing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use sysinfo::{Disks, System};

use crate::config::ProviderConfig;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct ProbeResult {
    pub reachable: bool,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub uptime_secs: u64,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub providers: Vec<(String, Option<ProbeResult>)>,
}

pub struct HealthMonitor {
    started: Instant,
    system: Mutex<System>,
    probes: DashMap<String, ProbeResult>,
    provider_ids: Vec<String>,
}

impl HealthMonitor {
    pub fn new(providers: &[ProviderConfig]) -> Self {
        Self {
            started: Instant::now(),
            system: Mutex::new(System::new()),
            probes: DashMap::new(),
            provider_ids: providers.iter().map(|p| p.id.clone()).collect(),
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let (cpu_percent, memory_percent) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();
            let cpu = system.global_cpu_usage();
            let total = system.total_memory().max(1);
            let memory = (system.used_memory() as f32 / total as f32) * 100.0;
            (cpu, memory)
        };

        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks.iter().fold((0u64, 0u64), |(t, a), disk| {
            (t + disk.total_space(), a + disk.available_space())
        });
        let disk_percent = if total == 0 {
            0.0
        } else {
            ((total - available) as f32 / total as f32) * 100.0
        };

        let providers = self
            .provider_ids
            .iter()
            .map(|id| (id.clone(), self.probes.get(id).map(|p| *p)))
            .collect();

        HealthSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            cpu_percent,
            memory_percent,
            disk_percent,
            providers,
        }
    }

    fn record_probe(&self, provider: &str, reachable: bool) {
        self.probes.insert(
            provider.to_string(),
            ProbeResult {
                reachable,
                at: Instant::now(),
            },
        );
    }
}

/// Background reachability probe per provider base URL.
pub fn spawn_prober(monitor: Arc<HealthMonitor>, providers: Vec<ProviderConfig>) {
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(error) => {
            tracing::warn!(%error, "provider prober disabled");
            return;
        }
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            for provider in &providers {
                let reachable = match client.get(provider.base_url.clone()).send().await {
                    Ok(response) => !response.status().is_server_error(),
                    Err(_) => false,
                };
                monitor.record_probe(&provider.id, reachable);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_bounded_percentages() {
        let monitor = HealthMonitor::new(&[]);
        let snapshot = monitor.snapshot();
        assert!(snapshot.memory_percent >= 0.0 && snapshot.memory_percent <= 100.0);
        assert!(snapshot.disk_percent >= 0.0 && snapshot.disk_percent <= 100.0);
    }

    #[test]
    fn probe_results_surface_in_snapshot() {
        let providers = vec![ProviderConfig {
            id: "ollama".to_string(),
            base_url: "http://localhost:11434".parse().unwrap(),
            api_key_env: None,
            adapter: crate::upstream::adapter::AdapterKind::Ollama,
            models: Vec::new(),
        }];
        let monitor = HealthMonitor::new(&providers);
        monitor.record_probe("ollama", true);

        let snapshot = monitor.snapshot();
        let (id, probe) = &snapshot.providers[0];
        assert_eq!(id, "ollama");
        assert!(probe.unwrap().reachable);
    }
}
