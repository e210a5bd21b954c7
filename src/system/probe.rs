//! Device information and capability probe
//!
//! The connection-establishment timeout depends on how quickly this host
//! can run its network stack. Rather than guessing from the CPU
//! architecture, a short hashing probe plus core and memory counts place
//! the host in one of three profiles.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::PeerSettings;

// ─────────────────────────────────────────────────────────────────
// Device Info
// ─────────────────────────────────────────────────────────────────

/// Device description sent with `hosting-status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub hostname: String,
    pub platform: String,
    pub arch: String,
    pub cpu_count: usize,
    pub total_memory_mb: u64,
}

impl DeviceInfo {
    pub fn collect() -> Self {
        Self {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_count: num_cpus::get(),
            total_memory_mb: total_memory_mb(),
        }
    }
}

fn total_memory_mb() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(content) = std::fs::read_to_string("/proc/meminfo") {
            let kb = content
                .lines()
                .find(|l| l.starts_with("MemTotal:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse::<u64>().ok());
            if let Some(kb) = kb {
                return kb / 1024;
            }
        }
    }

    // Unknown hosts are treated as mid-range
    4096
}

// ─────────────────────────────────────────────────────────────────
// Timeout Profile
// ─────────────────────────────────────────────────────────────────

/// Connection-establishment timeout class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutProfile {
    Fast,
    Standard,
    Constrained,
}

impl TimeoutProfile {
    pub fn connect_timeout(&self) -> Duration {
        match self {
            TimeoutProfile::Fast => Duration::from_secs(60),
            TimeoutProfile::Standard => Duration::from_secs(90),
            TimeoutProfile::Constrained => Duration::from_secs(120),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutProfile::Fast => "fast",
            TimeoutProfile::Standard => "standard",
            TimeoutProfile::Constrained => "constrained",
        }
    }

    /// Place a host in a profile from its measured capabilities
    pub fn classify(cpu_count: usize, total_memory_mb: u64, hashes_per_second: f64) -> Self {
        if cpu_count <= 2 || total_memory_mb < 2048 || hashes_per_second < 100_000.0 {
            TimeoutProfile::Constrained
        } else if cpu_count >= 8 && total_memory_mb >= 8192 && hashes_per_second >= 1_000_000.0 {
            TimeoutProfile::Fast
        } else {
            TimeoutProfile::Standard
        }
    }
}

impl std::fmt::Display for TimeoutProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────
// Probe
// ─────────────────────────────────────────────────────────────────

/// Outcome of the capability probe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub device: DeviceInfo,
    pub hashes_per_second: f64,
    pub profile: TimeoutProfile,
}

/// Hash 1KB blocks for roughly `budget` and report the rate
fn hash_rate(budget: Duration) -> f64 {
    let data = [0u8; 1024];
    let start = Instant::now();
    let mut count: u64 = 0;

    while start.elapsed() < budget {
        for _ in 0..256 {
            let mut hasher = Sha256::new();
            hasher.update(data);
            hasher.update(count.to_le_bytes());
            std::hint::black_box(hasher.finalize());
            count += 1;
        }
    }

    count as f64 / start.elapsed().as_secs_f64().max(f64::EPSILON)
}

/// Run the capability probe
///
/// Blocking; takes about `budget`. Call from `spawn_blocking` inside the
/// runtime.
pub fn run_probe(budget: Duration) -> ProbeResult {
    let device = DeviceInfo::collect();
    let hashes_per_second = hash_rate(budget);
    let profile = TimeoutProfile::classify(device.cpu_count, device.total_memory_mb, hashes_per_second);

    debug!(
        cpus = device.cpu_count,
        memory_mb = device.total_memory_mb,
        hashes_per_second = hashes_per_second as u64,
        "Capability probe finished"
    );

    ProbeResult {
        device,
        hashes_per_second,
        profile,
    }
}

/// Connection timeout: explicit configuration wins over the probe
pub fn resolve_connect_timeout(settings: &PeerSettings, probe: Option<&ProbeResult>) -> Duration {
    if let Some(secs) = settings.connect_timeout_secs {
        return Duration::from_secs(secs);
    }

    let profile = probe.map(|p| p.profile).unwrap_or(TimeoutProfile::Standard);
    info!(profile = %profile, "Selected connection timeout profile");
    profile.connect_timeout()
}
