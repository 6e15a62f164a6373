//! Device capability probing and backend selection.

use sysinfo::System;
use tracing::{debug, warn};

use crate::engine::Backend;

/// Inputs resolved by the caller before detection (CLI flags, env, config).
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionPrefs {
    /// Hard override forcing the CPU engine.
    pub force_cpu: bool,
    /// Persisted user preference.
    pub preferred: Option<Backend>,
}

/// Decide which engine family to use.
///
/// Decision order, first match wins: explicit CPU override, persisted CPU
/// preference, hardware probe granting acceleration, CPU fallback. Never
/// fails: any probe error resolves to the CPU backend.
pub async fn detect_backend(prefs: DetectionPrefs) -> Backend {
    if prefs.force_cpu {
        debug!("CPU engine forced by override");
        return Backend::Cpu;
    }
    if prefs.preferred == Some(Backend::Cpu) {
        debug!("CPU engine selected by persisted preference");
        return Backend::Cpu;
    }

    match tokio::task::spawn_blocking(SystemProbe::detect).await {
        Ok(probe) if probe.has_gpu() => Backend::Accelerated,
        Ok(_) => Backend::Cpu,
        Err(e) => {
            warn!(error = %e, "capability probe failed, falling back to CPU");
            Backend::Cpu
        },
    }
}

/// System information for backend and model selection.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    /// Total system RAM in bytes.
    pub total_ram_bytes: u64,
    /// Available (free) RAM in bytes.
    pub available_ram_bytes: u64,
    /// Whether Metal GPU acceleration is compiled in and applicable (macOS).
    pub has_metal: bool,
    /// Whether CUDA GPU acceleration is compiled in (NVIDIA).
    pub has_cuda: bool,
    /// Whether running on Apple Silicon.
    pub is_apple_silicon: bool,
}

impl SystemProbe {
    /// Probe the current device.
    pub fn detect() -> Self {
        let sys = System::new_all();

        let (total_ram_bytes, available_ram_bytes) = {
            let total = sys.total_memory();
            let available = sys.available_memory();
            if total > 0 {
                (total, available)
            } else if let Some((fallback_total, fallback_available)) = read_proc_meminfo() {
                (fallback_total, fallback_available)
            } else {
                (total, available)
            }
        };

        let has_metal = cfg!(target_os = "macos") && cfg!(feature = "runtime-llama-metal");
        let has_cuda = cfg!(feature = "runtime-llama-cuda");
        let is_apple_silicon = cfg!(target_os = "macos") && cfg!(target_arch = "aarch64");

        Self {
            total_ram_bytes,
            available_ram_bytes,
            has_metal,
            has_cuda,
            is_apple_silicon,
        }
    }

    /// Total RAM in gigabytes.
    #[must_use]
    pub fn total_ram_gb(&self) -> u32 {
        (self.total_ram_bytes / (1024 * 1024 * 1024)) as u32
    }

    /// Available RAM in gigabytes.
    #[must_use]
    pub fn available_ram_gb(&self) -> u32 {
        (self.available_ram_bytes / (1024 * 1024 * 1024)) as u32
    }

    /// Memory tier for model suggestions.
    #[must_use]
    pub fn memory_tier(&self) -> MemoryTier {
        let gb = self.total_ram_gb();
        if gb >= 32 {
            MemoryTier::Large
        } else if gb >= 16 {
            MemoryTier::Medium
        } else if gb >= 8 {
            MemoryTier::Small
        } else {
            MemoryTier::Tiny
        }
    }

    /// Whether GPU acceleration is available.
    #[must_use]
    pub fn has_gpu(&self) -> bool {
        self.has_metal || self.has_cuda
    }
}

/// Memory tier for model recommendations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTier {
    /// 4GB or less — only very small models
    Tiny,
    /// 8GB — small 1-3B models
    Small,
    /// 16GB — medium 7B models
    Medium,
    /// 32GB+ — anything in the registry
    Large,
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryTier::Tiny => write!(f, "tiny (4GB)"),
            MemoryTier::Small => write!(f, "small (8GB)"),
            MemoryTier::Medium => write!(f, "medium (16GB)"),
            MemoryTier::Large => write!(f, "large (32GB+)"),
        }
    }
}

/// Parse `/proc/meminfo` as a fallback when `sysinfo` returns 0 (common in
/// containers with restrictive cgroup settings).
fn read_proc_meminfo() -> Option<(u64, u64)> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb: Option<u64> = None;
    let mut available_kb: Option<u64> = None;

    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = parse_meminfo_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = parse_meminfo_kb(rest);
        }
        if total_kb.is_some() && available_kb.is_some() {
            break;
        }
    }

    let total = total_kb? * 1024;
    let available = available_kb.unwrap_or(0) * 1024;
    Some((total, available))
}

/// Parse a `/proc/meminfo` value line like `"   16384 kB"` into kilobytes.
fn parse_meminfo_kb(value: &str) -> Option<u64> {
    value.split_whitespace().next()?.parse::<u64>().ok()
}
