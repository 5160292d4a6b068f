// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Memory-limit detection and cheap process memory sampling.
//!
//! The control lab needs two things from this crate: a one-time detection of
//! "how much memory am I allowed to use" (tried against several sources, most
//! authoritative first) and a per-tick, allocation-free read of "how much am I
//! using right now".

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Values at or above this are treated as "no limit" sentinels rather than real
/// limits. Cgroup v1 reports a huge number (close to `i64::MAX`, rounded down to
/// a page boundary) when no limit is configured; `2^60` is comfortably below that
/// and comfortably above any limit a real deployment would configure.
const UNLIMITED_SENTINEL_BYTES: u64 = 1 << 60;

const CGROUP_V2_PATH: &str = "/sys/fs/cgroup/memory.max";
const CGROUP_V1_PATH: &str = "/sys/fs/cgroup/memory/memory.limit_in_bytes";
const MEMORY_LIMIT_ENV_VAR: &str = "MEMORY_LIMIT_BYTES";

/// Where a detected memory limit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSource {
    /// A runtime-provided soft limit (unused in this implementation; see
    /// [`detect_memory_limit`] docs).
    Runtime,
    /// Linux cgroup v2 `memory.max`.
    CgroupV2,
    /// Linux cgroup v1 `memory.limit_in_bytes`.
    CgroupV1,
    /// The `MEMORY_LIMIT_BYTES` environment variable.
    EnvVar,
    /// No source yielded a usable limit.
    None,
}

impl LimitSource {
    /// A short description suitable for logs and flight-recorder dumps.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            LimitSource::Runtime => "runtime",
            LimitSource::CgroupV2 => "cgroup_v2",
            LimitSource::CgroupV1 => "cgroup_v1",
            LimitSource::EnvVar => "env",
            LimitSource::None => "none",
        }
    }
}

/// The outcome of a memory-limit detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedLimit {
    /// The detected limit in bytes, or `0` if none was found.
    pub bytes: u64,
    /// Which source produced `bytes`.
    pub source: LimitSource,
    /// Whether a usable limit was found at all.
    pub ok: bool,
}

fn accept(value: u64) -> Option<u64> {
    if value > 0 && value < UNLIMITED_SENTINEL_BYTES {
        Some(value)
    } else {
        None
    }
}

/// Rust has no equivalent of a managed-runtime memory soft-limit API (the
/// original source's first detection source). This is a deliberate no-op: it
/// always falls through to the cgroup/env sources below. Kept as a distinct
/// step so an allocator-specific stats hook (jemalloc/mimalloc) can be wired in
/// here later without changing the detection order or the public contract.
fn runtime_soft_limit() -> Option<u64> {
    None
}

fn read_cgroup_v2(path: &Path) -> Option<u64> {
    let contents = fs::read_to_string(path).ok()?;
    let trimmed = contents.trim();
    if trimmed == "max" {
        return None;
    }
    trimmed.parse::<u64>().ok()
}

fn read_cgroup_v1(path: &Path) -> Option<u64> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse::<u64>().ok()
}

/// Detects the process's memory limit, consulting (in order): a runtime soft
/// limit, cgroup v2, cgroup v1, and the `MEMORY_LIMIT_BYTES` environment
/// variable. Returns the first source that yields a positive, non-sentinel
/// value.
#[must_use]
pub fn detect_memory_limit() -> DetectedLimit {
    let env_value = std::env::var(MEMORY_LIMIT_ENV_VAR).ok();
    detect_memory_limit_from(
        Path::new(CGROUP_V2_PATH),
        Path::new(CGROUP_V1_PATH),
        env_value.as_deref(),
    )
}

/// Same as [`detect_memory_limit`] but with injectable sources, for testing
/// without touching the real filesystem or process environment.
#[must_use]
pub fn detect_memory_limit_from(
    cgroup_v2_path: &Path,
    cgroup_v1_path: &Path,
    env_value: Option<&str>,
) -> DetectedLimit {
    if let Some(bytes) = runtime_soft_limit().and_then(accept) {
        return DetectedLimit {
            bytes,
            source: LimitSource::Runtime,
            ok: true,
        };
    }
    if let Some(bytes) = read_cgroup_v2(cgroup_v2_path).and_then(accept) {
        debug!(bytes, "detected memory limit from cgroup v2");
        return DetectedLimit {
            bytes,
            source: LimitSource::CgroupV2,
            ok: true,
        };
    }
    if let Some(bytes) = read_cgroup_v1(cgroup_v1_path).and_then(accept) {
        debug!(bytes, "detected memory limit from cgroup v1");
        return DetectedLimit {
            bytes,
            source: LimitSource::CgroupV1,
            ok: true,
        };
    }
    if let Some(bytes) = env_value.and_then(|s| s.trim().parse::<u64>().ok()).and_then(accept) {
        debug!(bytes, "detected memory limit from environment override");
        return DetectedLimit {
            bytes,
            source: LimitSource::EnvVar,
            ok: true,
        };
    }
    DetectedLimit {
        bytes: 0,
        source: LimitSource::None,
        ok: false,
    }
}

/// A snapshot of process memory usage, sampled at a single instant.
///
/// Rust has no managed heap or GC, so `heap_alloc_bytes` / `heap_sys_bytes` are
/// populated from resident-set and virtual-size readings respectively (the
/// cheapest available proxy for "memory this process is holding"), and
/// `gc_cycles` is always `0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryStats {
    /// Resident memory, standing in for "heap allocated" in the original model.
    pub heap_alloc_bytes: u64,
    /// Virtual memory size, standing in for "heap reserved from the OS".
    pub heap_sys_bytes: u64,
    /// Always `0`; Rust has no tracked GC cycles. Kept for shape-compatibility.
    pub gc_cycles: u64,
    /// The limit this sample was measured against (`0` if none detected).
    pub limit_bytes: u64,
    /// `heap_alloc_bytes / limit_bytes`, or `0.0` when `limit_bytes == 0`.
    pub usage_pct: f64,
}

/// Reads current process memory usage as cheaply as the platform allows.
///
/// On Linux this is a single read of `/proc/self/statm`-equivalent data via the
/// `memory-stats` crate; it performs no locking and no more than a small fixed
/// allocation, so it is safe to call on every control-lab tick.
#[must_use]
pub fn read_memory_stats_fast(limit_bytes: u64) -> MemoryStats {
    let sample = memory_stats::memory_stats();
    let (heap_alloc_bytes, heap_sys_bytes) = match sample {
        Some(stats) => (stats.physical_mem as u64, stats.virtual_mem as u64),
        None => (0, 0),
    };
    let usage_pct = if limit_bytes > 0 {
        heap_alloc_bytes as f64 / limit_bytes as f64
    } else {
        0.0
    };
    MemoryStats {
        heap_alloc_bytes,
        heap_sys_bytes,
        gc_cycles: 0,
        limit_bytes,
        usage_pct,
    }
}
