// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! CPU frequency-governor and Intel energy-bias manager.
//!
//! First acquire captures every CPU's current governor and writes
//! `performance`; where `power/energy_perf_bias` exists the bias is
//! captured and driven to `0`. Last release restores the captured values
//! per CPU. A restore failure is logged and left best-effort; the next
//! first-acquire re-captures whatever the system then reports.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{OptError, Result};
use crate::state::{RefCounted, SessionId};

const PERFORMANCE_GOVERNOR: &str = "performance";
const PERFORMANCE_EPB: &str = "0";

/// Captured per-CPU originals.
#[derive(Debug, Default, PartialEq)]
struct CpuOriginals {
    governors: HashMap<usize, String>,
    energy_perf_bias: HashMap<usize, String>,
}

pub struct CpuPerformanceManager {
    counted: RefCounted<CpuOriginals>,
    sys_cpu_root: PathBuf,
}

impl Default for CpuPerformanceManager {
    fn default() -> Self {
        Self::with_sys_cpu_root("/sys/devices/system/cpu")
    }
}

impl CpuPerformanceManager {
    pub fn with_sys_cpu_root(root: impl Into<PathBuf>) -> Self {
        Self {
            counted: RefCounted::new("cpu"),
            sys_cpu_root: root.into(),
        }
    }

    pub async fn acquire(&self, session: SessionId) -> Result<()> {
        let root = self.sys_cpu_root.clone();
        self.counted
            .acquire(session, || async move { capture_and_alter(&root).await })
            .await
    }

    pub async fn release(&self, session: SessionId) {
        let root = self.sys_cpu_root.clone();
        self.counted
            .release(session, |originals| async move {
                restore(&root, originals).await;
            })
            .await;
    }
}

/// Enumerate `cpu<N>` directories under the sysfs cpu root.
async fn cpu_indices(root: &Path) -> Vec<usize> {
    let mut indices = Vec::new();
    let Ok(mut dir) = tokio::fs::read_dir(root).await else {
        return indices;
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        if let Some(name) = entry.file_name().to_str() {
            if let Some(rest) = name.strip_prefix("cpu") {
                if let Ok(index) = rest.parse::<usize>() {
                    indices.push(index);
                }
            }
        }
    }
    indices.sort_unstable();
    indices
}

async fn capture_and_alter(root: &Path) -> Result<CpuOriginals> {
    let mut originals = CpuOriginals::default();
    for cpu in cpu_indices(root).await {
        let governor_path = governor_path(root, cpu);
        match tokio::fs::read_to_string(&governor_path).await {
            Ok(current) => {
                let current = current.trim().to_string();
                if let Err(e) = tokio::fs::write(&governor_path, PERFORMANCE_GOVERNOR).await {
                    tracing::error!("Could not set governor of cpu{cpu}: {e}");
                    continue;
                }
                tracing::info!("Governor of cpu{cpu}: {current} -> {PERFORMANCE_GOVERNOR}");
                let _ = originals.governors.insert(cpu, current);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Could not read governor of cpu{cpu}: {e}"),
        }

        let epb_path = epb_path(root, cpu);
        match tokio::fs::read_to_string(&epb_path).await {
            Ok(current) => {
                let current = current.trim().to_string();
                if let Err(e) = tokio::fs::write(&epb_path, PERFORMANCE_EPB).await {
                    tracing::error!("Could not set energy_perf_bias of cpu{cpu}: {e}");
                    continue;
                }
                tracing::info!("energy_perf_bias of cpu{cpu}: {current} -> {PERFORMANCE_EPB}");
                let _ = originals.energy_perf_bias.insert(cpu, current);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Could not read energy_perf_bias of cpu{cpu}: {e}"),
        }
    }

    if originals.governors.is_empty() && originals.energy_perf_bias.is_empty() {
        return Err(OptError::System(
            "no writable cpufreq governor found".into(),
        ));
    }
    Ok(originals)
}

async fn restore(root: &Path, originals: CpuOriginals) {
    for (cpu, governor) in originals.governors {
        let path = governor_path(root, cpu);
        match tokio::fs::write(&path, &governor).await {
            Ok(()) => tracing::info!("Governor of cpu{cpu} restored to {governor}"),
            Err(e) => tracing::error!("Could not restore governor of cpu{cpu}: {e}"),
        }
    }
    for (cpu, bias) in originals.energy_perf_bias {
        let path = epb_path(root, cpu);
        match tokio::fs::write(&path, &bias).await {
            Ok(()) => tracing::info!("energy_perf_bias of cpu{cpu} restored to {bias}"),
            Err(e) => tracing::error!("Could not restore energy_perf_bias of cpu{cpu}: {e}"),
        }
    }
}

fn governor_path(root: &Path, cpu: usize) -> PathBuf {
    root.join(format!("cpu{cpu}")).join("cpufreq").join("scaling_governor")
}

fn epb_path(root: &Path, cpu: usize) -> PathBuf {
    root.join(format!("cpu{cpu}")).join("power").join("energy_perf_bias")
}
