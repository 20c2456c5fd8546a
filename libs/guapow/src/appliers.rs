// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! Per-process appliers: nice, I/O class, scheduling policy, CPU affinity.
//!
//! Each applier is idempotent per (pid, attribute) and is re-run verbatim
//! for every PID the watcher discovers. Failures are logged and never abort
//! the rest of the plan. Nice goes through `setpriority(2)` directly; the
//! others shell out to the util-linux tools.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{OptError, Result};
use crate::profile::{IoClass, OptimizationProfile, SchedPolicy};

#[derive(Debug, Clone)]
pub struct ProcessAppliers {
    /// Root of the cpu sysfs tree, injectable for tests.
    sys_cpu_root: PathBuf,
}

impl Default for ProcessAppliers {
    fn default() -> Self {
        Self {
            sys_cpu_root: PathBuf::from("/sys/devices/system/cpu"),
        }
    }
}

impl ProcessAppliers {
    pub fn with_sys_cpu_root(root: impl Into<PathBuf>) -> Self {
        Self {
            sys_cpu_root: root.into(),
        }
    }

    /// Run every requested applier against `pid`. Individual failures are
    /// logged and swallowed.
    pub async fn apply_all(&self, pid: u32, profile: &OptimizationProfile, user_is_root: bool) {
        tokio::join!(
            self.apply_nice(pid, profile),
            self.apply_io(pid, profile, user_is_root),
            self.apply_policy(pid, profile),
            self.apply_affinity(pid, profile),
        );
    }

    async fn apply_nice(&self, pid: u32, profile: &OptimizationProfile) {
        let Some(nice) = profile.nice else { return };
        if let Some(delay) = profile.nice_delay {
            if delay > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }
        match set_nice(pid, nice) {
            Ok(()) => tracing::info!("Nice of pid {pid} set to {nice}"),
            Err(e) => tracing::warn!("Could not set nice of pid {pid} to {nice}: {e}"),
        }
    }

    async fn apply_io(&self, pid: u32, profile: &OptimizationProfile, user_is_root: bool) {
        let Some(class) = profile.io_class else { return };
        match ionice_args(class, profile.io_nice, pid, user_is_root) {
            Some(args) => {
                if let Err(e) = run_tool("ionice", &args).await {
                    tracing::warn!("ionice failed for pid {pid}: {e}");
                }
            }
            None => {
                tracing::warn!(
                    "proc.io.class=realtime requires a root requester, skipping for pid {pid}"
                );
            }
        }
    }

    async fn apply_policy(&self, pid: u32, profile: &OptimizationProfile) {
        let Some(policy) = profile.policy else { return };
        match chrt_args(policy, profile.policy_priority, pid) {
            Ok(args) => {
                if let Err(e) = run_tool("chrt", &args).await {
                    tracing::warn!("chrt failed for pid {pid}: {e}");
                }
            }
            Err(e) => tracing::warn!("Scheduling policy not applied to pid {pid}: {e}"),
        }
    }

    async fn apply_affinity(&self, pid: u32, profile: &OptimizationProfile) {
        if profile.affinity.is_empty() {
            return;
        }
        let online = self.online_cpus().await;
        let Some(args) = taskset_args(&profile.affinity, online, pid) else {
            tracing::warn!(
                "proc.affinity for pid {pid}: no requested CPU is online, nothing to pin"
            );
            return;
        };
        if let Err(e) = run_tool("taskset", &args).await {
            tracing::warn!("taskset failed for pid {pid}: {e}");
        }
    }

    /// Number of online CPUs, from the sysfs `online` range list. Falls
    /// back to "everything requested is valid" when unreadable.
    async fn online_cpus(&self) -> Option<usize> {
        let content = tokio::fs::read_to_string(self.sys_cpu_root.join("online"))
            .await
            .ok()?;
        parse_cpu_ranges(content.trim()).map(|cpus| cpus.into_iter().max().map_or(0, |m| m + 1))
    }
}

/// `setpriority(2)` on a single process.
pub(crate) fn set_nice(pid: u32, nice: i32) -> std::io::Result<()> {
    // SAFETY: plain syscall, no pointers involved.
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, pid as libc::id_t, nice) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Arguments for `ionice`, or `None` when realtime is requested without
/// root.
fn ionice_args(
    class: IoClass,
    level: Option<u8>,
    pid: u32,
    user_is_root: bool,
) -> Option<Vec<String>> {
    if class == IoClass::Realtime && !user_is_root {
        return None;
    }
    let mut args = vec!["-c".into(), class.ionice_class().to_string()];
    // idle ignores the priority level
    if class != IoClass::Idle {
        if let Some(level) = level {
            args.push("-n".into());
            args.push(level.to_string());
        }
    }
    args.push("-p".into());
    args.push(pid.to_string());
    Some(args)
}

/// Arguments for `chrt`. fifo/rr demand a priority in 1..=99; the other
/// policies force priority 0 and ignore any configured one.
fn chrt_args(policy: SchedPolicy, priority: Option<i32>, pid: u32) -> Result<Vec<String>> {
    let priority = if policy.is_realtime() {
        match priority {
            Some(p) if (1..=99).contains(&p) => p,
            Some(p) => {
                return Err(OptError::Configuration(format!(
                    "priority {p} outside 1..99 for a real-time policy"
                )));
            }
            None => {
                return Err(OptError::Configuration(
                    "fifo/rr require proc.policy.priority".into(),
                ));
            }
        }
    } else {
        if priority.is_some_and(|p| p != 0) {
            tracing::debug!("proc.policy.priority ignored for a non-realtime policy");
        }
        0
    };
    Ok(vec![
        policy.chrt_flag().to_string(),
        "-p".into(),
        priority.to_string(),
        pid.to_string(),
    ])
}

/// Arguments for `taskset`, with the requested CPUs filtered against the
/// online count. `None` when nothing survives the filter.
fn taskset_args(requested: &[usize], online: Option<usize>, pid: u32) -> Option<Vec<String>> {
    let valid: Vec<usize> = match online {
        Some(count) => {
            let (valid, dropped): (Vec<usize>, Vec<usize>) =
                requested.iter().copied().partition(|&cpu| cpu < count);
            if !dropped.is_empty() {
                tracing::warn!("proc.affinity: dropping offline CPU indices {dropped:?}");
            }
            valid
        }
        None => requested.to_vec(),
    };
    if valid.is_empty() {
        return None;
    }
    let list = valid
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(",");
    Some(vec!["-pc".into(), list, pid.to_string()])
}

/// Parse a sysfs cpu range list like `0-3,5,7-8`.
fn parse_cpu_ranges(spec: &str) -> Option<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().ok()?;
                let hi: usize = hi.trim().parse().ok()?;
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().ok()?),
        }
    }
    Some(cpus)
}

/// Run an external tool, logging stderr on a non-zero exit.
pub(crate) async fn run_tool(tool: &str, args: &[String]) -> Result<()> {
    let _ = tool_output_env(tool, args, &[]).await?;
    Ok(())
}

/// Run an external tool with extra environment and return its stdout.
pub(crate) async fn tool_output_env(
    tool: &str,
    args: &[String],
    envs: &[(&str, &str)],
) -> Result<String> {
    let mut cmd = tokio::process::Command::new(tool);
    let _ = cmd.args(args);
    for (key, value) in envs {
        let _ = cmd.env(key, value);
    }
    let output = cmd
        .output()
        .await
        .map_err(|e| OptError::System(format!("could not launch {tool}: {e}")))?;
    if output.status.success() {
        tracing::debug!("{tool} {} succeeded", args.join(" "));
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(OptError::System(format!(
            "{tool} {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ionice_args() {
        assert_eq!(
            ionice_args(IoClass::BestEffort, Some(3), 42, false).unwrap(),
            vec!["-c", "2", "-n", "3", "-p", "42"]
        );
        // idle drops the level
        assert_eq!(
            ionice_args(IoClass::Idle, Some(3), 42, false).unwrap(),
            vec!["-c", "3", "-p", "42"]
        );
    }

    #[test]
    fn test_ionice_realtime_requires_root() {
        assert!(ionice_args(IoClass::Realtime, Some(0), 1, false).is_none());
        assert!(ionice_args(IoClass::Realtime, Some(0), 1, true).is_some());
    }

    #[test]
    fn test_chrt_realtime_priority_bounds() {
        assert!(chrt_args(SchedPolicy::Fifo, Some(0), 1).is_err());
        assert!(chrt_args(SchedPolicy::Fifo, Some(100), 1).is_err());
        assert!(chrt_args(SchedPolicy::Rr, None, 1).is_err());
        assert_eq!(
            chrt_args(SchedPolicy::Fifo, Some(50), 7).unwrap(),
            vec!["--fifo", "-p", "50", "7"]
        );
    }

    #[test]
    fn test_chrt_non_realtime_ignores_priority() {
        assert_eq!(
            chrt_args(SchedPolicy::Batch, Some(42), 7).unwrap(),
            vec!["--batch", "-p", "0", "7"]
        );
    }

    #[test]
    fn test_taskset_filters_offline() {
        assert_eq!(
            taskset_args(&[0, 2, 9], Some(4), 5).unwrap(),
            vec!["-pc", "0,2", "5"]
        );
        assert!(taskset_args(&[9, 10], Some(4), 5).is_none());
    }

    #[test]
    fn test_cpu_range_parsing() {
        assert_eq!(parse_cpu_ranges("0-3").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_ranges("0-1,4,6-7").unwrap(), vec![0, 1, 4, 6, 7]);
        assert_eq!(parse_cpu_ranges("2").unwrap(), vec![2]);
        assert!(parse_cpu_ranges("x").is_none());
    }
}
