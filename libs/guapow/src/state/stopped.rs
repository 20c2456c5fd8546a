// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! Stopped companion processes, reference-counted by process name.
//!
//! `stop.after` names are stopped by the optimizer itself, capturing each
//! victim's command line and owner first. Processes the Runner already
//! stopped client-side arrive pre-captured in the request. Either way a
//! name is relaunched only when the last session demanding it stopped has
//! finished, and only if some holder asked for relaunch and the process
//! has not come back on its own.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::error::Result;
use crate::procs::ProcFs;
use crate::request::StoppedProcess;
use crate::state::SessionId;

/// What it takes to bring one process back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaunchRecord {
    pub name: String,
    pub command: Option<String>,
    pub uid: Option<u32>,
}

#[derive(Debug, Default)]
struct StopEntry {
    holders: HashSet<SessionId>,
    relaunch: bool,
    records: Vec<RelaunchRecord>,
}

pub struct StoppedProcessManager {
    procs: ProcFs,
    inner: tokio::sync::Mutex<HashMap<String, StopEntry>>,
}

impl StoppedProcessManager {
    pub fn new(procs: ProcFs) -> Self {
        Self {
            procs,
            inner: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Stop every live process named in `names` (capture first, then
    /// SIGKILL) and add `session` as a holder of each name.
    pub async fn stop(&self, session: SessionId, names: &[String], relaunch: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for name in names {
            let entry = inner.entry(name.clone()).or_default();
            entry.relaunch |= relaunch;
            if entry.holders.is_empty() && entry.records.is_empty() {
                for proc in self.procs.find_by_comm(name).await {
                    let record = RelaunchRecord {
                        name: name.clone(),
                        command: self.procs.cmdline(proc.pid).await,
                        uid: self.procs.uid(proc.pid).await,
                    };
                    match kill(Pid::from_raw(proc.pid as i32), Signal::SIGKILL) {
                        Ok(()) => tracing::info!("Stopped {name} (pid {})", proc.pid),
                        Err(e) => {
                            tracing::warn!("Could not stop {name} (pid {}): {e}", proc.pid);
                        }
                    }
                    entry.records.push(record);
                }
                if entry.records.is_empty() {
                    tracing::info!("No live process named {name} to stop");
                }
            }
            let _ = entry.holders.insert(session);
        }
        Ok(())
    }

    /// Account for processes the Runner stopped before the target started.
    /// They join the same per-name ledger so concurrent sessions keep them
    /// down until the last one finishes.
    pub async fn register_prestopped(
        &self,
        session: SessionId,
        stopped: &[StoppedProcess],
        relaunch: bool,
    ) {
        let mut inner = self.inner.lock().await;
        for process in stopped {
            let entry = inner.entry(process.name.clone()).or_default();
            entry.relaunch |= relaunch;
            if !entry.records.iter().any(|r| r.command == process.command) {
                entry.records.push(RelaunchRecord {
                    name: process.name.clone(),
                    command: process.command.clone(),
                    uid: None,
                });
            }
            let _ = entry.holders.insert(session);
        }
    }

    /// Drop `session` from every name it holds; relaunch the names whose
    /// holder set drained. Returns the relaunched names.
    pub async fn release(&self, session: SessionId) -> Vec<String> {
        let mut drained = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            inner.retain(|name, entry| {
                if !entry.holders.remove(&session) {
                    return true;
                }
                if entry.holders.is_empty() {
                    drained.push((name.clone(), entry.relaunch, std::mem::take(&mut entry.records)));
                    return false;
                }
                true
            });
        }

        let mut relaunched = Vec::new();
        for (name, relaunch, records) in drained {
            if !relaunch {
                continue;
            }
            if !self.procs.find_by_comm(&name).await.is_empty() {
                tracing::info!("{name} already running again, not relaunching");
                continue;
            }
            for record in records {
                if self.relaunch(&record).await {
                    relaunched.push(record.name.clone());
                }
            }
        }
        relaunched
    }

    async fn relaunch(&self, record: &RelaunchRecord) -> bool {
        let Some(command) = &record.command else {
            tracing::warn!("No command captured for {}, cannot relaunch", record.name);
            return false;
        };
        let mut cmd = match record.uid {
            // spawn as the original owner when the daemon has the power to
            Some(uid) if crate::settings::is_root() && uid != 0 => {
                match crate::users::name_of(uid) {
                    Some(user) => {
                        let mut cmd = tokio::process::Command::new("runuser");
                        let _ = cmd.args(["-u", &user, "--", "sh", "-c", command]);
                        cmd
                    }
                    None => {
                        tracing::warn!("Unknown uid {uid} for {}, relaunching as self", record.name);
                        shell_command(command)
                    }
                }
            }
            _ => shell_command(command),
        };
        match cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                tracing::info!("Relaunched {} (pid {:?})", record.name, child.id());
                true
            }
            Err(e) => {
                tracing::error!("Could not relaunch {}: {e}", record.name);
                false
            }
        }
    }
}

fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    let _ = cmd.arg("-c").arg(command);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fake_proc(dir: &std::path::Path, pid: u32, comm: &str, cmdline: &str) {
        let proc_dir = dir.join(pid.to_string());
        tokio::fs::create_dir_all(&proc_dir).await.unwrap();
        tokio::fs::write(proc_dir.join("comm"), format!("{comm}\n"))
            .await
            .unwrap();
        tokio::fs::write(
            proc_dir.join("stat"),
            format!("{pid} ({comm}) S 1 0 0 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 0 0 0"),
        )
        .await
        .unwrap();
        let raw: Vec<u8> = cmdline
            .split(' ')
            .flat_map(|a| a.bytes().chain(std::iter::once(0)))
            .collect();
        tokio::fs::write(proc_dir.join("cmdline"), raw).await.unwrap();
        tokio::fs::write(proc_dir.join("status"), "Name:\tx\nUid:\t1000\t1000\t1000\t1000\n")
            .await
            .unwrap();
    }

    // Fake pids are far outside anything alive, so the SIGKILL attempts
    // fail harmlessly; the captured records are what matters here.

    #[tokio::test]
    async fn test_capture_and_refcounted_relaunch() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 4009999, "discord", "true").await;

        let manager = StoppedProcessManager::new(ProcFs::with_root(dir.path()));
        manager
            .stop(1, &["discord".to_string()], true)
            .await
            .unwrap();
        manager
            .stop(2, &["discord".to_string()], true)
            .await
            .unwrap();

        // remove the fake entry so the relaunch check sees it gone
        tokio::fs::remove_dir_all(dir.path().join("4009999"))
            .await
            .unwrap();

        // first release: another session still demands it stopped
        assert!(manager.release(1).await.is_empty());
        // last release: relaunch (`true` exits immediately and harmlessly)
        assert_eq!(manager.release(2).await, vec!["discord"]);
    }

    #[tokio::test]
    async fn test_no_relaunch_when_not_requested() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 4009998, "telegram", "true").await;

        let manager = StoppedProcessManager::new(ProcFs::with_root(dir.path()));
        manager
            .stop(1, &["telegram".to_string()], false)
            .await
            .unwrap();
        tokio::fs::remove_dir_all(dir.path().join("4009998"))
            .await
            .unwrap();
        assert!(manager.release(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_no_relaunch_when_process_returned() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 4009997, "spotify", "true").await;

        let manager = StoppedProcessManager::new(ProcFs::with_root(dir.path()));
        manager
            .stop(1, &["spotify".to_string()], true)
            .await
            .unwrap();
        // still "running" in the fake table at release time
        assert!(manager.release(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_prestopped_records_relaunch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StoppedProcessManager::new(ProcFs::with_root(dir.path()));
        manager
            .register_prestopped(
                7,
                &[StoppedProcess {
                    name: "slack".into(),
                    command: Some("true".into()),
                }],
                true,
            )
            .await;
        assert_eq!(manager.release(7).await, vec!["slack"]);
    }
}
