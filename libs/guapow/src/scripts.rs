// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! Phase script execution (`scripts.after`, `scripts.finish`).
//!
//! `wait=false` fire-and-forgets every command. `wait=true` serializes:
//! each command must finish before the next starts, bounded per command by
//! `timeout`. A command that outlives its timeout is left running; the
//! runner only stops waiting for it. Exit codes are logged and never fail
//! the session.

use std::process::Stdio;
use std::time::Duration;

use crate::profile::ScriptPhase;

#[derive(Debug, Clone)]
pub struct ScriptsRunner {
    /// Daemon-level `scripts.allow_root` opt-in.
    allow_root: bool,
    daemon_is_root: bool,
}

impl ScriptsRunner {
    pub fn new(allow_root: bool) -> Self {
        Self {
            allow_root,
            daemon_is_root: crate::settings::is_root(),
        }
    }

    #[cfg(test)]
    fn for_test() -> Self {
        Self {
            allow_root: false,
            daemon_is_root: false,
        }
    }

    /// Run one phase for the requesting `user`.
    pub async fn run_phase(&self, phase_name: &str, phase: &ScriptPhase, user: &str) {
        if phase.is_empty() {
            return;
        }

        let as_root = phase.run_as_root && self.allow_root && self.daemon_is_root;
        if phase.run_as_root && !as_root {
            tracing::warn!(
                "scripts.{phase_name}.root requested but not permitted, running as {user}"
            );
        }

        for command in &phase.commands {
            let mut child = match self.spawn(command, user, as_root) {
                Ok(child) => child,
                Err(e) => {
                    tracing::warn!("scripts.{phase_name}: could not start '{command}': {e}");
                    continue;
                }
            };
            tracing::info!("scripts.{phase_name}: started '{command}'");

            if !phase.wait {
                continue;
            }
            match phase.timeout {
                // timeout=0 means start-and-move-on even in wait mode
                Some(t) if t == 0.0 => continue,
                Some(t) => {
                    match tokio::time::timeout(Duration::from_secs_f64(t), child.wait()).await {
                        Ok(Ok(status)) => {
                            tracing::info!("scripts.{phase_name}: '{command}' exited with {status}");
                        }
                        Ok(Err(e)) => {
                            tracing::warn!("scripts.{phase_name}: wait on '{command}' failed: {e}");
                        }
                        Err(_) => {
                            tracing::warn!(
                                "scripts.{phase_name}: '{command}' still running after {t}s, not waiting any longer"
                            );
                        }
                    }
                }
                None => match child.wait().await {
                    Ok(status) => {
                        tracing::info!("scripts.{phase_name}: '{command}' exited with {status}");
                    }
                    Err(e) => {
                        tracing::warn!("scripts.{phase_name}: wait on '{command}' failed: {e}");
                    }
                },
            }
        }
    }

    fn spawn(
        &self,
        command: &str,
        user: &str,
        as_root: bool,
    ) -> std::io::Result<tokio::process::Child> {
        let mut cmd = if as_root || !self.daemon_is_root || user == "root" {
            // Either root execution was granted, or the daemon runs
            // unprivileged and can only spawn as itself anyway.
            let mut cmd = tokio::process::Command::new("sh");
            let _ = cmd.arg("-c").arg(command);
            cmd
        } else {
            let mut cmd = tokio::process::Command::new("runuser");
            let _ = cmd.args(["-u", user, "--", "sh", "-c", command]);
            cmd
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn phase(commands: &[&str], wait: bool, timeout: Option<f64>) -> ScriptPhase {
        ScriptPhase {
            commands: commands.iter().map(|s| s.to_string()).collect(),
            wait,
            timeout,
            run_as_root: false,
        }
    }

    #[tokio::test]
    async fn test_no_wait_returns_immediately() {
        let runner = ScriptsRunner::for_test();
        let start = Instant::now();
        runner
            .run_phase("after", &phase(&["sleep 5"], false, None), "nobody")
            .await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_serializes() {
        let runner = ScriptsRunner::for_test();
        let start = Instant::now();
        runner
            .run_phase("after", &phase(&["sleep 0.2", "sleep 0.2"], true, None), "nobody")
            .await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_timeout_unblocks_without_killing() {
        let runner = ScriptsRunner::for_test();
        let start = Instant::now();
        runner
            .run_phase("after", &phase(&["sleep 10", "true"], true, Some(0.2)), "nobody")
            .await;
        // the second command started well before the first would finish
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_zero_timeout_skips_waiting() {
        let runner = ScriptsRunner::for_test();
        let start = Instant::now();
        runner
            .run_phase("finish", &phase(&["sleep 10"], true, Some(0.0)), "nobody")
            .await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_failing_command_does_not_abort_phase() {
        let runner = ScriptsRunner::for_test();
        runner
            .run_phase("finish", &phase(&["false", "true"], true, None), "nobody")
            .await;
    }
}
