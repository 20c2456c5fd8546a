// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! Continuous monitors.
//!
//! The only monitor today is the nice watch: some targets renice
//! themselves after startup, so when `proc.nice.watch` is set the session
//! re-asserts the configured nice for every tracked PID at a fixed period.
//! The session aborts the task when it ends.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::procs::ProcFs;

/// Re-assert `nice` on every tracked PID whose observed value drifted.
/// Loops until aborted.
pub async fn watch_nice(
    procs: ProcFs,
    tracked: Arc<Mutex<HashSet<u32>>>,
    nice: i32,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        let pids: Vec<u32> = tracked.lock().iter().copied().collect();
        for pid in pids {
            let Some(current) = procs.nice(pid).await else {
                continue; // exited; the session's own poll will drop it
            };
            if current == nice {
                continue;
            }
            tracing::info!("Nice of pid {pid} drifted to {current}, re-asserting {nice}");
            if let Err(e) = crate::appliers::set_nice(pid, nice) {
                tracing::warn!("Could not re-assert nice of pid {pid}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Current nice of a live process, via getpriority(2).
    fn real_nice(pid: u32) -> i32 {
        // SAFETY: plain syscall; -1 is also a valid return, but the test
        // values stay positive.
        unsafe { libc::getpriority(libc::PRIO_PROCESS as _, pid as libc::id_t) }
    }

    #[tokio::test]
    async fn test_drifted_nice_is_reasserted() {
        // A real child (raising nice needs no privilege) fronted by a fake
        // procfs entry that reports a drifted value.
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .unwrap();
        let pid = child.id();

        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join(pid.to_string());
        tokio::fs::create_dir_all(&proc_dir).await.unwrap();
        tokio::fs::write(
            proc_dir.join("stat"),
            format!("{pid} (sleep) S 1 0 0 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 0 0 0"),
        )
        .await
        .unwrap();

        let tracked = Arc::new(Mutex::new(HashSet::from([pid])));
        let task = tokio::spawn(watch_nice(
            ProcFs::with_root(dir.path()),
            Arc::clone(&tracked),
            5,
            Duration::from_millis(50),
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        task.abort();
        assert_eq!(real_nice(pid), 5);
        child.kill().ok();
        child.wait().ok();
    }
}
