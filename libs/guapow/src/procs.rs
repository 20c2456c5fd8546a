// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! Thin procfs adapters.
//!
//! All process inspection goes through [`ProcFs`], which is rooted at
//! `/proc` in production and at a temp tree in tests. Reads are best-effort:
//! a process that exits mid-scan simply yields `None`.

use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

/// One row of a full process-table scan.
#[derive(Debug, Clone)]
pub struct ProcEntry {
    pub pid: u32,
    pub ppid: u32,
    pub comm: String,
}

impl ProcFs {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn is_alive(&self, pid: u32) -> bool {
        tokio::fs::metadata(self.root.join(pid.to_string()))
            .await
            .is_ok()
    }

    /// Short process name from `/proc/<pid>/comm`.
    pub async fn comm(&self, pid: u32) -> Option<String> {
        let content = tokio::fs::read_to_string(self.root.join(pid.to_string()).join("comm"))
            .await
            .ok()?;
        Some(content.trim().to_string())
    }

    /// Full command line, NUL separators replaced with spaces.
    pub async fn cmdline(&self, pid: u32) -> Option<String> {
        let mut raw = tokio::fs::read(self.root.join(pid.to_string()).join("cmdline"))
            .await
            .ok()?;
        for b in &mut raw {
            if *b == 0 {
                *b = b' ';
            }
        }
        let trimmed = String::from_utf8_lossy(&raw).trim().to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    /// Parent pid from `/proc/<pid>/stat`.
    pub async fn ppid(&self, pid: u32) -> Option<u32> {
        let (_, after) = self.stat_fields(pid).await?;
        after.get(1)?.parse().ok()
    }

    /// Current nice value from `/proc/<pid>/stat` (field 19).
    pub async fn nice(&self, pid: u32) -> Option<i32> {
        let (_, after) = self.stat_fields(pid).await?;
        after.get(16)?.parse().ok()
    }

    /// Real uid of the process, from `/proc/<pid>/status`.
    pub async fn uid(&self, pid: u32) -> Option<u32> {
        let content = tokio::fs::read_to_string(self.root.join(pid.to_string()).join("status"))
            .await
            .ok()?;
        content
            .lines()
            .find(|l| l.starts_with("Uid:"))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    }

    /// Full process-table scan: pid, ppid and comm for every live process.
    pub async fn scan(&self) -> Vec<ProcEntry> {
        let mut entries = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(&self.root).await else {
            return entries;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            if let Some((comm, after)) = self.stat_fields(pid).await {
                if let Some(ppid) = after.get(1).and_then(|f| f.parse().ok()) {
                    entries.push(ProcEntry { pid, ppid, comm });
                }
            }
        }
        entries
    }

    /// Transitive descendants of `root_pid`, from a single table scan.
    pub async fn descendants(&self, root_pid: u32) -> Vec<ProcEntry> {
        let entries = self.scan().await;
        let mut by_parent: HashMap<u32, Vec<&ProcEntry>> = HashMap::new();
        for entry in &entries {
            by_parent.entry(entry.ppid).or_default().push(entry);
        }

        let mut found = Vec::new();
        let mut frontier = vec![root_pid];
        while let Some(parent) = frontier.pop() {
            if let Some(children) = by_parent.get(&parent) {
                for child in children {
                    frontier.push(child.pid);
                    found.push((*child).clone());
                }
            }
        }
        found
    }

    /// Live processes whose comm equals `name`.
    pub async fn find_by_comm(&self, name: &str) -> Vec<ProcEntry> {
        self.scan()
            .await
            .into_iter()
            .filter(|e| e.comm == name)
            .collect()
    }

    /// `(comm, fields-after-comm)` from `/proc/<pid>/stat`. The comm field
    /// is parenthesized and may itself contain spaces or parentheses, so
    /// everything up to the last `)` is the name.
    async fn stat_fields(&self, pid: u32) -> Option<(String, Vec<String>)> {
        let content = tokio::fs::read_to_string(self.root.join(pid.to_string()).join("stat"))
            .await
            .ok()?;
        let open = content.find('(')?;
        let close = content.rfind(')')?;
        let comm = content.get(open + 1..close)?.to_string();
        let after = content
            .get(close + 1..)?
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Some((comm, after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fake_proc(dir: &std::path::Path, pid: u32, ppid: u32, comm: &str, nice: i32) {
        let proc_dir = dir.join(pid.to_string());
        tokio::fs::create_dir_all(&proc_dir).await.unwrap();
        tokio::fs::write(proc_dir.join("comm"), format!("{comm}\n"))
            .await
            .unwrap();
        // state ppid pgrp session tty tpgid flags minflt cminflt majflt
        // cmajflt utime stime cutime cstime priority nice ...
        let stat = format!(
            "{pid} ({comm}) S {ppid} {pid} {pid} 0 -1 4194304 100 0 0 0 1 1 0 0 20 {nice} 1 0 100 0 0"
        );
        tokio::fs::write(proc_dir.join("stat"), stat).await.unwrap();
        tokio::fs::write(
            proc_dir.join("status"),
            format!("Name:\t{comm}\nUid:\t1000\t1000\t1000\t1000\n"),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stat_parsing_with_spaced_comm() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 100, 1, "Web Content", -4).await;
        let procs = ProcFs::with_root(dir.path());
        assert_eq!(procs.comm(100).await.as_deref(), Some("Web Content"));
        assert_eq!(procs.ppid(100).await, Some(1));
        assert_eq!(procs.nice(100).await, Some(-4));
        assert_eq!(procs.uid(100).await, Some(1000));
    }

    #[tokio::test]
    async fn test_descendants() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 10, 1, "root-proc", 0).await;
        fake_proc(dir.path(), 11, 10, "child-a", 0).await;
        fake_proc(dir.path(), 12, 11, "grandchild", 0).await;
        fake_proc(dir.path(), 20, 1, "unrelated", 0).await;

        let procs = ProcFs::with_root(dir.path());
        let mut pids: Vec<u32> = procs.descendants(10).await.iter().map(|e| e.pid).collect();
        pids.sort_unstable();
        assert_eq!(pids, vec![11, 12]);
    }

    #[tokio::test]
    async fn test_missing_process() {
        let dir = tempfile::tempdir().unwrap();
        let procs = ProcFs::with_root(dir.path());
        assert!(!procs.is_alive(999).await);
        assert_eq!(procs.comm(999).await, None);
        assert_eq!(procs.nice(999).await, None);
    }

    #[tokio::test]
    async fn test_find_by_comm() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 30, 1, "discord", 0).await;
        fake_proc(dir.path(), 31, 1, "discord", 0).await;
        fake_proc(dir.path(), 32, 1, "other", 0).await;
        let procs = ProcFs::with_root(dir.path());
        assert_eq!(procs.find_by_comm("discord").await.len(), 2);
    }
}
