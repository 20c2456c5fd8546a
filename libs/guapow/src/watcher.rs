// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! Process watcher: streams the PIDs a session should also optimize.
//!
//! Given a root PID the watcher polls procfs and emits descendants that
//! match the active modes: plain child tracking, launcher mapping
//! (redirect from a launcher executable to the process it eventually
//! spawns) and Steam game detection. Every PID is emitted at most once.
//!
//! Two wall-clock bounds limit the search: the absolute deadline from
//! session start, and the found deadline measured from the last match. A
//! found timeout of zero stops the search right after the first match.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;

use crate::procs::{ProcEntry, ProcFs};
use crate::profile::LauncherRule;
use crate::settings::config_dir_for;

/// Shortest poll period; the remaining deadline bounds it further.
const POLL_PERIOD: Duration = Duration::from_millis(500);

/// Steam game heuristics: the wrapper that execs the game, the install
/// path every Steam game runs from, and launcher helpers that must not be
/// mistaken for the game itself.
const STEAM_WRAPPER_COMM: &str = "reaper";
const STEAM_LIBRARY_MARKER: &str = "steamapps/common";
const STEAM_EXCLUDED_MARKERS: &[&str] = &["UbisoftGameLauncher", "upc.exe"];

/// What a launcher pattern matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Name,
    Command,
}

/// A compiled launcher target pattern.
#[derive(Debug, Clone)]
pub struct TargetPattern {
    pub kind: MatchKind,
    regex: Regex,
}

impl TargetPattern {
    /// Compile a pattern: `n%` forces a name match, `c%` a command match,
    /// a leading `/` implies command, anything else name. `*` is a glob.
    pub fn compile(pattern: &str) -> Option<Self> {
        let (kind, body) = if let Some(rest) = pattern.strip_prefix("n%") {
            (MatchKind::Name, rest)
        } else if let Some(rest) = pattern.strip_prefix("c%") {
            (MatchKind::Command, rest)
        } else if pattern.starts_with('/') {
            (MatchKind::Command, pattern)
        } else {
            (MatchKind::Name, pattern)
        };
        if body.is_empty() {
            return None;
        }
        let escaped = regex::escape(body).replace(r"\*", ".*");
        match Regex::new(&format!("(?i)^{escaped}$")) {
            Ok(regex) => Some(Self { kind, regex }),
            Err(e) => {
                tracing::warn!("Invalid launcher pattern '{pattern}': {e}");
                None
            }
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Discovery parameters derived from settings + resolved profile.
#[derive(Debug, Clone, Default)]
pub struct WatcherConfig {
    /// Merged launcher rules (per-request over global file).
    pub launcher_rules: Vec<LauncherRule>,
    pub skip_launcher_mapping: bool,
    pub steam: bool,
    /// `optimize_children.timeout`; 0 disables plain child tracking.
    pub children_timeout: f64,
    pub children_found_timeout: f64,
    /// `launcher.mapping.timeout`.
    pub mapping_timeout: f64,
    pub mapping_found_timeout: f64,
}

/// Overlay per-request launcher rules on the body of a global `launchers`
/// file (`exe=target` lines). A per-request rule masks every global entry
/// with the same exe.
pub fn merge_rules(per_request: &[LauncherRule], global: &str) -> Vec<LauncherRule> {
    let mut rules = per_request.to_vec();
    for (exe, target) in crate::settings::config_lines(global) {
        if target.is_empty() {
            tracing::warn!("launchers file: entry '{exe}' has no target, ignoring");
            continue;
        }
        if per_request.iter().any(|r| r.exe == exe) {
            continue; // masked
        }
        rules.push(LauncherRule {
            exe: exe.to_string(),
            target: target.to_string(),
        });
    }
    rules
}

#[derive(Debug, Clone)]
pub struct ProcessWatcher {
    procs: ProcFs,
}

impl ProcessWatcher {
    pub fn new(procs: ProcFs) -> Self {
        Self { procs }
    }

    /// Merge per-request launcher rules over the user's global `launchers`
    /// file. A per-request rule masks every global entry with the same exe.
    pub async fn merged_rules(per_request: &[LauncherRule], user: &str) -> Vec<LauncherRule> {
        let Some(path) = config_dir_for(user).map(|d| d.join("launchers")) else {
            return per_request.to_vec();
        };
        let global = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        merge_rules(per_request, &global)
    }

    /// Poll for matching descendants of `root_pid` until the deadlines
    /// expire, emitting each at most once. Returns the number of emitted
    /// PIDs.
    pub async fn discover(
        &self,
        root_pid: u32,
        config: &WatcherConfig,
        tx: UnboundedSender<ProcEntry>,
    ) -> usize {
        let root_comm = self.procs.comm(root_pid).await.unwrap_or_default();

        let children_mode = config.children_timeout > 0.0 || config.steam;
        let targets: Vec<TargetPattern> = if config.skip_launcher_mapping {
            Vec::new()
        } else {
            config
                .launcher_rules
                .iter()
                .filter(|rule| {
                    TargetPattern::compile(&rule.exe)
                        .is_some_and(|exe_pattern| exe_pattern.matches(&root_comm))
                })
                .filter_map(|rule| TargetPattern::compile(&rule.target))
                .collect()
        };
        let launcher_mode = !targets.is_empty();
        if !children_mode && !launcher_mode {
            return 0;
        }

        let mut absolute = 0.0f64;
        let mut found = 0.0f64;
        if children_mode {
            absolute = config.children_timeout.max(absolute);
            found = config.children_found_timeout.max(found);
        }
        if launcher_mode {
            absolute = config.mapping_timeout.max(absolute);
            found = config.mapping_found_timeout.max(found);
        }

        let start = Instant::now();
        let absolute_deadline = start + Duration::from_secs_f64(absolute);
        let mut last_match: Option<Instant> = None;
        let mut seen: HashSet<u32> = HashSet::new();
        let mut emitted = 0usize;

        loop {
            for entry in self.procs.descendants(root_pid).await {
                if seen.contains(&entry.pid) {
                    continue;
                }
                if self.matches(&entry, children_mode, config.steam, &targets).await {
                    let _ = seen.insert(entry.pid);
                    last_match = Some(Instant::now());
                    emitted += 1;
                    tracing::info!(
                        "Discovered pid {} ({}) under {root_pid}",
                        entry.pid,
                        entry.comm
                    );
                    if tx.send(entry).is_err() {
                        return emitted; // session is gone
                    }
                    if found == 0.0 {
                        return emitted;
                    }
                }
            }

            let now = Instant::now();
            if now >= absolute_deadline {
                break;
            }
            let mut wakeup = absolute_deadline;
            if let Some(matched_at) = last_match {
                let found_deadline = matched_at + Duration::from_secs_f64(found);
                if now >= found_deadline {
                    break;
                }
                wakeup = wakeup.min(found_deadline);
            }
            tokio::time::sleep(POLL_PERIOD.min(wakeup - now)).await;
        }
        tracing::debug!("Child discovery for pid {root_pid} finished with {emitted} matches");
        emitted
    }

    async fn matches(
        &self,
        entry: &ProcEntry,
        children_mode: bool,
        steam: bool,
        targets: &[TargetPattern],
    ) -> bool {
        if steam {
            if self.is_steam_game(entry).await {
                return true;
            }
            // In steam mode plain children are only interesting when child
            // tracking was asked for on its own; fall through.
        }
        if children_mode && !steam {
            return true;
        }
        if !targets.is_empty() {
            let needs_cmdline = targets.iter().any(|t| t.kind == MatchKind::Command);
            let cmdline = if needs_cmdline {
                self.procs.cmdline(entry.pid).await
            } else {
                None
            };
            for target in targets {
                let matched = match target.kind {
                    MatchKind::Name => target.matches(&entry.comm),
                    MatchKind::Command => {
                        cmdline.as_deref().is_some_and(|cmd| target.matches(cmd))
                    }
                };
                if matched {
                    return true;
                }
            }
        }
        false
    }

    /// Steam game detection: a descendant spawned by the `reaper` wrapper
    /// or running out of the Steam library, excluding Ubisoft launcher
    /// helpers. Emits the game, not the launcher.
    async fn is_steam_game(&self, entry: &ProcEntry) -> bool {
        let parent_comm = self.procs.comm(entry.ppid).await.unwrap_or_default();
        let cmdline = self.procs.cmdline(entry.pid).await.unwrap_or_default();
        if STEAM_EXCLUDED_MARKERS.iter().any(|m| cmdline.contains(m)) {
            return false;
        }
        parent_comm == STEAM_WRAPPER_COMM || cmdline.contains(STEAM_LIBRARY_MARKER)
    }
}
