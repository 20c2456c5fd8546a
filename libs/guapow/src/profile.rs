// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! Profile model: the declarative option set a request resolves to.
//!
//! A profile arrives either as a `*.profile` file (one option per line) or
//! as an inline option string (whitespace-separated tokens). Both forms are
//! `key` / `key=value` pairs that build the same typed
//! [`OptimizationProfile`]. Unknown keys warn and are skipped; later pairs
//! override earlier ones, which is also how the `profile-add` overlay works.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::settings::{config_dir_for, config_lines, parse_bool};

/// I/O scheduling class (`ionice -c`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoClass {
    Realtime,
    BestEffort,
    Idle,
}

impl IoClass {
    /// Numeric class as understood by `ionice -c`.
    pub fn ionice_class(self) -> u8 {
        match self {
            IoClass::Realtime => 1,
            IoClass::BestEffort => 2,
            IoClass::Idle => 3,
        }
    }
}

impl std::str::FromStr for IoClass {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "realtime" => Ok(IoClass::Realtime),
            "best_effort" => Ok(IoClass::BestEffort),
            "idle" => Ok(IoClass::Idle),
            _ => Err(()),
        }
    }
}

/// CPU scheduling policy (`chrt`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    Other,
    Idle,
    Batch,
    Fifo,
    Rr,
}

impl SchedPolicy {
    /// The `chrt` long flag selecting this policy.
    pub fn chrt_flag(self) -> &'static str {
        match self {
            SchedPolicy::Other => "--other",
            SchedPolicy::Idle => "--idle",
            SchedPolicy::Batch => "--batch",
            SchedPolicy::Fifo => "--fifo",
            SchedPolicy::Rr => "--rr",
        }
    }

    /// fifo/rr take a real-time priority; everything else requires 0.
    pub fn is_realtime(self) -> bool {
        matches!(self, SchedPolicy::Fifo | SchedPolicy::Rr)
    }
}

impl std::str::FromStr for SchedPolicy {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "other" => Ok(SchedPolicy::Other),
            "idle" => Ok(SchedPolicy::Idle),
            "batch" => Ok(SchedPolicy::Batch),
            "fifo" => Ok(SchedPolicy::Fifo),
            "rr" => Ok(SchedPolicy::Rr),
            _ => Err(()),
        }
    }
}

/// One `scripts.<phase>` block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptPhase {
    pub commands: Vec<String>,
    /// Serialize execution, waiting for each command.
    pub wait: bool,
    /// Per-command wait bound in seconds; only meaningful with `wait`.
    pub timeout: Option<f64>,
    /// Run as root (requires the daemon-level opt-in as well).
    pub run_as_root: bool,
}

impl ScriptPhase {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// A `stop.before` / `stop.after` block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopRule {
    pub names: Vec<String>,
    pub relaunch: bool,
}

/// One launcher mapping rule: requests targeting `exe` are redirected to a
/// descendant matching `target` (see the watcher for pattern syntax).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherRule {
    pub exe: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationProfile {
    pub nice: Option<i32>,
    pub nice_watch: bool,
    pub nice_delay: Option<f64>,
    pub io_class: Option<IoClass>,
    pub io_nice: Option<u8>,
    pub policy: Option<SchedPolicy>,
    pub policy_priority: Option<i32>,
    pub affinity: Vec<usize>,
    /// `K:V` sets, bare `K` unsets. Applied by the Runner before exec; the
    /// optimizer carries it only so profiles round-trip completely.
    pub env: Vec<(String, Option<String>)>,
    pub cpu_performance: bool,
    pub gpu_performance: bool,
    pub compositor_off: bool,
    pub mouse_hidden: bool,
    pub stop_before: StopRule,
    pub stop_after: StopRule,
    /// Runner-phase; never executed by the optimizer.
    pub scripts_before: ScriptPhase,
    pub scripts_after: ScriptPhase,
    pub scripts_finish: ScriptPhase,
    pub launchers: Vec<LauncherRule>,
    pub skip_launcher_mapping: bool,
    pub steam: bool,

    /// True once any recognized option was set.
    touched: bool,
}

impl OptimizationProfile {
    /// Parse an inline option string (whitespace-separated tokens).
    pub fn from_option_string(options: &str) -> Self {
        let mut profile = Self::default();
        profile.apply_pairs(options.split_whitespace().map(|tok| {
            match tok.split_once('=') {
                Some((k, v)) => (k, v),
                None => (tok, ""),
            }
        }));
        profile
    }

    /// Parse a `*.profile` file body.
    pub fn from_file_content(content: &str) -> Self {
        let mut profile = Self::default();
        profile.apply_pairs(config_lines(content));
        profile
    }

    /// Overlay another option string on top (the `profile-add` mechanism).
    pub fn overlay_option_string(&mut self, options: &str) {
        self.apply_pairs(options.split_whitespace().map(|tok| {
            match tok.split_once('=') {
                Some((k, v)) => (k, v),
                None => (tok, ""),
            }
        }));
    }

    /// True when no recognized option was set: the request resolves to a
    /// no-op plan.
    pub fn is_empty(&self) -> bool {
        !self.touched
    }

    fn apply_pairs<'a>(&mut self, pairs: impl Iterator<Item = (&'a str, &'a str)>) {
        for (key, value) in pairs {
            self.apply_pair(key, value);
        }
    }

    fn apply_pair(&mut self, key: &str, value: &str) {
        let touched_before = self.touched;
        self.touched = true;
        match key {
            "proc.nice" => match value.parse::<i32>() {
                Ok(n) if (-20..=19).contains(&n) => self.nice = Some(n),
                _ => tracing::warn!("proc.nice: '{value}' outside -20..19, ignoring"),
            },
            "proc.nice.watch" => self.nice_watch = parse_bool(key, value),
            "proc.nice.delay" => match value.parse::<f64>() {
                Ok(d) if d >= 0.0 && d.is_finite() => self.nice_delay = Some(d),
                _ => tracing::warn!("proc.nice.delay: invalid '{value}', ignoring"),
            },
            "proc.io.class" => match value.parse::<IoClass>() {
                Ok(c) => self.io_class = Some(c),
                Err(()) => tracing::warn!("proc.io.class: unknown class '{value}', ignoring"),
            },
            "proc.io.nice" => match value.parse::<u8>() {
                Ok(n) if n <= 7 => self.io_nice = Some(n),
                _ => tracing::warn!("proc.io.nice: '{value}' outside 0..7, ignoring"),
            },
            "proc.policy" => match value.parse::<SchedPolicy>() {
                Ok(p) => self.policy = Some(p),
                Err(()) => tracing::warn!("proc.policy: unknown policy '{value}', ignoring"),
            },
            "proc.policy.priority" => match value.parse::<i32>() {
                Ok(p) => self.policy_priority = Some(p),
                Err(_) => tracing::warn!("proc.policy.priority: invalid '{value}', ignoring"),
            },
            "proc.affinity" => {
                self.affinity = value
                    .split(',')
                    .filter_map(|s| {
                        let s = s.trim();
                        if s.is_empty() {
                            return None;
                        }
                        match s.parse::<usize>() {
                            Ok(cpu) => Some(cpu),
                            Err(_) => {
                                tracing::warn!("proc.affinity: ignoring invalid index '{s}'");
                                None
                            }
                        }
                    })
                    .collect();
            }
            "proc.env" => {
                self.env = list_values(value)
                    .map(|entry| match entry.split_once(':') {
                        Some((k, v)) => (k.to_string(), Some(v.to_string())),
                        None => (entry.to_string(), None),
                    })
                    .collect();
            }
            "cpu.performance" => self.cpu_performance = parse_bool(key, value),
            "gpu.performance" => self.gpu_performance = parse_bool(key, value),
            "compositor.off" => self.compositor_off = parse_bool(key, value),
            "mouse.hidden" => self.mouse_hidden = parse_bool(key, value),
            "stop.before" => {
                self.stop_before.names = list_values(value).map(str::to_string).collect();
            }
            "stop.before.relaunch" => self.stop_before.relaunch = parse_bool(key, value),
            "stop.after" => {
                self.stop_after.names = list_values(value).map(str::to_string).collect();
            }
            "stop.after.relaunch" => self.stop_after.relaunch = parse_bool(key, value),
            "scripts.before" => {
                self.scripts_before.commands = list_values(value).map(str::to_string).collect();
            }
            "scripts.before.wait" => self.scripts_before.wait = parse_bool(key, value),
            "scripts.before.timeout" => {
                self.scripts_before.timeout = parse_timeout(key, value);
            }
            "scripts.before.root" => self.scripts_before.run_as_root = parse_bool(key, value),
            "scripts.after" => {
                self.scripts_after.commands = list_values(value).map(str::to_string).collect();
            }
            "scripts.after.wait" => self.scripts_after.wait = parse_bool(key, value),
            "scripts.after.timeout" => {
                self.scripts_after.timeout = parse_timeout(key, value);
            }
            "scripts.after.root" => self.scripts_after.run_as_root = parse_bool(key, value),
            "scripts.finish" => {
                self.scripts_finish.commands = list_values(value).map(str::to_string).collect();
            }
            "scripts.finish.wait" => self.scripts_finish.wait = parse_bool(key, value),
            "scripts.finish.timeout" => {
                self.scripts_finish.timeout = parse_timeout(key, value);
            }
            "scripts.finish.root" => self.scripts_finish.run_as_root = parse_bool(key, value),
            "launcher" => {
                self.launchers = list_values(value)
                    .filter_map(|entry| match entry.split_once(':') {
                        Some((exe, target)) if !exe.is_empty() && !target.is_empty() => {
                            Some(LauncherRule {
                                exe: exe.to_string(),
                                target: target.to_string(),
                            })
                        }
                        _ => {
                            tracing::warn!("launcher: invalid rule '{entry}', expected exe:target");
                            None
                        }
                    })
                    .collect();
            }
            "launcher.skip_mapping" => self.skip_launcher_mapping = parse_bool(key, value),
            "steam" => self.steam = parse_bool(key, value),
            _ => {
                tracing::warn!("Unknown profile option '{key}', ignoring");
                self.touched = touched_before;
            }
        }
    }
}

fn list_values(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_timeout(key: &str, value: &str) -> Option<f64> {
    match value.parse::<f64>() {
        Ok(t) if t >= 0.0 && t.is_finite() => Some(t),
        _ => {
            tracing::warn!("'{key}': invalid timeout '{value}', ignoring");
            None
        }
    }
}

/// Loads profiles from disk with the user-over-system precedence and the
/// optional never-evicting cache.
pub struct ProfileResolver {
    cache: Option<Mutex<HashMap<(String, String), Arc<OptimizationProfile>>>>,
}

impl ProfileResolver {
    pub fn new(cache_enabled: bool) -> Self {
        Self {
            cache: cache_enabled.then(|| Mutex::new(HashMap::new())),
        }
    }

    /// Resolve `<name>.profile` for `user`: user config dir first, then
    /// `/etc/guapow`, then the same search for `default.profile`. A total
    /// miss resolves to the empty profile.
    pub async fn resolve(&self, user: &str, name: &str) -> Result<Arc<OptimizationProfile>> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().get(&(user.to_string(), name.to_string())) {
                tracing::debug!("Profile '{name}' for {user} served from cache");
                return Ok(Arc::clone(hit));
            }
        }

        let profile = match self.read_first(user, name).await {
            Some(p) => p,
            None if name != "default" => {
                tracing::warn!("Profile '{name}' not found for {user}, trying default");
                self.read_first(user, "default").await.unwrap_or_default()
            }
            None => {
                tracing::warn!("No profile '{name}' and no default, empty plan");
                OptimizationProfile::default()
            }
        };

        let profile = Arc::new(profile);
        if let Some(cache) = &self.cache {
            let _ = cache
                .lock()
                .insert((user.to_string(), name.to_string()), Arc::clone(&profile));
        }
        Ok(profile)
    }

    async fn read_first(&self, user: &str, name: &str) -> Option<OptimizationProfile> {
        for path in candidate_paths(user, name) {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    tracing::info!("Profile loaded from {}", path.display());
                    return Some(OptimizationProfile::from_file_content(&content));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("Could not read {}: {e}", path.display());
                }
            }
        }
        None
    }

    /// Eagerly load every `*.profile` visible to `user` into the cache.
    /// No-op unless caching is enabled.
    pub async fn pre_cache(&self, user: &str) {
        if self.cache.is_none() {
            return;
        }
        for dir in [config_dir_for(user), Some(PathBuf::from("/etc/guapow"))]
            .into_iter()
            .flatten()
        {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if path.extension().and_then(|e| e.to_str()) == Some("profile") {
                    let _ = self.resolve(user, stem).await;
                }
            }
        }
    }
}

fn candidate_paths(user: &str, name: &str) -> Vec<PathBuf> {
    let file = format!("{name}.profile");
    let mut paths = Vec::with_capacity(3);
    if let Ok(dir) = std::env::var("GUAPOW_CONFIG") {
        if !dir.trim().is_empty() {
            paths.push(PathBuf::from(dir).join(&file));
        }
    }
    if let Some(dir) = config_dir_for(user) {
        paths.push(dir.join(&file));
    }
    paths.push(PathBuf::from("/etc/guapow").join(&file));
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_options() {
        let p = OptimizationProfile::from_option_string(
            "proc.nice=-5 proc.nice.watch cpu.performance=1 proc.io.class=idle proc.io.nice=6",
        );
        assert_eq!(p.nice, Some(-5));
        assert!(p.nice_watch);
        assert!(p.cpu_performance);
        assert_eq!(p.io_class, Some(IoClass::Idle));
        assert_eq!(p.io_nice, Some(6));
        assert!(!p.is_empty());
    }

    #[test]
    fn test_profile_file_with_comments() {
        let p = OptimizationProfile::from_file_content(
            "# gaming profile\n\
             gpu.performance\n\
             compositor.off=true\n\
             proc.affinity=0, 2,4\n\
             \n\
             stop.after=discord,telegram\n\
             stop.after.relaunch\n",
        );
        assert!(p.gpu_performance);
        assert!(p.compositor_off);
        assert_eq!(p.affinity, vec![0, 2, 4]);
        assert_eq!(p.stop_after.names, vec!["discord", "telegram"]);
        assert!(p.stop_after.relaunch);
    }

    #[test]
    fn test_unknown_key_keeps_profile_empty() {
        let p = OptimizationProfile::from_option_string("definitely.not.an.option=1");
        assert!(p.is_empty());
    }

    #[test]
    fn test_out_of_range_values_ignored() {
        let p = OptimizationProfile::from_option_string("proc.nice=-40 proc.io.nice=9");
        assert_eq!(p.nice, None);
        assert_eq!(p.io_nice, None);
    }

    #[test]
    fn test_overlay_overrides() {
        let mut p = OptimizationProfile::from_option_string("proc.nice=-5 mouse.hidden");
        p.overlay_option_string("proc.nice=-10 steam");
        assert_eq!(p.nice, Some(-10));
        assert!(p.mouse_hidden);
        assert!(p.steam);
    }

    #[test]
    fn test_launcher_rules() {
        let p = OptimizationProfile::from_option_string("launcher=Launcher.exe:game*,bad");
        assert_eq!(
            p.launchers,
            vec![LauncherRule {
                exe: "Launcher.exe".into(),
                target: "game*".into()
            }]
        );
    }

    #[test]
    fn test_env_entries() {
        let p = OptimizationProfile::from_option_string("proc.env=WINEDEBUG:-all,DXVK_HUD");
        assert_eq!(
            p.env,
            vec![
                ("WINEDEBUG".into(), Some("-all".into())),
                ("DXVK_HUD".into(), None)
            ]
        );
    }

    #[test]
    fn test_script_phases() {
        let p = OptimizationProfile::from_option_string(
            "scripts.after=/bin/a,/bin/b scripts.after.wait scripts.after.timeout=2.5",
        );
        assert_eq!(p.scripts_after.commands, vec!["/bin/a", "/bin/b"]);
        assert!(p.scripts_after.wait);
        assert_eq!(p.scripts_after.timeout, Some(2.5));
        assert!(p.scripts_finish.is_empty());
    }

    #[test]
    fn test_policy_parsing() {
        let p = OptimizationProfile::from_option_string("proc.policy=fifo proc.policy.priority=42");
        assert_eq!(p.policy, Some(SchedPolicy::Fifo));
        assert_eq!(p.policy_priority, Some(42));
        assert!(p.policy.unwrap().is_realtime());
    }
}
