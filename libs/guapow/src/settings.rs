// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! Daemon settings (`opt.conf`).
//!
//! Loaded exactly once at startup and immutable afterwards. The file is
//! line-oriented `key=value` (or bare `key` for booleans), `#` starts a
//! comment. Unknown keys are warned about and ignored; a missing file means
//! all defaults.
//!
//! Search order: `$GUAPOW_CONFIG/opt.conf` when the environment variable is
//! set, else `/etc/guapow/opt.conf` when running as root, else
//! `~/.config/guapow/opt.conf`.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{OptError, Result};
use crate::state::gpu::GpuVendor;

/// Default request port (loopback only).
pub const DEFAULT_PORT: u16 = 5087;

/// Floor for the termination poll interval.
const MIN_FINISHED_CHECK_INTERVAL: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct Settings {
    /// TCP port the daemon binds on 127.0.0.1.
    pub port: u16,
    /// Pre-set compositor name; skips detection when non-empty.
    pub compositor: Option<String>,
    /// Daemon-level opt-in for `scripts.<phase>.root` profiles.
    pub scripts_allow_root: bool,
    /// Poll interval for target/children termination, seconds (min 0.5).
    pub check_finished_interval: f64,
    /// Absolute deadline for launcher mapping, seconds.
    pub launcher_mapping_timeout: f64,
    /// Deadline after the last launcher match, seconds.
    pub launcher_mapping_found_timeout: f64,
    /// Cache the GPU map instead of re-probing per request.
    pub gpu_cache: bool,
    /// Restrict driven GPUs to these logical ids (empty = all).
    pub gpu_ids: Vec<u32>,
    /// AMD only: skip cards with no connected display.
    pub gpu_only_connected: bool,
    /// Restrict probing to a single vendor.
    pub gpu_vendor: Option<GpuVendor>,
    /// Hold the CPU manager in performance for the daemon's lifetime.
    pub cpu_performance: bool,
    /// Users allowed to request optimizations (empty = everyone).
    pub allowed_users: Vec<String>,
    /// Require encrypted request bodies.
    pub encrypted_requests: bool,
    /// Memoize resolved profiles per (user, name).
    pub profile_cache: bool,
    /// Eagerly load every visible profile at startup (implies caching).
    pub profile_pre_caching: bool,
    /// Nice watch re-assertion period, seconds.
    pub nice_check_interval: f64,
    /// Absolute deadline for child discovery, seconds (0 disables).
    pub optimize_children_timeout: f64,
    /// Deadline after the last discovered child, seconds.
    pub optimize_children_found_timeout: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            compositor: None,
            scripts_allow_root: false,
            check_finished_interval: 3.0,
            launcher_mapping_timeout: 60.0,
            launcher_mapping_found_timeout: 10.0,
            gpu_cache: false,
            gpu_ids: Vec::new(),
            gpu_only_connected: true,
            gpu_vendor: None,
            cpu_performance: false,
            allowed_users: Vec::new(),
            encrypted_requests: true,
            profile_cache: false,
            profile_pre_caching: false,
            nice_check_interval: 5.0,
            optimize_children_timeout: 30.0,
            optimize_children_found_timeout: 10.0,
        }
    }
}

impl Settings {
    /// Resolve the configuration file path for the current process.
    pub fn config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("GUAPOW_CONFIG") {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir).join("opt.conf");
            }
        }
        if is_root() {
            PathBuf::from("/etc/guapow/opt.conf")
        } else {
            user_config_dir().join("opt.conf")
        }
    }

    /// Load settings from the default location. A missing file yields
    /// defaults; an unreadable file is an error.
    pub async fn load() -> Result<Self> {
        let path = Self::config_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                tracing::info!("Settings loaded from {}", path.display());
                Self::parse(&content)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    "No configuration at {}, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(OptError::Configuration(format!(
                "could not read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Parse the line-oriented configuration body.
    pub fn parse(content: &str) -> Result<Self> {
        let mut settings = Self::default();
        for (key, value) in config_lines(content) {
            match key {
                "port" => match value.parse::<u16>() {
                    Ok(p) => settings.port = p,
                    Err(_) => {
                        return Err(OptError::Configuration(format!("invalid port '{value}'")));
                    }
                },
                "compositor" => {
                    settings.compositor =
                        (!value.is_empty()).then(|| value.to_lowercase());
                }
                "scripts.allow_root" => settings.scripts_allow_root = parse_bool(key, value),
                "check.finished.interval" => {
                    let v = parse_seconds(key, value, settings.check_finished_interval);
                    if v < MIN_FINISHED_CHECK_INTERVAL {
                        tracing::warn!(
                            "check.finished.interval={v} below minimum, clamping to {MIN_FINISHED_CHECK_INTERVAL}"
                        );
                        settings.check_finished_interval = MIN_FINISHED_CHECK_INTERVAL;
                    } else {
                        settings.check_finished_interval = v;
                    }
                }
                "launcher.mapping.timeout" => {
                    settings.launcher_mapping_timeout =
                        parse_seconds(key, value, settings.launcher_mapping_timeout);
                }
                "launcher.mapping.found_timeout" => {
                    settings.launcher_mapping_found_timeout =
                        parse_seconds(key, value, settings.launcher_mapping_found_timeout);
                }
                "gpu.cache" => settings.gpu_cache = parse_bool(key, value),
                "gpu.id" => {
                    settings.gpu_ids = value
                        .split(',')
                        .filter_map(|s| {
                            let s = s.trim();
                            if s.is_empty() {
                                return None;
                            }
                            match s.parse::<u32>() {
                                Ok(id) => Some(id),
                                Err(_) => {
                                    tracing::warn!("gpu.id: ignoring invalid id '{s}'");
                                    None
                                }
                            }
                        })
                        .collect();
                }
                "gpu.only_connected" => settings.gpu_only_connected = parse_bool(key, value),
                "gpu.vendor" => {
                    settings.gpu_vendor = if value.is_empty() {
                        None
                    } else {
                        match value.parse::<GpuVendor>() {
                            Ok(v) => Some(v),
                            Err(_) => {
                                tracing::warn!("gpu.vendor: unknown vendor '{value}', ignoring");
                                None
                            }
                        }
                    };
                }
                "cpu.performance" => settings.cpu_performance = parse_bool(key, value),
                "request.allowed_users" => {
                    settings.allowed_users = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "request.encrypted" => settings.encrypted_requests = parse_bool(key, value),
                "profile.cache" => settings.profile_cache = parse_bool(key, value),
                "profile.pre_caching" => settings.profile_pre_caching = parse_bool(key, value),
                "nice.check.interval" => {
                    settings.nice_check_interval =
                        parse_seconds(key, value, settings.nice_check_interval);
                }
                "optimize_children.timeout" => {
                    settings.optimize_children_timeout =
                        parse_seconds(key, value, settings.optimize_children_timeout);
                }
                "optimize_children.found_timeout" => {
                    settings.optimize_children_found_timeout =
                        parse_seconds(key, value, settings.optimize_children_found_timeout);
                }
                _ => tracing::warn!("Unknown setting '{key}', ignoring"),
            }
        }
        Ok(settings)
    }

    pub fn check_finished_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_finished_interval)
    }

    pub fn nice_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.nice_check_interval)
    }

    pub fn is_user_allowed(&self, user: &str) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.iter().any(|u| u == user)
    }
}

/// Iterate `key=value` / bare-`key` pairs of a config body, skipping blanks
/// and `#` comments. Bare keys yield an empty value.
pub(crate) fn config_lines(content: &str) -> impl Iterator<Item = (&str, &str)> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|line| match line.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (line, ""),
        })
}

/// Boolean option semantics shared by settings and profiles: bare key or
/// empty value is true, `true`/`1` true, `false`/`0` false, anything else
/// warns and counts as false.
pub(crate) fn parse_bool(key: &str, value: &str) -> bool {
    match value {
        "" | "true" | "1" => true,
        "false" | "0" => false,
        other => {
            tracing::warn!("'{key}': invalid boolean '{other}', treating as false");
            false
        }
    }
}

fn parse_seconds(key: &str, value: &str, fallback: f64) -> f64 {
    match value.parse::<f64>() {
        Ok(v) if v >= 0.0 && v.is_finite() => v,
        _ => {
            tracing::warn!("'{key}': invalid number '{value}', keeping {fallback}");
            fallback
        }
    }
}

pub(crate) fn is_root() -> bool {
    // SAFETY: geteuid has no failure mode.
    unsafe { libc::geteuid() == 0 }
}

/// `~/.config/guapow` for the daemon's own user.
pub(crate) fn user_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("guapow")
}

/// `~<name>/.config/guapow` for an arbitrary user, resolved via passwd.
pub(crate) fn config_dir_for(user: &str) -> Option<PathBuf> {
    crate::users::home_dir(user).map(|home| home.join(".config").join("guapow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.port, 5087);
        assert!(s.encrypted_requests);
        assert!(s.gpu_only_connected);
        assert!(!s.scripts_allow_root);
        assert_eq!(s.check_finished_interval, 3.0);
        assert_eq!(s.optimize_children_timeout, 30.0);
        assert!(s.allowed_users.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let s = Settings::parse(
            "# daemon config\n\
             port=6000\n\
             compositor=KWin\n\
             scripts.allow_root=1\n\
             request.allowed_users=alice, bob\n\
             request.encrypted=false\n\
             gpu.id=0,1\n\
             gpu.vendor=nvidia\n\
             nice.check.interval=2.5\n",
        )
        .unwrap();
        assert_eq!(s.port, 6000);
        assert_eq!(s.compositor.as_deref(), Some("kwin"));
        assert!(s.scripts_allow_root);
        assert_eq!(s.allowed_users, vec!["alice", "bob"]);
        assert!(!s.encrypted_requests);
        assert_eq!(s.gpu_ids, vec![0, 1]);
        assert_eq!(s.gpu_vendor, Some(GpuVendor::Nvidia));
        assert_eq!(s.nice_check_interval, 2.5);
    }

    #[test]
    fn test_finished_interval_clamped() {
        let s = Settings::parse("check.finished.interval=0.1").unwrap();
        assert_eq!(s.check_finished_interval, 0.5);
    }

    #[test]
    fn test_bare_key_is_true() {
        let s = Settings::parse("cpu.performance").unwrap();
        assert!(s.cpu_performance);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let s = Settings::parse("no.such.key=1\nport=5100").unwrap();
        assert_eq!(s.port, 5100);
    }

    #[test]
    fn test_invalid_port_is_error() {
        assert!(Settings::parse("port=banana").is_err());
    }

    #[test]
    fn test_user_allowed() {
        let mut s = Settings::default();
        assert!(s.is_user_allowed("anyone"));
        s.allowed_users = vec!["alice".into()];
        assert!(s.is_user_allowed("alice"));
        assert!(!s.is_user_allowed("bob"));
    }
}
