// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! Optimization request: the decrypted wire body.
//!
//! The body is line-oriented: one `key=value` (or bare `key`) token per
//! line, so values may themselves contain spaces (the inline option string
//! does). `request.pid` and `request.user` are mandatory; repeated
//! `request.stopped` lines accumulate.

use crate::error::{OptError, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationRequest {
    /// Target process, already running (spawned by the Runner or matched by
    /// the Watcher).
    pub pid: u32,
    /// Requesting user name; cross-checked against the socket owner.
    pub user: String,
    /// Profile name to resolve from disk.
    pub profile: Option<String>,
    /// Inline option string; wins over `profile` when present.
    pub config: Option<String>,
    /// Option string overlaid on the resolved profile.
    pub profile_add: Option<String>,
    /// Client-side creation time, unix seconds.
    pub created_at: Option<f64>,
    /// Client-generated correlation id.
    pub request_id: Option<String>,
    /// Processes the Runner stopped client-side, as `name[:command]`; the
    /// optimizer relaunches them at finish when `stop.before.relaunch`.
    pub stopped: Vec<StoppedProcess>,
}

/// A process stopped before the target launched, eligible for relaunch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedProcess {
    pub name: String,
    /// Original command line, when the Runner captured one.
    pub command: Option<String>,
}

impl OptimizationRequest {
    /// Parse a decrypted request body.
    pub fn parse(body: &str) -> Result<Self> {
        let mut request = Self::default();
        let mut saw_pid = false;

        for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (line, ""),
            };
            match key {
                "request.pid" => {
                    request.pid = value.parse().map_err(|_| {
                        OptError::MalformedRequest(format!("invalid request.pid '{value}'"))
                    })?;
                    saw_pid = true;
                }
                "request.user" => request.user = value.to_string(),
                "request.profile" => {
                    request.profile = (!value.is_empty()).then(|| value.to_string());
                }
                "request.config" => {
                    request.config = (!value.is_empty()).then(|| value.to_string());
                }
                "request.profile_add" => {
                    request.profile_add = (!value.is_empty()).then(|| value.to_string());
                }
                "request.created_at" => request.created_at = value.parse().ok(),
                "request.id" => {
                    request.request_id = (!value.is_empty()).then(|| value.to_string());
                }
                "request.stopped" => {
                    let (name, command) = match value.split_once(':') {
                        Some((n, c)) => (n.trim(), Some(c.trim().to_string())),
                        None => (value, None),
                    };
                    if !name.is_empty() {
                        request.stopped.push(StoppedProcess {
                            name: name.to_string(),
                            command: command.filter(|c| !c.is_empty()),
                        });
                    }
                }
                _ => tracing::warn!("Unknown request field '{key}', ignoring"),
            }
        }

        if !saw_pid || request.pid == 0 {
            return Err(OptError::MalformedRequest("missing request.pid".into()));
        }
        if request.user.is_empty() {
            return Err(OptError::MalformedRequest("missing request.user".into()));
        }
        if request.profile.is_none() && request.config.is_none() {
            return Err(OptError::MalformedRequest(
                "neither request.profile nor request.config present".into(),
            ));
        }
        Ok(request)
    }

    /// Serialize to the wire body (one token per line). The counterpart of
    /// [`OptimizationRequest::parse`]; used by clients and tests.
    pub fn to_body(&self) -> String {
        let mut lines = vec![
            format!("request.pid={}", self.pid),
            format!("request.user={}", self.user),
        ];
        if let Some(p) = &self.profile {
            lines.push(format!("request.profile={p}"));
        }
        if let Some(c) = &self.config {
            lines.push(format!("request.config={c}"));
        }
        if let Some(a) = &self.profile_add {
            lines.push(format!("request.profile_add={a}"));
        }
        if let Some(t) = self.created_at {
            lines.push(format!("request.created_at={t}"));
        }
        if let Some(id) = &self.request_id {
            lines.push(format!("request.id={id}"));
        }
        for s in &self.stopped {
            match &s.command {
                Some(cmd) => lines.push(format!("request.stopped={}:{cmd}", s.name)),
                None => lines.push(format!("request.stopped={}", s.name)),
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let r = OptimizationRequest::parse(
            "request.pid=1234\nrequest.user=alice\nrequest.profile=game",
        )
        .unwrap();
        assert_eq!(r.pid, 1234);
        assert_eq!(r.user, "alice");
        assert_eq!(r.profile.as_deref(), Some("game"));
    }

    #[test]
    fn test_inline_config_keeps_spaces() {
        let r = OptimizationRequest::parse(
            "request.pid=9\nrequest.user=bob\nrequest.config=proc.nice=-4 mouse.hidden",
        )
        .unwrap();
        assert_eq!(r.config.as_deref(), Some("proc.nice=-4 mouse.hidden"));
    }

    #[test]
    fn test_missing_pid_rejected() {
        assert!(OptimizationRequest::parse("request.user=alice\nrequest.profile=x").is_err());
    }

    #[test]
    fn test_missing_plan_source_rejected() {
        assert!(OptimizationRequest::parse("request.pid=5\nrequest.user=alice").is_err());
    }

    #[test]
    fn test_stopped_accumulates() {
        let r = OptimizationRequest::parse(
            "request.pid=7\nrequest.user=u\nrequest.profile=p\n\
             request.stopped=discord:/usr/bin/discord --flag\n\
             request.stopped=telegram",
        )
        .unwrap();
        assert_eq!(r.stopped.len(), 2);
        assert_eq!(r.stopped[0].name, "discord");
        assert_eq!(
            r.stopped[0].command.as_deref(),
            Some("/usr/bin/discord --flag")
        );
        assert_eq!(r.stopped[1].command, None);
    }

    #[test]
    fn test_round_trip() {
        let r = OptimizationRequest {
            pid: 42,
            user: "carol".into(),
            profile: Some("media".into()),
            profile_add: Some("steam".into()),
            created_at: Some(1700000000.5),
            request_id: Some("req-1".into()),
            ..Default::default()
        };
        // profile-only requests are valid; config stays None
        let parsed = OptimizationRequest::parse(&r.to_body()).unwrap();
        assert_eq!(parsed, r);
    }
}
