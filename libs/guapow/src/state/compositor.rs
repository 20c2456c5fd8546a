// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! Window-compositor manager.
//!
//! The compositor family is detected once per daemon (via `inxi`, unless
//! pre-set in opt.conf) and disabled/re-enabled with family-specific
//! tooling: kwin and compiz over D-Bus, xfwm4 through `xfconf-query`,
//! marco through `gsettings`, picom/compton by SIGSTOP/SIGCONT of the
//! process, and the NVIDIA composition pipeline through a metamode
//! reassignment (X11 only; skipped headless). A compositor that is already
//! off stays off across the session.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::appliers::{run_tool, tool_output_env};
use crate::error::{OptError, Result};
use crate::procs::ProcFs;
use crate::state::{RefCounted, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositorFamily {
    Kwin,
    Xfwm4,
    Marco,
    /// picom and its compton ancestor.
    Picom,
    Compiz,
    /// The driver-level composition pipeline, not a standalone process.
    Nvidia,
}

impl CompositorFamily {
    /// Map a detected or pre-set compositor name.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_lowercase();
        if name.starts_with("kwin") {
            Some(CompositorFamily::Kwin)
        } else if name.starts_with("xfwm") {
            Some(CompositorFamily::Xfwm4)
        } else if name == "marco" {
            Some(CompositorFamily::Marco)
        } else if name == "picom" || name == "compton" {
            Some(CompositorFamily::Picom)
        } else if name == "compiz" {
            Some(CompositorFamily::Compiz)
        } else if name == "nvidia" {
            Some(CompositorFamily::Nvidia)
        } else {
            None
        }
    }
}

/// What re-enabling takes, captured at disable time. `None` state in the
/// manager means the compositor was already off and must stay off.
#[derive(Debug)]
enum ReenableAction {
    Kwin,
    Xfwm4,
    Marco,
    Picom { pid: u32 },
    Compiz,
    Nvidia { metamode: String },
    /// Found disabled; nothing to undo.
    Nothing,
}

pub struct CompositorManager {
    counted: RefCounted<ReenableAction>,
    preset: Option<String>,
    procs: ProcFs,
    detected: tokio::sync::Mutex<Option<Option<CompositorFamily>>>,
}

impl CompositorManager {
    pub fn new(preset: Option<String>, procs: ProcFs) -> Self {
        Self {
            counted: RefCounted::new("compositor"),
            preset,
            procs,
            detected: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn acquire(&self, session: SessionId) -> Result<()> {
        let Some(family) = self.family().await else {
            return Err(OptError::System("no compositor detected".into()));
        };
        let procs = self.procs.clone();
        self.counted
            .acquire(session, || async move { disable(family, &procs).await })
            .await
    }

    pub async fn release(&self, session: SessionId) {
        self.counted
            .release(session, |action| async move { reenable(action).await })
            .await;
    }

    /// Detected family, resolved once per daemon lifetime.
    async fn family(&self) -> Option<CompositorFamily> {
        let mut detected = self.detected.lock().await;
        if let Some(result) = *detected {
            return result;
        }
        let family = match &self.preset {
            Some(name) => {
                let family = CompositorFamily::from_name(name);
                if family.is_none() {
                    tracing::warn!("Pre-set compositor '{name}' is not supported");
                }
                family
            }
            None => detect_via_inxi().await,
        };
        match family {
            Some(f) => tracing::info!("Compositor detected: {f:?}"),
            None => tracing::warn!("No supported compositor detected"),
        }
        *detected = Some(family);
        family
    }
}

async fn detect_via_inxi() -> Option<CompositorFamily> {
    let args: Vec<String> = vec!["-Gxx".into(), "-y".into(), "1".into()];
    let output = match tool_output_env("inxi", &args, &[]).await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!("Compositor detection failed (inxi): {e}");
            return None;
        }
    };
    parse_inxi_compositor(&output).and_then(|name| CompositorFamily::from_name(&name))
}

fn parse_inxi_compositor(output: &str) -> Option<String> {
    let tokens: Vec<&str> = output.split_whitespace().collect();
    tokens
        .iter()
        .position(|t| *t == "compositor:")
        .and_then(|i| tokens.get(i + 1))
        .map(|s| s.to_string())
}

async fn disable(family: CompositorFamily, procs: &ProcFs) -> Result<ReenableAction> {
    match family {
        CompositorFamily::Kwin => {
            if !kwin_active().await {
                tracing::info!("kwin compositing already suspended");
                return Ok(ReenableAction::Nothing);
            }
            run_tool("qdbus", &kwin_args("suspend")).await?;
            tracing::info!("kwin compositing suspended");
            Ok(ReenableAction::Kwin)
        }
        CompositorFamily::Xfwm4 => {
            let enabled = tool_output_env("xfconf-query", &xfwm4_query_args(), &[])
                .await
                .is_ok_and(|out| out.trim() == "true");
            if !enabled {
                return Ok(ReenableAction::Nothing);
            }
            run_tool("xfconf-query", &xfwm4_set_args(false)).await?;
            tracing::info!("xfwm4 compositing disabled");
            Ok(ReenableAction::Xfwm4)
        }
        CompositorFamily::Marco => {
            let enabled = tool_output_env("gsettings", &marco_query_args(), &[])
                .await
                .is_ok_and(|out| out.trim() == "true");
            if !enabled {
                return Ok(ReenableAction::Nothing);
            }
            run_tool("gsettings", &marco_set_args(false)).await?;
            tracing::info!("marco compositing disabled");
            Ok(ReenableAction::Marco)
        }
        CompositorFamily::Picom => {
            let mut candidates = procs.find_by_comm("picom").await;
            if candidates.is_empty() {
                candidates = procs.find_by_comm("compton").await;
            }
            let Some(entry) = candidates.into_iter().next() else {
                tracing::info!("picom/compton not running, nothing to stop");
                return Ok(ReenableAction::Nothing);
            };
            kill(Pid::from_raw(entry.pid as i32), Signal::SIGSTOP)
                .map_err(|e| OptError::System(format!("SIGSTOP {}: {e}", entry.pid)))?;
            tracing::info!("{} (pid {}) stopped", entry.comm, entry.pid);
            Ok(ReenableAction::Picom { pid: entry.pid })
        }
        CompositorFamily::Compiz => {
            run_tool("dbus-send", &compiz_args(false)).await?;
            tracing::info!("compiz composite plugin deactivated");
            Ok(ReenableAction::Compiz)
        }
        CompositorFamily::Nvidia => {
            if std::env::var("DISPLAY").is_err() {
                tracing::warn!("No DISPLAY; NVIDIA composition pipeline left untouched");
                return Ok(ReenableAction::Nothing);
            }
            let metamode = tool_output_env("nvidia-settings", &nvidia_query_args(), &[])
                .await?
                .trim()
                .to_string();
            if !metamode.contains("ForceCompositionPipeline=On") {
                return Ok(ReenableAction::Nothing);
            }
            let stripped = metamode
                .replace("ForceCompositionPipeline=On", "ForceCompositionPipeline=Off")
                .replace(
                    "ForceFullCompositionPipeline=On",
                    "ForceFullCompositionPipeline=Off",
                );
            run_tool("nvidia-settings", &nvidia_assign_args(&stripped)).await?;
            tracing::info!("NVIDIA composition pipeline disabled");
            Ok(ReenableAction::Nvidia { metamode })
        }
    }
}

async fn reenable(action: ReenableAction) {
    let result = match &action {
        ReenableAction::Nothing => Ok(()),
        ReenableAction::Kwin => run_tool("qdbus", &kwin_args("resume")).await,
        ReenableAction::Xfwm4 => run_tool("xfconf-query", &xfwm4_set_args(true)).await,
        ReenableAction::Marco => run_tool("gsettings", &marco_set_args(true)).await,
        ReenableAction::Picom { pid } => kill(Pid::from_raw(*pid as i32), Signal::SIGCONT)
            .map_err(|e| OptError::System(format!("SIGCONT {pid}: {e}"))),
        ReenableAction::Compiz => run_tool("dbus-send", &compiz_args(true)).await,
        ReenableAction::Nvidia { metamode } => {
            run_tool("nvidia-settings", &nvidia_assign_args(metamode)).await
        }
    };
    match result {
        Ok(()) => tracing::info!("Compositor re-enabled ({action:?})"),
        Err(e) => tracing::error!("Compositor not re-enabled: {e}"),
    }
}

async fn kwin_active() -> bool {
    let args: Vec<String> = vec![
        "org.kde.KWin".into(),
        "/Compositor".into(),
        "org.kde.kwin.Compositing.active".into(),
    ];
    tool_output_env("qdbus", &args, &[])
        .await
        .is_ok_and(|out| out.trim() == "true")
}

fn kwin_args(method: &str) -> Vec<String> {
    vec![
        "org.kde.KWin".into(),
        "/Compositor".into(),
        format!("org.kde.kwin.Compositing.{method}"),
    ]
}

fn xfwm4_query_args() -> Vec<String> {
    vec![
        "-c".into(),
        "xfwm4".into(),
        "-p".into(),
        "/general/use_compositing".into(),
    ]
}

fn xfwm4_set_args(enabled: bool) -> Vec<String> {
    let mut args = xfwm4_query_args();
    args.push("-s".into());
    args.push(enabled.to_string());
    args
}

fn marco_query_args() -> Vec<String> {
    vec![
        "get".into(),
        "org.mate.Marco.general".into(),
        "compositing-manager".into(),
    ]
}

fn marco_set_args(enabled: bool) -> Vec<String> {
    vec![
        "set".into(),
        "org.mate.Marco.general".into(),
        "compositing-manager".into(),
        enabled.to_string(),
    ]
}

fn compiz_args(activate: bool) -> Vec<String> {
    vec![
        "--type=method_call".into(),
        "--dest=org.freedesktop.compiz".into(),
        "/org/freedesktop/compiz/composite/screen0/core".into(),
        format!(
            "org.freedesktop.compiz.{}",
            if activate { "activate" } else { "deactivate" }
        ),
    ]
}

fn nvidia_query_args() -> Vec<String> {
    vec!["-q".into(), "CurrentMetaMode".into(), "-t".into()]
}

fn nvidia_assign_args(metamode: &str) -> Vec<String> {
    vec!["--assign".into(), format!("CurrentMetaMode={metamode}")]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_names() {
        assert_eq!(
            CompositorFamily::from_name("kwin_x11"),
            Some(CompositorFamily::Kwin)
        );
        assert_eq!(
            CompositorFamily::from_name("Compton"),
            Some(CompositorFamily::Picom)
        );
        assert_eq!(
            CompositorFamily::from_name("xfwm4"),
            Some(CompositorFamily::Xfwm4)
        );
        assert_eq!(CompositorFamily::from_name("mutter"), None);
    }

    #[test]
    fn test_inxi_parse() {
        let output = "Graphics:\n  Device-1: ...\n  Display: x11 server: X.Org v: 21.1 \
                      compositor: kwin_x11 driver: X: loaded: modesetting\n";
        assert_eq!(parse_inxi_compositor(output).as_deref(), Some("kwin_x11"));
        assert_eq!(parse_inxi_compositor("no match here"), None);
    }

    #[test]
    fn test_toggle_commands() {
        assert_eq!(
            kwin_args("suspend"),
            vec!["org.kde.KWin", "/Compositor", "org.kde.kwin.Compositing.suspend"]
        );
        assert_eq!(
            xfwm4_set_args(false),
            vec!["-c", "xfwm4", "-p", "/general/use_compositing", "-s", "false"]
        );
        assert_eq!(
            marco_set_args(true),
            vec!["set", "org.mate.Marco.general", "compositing-manager", "true"]
        );
    }

    #[test]
    fn test_nvidia_metamode_strip() {
        let metamode = "DPY-1: nvidia-auto-select @1920x1080 { ForceCompositionPipeline=On }";
        let stripped = metamode.replace("ForceCompositionPipeline=On", "ForceCompositionPipeline=Off");
        assert!(stripped.contains("ForceCompositionPipeline=Off"));
        assert_eq!(nvidia_assign_args(&stripped)[0], "--assign");
    }
}
