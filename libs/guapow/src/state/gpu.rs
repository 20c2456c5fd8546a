// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! GPU power-mode manager with vendor probing.
//!
//! NVIDIA cards are found through `nvidia-smi` and driven via
//! `nvidia-settings` (PowerMizerMode, once per X display) plus persistence
//! mode; AMD cards are sysfs nodes
//! (`/sys/class/drm/card<N>/device/power_dpm_force_performance_level`)
//! driven to `high`. Logical ids are assigned in discovery order (NVIDIA
//! indices first, then AMD cards) and `gpu.id` filters against those.
//!
//! The map refresh policy follows `gpu.cache`: probe on every request when
//! off; probe once when on (at startup for a user daemon, lazily on first
//! use for a system service).

use std::path::{Path, PathBuf};

use crate::appliers::{run_tool, tool_output_env};
use crate::error::{OptError, Result};
use crate::settings::Settings;
use crate::state::{RefCounted, SessionId};

const AMD_PERFORMANCE_LEVEL: &str = "high";
const NVIDIA_PERFORMANCE_MIZER: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuVendor {
    Nvidia,
    Amd,
}

impl std::str::FromStr for GpuVendor {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s.to_lowercase().as_str() {
            "nvidia" => Ok(GpuVendor::Nvidia),
            "amd" => Ok(GpuVendor::Amd),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "nvidia"),
            GpuVendor::Amd => write!(f, "amd"),
        }
    }
}

/// One discovered GPU: logical id plus the vendor-specific handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    pub id: u32,
    pub vendor: GpuVendor,
    /// `nvidia-smi` index for NVIDIA, sysfs device dir for AMD.
    pub nvidia_index: Option<u32>,
    pub amd_device_dir: Option<PathBuf>,
}

/// Captured pre-alteration state of one driven GPU.
#[derive(Debug)]
enum GpuOriginal {
    Nvidia {
        index: u32,
        power_mizer: Option<String>,
        persistence_was_on: bool,
    },
    Amd {
        device_dir: PathBuf,
        dpm_level: String,
    },
}

/// Vendor probing with the configured refresh policy.
pub struct GpuMap {
    drm_root: PathBuf,
    cache_enabled: bool,
    vendor_filter: Option<GpuVendor>,
    only_connected: bool,
    cached: tokio::sync::Mutex<Option<std::sync::Arc<Vec<GpuDevice>>>>,
}

impl GpuMap {
    pub fn new(settings: &Settings) -> Self {
        Self {
            drm_root: PathBuf::from("/sys/class/drm"),
            cache_enabled: settings.gpu_cache,
            vendor_filter: settings.gpu_vendor,
            only_connected: settings.gpu_only_connected,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn for_test(drm_root: impl Into<PathBuf>, cache: bool, only_connected: bool) -> Self {
        Self {
            drm_root: drm_root.into(),
            cache_enabled: cache,
            vendor_filter: Some(GpuVendor::Amd),
            only_connected,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    /// Devices under the current refresh policy.
    pub async fn devices(&self) -> std::sync::Arc<Vec<GpuDevice>> {
        if self.cache_enabled {
            let mut cached = self.cached.lock().await;
            if let Some(devices) = cached.as_ref() {
                return std::sync::Arc::clone(devices);
            }
            let devices = std::sync::Arc::new(self.probe().await);
            *cached = Some(std::sync::Arc::clone(&devices));
            devices
        } else {
            std::sync::Arc::new(self.probe().await)
        }
    }

    /// Eager probe for the startup path (user daemon with `gpu.cache`).
    pub async fn prime(&self) {
        if self.cache_enabled {
            let devices = self.devices().await;
            tracing::info!("GPU map primed with {} device(s)", devices.len());
        }
    }

    async fn probe(&self) -> Vec<GpuDevice> {
        let mut devices = Vec::new();
        let mut next_id = 0u32;

        if self.vendor_filter != Some(GpuVendor::Amd) {
            for index in probe_nvidia_indices().await {
                devices.push(GpuDevice {
                    id: next_id,
                    vendor: GpuVendor::Nvidia,
                    nvidia_index: Some(index),
                    amd_device_dir: None,
                });
                next_id += 1;
            }
        }
        if self.vendor_filter != Some(GpuVendor::Nvidia) {
            for device_dir in self.probe_amd_cards().await {
                devices.push(GpuDevice {
                    id: next_id,
                    vendor: GpuVendor::Amd,
                    nvidia_index: None,
                    amd_device_dir: Some(device_dir),
                });
                next_id += 1;
            }
        }

        tracing::debug!("GPU probe found {} device(s)", devices.len());
        devices
    }

    /// AMD cards with a DPM performance-level node, optionally restricted
    /// to cards with at least one connected display. A card counts once no
    /// matter how many connectors are lit.
    async fn probe_amd_cards(&self) -> Vec<PathBuf> {
        let mut cards = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(&self.drm_root).await else {
            return cards;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(number) = name.strip_prefix("card") else {
                continue;
            };
            if number.parse::<u32>().is_err() {
                continue; // connector dirs like card0-HDMI-A-1
            }
            let device_dir = entry.path().join("device");
            if tokio::fs::metadata(device_dir.join("power_dpm_force_performance_level"))
                .await
                .is_err()
            {
                continue;
            }
            if self.only_connected && !card_has_connected_display(&self.drm_root, name).await {
                tracing::debug!("Skipping {name}: no connected display");
                continue;
            }
            cards.push(device_dir);
        }
        cards.sort();
        cards
    }
}

async fn card_has_connected_display(drm_root: &Path, card: &str) -> bool {
    let prefix = format!("{card}-");
    let Ok(mut dir) = tokio::fs::read_dir(drm_root).await else {
        return false;
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) {
            continue;
        }
        if let Ok(status) = tokio::fs::read_to_string(entry.path().join("status")).await {
            if status.trim() == "connected" {
                return true;
            }
        }
    }
    false
}

async fn probe_nvidia_indices() -> Vec<u32> {
    let args: Vec<String> = vec![
        "--query-gpu=index".into(),
        "--format=csv,noheader".into(),
    ];
    match tool_output_env("nvidia-smi", &args, &[]).await {
        Ok(output) => output
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect(),
        Err(_) => Vec::new(), // no driver or no card; not an error
    }
}

/// X displays to address `nvidia-settings` at, from the X socket dir.
fn x_displays() -> Vec<String> {
    let mut displays: Vec<String> = std::fs::read_dir("/tmp/.X11-unix")
        .map(|dir| {
            dir.filter_map(|e| e.ok())
                .filter_map(|e| {
                    e.file_name()
                        .to_str()
                        .and_then(|n| n.strip_prefix('X').map(|d| format!(":{d}")))
                })
                .collect()
        })
        .unwrap_or_default();
    displays.sort();
    if displays.is_empty() {
        if let Ok(display) = std::env::var("DISPLAY") {
            displays.push(display);
        }
    }
    displays
}

pub struct GpuManager {
    counted: RefCounted<Vec<GpuOriginal>>,
    map: GpuMap,
    id_filter: Vec<u32>,
}

impl GpuManager {
    pub fn new(settings: &Settings) -> Self {
        Self {
            counted: RefCounted::new("gpu"),
            map: GpuMap::new(settings),
            id_filter: settings.gpu_ids.clone(),
        }
    }

    /// Probe eagerly when the refresh policy asks for it.
    pub async fn prime(&self) {
        self.map.prime().await;
    }

    pub async fn acquire(&self, session: SessionId) -> Result<()> {
        let devices = self.map.devices().await;
        let selected: Vec<GpuDevice> = devices
            .iter()
            .filter(|d| self.id_filter.is_empty() || self.id_filter.contains(&d.id))
            .cloned()
            .collect();
        self.counted
            .acquire(session, || async move {
                if selected.is_empty() {
                    tracing::warn!("gpu.performance requested but no eligible GPU found");
                }
                let mut altered = Vec::with_capacity(selected.len());
                for device in &selected {
                    match drive_to_performance(device).await {
                        Ok(original) => altered.push(original),
                        Err(e) => {
                            tracing::error!("GPU {} not driven to performance: {e}", device.id);
                        }
                    }
                }
                Ok(altered)
            })
            .await
    }

    pub async fn release(&self, session: SessionId) {
        self.counted
            .release(session, |altered| async move {
                for original in altered {
                    restore_original(original).await;
                }
            })
            .await;
    }
}

async fn drive_to_performance(device: &GpuDevice) -> Result<GpuOriginal> {
    match device.vendor {
        GpuVendor::Nvidia => {
            let index = device
                .nvidia_index
                .ok_or_else(|| OptError::System("nvidia device without index".into()))?;
            let original = GpuOriginal::Nvidia {
                index,
                power_mizer: query_power_mizer(index).await,
                persistence_was_on: query_persistence(index).await,
            };
            assign_power_mizer(index, NVIDIA_PERFORMANCE_MIZER).await;
            let args: Vec<String> =
                vec!["-i".into(), index.to_string(), "-pm".into(), "1".into()];
            if let Err(e) = run_tool("nvidia-smi", &args).await {
                tracing::warn!("Persistence mode not enabled for GPU {index}: {e}");
            }
            tracing::info!("NVIDIA GPU {index} driven to performance");
            Ok(original)
        }
        GpuVendor::Amd => {
            let device_dir = device
                .amd_device_dir
                .clone()
                .ok_or_else(|| OptError::System("amd device without sysfs dir".into()))?;
            let path = device_dir.join("power_dpm_force_performance_level");
            let current = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| OptError::System(format!("read {}: {e}", path.display())))?
                .trim()
                .to_string();
            tokio::fs::write(&path, AMD_PERFORMANCE_LEVEL)
                .await
                .map_err(|e| OptError::System(format!("write {}: {e}", path.display())))?;
            tracing::info!(
                "AMD card at {}: {current} -> {AMD_PERFORMANCE_LEVEL}",
                device_dir.display()
            );
            Ok(GpuOriginal::Amd {
                device_dir,
                dpm_level: current,
            })
        }
    }
}

async fn restore_original(original: GpuOriginal) {
    match original {
        GpuOriginal::Nvidia {
            index,
            power_mizer,
            persistence_was_on,
        } => {
            if let Some(mode) = power_mizer {
                assign_power_mizer(index, &mode).await;
            }
            if !persistence_was_on {
                let args: Vec<String> =
                    vec!["-i".into(), index.to_string(), "-pm".into(), "0".into()];
                if let Err(e) = run_tool("nvidia-smi", &args).await {
                    tracing::warn!("Persistence mode not restored for GPU {index}: {e}");
                }
            }
            tracing::info!("NVIDIA GPU {index} restored");
        }
        GpuOriginal::Amd {
            device_dir,
            dpm_level,
        } => {
            let path = device_dir.join("power_dpm_force_performance_level");
            match tokio::fs::write(&path, &dpm_level).await {
                Ok(()) => tracing::info!(
                    "AMD card at {} restored to {dpm_level}",
                    device_dir.display()
                ),
                Err(e) => tracing::error!("Could not restore {}: {e}", path.display()),
            }
        }
    }
}

/// Current PowerMizerMode digit, when an X display answers.
async fn query_power_mizer(index: u32) -> Option<String> {
    for display in x_displays() {
        let args: Vec<String> = vec![
            "-q".into(),
            format!("[gpu:{index}]/GpuPowerMizerMode"),
            "-t".into(),
        ];
        if let Ok(output) =
            tool_output_env("nvidia-settings", &args, &[("DISPLAY", display.as_str())]).await
        {
            let mode = output.trim().to_string();
            if !mode.is_empty() {
                return Some(mode);
            }
        }
    }
    None
}

async fn query_persistence(index: u32) -> bool {
    let args: Vec<String> = vec![
        "-i".into(),
        index.to_string(),
        "--query-gpu=persistence_mode".into(),
        "--format=csv,noheader".into(),
    ];
    matches!(
        tool_output_env("nvidia-smi", &args, &[]).await,
        Ok(output) if output.trim().eq_ignore_ascii_case("enabled")
    )
}

/// Assign PowerMizerMode on every X display that will take it.
async fn assign_power_mizer(index: u32, mode: &str) {
    let displays = x_displays();
    if displays.is_empty() {
        tracing::warn!("No X display found; PowerMizerMode not set for GPU {index}");
        return;
    }
    for disp in displays {
        let args: Vec<String> = vec![
            "-a".into(),
            format!("[gpu:{index}]/GpuPowerMizerMode={mode}"),
        ];
        if let Err(e) =
            tool_output_env("nvidia-settings", &args, &[("DISPLAY", disp.as_str())]).await
        {
            tracing::warn!("nvidia-settings failed on display {disp}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fake_amd_card(root: &Path, number: u32, level: &str, connected: bool) {
        let device = root.join(format!("card{number}")).join("device");
        tokio::fs::create_dir_all(&device).await.unwrap();
        tokio::fs::write(
            device.join("power_dpm_force_performance_level"),
            format!("{level}\n"),
        )
        .await
        .unwrap();
        let connector = root.join(format!("card{number}-HDMI-A-1"));
        tokio::fs::create_dir_all(&connector).await.unwrap();
        tokio::fs::write(
            connector.join("status"),
            if connected { "connected\n" } else { "disconnected\n" },
        )
        .await
        .unwrap();
    }

    fn amd_manager(map: GpuMap, ids: Vec<u32>) -> GpuManager {
        GpuManager {
            counted: RefCounted::new("gpu"),
            map,
            id_filter: ids,
        }
    }

    #[test]
    fn test_vendor_parse() {
        assert_eq!("NVIDIA".parse::<GpuVendor>(), Ok(GpuVendor::Nvidia));
        assert_eq!("amd".parse::<GpuVendor>(), Ok(GpuVendor::Amd));
        assert!("matrox".parse::<GpuVendor>().is_err());
    }

    #[tokio::test]
    async fn test_amd_probe_skips_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        fake_amd_card(dir.path(), 0, "auto", true).await;
        fake_amd_card(dir.path(), 1, "auto", false).await;

        let map = GpuMap::for_test(dir.path(), false, true);
        let devices = map.devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].vendor, GpuVendor::Amd);

        let map_all = GpuMap::for_test(dir.path(), false, false);
        assert_eq!(map_all.devices().await.len(), 2);
    }

    #[tokio::test]
    async fn test_cache_policy() {
        let dir = tempfile::tempdir().unwrap();
        fake_amd_card(dir.path(), 0, "auto", true).await;

        let cached = GpuMap::for_test(dir.path(), true, true);
        assert_eq!(cached.devices().await.len(), 1);
        fake_amd_card(dir.path(), 1, "auto", true).await;
        // cached map must not see the new card
        assert_eq!(cached.devices().await.len(), 1);

        let uncached = GpuMap::for_test(dir.path(), false, true);
        assert_eq!(uncached.devices().await.len(), 2);
    }

    #[tokio::test]
    async fn test_amd_acquire_release_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        fake_amd_card(dir.path(), 0, "auto", true).await;
        let level_path = dir
            .path()
            .join("card0/device/power_dpm_force_performance_level");

        let manager = amd_manager(GpuMap::for_test(dir.path(), false, true), Vec::new());
        manager.acquire(1).await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(&level_path).await.unwrap().trim(),
            "high"
        );
        manager.release(1).await;
        assert_eq!(
            tokio::fs::read_to_string(&level_path).await.unwrap().trim(),
            "auto"
        );
    }

    #[tokio::test]
    async fn test_id_filter() {
        let dir = tempfile::tempdir().unwrap();
        fake_amd_card(dir.path(), 0, "auto", true).await;
        fake_amd_card(dir.path(), 1, "auto", true).await;
        let level0 = dir
            .path()
            .join("card0/device/power_dpm_force_performance_level");
        let level1 = dir
            .path()
            .join("card1/device/power_dpm_force_performance_level");

        // only logical id 1 (the second AMD card) is eligible
        let manager = amd_manager(GpuMap::for_test(dir.path(), false, true), vec![1]);
        manager.acquire(1).await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(&level0).await.unwrap().trim(),
            "auto"
        );
        assert_eq!(
            tokio::fs::read_to_string(&level1).await.unwrap().trim(),
            "high"
        );
        manager.release(1).await;
    }
}
