// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! Session lifecycle: one accepted request from apply to rollback.
//!
//! A session runs the phases in strict order: resolve, apply (per-process
//! appliers, shared-state acquires and after-scripts concurrently), track
//! discovered children, monitor, wait for the whole tracked tree to exit,
//! roll back. Individual applier and acquire failures are logged and the
//! rest of the plan continues; only an undecodable request is fatal, and
//! that never reaches this module.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::appliers::ProcessAppliers;
use crate::error::Result;
use crate::procs::ProcFs;
use crate::profile::OptimizationProfile;
use crate::request::OptimizationRequest;
use crate::scripts::ScriptsRunner;
use crate::settings::Settings;
use crate::state::{SessionId, SharedState, StateToken};
use crate::watcher::{ProcessWatcher, WatcherConfig};

/// Hard bound on rollback work once a session starts tearing down.
const ROLLBACK_BUDGET: Duration = Duration::from_secs(30);

/// Everything a session needs, shared by all sessions of one daemon.
pub struct SessionContext {
    pub settings: Settings,
    pub procs: ProcFs,
    pub appliers: ProcessAppliers,
    pub scripts: ScriptsRunner,
    pub watcher: ProcessWatcher,
    pub shared: SharedState,
    pub profiles: crate::profile::ProfileResolver,
    next_id: AtomicU64,
}

impl SessionContext {
    pub fn new(settings: Settings) -> Arc<Self> {
        let procs = ProcFs::default();
        Arc::new(Self {
            procs: procs.clone(),
            appliers: ProcessAppliers::default(),
            scripts: ScriptsRunner::new(settings.scripts_allow_root),
            watcher: ProcessWatcher::new(procs.clone()),
            shared: SharedState::new(&settings, procs),
            profiles: crate::profile::ProfileResolver::new(
                settings.profile_cache || settings.profile_pre_caching,
            ),
            next_id: AtomicU64::new(1),
            settings,
        })
    }

    /// Assemble a context from explicit parts (tests).
    pub fn with_parts(
        settings: Settings,
        procs: ProcFs,
        appliers: ProcessAppliers,
        shared: SharedState,
    ) -> Arc<Self> {
        Arc::new(Self {
            appliers,
            scripts: ScriptsRunner::new(settings.scripts_allow_root),
            watcher: ProcessWatcher::new(procs.clone()),
            shared,
            profiles: crate::profile::ProfileResolver::new(false),
            next_id: AtomicU64::new(1),
            procs,
            settings,
        })
    }

    fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Run one request to completion. Returns once the target tree has exited
/// and rollback finished, or once `shutdown` flips and the bounded
/// teardown ran.
pub async fn handle_request(
    ctx: Arc<SessionContext>,
    request: OptimizationRequest,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let profile = resolve_profile(&ctx, &request).await?;
    if profile.is_empty() {
        tracing::info!(
            "Request {} for pid {} resolved to an empty plan, nothing to do",
            request.request_id.as_deref().unwrap_or("-"),
            request.pid
        );
        return Ok(());
    }

    let session = ctx.next_session_id();
    tracing::info!(
        "Session {session} started: pid={} user={} request={}",
        request.pid,
        request.user,
        request.request_id.as_deref().unwrap_or("-")
    );

    let user_is_root = crate::users::uid_of(&request.user) == Some(0);
    let tracked: Arc<Mutex<HashSet<u32>>> = Arc::new(Mutex::new(HashSet::from([request.pid])));
    let mut tokens: Vec<StateToken> = Vec::new();

    // Apply phase: appliers, shared-state acquires and after-scripts have
    // no ordering dependency between each other.
    tokio::join!(
        ctx.appliers.apply_all(request.pid, &profile, user_is_root),
        acquire_shared(&ctx, session, &request, &profile, &mut tokens),
        ctx.scripts
            .run_phase("after", &profile.scripts_after, &request.user),
    );

    // Track phase: child discovery feeds newly found PIDs back into the
    // applier set until its deadlines expire.
    let discovery = spawn_discovery(
        &ctx,
        &request,
        &profile,
        Arc::clone(&tracked),
        user_is_root,
    )
    .await;

    // Monitor phase.
    let nice_watch = profile.nice.filter(|_| profile.nice_watch).map(|nice| {
        tokio::spawn(crate::monitor::watch_nice(
            ctx.procs.clone(),
            Arc::clone(&tracked),
            nice,
            ctx.settings.nice_check_interval(),
        ))
    });

    // Wait for the tracked tree to drain, or for daemon shutdown.
    let cancelled = wait_for_termination(&ctx, &tracked, &mut shutdown).await;
    if cancelled {
        tracing::info!("Session {session} cancelled by daemon shutdown");
    } else {
        tracing::info!("Session {session}: all tracked processes exited");
    }

    // Rollback, bounded.
    if let Some(watch) = nice_watch {
        watch.abort();
    }
    if let Some(discovery) = discovery {
        discovery.abort();
    }
    let rollback = rollback(&ctx, &request, &profile, tokens);
    if tokio::time::timeout(ROLLBACK_BUDGET, rollback).await.is_err() {
        tracing::error!("Session {session}: rollback exceeded its budget, some state may linger");
    }
    tracing::info!("Session {session} finished");
    Ok(())
}

async fn resolve_profile(
    ctx: &SessionContext,
    request: &OptimizationRequest,
) -> Result<OptimizationProfile> {
    let mut profile = if let Some(config) = &request.config {
        OptimizationProfile::from_option_string(config)
    } else if let Some(name) = &request.profile {
        (*ctx.profiles.resolve(&request.user, name).await?).clone()
    } else {
        OptimizationProfile::default()
    };
    if let Some(overlay) = &request.profile_add {
        profile.overlay_option_string(overlay);
    }
    Ok(profile)
}

async fn acquire_shared(
    ctx: &SessionContext,
    session: SessionId,
    request: &OptimizationRequest,
    profile: &OptimizationProfile,
    tokens: &mut Vec<StateToken>,
) {
    if profile.cpu_performance {
        match ctx.shared.acquire_cpu(session).await {
            Ok(token) => tokens.push(token),
            Err(e) => tracing::error!("Session {session}: cpu.performance not applied: {e}"),
        }
    }
    if profile.gpu_performance {
        match ctx.shared.acquire_gpu(session).await {
            Ok(token) => tokens.push(token),
            Err(e) => tracing::error!("Session {session}: gpu.performance not applied: {e}"),
        }
    }
    if profile.compositor_off {
        match ctx.shared.acquire_compositor(session).await {
            Ok(token) => tokens.push(token),
            Err(e) => tracing::error!("Session {session}: compositor.off not applied: {e}"),
        }
    }
    if profile.mouse_hidden {
        match ctx.shared.acquire_mouse(session).await {
            Ok(token) => tokens.push(token),
            Err(e) => tracing::error!("Session {session}: mouse.hidden not applied: {e}"),
        }
    }

    let stop_after = !profile.stop_after.names.is_empty();
    let prestopped = !request.stopped.is_empty() && profile.stop_before.relaunch;
    if stop_after || prestopped {
        if prestopped {
            ctx.shared
                .stopped
                .register_prestopped(session, &request.stopped, true)
                .await;
        }
        let names = if stop_after {
            profile.stop_after.names.as_slice()
        } else {
            &[]
        };
        match ctx
            .shared
            .acquire_stopped(session, names, profile.stop_after.relaunch)
            .await
        {
            Ok(token) => tokens.push(token),
            Err(e) => tracing::error!("Session {session}: stop.after not applied: {e}"),
        }
    }
}

/// Spawn discovery plus its consumer when any discovery mode is active.
async fn spawn_discovery(
    ctx: &Arc<SessionContext>,
    request: &OptimizationRequest,
    profile: &OptimizationProfile,
    tracked: Arc<Mutex<HashSet<u32>>>,
    user_is_root: bool,
) -> Option<tokio::task::JoinHandle<()>> {
    let settings = &ctx.settings;
    let rules = ProcessWatcher::merged_rules(&profile.launchers, &request.user).await;
    let wants_discovery =
        settings.optimize_children_timeout > 0.0 || profile.steam || !rules.is_empty();
    if !wants_discovery {
        return None;
    }

    let config = WatcherConfig {
        launcher_rules: rules,
        skip_launcher_mapping: profile.skip_launcher_mapping,
        steam: profile.steam,
        children_timeout: settings.optimize_children_timeout,
        children_found_timeout: settings.optimize_children_found_timeout,
        mapping_timeout: settings.launcher_mapping_timeout,
        mapping_found_timeout: settings.launcher_mapping_found_timeout,
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctx = Arc::clone(ctx);
    let profile = profile.clone();
    let root_pid = request.pid;
    Some(tokio::spawn(async move {
        let watcher = ctx.watcher.clone();
        let producer = watcher.discover(root_pid, &config, tx);
        let consumer = async {
            while let Some(entry) = rx.recv().await {
                let is_new = tracked.lock().insert(entry.pid);
                if is_new {
                    ctx.appliers
                        .apply_all(entry.pid, &profile, user_is_root)
                        .await;
                }
            }
        };
        let _ = tokio::join!(producer, consumer);
    }))
}

/// Poll the tracked set until every PID is gone. Returns true when the
/// wait ended because of daemon shutdown instead.
async fn wait_for_termination(
    ctx: &SessionContext,
    tracked: &Arc<Mutex<HashSet<u32>>>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let interval = ctx.settings.check_finished_interval();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                match changed {
                    Ok(()) if *shutdown.borrow() => return true,
                    Ok(()) => {}
                    // sender gone: the daemon can no longer cancel us,
                    // fall back to plain polling
                    Err(_) => tokio::time::sleep(interval).await,
                }
            }
        }
        let pids: Vec<u32> = tracked.lock().iter().copied().collect();
        let mut alive = HashSet::new();
        for pid in pids {
            if ctx.procs.is_alive(pid).await {
                let _ = alive.insert(pid);
            }
        }
        let mut guard = tracked.lock();
        guard.retain(|pid| alive.contains(pid));
        if guard.is_empty() {
            return false;
        }
    }
}

async fn rollback(
    ctx: &SessionContext,
    request: &OptimizationRequest,
    profile: &OptimizationProfile,
    tokens: Vec<StateToken>,
) {
    for token in tokens {
        ctx.shared.release(token).await;
    }
    ctx.scripts
        .run_phase("finish", &profile.scripts_finish, &request.user)
        .await;
}
