// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! Reference-counted custodians of machine-wide state.
//!
//! Every attribute the optimizer may alter globally (CPU governors, GPU
//! power mode, compositor, mouse cursor, stopped companion processes) is
//! owned by exactly one manager. A manager captures the original state on
//! the empty→non-empty transition of its holder set, keeps the altered
//! state while any session holds a reference, and restores the captured
//! original exactly once when the set drains. All mutation of these
//! attributes flows through the managers; nothing else writes them.
//!
//! Sessions hold [`StateToken`]s and hand them back during rollback.
//! Restoration is async (sysfs writes, subprocess calls), so tokens are
//! released explicitly; a token dropped without release logs an error and
//! the manager self-heals by re-capturing on its next first acquire.

use std::collections::HashSet;

use crate::error::Result;
use crate::procs::ProcFs;
use crate::settings::Settings;

pub mod compositor;
pub mod cpu;
pub mod gpu;
pub mod mouse;
pub mod stopped;

/// Identifies one live optimization across the managers.
pub type SessionId = u64;

/// Reserved id for state the daemon itself holds for its whole lifetime
/// (`cpu.performance=true` in opt.conf).
pub const DAEMON_SESSION_ID: SessionId = 0;

/// Which manager a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Cpu,
    Gpu,
    Compositor,
    Mouse,
    Stopped,
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StateKind::Cpu => "cpu",
            StateKind::Gpu => "gpu",
            StateKind::Compositor => "compositor",
            StateKind::Mouse => "mouse",
            StateKind::Stopped => "stopped-processes",
        };
        write!(f, "{label}")
    }
}

/// Opaque proof that a session holds a shared-state reference. Returned by
/// the acquire methods on [`SharedState`] and consumed by
/// [`SharedState::release`].
#[derive(Debug)]
pub struct StateToken {
    pub kind: StateKind,
    session: SessionId,
    released: bool,
}

impl StateToken {
    fn new(kind: StateKind, session: SessionId) -> Self {
        Self {
            kind,
            session,
            released: false,
        }
    }
}

impl Drop for StateToken {
    fn drop(&mut self) {
        if !self.released {
            tracing::error!(
                "{} token of session {} dropped without release; state will be re-captured by the next holder",
                self.kind,
                self.session
            );
        }
    }
}

/// Shared skeleton of every manager: the holder set, the captured original,
/// and the mutex that makes first-acquire / last-release atomic.
pub(crate) struct RefCounted<S> {
    name: &'static str,
    inner: tokio::sync::Mutex<Inner<S>>,
}

struct Inner<S> {
    holders: HashSet<SessionId>,
    state: Option<S>,
}

impl<S> RefCounted<S> {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: tokio::sync::Mutex::new(Inner {
                holders: HashSet::new(),
                state: None,
            }),
        }
    }

    /// Add `session` to the holder set. On the empty→non-empty transition
    /// `init` runs under the manager mutex to capture the original state
    /// and apply the altered one; its failure leaves the set empty.
    /// Re-acquiring under the same session id is a no-op.
    pub(crate) async fn acquire<F, Fut>(&self, session: SessionId, init: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        let mut inner = self.inner.lock().await;
        if inner.holders.is_empty() {
            let state = init().await?;
            inner.state = Some(state);
            tracing::debug!("{} manager: original state captured", self.name);
        }
        if inner.holders.insert(session) {
            tracing::info!(
                "{} manager: session {session} acquired ({} holders)",
                self.name,
                inner.holders.len()
            );
        }
        Ok(())
    }

    /// Drop `session` from the holder set. On the non-empty→empty
    /// transition `restore` runs under the manager mutex with the captured
    /// state.
    pub(crate) async fn release<F, Fut>(&self, session: SessionId, restore: F)
    where
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut inner = self.inner.lock().await;
        if !inner.holders.remove(&session) {
            return;
        }
        tracing::info!(
            "{} manager: session {session} released ({} holders left)",
            self.name,
            inner.holders.len()
        );
        if inner.holders.is_empty() {
            if let Some(state) = inner.state.take() {
                restore(state).await;
                tracing::debug!("{} manager: original state restored", self.name);
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn holder_count(&self) -> usize {
        self.inner.lock().await.holders.len()
    }
}

/// All shared-state managers of one daemon.
pub struct SharedState {
    pub cpu: cpu::CpuPerformanceManager,
    pub gpu: gpu::GpuManager,
    pub compositor: compositor::CompositorManager,
    pub mouse: mouse::MouseManager,
    pub stopped: stopped::StoppedProcessManager,
}

impl SharedState {
    pub fn new(settings: &Settings, procs: ProcFs) -> Self {
        Self {
            cpu: cpu::CpuPerformanceManager::default(),
            gpu: gpu::GpuManager::new(settings),
            compositor: compositor::CompositorManager::new(settings.compositor.clone(), procs.clone()),
            mouse: mouse::MouseManager::default(),
            stopped: stopped::StoppedProcessManager::new(procs),
        }
    }

    pub async fn acquire_cpu(&self, session: SessionId) -> Result<StateToken> {
        self.cpu.acquire(session).await?;
        Ok(StateToken::new(StateKind::Cpu, session))
    }

    pub async fn acquire_gpu(&self, session: SessionId) -> Result<StateToken> {
        self.gpu.acquire(session).await?;
        Ok(StateToken::new(StateKind::Gpu, session))
    }

    pub async fn acquire_compositor(&self, session: SessionId) -> Result<StateToken> {
        self.compositor.acquire(session).await?;
        Ok(StateToken::new(StateKind::Compositor, session))
    }

    pub async fn acquire_mouse(&self, session: SessionId) -> Result<StateToken> {
        self.mouse.acquire(session).await?;
        Ok(StateToken::new(StateKind::Mouse, session))
    }

    /// Stop `names` and register them for relaunch accounting; see
    /// [`stopped::StoppedProcessManager`].
    pub async fn acquire_stopped(
        &self,
        session: SessionId,
        names: &[String],
        relaunch: bool,
    ) -> Result<StateToken> {
        self.stopped.stop(session, names, relaunch).await?;
        Ok(StateToken::new(StateKind::Stopped, session))
    }

    /// Release one token; runs the manager's restore path when the session
    /// was the last holder.
    pub async fn release(&self, mut token: StateToken) {
        let session = token.session;
        match token.kind {
            StateKind::Cpu => self.cpu.release(session).await,
            StateKind::Gpu => self.gpu.release(session).await,
            StateKind::Compositor => self.compositor.release(session).await,
            StateKind::Mouse => self.mouse.release(session).await,
            StateKind::Stopped => {
                let relaunched = self.stopped.release(session).await;
                if !relaunched.is_empty() {
                    tracing::info!(
                        "Session {session}: relaunched {}",
                        relaunched.join(", ")
                    );
                }
            }
        }
        token.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_capture_once_restore_once() {
        let counted: RefCounted<u32> = RefCounted::new("test");
        let captures = Arc::new(AtomicUsize::new(0));
        let restores = Arc::new(AtomicUsize::new(0));

        for session in [1, 2, 2] {
            let captures = Arc::clone(&captures);
            counted
                .acquire(session, || async move {
                    let _ = captures.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
        }
        assert_eq!(captures.load(Ordering::SeqCst), 1);
        assert_eq!(counted.holder_count().await, 2);

        for session in [1, 2, 3] {
            let restores = Arc::clone(&restores);
            counted
                .release(session, |state| async move {
                    assert_eq!(state, 7);
                    let _ = restores.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }
        assert_eq!(restores.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_init_leaves_set_empty() {
        let counted: RefCounted<u32> = RefCounted::new("test");
        let result = counted
            .acquire(1, || async { Err(crate::OptError::System("probe failed".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(counted.holder_count().await, 0);

        // next acquirer re-captures
        counted.acquire(2, || async { Ok(9) }).await.unwrap();
        assert_eq!(counted.holder_count().await, 1);
    }

    #[tokio::test]
    async fn test_recapture_after_drain() {
        let counted: RefCounted<u32> = RefCounted::new("test");
        let captures = Arc::new(AtomicUsize::new(0));
        for round in 0..2u64 {
            let captures = Arc::clone(&captures);
            counted
                .acquire(round + 1, move || async move {
                    let _ = captures.fetch_add(1, Ordering::SeqCst);
                    Ok(0)
                })
                .await
                .unwrap();
            counted.release(round + 1, |_| async {}).await;
        }
        assert_eq!(captures.load(Ordering::SeqCst), 2);
    }
}
