// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! The optimizer TCP service.
//!
//! One request per connection on loopback: read to EOF, decrypt under the
//! daemon key (unless cleartext was allowed for development), parse,
//! authorize, then run the session. Rejected requests get nothing back;
//! the client just observes the close. The daemon never dies on a bad
//! request.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::crypto::RequestCipher;
use crate::error::{OptError, Result};
use crate::request::OptimizationRequest;
use crate::session::{SessionContext, handle_request};
use crate::settings::is_root;
use crate::state::DAEMON_SESSION_ID;

/// Upper bound for one request body; anything larger is hostile.
const MAX_BODY_BYTES: u64 = 64 * 1024;

/// Grace period for live sessions to roll back on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(35);

pub struct OptimizerServer {
    ctx: Arc<SessionContext>,
    listener: TcpListener,
    cipher: Option<RequestCipher>,
    key_path: PathBuf,
}

impl OptimizerServer {
    /// Bind the listener and run the startup side-effects: key publishing,
    /// optional daemon-lifetime CPU performance, GPU map priming and
    /// profile pre-caching.
    pub async fn bind(ctx: Arc<SessionContext>) -> Result<Self> {
        Self::bind_with_key_path(ctx, crate::crypto::key_path()).await
    }

    pub async fn bind_with_key_path(
        ctx: Arc<SessionContext>,
        key_path: PathBuf,
    ) -> Result<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], ctx.settings.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| OptError::System(format!("could not bind {addr}: {e}")))?;
        tracing::info!("Listening on {}", listener.local_addr()?);

        let cipher = if ctx.settings.encrypted_requests {
            let cipher = RequestCipher::generate();
            cipher.publish(&key_path).await?;
            Some(cipher)
        } else {
            tracing::warn!("request.encrypted=false: accepting cleartext requests");
            None
        };

        if ctx.settings.cpu_performance {
            match ctx.shared.acquire_cpu(DAEMON_SESSION_ID).await {
                // held for the daemon's entire lifetime, never released
                Ok(token) => std::mem::forget(token),
                Err(e) => tracing::error!("cpu.performance=true not applied: {e}"),
            }
        }
        if ctx.settings.gpu_cache && !is_root() {
            ctx.shared.gpu.prime().await;
        }
        if ctx.settings.profile_pre_caching {
            if let Some(user) = current_user() {
                ctx.profiles.pre_cache(&user).await;
            }
        }

        Ok(Self {
            ctx,
            listener,
            cipher,
            key_path,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` flips, then give live sessions a bounded
    /// grace period to roll back.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let cipher = Arc::new(self.cipher);
        let mut sessions: JoinSet<()> = JoinSet::new();
        let port = self.listener.local_addr()?.port();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let ctx = Arc::clone(&self.ctx);
                            let cipher = Arc::clone(&cipher);
                            let shutdown = shutdown.clone();
                            let _ = sessions.spawn(async move {
                                handle_connection(ctx, cipher, stream, peer, port, shutdown).await;
                            });
                        }
                        Err(e) => tracing::warn!("Accept failed: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    match changed {
                        Ok(()) => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                        // sender gone: keep serving, nothing can stop us
                        Err(_) => tokio::time::sleep(Duration::from_secs(1)).await,
                    }
                }
                // reap finished sessions so the set does not grow unbounded
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        tracing::info!(
            "Shutting down: waiting up to {SHUTDOWN_GRACE:?} for {} live session(s)",
            sessions.len()
        );
        let drain = async {
            while sessions.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            tracing::error!("Some sessions did not finish rollback in time");
            sessions.abort_all();
        }
        RequestCipher::unpublish(&self.key_path).await;
        Ok(())
    }
}

async fn handle_connection(
    ctx: Arc<SessionContext>,
    cipher: Arc<Option<RequestCipher>>,
    mut stream: TcpStream,
    peer: SocketAddr,
    port: u16,
    shutdown: watch::Receiver<bool>,
) {
    let request = match read_request(&ctx, cipher.as_ref().as_ref(), &mut stream, peer, port).await
    {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Request from {peer} rejected: {e}");
            return; // close with no body
        }
    };
    drop(stream);

    if let Err(e) = handle_request(ctx, request, shutdown).await {
        tracing::error!("Session for {peer} failed: {e}");
    }
}

async fn read_request(
    ctx: &SessionContext,
    cipher: Option<&RequestCipher>,
    stream: &mut TcpStream,
    peer: SocketAddr,
    port: u16,
) -> Result<OptimizationRequest> {
    let mut raw = Vec::new();
    let _ = stream
        .take(MAX_BODY_BYTES)
        .read_to_end(&mut raw)
        .await?;

    let body = match cipher {
        Some(cipher) => String::from_utf8_lossy(&cipher.open(&raw)?).into_owned(),
        None => String::from_utf8_lossy(&raw).into_owned(),
    };
    let request = OptimizationRequest::parse(&body)?;

    let user_uid = crate::users::uid_of(&request.user);
    let peer_uid = crate::users::tcp_peer_uid(peer, port);
    authorize(
        &request.user,
        &ctx.settings.allowed_users,
        user_uid,
        peer_uid,
    )?;
    Ok(request)
}

/// Allow-list plus socket-owner validation. The peer check is skipped when
/// either uid cannot be resolved (short-lived client sockets race with the
/// table scan).
fn authorize(
    user: &str,
    allowed_users: &[String],
    user_uid: Option<u32>,
    peer_uid: Option<u32>,
) -> Result<()> {
    if !allowed_users.is_empty() && !allowed_users.iter().any(|u| u == user) {
        return Err(OptError::Authorization(format!(
            "user '{user}' is not in request.allowed_users"
        )));
    }
    match (user_uid, peer_uid) {
        (Some(user_uid), Some(peer_uid)) if user_uid != peer_uid => {
            Err(OptError::Authorization(format!(
                "request.user '{user}' (uid {user_uid}) does not own the connection (uid {peer_uid})"
            )))
        }
        (None, _) | (_, None) => {
            tracing::warn!("Could not verify the socket owner for '{user}', continuing");
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Name of the user the daemon runs as.
fn current_user() -> Option<String> {
    // SAFETY: getuid has no failure mode.
    crate::users::name_of(unsafe { libc::getuid() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_authorize_allow_list() {
        let allowed = vec!["alice".to_string()];
        assert!(authorize("alice", &allowed, Some(1000), Some(1000)).is_ok());
        assert!(authorize("bob", &allowed, Some(1001), Some(1001)).is_err());
        assert!(authorize("bob", &[], Some(1001), Some(1001)).is_ok());
    }

    #[test]
    fn test_authorize_socket_owner() {
        assert!(authorize("alice", &[], Some(1000), Some(0)).is_err());
        // unverifiable sides are skipped, not rejected
        assert!(authorize("alice", &[], None, Some(0)).is_ok());
        assert!(authorize("alice", &[], Some(1000), None).is_ok());
    }

    async fn test_server() -> (SocketAddr, RequestCipher, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            port: 0,
            check_finished_interval: 0.5,
            optimize_children_timeout: 0.0,
            ..Default::default()
        };
        let ctx = SessionContext::new(settings);
        let key_path = dir.path().join("opt.key");
        let server = OptimizerServer::bind_with_key_path(ctx, key_path.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let key = tokio::fs::read_to_string(&key_path).await.unwrap();
        let cipher = RequestCipher::from_hex(&key).unwrap();
        let (_tx, rx) = watch::channel(false);
        let _ = tokio::spawn(server.run(rx));
        (addr, cipher, dir)
    }

    async fn send(addr: SocketAddr, payload: &[u8]) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(payload).await.unwrap();
        stream.shutdown().await.unwrap();
        // the daemon answers nothing either way; just let it read EOF
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
    }

    #[tokio::test]
    async fn test_sealed_noop_request_accepted_and_server_survives() {
        let (addr, cipher, _dir) = test_server().await;
        let body = OptimizationRequest {
            pid: 1,
            user: "whoever".into(),
            config: Some("made.up.option".into()),
            ..Default::default()
        }
        .to_body();

        send(addr, &cipher.seal(body.as_bytes()).unwrap()).await;
        // cleartext must be rejected while encryption is on, without
        // taking the daemon down
        send(addr, body.as_bytes()).await;
        // and the daemon still accepts connections afterwards
        send(addr, &cipher.seal(body.as_bytes()).unwrap()).await;
    }
}
