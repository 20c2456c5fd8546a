// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! Mouse-pointer hiding: one `unclutter` process shared across sessions.

use std::process::Stdio;

use crate::error::{OptError, Result};
use crate::state::{RefCounted, SessionId};

const UNCLUTTER_IDLE_SECONDS: &str = "1";

pub struct MouseManager {
    counted: RefCounted<tokio::process::Child>,
}

impl Default for MouseManager {
    fn default() -> Self {
        Self {
            counted: RefCounted::new("mouse"),
        }
    }
}

impl MouseManager {
    pub async fn acquire(&self, session: SessionId) -> Result<()> {
        self.counted
            .acquire(session, || async {
                let child = tokio::process::Command::new("unclutter")
                    .args(["-idle", UNCLUTTER_IDLE_SECONDS])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                    .map_err(|e| OptError::System(format!("could not spawn unclutter: {e}")))?;
                tracing::info!("unclutter spawned (pid {:?})", child.id());
                Ok(child)
            })
            .await
    }

    pub async fn release(&self, session: SessionId) {
        self.counted
            .release(session, |mut child| async move {
                match child.kill().await {
                    Ok(()) => tracing::info!("unclutter stopped"),
                    Err(e) => tracing::warn!("Could not stop unclutter: {e}"),
                }
            })
            .await;
    }
}
