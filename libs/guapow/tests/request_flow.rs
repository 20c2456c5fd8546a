// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! End-to-end request flow: sealed TCP request in, governor altered while
//! the target lives, originals restored once the tracked tree is gone.

use std::sync::Arc;
use std::time::{Duration, Instant};

use guapow::appliers::ProcessAppliers;
use guapow::crypto::RequestCipher;
use guapow::procs::ProcFs;
use guapow::request::OptimizationRequest;
use guapow::server::OptimizerServer;
use guapow::session::SessionContext;
use guapow::settings::Settings;
use guapow::state::SharedState;
use guapow::state::compositor::CompositorManager;
use guapow::state::cpu::CpuPerformanceManager;
use guapow::state::gpu::GpuManager;
use guapow::state::mouse::MouseManager;
use guapow::state::stopped::StoppedProcessManager;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

async fn fake_target(proc_root: &std::path::Path, pid: u32) {
    let dir = proc_root.join(pid.to_string());
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("comm"), "game\n").await.unwrap();
    tokio::fs::write(
        dir.join("stat"),
        format!("{pid} (game) S 1 0 0 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 0 0 0"),
    )
    .await
    .unwrap();
}

async fn governor(sys_root: &std::path::Path) -> String {
    tokio::fs::read_to_string(sys_root.join("cpu0/cpufreq/scaling_governor"))
        .await
        .unwrap()
        .trim()
        .to_string()
}

#[tokio::test]
async fn test_sealed_request_alters_and_restores_the_governor() {
    let proc_root = tempfile::tempdir().unwrap();
    let sys_root = tempfile::tempdir().unwrap();
    let key_dir = tempfile::tempdir().unwrap();

    let cpufreq = sys_root.path().join("cpu0/cpufreq");
    tokio::fs::create_dir_all(&cpufreq).await.unwrap();
    tokio::fs::write(cpufreq.join("scaling_governor"), "schedutil\n")
        .await
        .unwrap();
    fake_target(proc_root.path(), 5150).await;

    let settings = Settings {
        port: 0,
        check_finished_interval: 0.5,
        optimize_children_timeout: 0.0,
        ..Default::default()
    };
    let procs = ProcFs::with_root(proc_root.path());
    let shared = SharedState {
        cpu: CpuPerformanceManager::with_sys_cpu_root(sys_root.path()),
        gpu: GpuManager::new(&settings),
        compositor: CompositorManager::new(None, procs.clone()),
        mouse: MouseManager::default(),
        stopped: StoppedProcessManager::new(procs.clone()),
    };
    let ctx = SessionContext::with_parts(settings, procs, ProcessAppliers::default(), shared);

    let key_path = key_dir.path().join("opt.key");
    let server = OptimizerServer::bind_with_key_path(Arc::clone(&ctx), key_path.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let _server_task = tokio::spawn(server.run(shutdown_rx));

    // the client reads the published key, seals the body and sends it
    let key = tokio::fs::read_to_string(&key_path).await.unwrap();
    let cipher = RequestCipher::from_hex(&key).unwrap();
    let body = OptimizationRequest {
        pid: 5150,
        user: "player".into(),
        config: Some("cpu.performance".into()),
        ..Default::default()
    }
    .to_body();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(&cipher.seal(body.as_bytes()).unwrap())
        .await
        .unwrap();
    stream.shutdown().await.unwrap();
    let mut sink = Vec::new();
    let _ = stream.read_to_end(&mut sink).await;

    // altered while the target lives
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if governor(sys_root.path()).await == "performance" {
            break;
        }
        assert!(Instant::now() < deadline, "governor never became performance");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // target exits; the session restores the captured original
    tokio::fs::remove_dir_all(proc_root.path().join("5150"))
        .await
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if governor(sys_root.path()).await == "schedutil" {
            break;
        }
        assert!(Instant::now() < deadline, "governor never restored");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
