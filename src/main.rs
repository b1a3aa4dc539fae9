//! Process entrypoint: loads configuration, opens the three input
//! pipes and the output pipe, wires the shared atomics between the
//! splicer, the switch controller, and the HTTP control surface, and
//! joins every thread on shutdown.
//!
//! Only the HTTP control surface runs on `tokio`; the data plane (three
//! `FIFOInput` readers, the splicer/writer, and the controller tick
//! loop) is plain OS threads, per the concurrency model the splicer's
//! own design mandates.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ts_relay::config::RelayConfig;
use ts_relay::control::api::{self, ApiState};
use ts_relay::control::{ControlState, SceneChangeEvent, SwitchController};
use ts_relay::metrics::RelayMetrics;
use ts_relay::output::OutputWriter;
use ts_relay::source::{FIFOInput, ReadinessEvent, SourceKind};
use ts_relay::splicer::StreamSplicer;
use ts_relay::ts::psi::STREAM_TYPE_H264;

const SHUTDOWN_JOIN_DEADLINE: Duration = Duration::from_secs(1);

fn main() -> ExitCode {
    env_logger::init();

    let config = match RelayConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            log::error!("startup: {e}");
            return ExitCode::FAILURE;
        }
    };

    log::info!(
        "starting ts-relay: camera={} drone={} fallback={} output={} http_port={}",
        config.camera_pipe,
        config.drone_pipe,
        config.fallback_pipe,
        config.output_pipe,
        config.http_port
    );

    let metrics = Arc::new(RelayMetrics::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let (readiness_tx, readiness_rx) = mpsc::channel::<ReadinessEvent>();
    let readiness_log = thread::spawn(move || {
        while let Ok(event) = readiness_rx.recv() {
            log::info!("{}: ready={}", event.source, event.ready);
        }
    });

    let camera = FIFOInput::spawn(
        SourceKind::Camera,
        config.camera_pipe.clone(),
        config.buffer_packets,
        readiness_tx.clone(),
        Arc::clone(&metrics),
    );
    let drone = FIFOInput::spawn(
        SourceKind::Drone,
        config.drone_pipe.clone(),
        config.buffer_packets,
        readiness_tx.clone(),
        Arc::clone(&metrics),
    );
    let fallback = FIFOInput::spawn(
        SourceKind::Fallback,
        config.fallback_pipe.clone(),
        config.buffer_packets,
        readiness_tx,
        Arc::clone(&metrics),
    );

    let mut sources = HashMap::new();
    sources.insert(SourceKind::Camera, Arc::clone(&camera));
    sources.insert(SourceKind::Drone, Arc::clone(&drone));
    sources.insert(SourceKind::Fallback, Arc::clone(&fallback));

    let last_output_write = Arc::new(AtomicU64::new(0));
    let writer = OutputWriter::new(
        config.output_pipe.clone(),
        config.psi_repeat_interval,
        STREAM_TYPE_H264,
        None,
        Arc::clone(&last_output_write),
    );

    let (command_tx, command_rx) = mpsc::channel();
    let (scene_tx, scene_rx) = mpsc::channel::<SceneChangeEvent>();

    let splicer_shutdown = Arc::clone(&shutdown);
    let splicer_metrics = Arc::clone(&metrics);
    let splicer_handle = thread::spawn(move || {
        let mut splicer = StreamSplicer::new(sources, writer, splicer_metrics);
        splicer.run(&command_rx, &splicer_shutdown);
    });

    let control_state = ControlState::new();

    let controller_shutdown = Arc::clone(&shutdown);
    let controller_state = Arc::clone(&control_state);
    let controller_camera = Arc::clone(&camera);
    let controller_drone = Arc::clone(&drone);
    let controller_fallback = Arc::clone(&fallback);
    let controller_handle = thread::spawn(move || {
        let mut controller = SwitchController::new(
            controller_camera,
            controller_drone,
            controller_fallback,
            controller_state,
            command_tx,
            scene_tx,
        );
        controller.run(&controller_shutdown);
    });

    // Bridges the controller's plain-thread scene-change channel onto
    // the tokio-side unbounded channel the notifier task reads from,
    // without pulling the async runtime into the sync data plane.
    let (tokio_scene_tx, tokio_scene_rx) = tokio::sync::mpsc::unbounded_channel::<SceneChangeEvent>();
    let bridge_handle = thread::spawn(move || {
        while let Ok(event) = scene_rx.recv() {
            if tokio_scene_tx.send(event).is_err() {
                break;
            }
        }
    });

    let http_shutdown = Arc::clone(&shutdown);
    let http_port = config.http_port;
    let controller_url = config.controller_url.clone();
    let api_state = ApiState::new(
        Arc::clone(&control_state),
        Arc::clone(&last_output_write),
        Arc::clone(&metrics),
    );
    let http_handle = thread::spawn(move || {
        run_http_thread(http_port, api_state, tokio_scene_rx, controller_url, http_shutdown);
    });

    wait_for_shutdown_signal();
    shutdown.store(true, Ordering::Release);

    camera.shutdown();
    drone.shutdown();
    fallback.shutdown();

    for (name, handle) in [
        ("splicer", splicer_handle),
        ("controller", controller_handle),
        ("http", http_handle),
        ("scene bridge", bridge_handle),
        ("readiness log", readiness_log),
    ] {
        if handle.join().is_err() {
            log::warn!("{name} thread panicked during shutdown");
        }
    }

    log::info!(
        "final metrics: malformed_packets={} timestamp_underflows={} splices={} reconnects={}",
        metrics.malformed_packets(),
        metrics.timestamp_underflows(),
        metrics.splices(),
        metrics.reconnects(),
    );
    log::info!("shutdown complete");
    ExitCode::SUCCESS
}

/// Blocks the main thread until SIGINT or SIGTERM, using a tiny
/// current-thread runtime dedicated to signal waiting so the rest of
/// the process stays entirely synchronous.
fn wait_for_shutdown_signal() {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to build signal-wait runtime: {e}, shutting down immediately");
            return;
        }
    };
    rt.block_on(async {
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("failed to install SIGTERM handler: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("received SIGINT"),
                _ = term.recv() => log::info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("received ctrl-c");
        }
    });
}

/// Runs the axum control API and the scene-change notifier on a
/// dedicated multi-thread tokio runtime, until `shutdown` is observed.
fn run_http_thread(
    port: u16,
    api_state: ApiState,
    scene_changes: tokio::sync::mpsc::UnboundedReceiver<SceneChangeEvent>,
    controller_url: Option<url::Url>,
    shutdown: Arc<AtomicBool>,
) {
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to build HTTP runtime: {e}");
            return;
        }
    };

    rt.block_on(async move {
        tokio::spawn(api::run_notifier(scene_changes, controller_url));

        let app = api::router(api_state);
        let addr = format!("0.0.0.0:{port}");
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                log::error!("control API: failed to bind {addr}: {e}");
                return;
            }
        };
        log::info!("control API listening on {addr}");

        let shutdown_poll = async move {
            while !shutdown.load(Ordering::Acquire) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };

        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_poll)
            .await
        {
            log::error!("control API server error: {e}");
        }
    });

    rt.shutdown_timeout(SHUTDOWN_JOIN_DEADLINE);
}
