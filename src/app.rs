//! Application context and startup/shutdown sequencing.
//!
//! # Startup order
//!
//! 1. Bootstrap the producer's config file (warn on failure)
//! 2. Spawn the pipeline (fatal on failure)
//! 3. Start draining the pipeline output
//! 4. Wait for the producer to authenticate (timeout is degraded, not fatal)
//! 5. Bind the metadata listener and start the relay
//! 6. Bind the audio listener
//!
//! The drain starts before readiness so the transformer never blocks on a
//! full stdout pipe while the producer is still logging in.
//!
//! # Shutdown
//!
//! Cancelling the shared token stops every loop and closes the listening
//! sockets. The pipeline is then sent SIGTERM and given a grace period,
//! after which it is killed.

// Rust guideline compliant 2026-02

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioListener, AudioRegistry, AudioSocketSettings, DrainEngine, DrainStats};
use crate::config::Config;
use crate::constants::{METADATA_WRITE_TIMEOUT, SHUTDOWN_GRACE};
use crate::metadata::{MetadataListener, MetadataRegistry, MetadataRelay, RelayState, RelayStats, WebSocketSource};
use crate::pipeline::{ensure_producer_config, Pipeline, ReadinessGate};

/// State shared by every component of a running server.
#[derive(Debug, Clone)]
pub struct AppContext {
    /// Effective configuration.
    pub config: Config,
    /// Connected audio clients.
    pub audio: Arc<AudioRegistry>,
    /// Connected metadata subscribers.
    pub metadata: Arc<MetadataRegistry>,
    /// Producer readiness, also consumed by the HTTP proxy.
    pub readiness: ReadinessGate,
    /// Stops every loop when cancelled.
    pub cancel: CancellationToken,
}

/// A started server: pipeline, listeners, drain and relay.
#[derive(Debug)]
pub struct Server {
    ctx: AppContext,
    pipeline: Pipeline,
    audio_addr: SocketAddr,
    metadata_addr: SocketAddr,
    relay_state: watch::Receiver<RelayState>,
    drain: JoinHandle<DrainStats>,
    relay: JoinHandle<RelayStats>,
    audio_accept: JoinHandle<()>,
    metadata_accept: JoinHandle<()>,
}

impl Server {
    /// Run the startup sequence.
    ///
    /// Fails if the pipeline cannot be spawned, a listener cannot be bound,
    /// or `cancel` fires before the listeners are up. On failure every task
    /// spawned so far is stopped; `cancel` itself is left untouched.
    pub async fn start(config: Config, cancel: CancellationToken) -> Result<Self> {
        if let Err(e) = ensure_producer_config(&config.producer_config_dir) {
            log::warn!(
                "[Server] Could not write producer config in {}: {}",
                config.producer_config_dir.display(),
                e
            );
        }

        let mut pipeline = Pipeline::start(&config.pipeline_config()).context("Failed to start audio pipeline")?;
        let output = pipeline
            .take_output()
            .context("Pipeline output already taken")?;

        let ctx = AppContext {
            audio: Arc::new(AudioRegistry::new(config.client_queue_depth)),
            metadata: Arc::new(MetadataRegistry::new(METADATA_WRITE_TIMEOUT)),
            readiness: pipeline.readiness(),
            cancel: cancel.child_token(),
            config,
        };
        let startup_guard = ctx.cancel.clone().drop_guard();

        let drain = tokio::spawn(
            DrainEngine::new(output, Arc::clone(&ctx.audio), ctx.config.chunk_size).run(ctx.cancel.clone()),
        );

        log::info!(
            "[Server] Waiting up to {}s for the producer to authenticate",
            ctx.config.ready_timeout_secs
        );
        let ready = tokio::select! {
            () = ctx.cancel.cancelled() => None,
            ready = pipeline.wait_ready(ctx.config.ready_timeout()) => Some(ready),
        };
        let Some(ready) = ready else {
            pipeline.terminate();
            anyhow::bail!("Shutdown requested during startup");
        };
        if !ready {
            log::warn!("[Server] Producer did not report ready in time; continuing degraded");
        }

        let metadata_listener = MetadataListener::bind(ctx.config.metadata_addr()?)
            .await
            .context("Failed to bind metadata listener")?;
        let metadata_addr = metadata_listener.local_addr()?;
        let metadata_accept = tokio::spawn(metadata_listener.run(Arc::clone(&ctx.metadata), ctx.cancel.clone()));

        let relay = MetadataRelay::new(
            WebSocketSource::new(ctx.config.upstream_events_url.clone()),
            Arc::clone(&ctx.metadata),
            ctx.config.relay_retry_delay(),
        );
        let relay_state = relay.state();
        let relay = tokio::spawn(relay.run(ctx.cancel.clone()));

        let settings = AudioSocketSettings {
            send_buffer_size: ctx.config.send_buffer_size,
            write_timeout: ctx.config.client_timeout(),
        };
        let audio_listener = AudioListener::bind(ctx.config.audio_addr()?, settings)
            .await
            .context("Failed to bind audio listener")?;
        let audio_addr = audio_listener.local_addr()?;
        let audio_accept = tokio::spawn(audio_listener.run(Arc::clone(&ctx.audio), ctx.cancel.clone()));

        log::info!("[Server] TigerTunes relay up");
        log::info!(
            "[Server]   Audio stream:    tcp://{}  (s16le, {} Hz, {} ch)",
            audio_addr,
            ctx.config.sample_rate,
            ctx.config.channels
        );
        log::info!("[Server]   Metadata stream: tcp://{}", metadata_addr);
        log::info!("[Server]   Upstream events: {}", ctx.config.upstream_events_url);

        startup_guard.disarm();
        Ok(Self {
            ctx,
            pipeline,
            audio_addr,
            metadata_addr,
            relay_state,
            drain,
            relay,
            audio_accept,
            metadata_accept,
        })
    }

    /// Bound audio address.
    pub fn audio_addr(&self) -> SocketAddr {
        self.audio_addr
    }

    /// Bound metadata address.
    pub fn metadata_addr(&self) -> SocketAddr {
        self.metadata_addr
    }

    /// Shared application context.
    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Observe the relay's connection state.
    pub fn relay_state(&self) -> watch::Receiver<RelayState> {
        self.relay_state.clone()
    }

    /// Stop everything and reap the pipeline.
    pub async fn shutdown(mut self) {
        log::info!("[Server] Shutting down");
        self.ctx.cancel.cancel();
        self.pipeline.terminate();

        join_logged("audio listener", self.audio_accept).await;
        join_logged("metadata listener", self.metadata_accept).await;
        if let Some(stats) = join_logged("relay", self.relay).await {
            log::debug!("[Server] Relay stats: {:?}", stats);
        }
        if let Some(stats) = join_logged("drain", self.drain).await {
            log::debug!("[Server] Drain stats: {:?}", stats);
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, self.pipeline.wait()).await {
            Ok(Ok(status)) => log::info!("[Server] Pipeline exited: {}", status),
            Ok(Err(e)) => log::warn!("[Server] Waiting for pipeline failed: {}", e),
            Err(_) => {
                log::warn!(
                    "[Server] Pipeline still running after {}s; killing",
                    SHUTDOWN_GRACE.as_secs()
                );
                self.pipeline.kill().await;
            }
        }
    }
}

async fn join_logged<T>(name: &str, handle: JoinHandle<T>) -> Option<T> {
    match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            log::warn!("[Server] {} task failed: {}", name, e);
            None
        }
        Err(_) => {
            log::warn!("[Server] {} task did not stop within {}s", name, SHUTDOWN_GRACE.as_secs());
            None
        }
    }
}

/// Start the server and run until SIGINT or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let server = match Server::start(config, cancel.clone()).await {
        Ok(server) => server,
        Err(e) if cancel.is_cancelled() => {
            log::info!("[Server] {:#}", e);
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    cancel.cancelled().await;
    server.shutdown().await;
    log::info!("[Server] Stopped");
    Ok(())
}

/// Resolves on the first SIGINT (Ctrl-C) or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("[Server] Received SIGINT"),
            Err(e) => {
                log::error!("[Server] Could not listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                log::info!("[Server] Received SIGTERM");
            }
            Err(e) => {
                log::error!("[Server] Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
