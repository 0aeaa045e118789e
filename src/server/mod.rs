//! Server lifecycle: bind, serve, sweep, drain.

pub mod download;
pub mod pake_routes;
pub mod routes;
pub mod state;
pub mod upload;
pub mod ws;

pub use state::AppState;

use crate::common::{Role, ServerConfig};
use crate::host::session as host_session;
use crate::metrics::MetricSink;
use crate::transfer::limiter;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cap on draining in-flight requests at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// A running serving process: owns the listener, the session store, and
/// the background sweepers. Everything is released by `shutdown`.
pub struct ServerInstance {
    state: AppState,
    addr: SocketAddr,
    cancel: CancellationToken,
    serve_task: JoinHandle<()>,
    sweeper_task: JoinHandle<()>,
}

impl ServerInstance {
    /// Bind and start serving `config`. The listener port is resolved here
    /// (port 0 lets the OS pick), so callers read it back from `addr`.
    pub async fn start(config: ServerConfig, metrics: Arc<dyn MetricSink>) -> Result<Self> {
        validate_config(&config)?;

        let bind = SocketAddr::from((config.bind, config.port));
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind {}", bind))?;
        let addr = listener.local_addr().context("read bound address")?;

        let state = AppState::new(config, metrics);
        let app = routes::create_router(&state);

        let cancel = CancellationToken::new();

        let sweeper_task = tokio::spawn(run_sweepers(state.clone(), cancel.clone()));

        let serve_cancel = cancel.clone();
        let serve_task = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "server exited with error");
            }
        });

        tracing::info!(%addr, role = ?state.config.role, "serving");
        Ok(Self {
            state,
            addr,
            cancel,
            serve_task,
            sweeper_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn token(&self) -> &str {
        self.state.token.as_str()
    }

    /// URL peers use to fetch (send modes) or push (host mode).
    pub fn share_url(&self) -> String {
        let path = match self.state.config.role {
            Role::Host => "u",
            Role::SendFile | Role::SendText => "d",
        };
        format!("http://{}/{}/{}", self.addr, path, self.token())
    }

    /// Stop sweepers, close the listener, and drain with a 30 s cap.
    pub async fn shutdown(self) {
        self.cancel.cancel();

        let _ = self.sweeper_task.await;
        if tokio::time::timeout(SHUTDOWN_GRACE, self.serve_task)
            .await
            .is_err()
        {
            tracing::warn!("shutdown grace period elapsed with requests still in flight");
        }

        tracing::info!("server stopped");
    }
}

fn validate_config(config: &ServerConfig) -> Result<()> {
    match config.role {
        Role::SendFile => {
            let source = config
                .source
                .as_ref()
                .context("send-file mode needs a source path")?;
            anyhow::ensure!(source.exists(), "source {} not found", source.display());
        }
        Role::SendText => {
            anyhow::ensure!(config.text.is_some(), "send-text mode needs text");
        }
        Role::Host => {
            anyhow::ensure!(
                config.upload_dir.is_some(),
                "host mode needs an upload directory"
            );
        }
    }
    Ok(())
}

/// Periodic maintenance: stale upload sessions every 15 minutes, idle
/// rate-limiter entries every 30. Both stop at cancellation.
async fn run_sweepers(state: AppState, cancel: CancellationToken) {
    let mut session_tick = tokio::time::interval(host_session::SWEEP_INTERVAL);
    let mut limiter_tick = tokio::time::interval(limiter::SWEEP_INTERVAL);
    // Both fire immediately once; harmless
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = session_tick.tick() => {
                let evicted = state.sessions.evict_stale(host_session::IDLE_EVICTION);
                if evicted > 0 {
                    tracing::info!(evicted, "swept stale upload sessions");
                }
            }
            _ = limiter_tick.tick() => {
                if let Some(registry) = &state.limiters {
                    let evicted = registry.evict_idle(limiter::IDLE_EVICTION);
                    if evicted > 0 {
                        tracing::debug!(evicted, "swept idle rate limiters");
                    }
                }
            }
        }
    }
}
