//! Kickoff task server.
//!
//! One TCP listener, one reply per request frame, one shared state behind
//! a mutex so every database mutation is serialized exactly as if a
//! single thread owned it. Periodic work (stats logging, zombie reaping)
//! runs between requests from interval tasks holding the same lock.

use std::net::SocketAddr;
use std::sync::Arc;

use kickoff_proto::{
    read_frame, write_frame, SERVER_STATS_MIN_INTERVAL_SECONDS,
    SERVER_TASK_CLEANUP_INTERVAL_SECONDS, WORKER_HEARTBEAT_TIMEOUT_SECONDS,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};

mod handler;

pub use handler::{ServerState, ServerStats};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind task server on port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },
    #[error("i/o error accepting connections: {0}")]
    Accept(#[from] std::io::Error),
}

/// The task server: owns the listener and the shared request state.
pub struct TaskServer {
    listener: TcpListener,
    state: Arc<Mutex<ServerState>>,
}

impl TaskServer {
    /// Bind `0.0.0.0:<port>`. Port 0 picks an ephemeral port, which the
    /// integration tests rely on.
    pub async fn bind(port: u16) -> Result<TaskServer, ServerError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| ServerError::Bind { port, source })?;
        Ok(TaskServer {
            listener,
            state: Arc::new(Mutex::new(ServerState::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Serve until ctrl-c.
    ///
    /// Spawns the stats and reaper tickers, then accepts connections;
    /// each connection is handled frame-at-a-time on its own task. A
    /// malformed request earns a `BadRequest` reply, never a server exit.
    pub async fn run(self) -> Result<(), ServerError> {
        if let Ok(addr) = self.local_addr() {
            tracing::info!(%addr, "task server listening");
        }

        let stats_task = tokio::spawn(run_stats_ticker(self.state.clone()));
        let reaper_task = tokio::spawn(run_zombie_reaper(self.state.clone()));

        let result = loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "client connected");
                            tokio::spawn(handle_connection(stream, peer, self.state.clone()));
                        }
                        Err(e) => {
                            // Accept failures are transient (fd pressure,
                            // aborted handshakes); keep serving.
                            tracing::warn!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested, stopping task server");
                    break Ok(());
                }
            }
        };

        stats_task.abort();
        reaper_task.abort();
        result
    }
}

/// Strict request/reply alternation per connection: read one frame,
/// answer one frame.
async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, state: Arc<Mutex<ServerState>>) {
    loop {
        let request = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(%peer, "client disconnected");
                break;
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "error reading request frame");
                break;
            }
        };

        let reply = state.lock().await.handle_request(&request);

        if let Err(e) = write_frame(&mut stream, &reply).await {
            tracing::warn!(%peer, error = %e, "error writing reply frame");
            break;
        }
    }
}

async fn run_stats_ticker(state: Arc<Mutex<ServerState>>) {
    let mut ticker = interval(Duration::from_secs(SERVER_STATS_MIN_INTERVAL_SECONDS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick

    loop {
        ticker.tick().await;
        let state = state.lock().await;
        let db_stats = state.db.stats();
        tracing::info!(
            succeeded = state.stats.succeeded_requests,
            failed = state.stats.failed_requests,
            bad = state.stats.bad_requests,
            pending = db_stats.num_pending,
            running = db_stats.num_running,
            canceling = db_stats.num_canceling,
            finished = db_stats.num_finished,
            "server stats"
        );
    }
}

async fn run_zombie_reaper(state: Arc<Mutex<ServerState>>) {
    let mut ticker = interval(Duration::from_secs(SERVER_TASK_CLEANUP_INTERVAL_SECONDS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let reaped = {
            let mut state = state.lock().await;
            state.db.cleanup_zombie_tasks(WORKER_HEARTBEAT_TIMEOUT_SECONDS)
        };
        if reaped > 0 {
            tracing::info!(count = reaped, "reaped zombie tasks");
        }
    }
}
