//! WebSocket front end.
//!
//! One accept thread polls a non-blocking listener; every accepted
//! connection gets its own session thread. A connection can act as a camera
//! (frames, heartbeats), as a viewer (queries, subscriptions) or both.

mod session;

use anyhow::{anyhow, Context, Result};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::router::Router;

pub use session::Session;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    /// Read timeout of a session socket; bounds push latency and shutdown time.
    pub session_poll: Duration,
    /// Time allowed for the WebSocket handshake.
    pub handshake_timeout: Duration,
    /// A peer that accepts no data for this long is dropped.
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8765".to_string(),
            session_poll: Duration::from_millis(20),
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting, close every session and wait for their threads.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("router server thread panicked"))?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .map(|join| !join.is_finished())
            .unwrap_or(false)
    }
}

pub struct RouterServer {
    cfg: ServerConfig,
    router: Arc<Router>,
}

impl RouterServer {
    pub fn new(cfg: ServerConfig, router: Arc<Router>) -> Self {
        Self { cfg, router }
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "router configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let router = self.router;
        let join = std::thread::Builder::new()
            .name("router-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_accept(listener, cfg, router, shutdown_thread) {
                    log::error!("router server stopped: {}", err);
                }
            })?;
        log::info!("router listening on ws://{}", addr);

        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_accept(
    listener: TcpListener,
    cfg: ServerConfig,
    router: Arc<Router>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut sessions: Vec<JoinHandle<()>> = Vec::new();
    let result = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let local = stream.local_addr()?;
                if local.ip().is_loopback() && !peer.ip().is_loopback() {
                    log::warn!("rejecting non-loopback peer {}", peer);
                    continue;
                }
                let session = Session::new(router.clone(), cfg.clone(), shutdown.clone());
                let spawned = std::thread::Builder::new()
                    .name(format!("session-{}", peer))
                    .spawn(move || session.run(stream, peer));
                match spawned {
                    Ok(join) => sessions.push(join),
                    Err(err) => log::error!("failed to start session for {}: {}", peer, err),
                }
                sessions.retain(|join| !join.is_finished());
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => break Err(err.into()),
        }
    };
    shutdown.store(true, Ordering::SeqCst);
    for join in sessions {
        if join.join().is_err() {
            log::error!("session thread panicked");
        }
    }
    result
}
