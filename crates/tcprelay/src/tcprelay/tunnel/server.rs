use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::tcprelay::{
    net,
    telemetry::{self, Engine, SessionInfo, SharedSessions},
    tunnel::{
        frame::{self, Response},
        registry::{self, ListenerRegistry, RegistryError},
        session::{self, ActiveSessions, RelayOptions},
        accept_until_shutdown, wait_shutdown,
    },
};

const REGISTRATION_BACKLOG: i32 = 1024;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: SocketAddr,
    /// How long a new tunnel connection may take to deliver its frame.
    pub registration_timeout: Duration,
    pub relay: RelayOptions,
}

/// Task-per-connection relay server.
pub struct Server {
    listen_addr: SocketAddr,
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<ListenerRegistry>,
    sessions: SharedSessions,
    active: ActiveSessions,
    registration_timeout: Duration,
    relay: RelayOptions,
}

impl Server {
    pub fn new(
        opts: ServerOptions,
        registry: Arc<ListenerRegistry>,
        sessions: SharedSessions,
    ) -> Self {
        Self {
            listen_addr: opts.listen_addr,
            inner: Arc::new(Inner {
                registry,
                sessions,
                active: ActiveSessions::default(),
                registration_timeout: opts.registration_timeout,
                relay: opts.relay,
            }),
        }
    }

    /// Sessions currently relaying.
    pub fn active_sessions(&self) -> usize {
        self.inner.active.len()
    }

    pub fn bind(&self) -> anyhow::Result<TcpListener> {
        let ln = net::bind_reusable(self.listen_addr, REGISTRATION_BACKLOG)
            .with_context(|| format!("relay: bind {}", self.listen_addr))?;
        TcpListener::from_std(ln).context("relay: adopt listener")
    }

    pub async fn serve(&self, ln: TcpListener, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(addr = %ln.local_addr()?, "relay: listening");

        accept_until_shutdown("relay", &ln, shutdown.clone(), |stream, peer| {
            let inner = self.inner.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_tunnel(inner, stream, peer, shutdown).await {
                    tracing::info!(peer = %peer, err = %format!("{err:#}"), "relay: tunnel dropped");
                }
            });
        })
        .await;

        tracing::info!(active = self.active_sessions(), "relay: stopped");
        self.inner.active.cancel_all();
        Ok(())
    }
}

enum Wait {
    External(io::Result<(TcpStream, SocketAddr)>),
    Evicted,
    TunnelLost(String),
    Shutdown,
}

async fn handle_tunnel(
    inner: Arc<Inner>,
    mut tunnel: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let token = frame::read_registration(&mut tunnel, inner.registration_timeout)
        .await
        .context("read registration")?;
    let target = token
        .target_addr()
        .with_context(|| format!("port {} out of range", token.port))?;
    let target = SocketAddr::V4(target);
    tracing::info!(peer = %peer, client = %token.client_id, target = %target, "relay: registration");

    let reg = inner.registry.clone();
    let client_id = token.client_id;
    let registered = tokio::task::spawn_blocking(move || reg.register(target, client_id, Some(peer)))
        .await
        .context("registry task")?;
    let lease = match registered {
        Ok(lease) => lease,
        Err(RegistryError::AddressInUse(addr)) => {
            tracing::info!(peer = %peer, addr = %addr, "relay: target in use; answering EX");
            frame::write_response(&mut tunnel, Response::PortInUse).await?;
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    let lease = lease
        .try_map(TcpListener::from_std)
        .context("adopt public listener")?;

    let mut eviction = lease.eviction();
    let mut one = [0u8; 1];
    let waited = tokio::select! {
        r = lease.listener().accept() => Wait::External(r),
        _ = registry::wait_evicted(&mut eviction) => Wait::Evicted,
        r = tunnel.read(&mut one) => Wait::TunnelLost(match r {
            Ok(0) => "closed".into(),
            Ok(_) => "unexpected data".into(),
            Err(err) => err.to_string(),
        }),
        _ = wait_shutdown(&mut shutdown) => Wait::Shutdown,
    };

    let (external, external_peer) = match waited {
        Wait::External(Ok(v)) => v,
        Wait::External(Err(err)) => {
            inner.registry.release(lease);
            return Err(err).context("accept external");
        }
        Wait::Evicted => {
            // The replacing registration is waiting on this socket; drop it straight away.
            drop(lease);
            tracing::info!(peer = %peer, target = %target, "relay: replaced by newer registration");
            return Ok(());
        }
        Wait::TunnelLost(reason) => {
            inner.registry.release(lease);
            tracing::info!(peer = %peer, target = %target, reason = %reason, "relay: tunnel lost before pairing");
            return Ok(());
        }
        Wait::Shutdown => {
            inner.registry.release(lease);
            return Ok(());
        }
    };
    inner.registry.release(lease);

    frame::write_response(&mut tunnel, Response::Ok)
        .await
        .context("write OK")?;

    let sid = telemetry::new_session_id("t");
    tracing::info!(sid = %sid, external = %external_peer, tunnel = %peer, target = %target, "relay: session paired");
    let info = SessionInfo {
        id: sid,
        engine: Engine::Threaded,
        external: external_peer.to_string(),
        tunnel: peer.to_string(),
        target: target.to_string(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    };
    session::run_tracked(
        info,
        external,
        tunnel,
        inner.relay.clone(),
        &inner.sessions,
        &inner.active,
        ("to_tunnel", "to_external"),
    )
    .await;
    Ok(())
}
