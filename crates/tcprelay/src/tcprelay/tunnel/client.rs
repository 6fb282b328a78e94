use std::{io, net::SocketAddrV4, sync::Arc, time::Duration};

use rand::{RngExt, rng};
use thiserror::Error;
use tokio::{net::TcpStream, sync::watch, task::JoinSet, time};

use crate::tcprelay::{
    telemetry::{self, Engine, SessionInfo, SharedSessions},
    tunnel::{
        dial,
        frame::{self, ClientId, ProtocolError, RegistrationToken, Response},
        session::{self, ActiveSessions, RelayOptions},
        wait_shutdown,
    },
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const PORT_IN_USE_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Relay registration address (`host:port`).
    pub server_addr: String,
    /// Local service each paired connection is spliced to.
    pub target_addr: String,
    /// Address the relay should listen on for us.
    pub public_addr: SocketAddrV4,
    pub client_id: ClientId,
    pub dial_timeout: Duration,
    /// How long a registered tunnel waits for a user before registering afresh.
    pub response_timeout: Duration,
    pub max_sessions: usize,
    pub relay: RelayOptions,
}

#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("dial relay {addr}: {source}")]
    DialRelay {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("relay reports {0} already in use")]
    PortInUse(SocketAddrV4),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("dial target {addr}: {source}")]
    DialTarget {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Keeps registrations open at a relay and splices every paired user onto the local
/// target.
pub struct Client {
    opts: ClientOptions,
    sessions: SharedSessions,
    active: Arc<ActiveSessions>,
}

impl Client {
    pub fn new(mut opts: ClientOptions, sessions: SharedSessions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: server_addr is required");
        }
        if opts.target_addr.trim().is_empty() {
            anyhow::bail!("tunnel: target_addr is required");
        }
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = Duration::from_secs(5);
        }
        opts.max_sessions = opts.max_sessions.max(1);
        Ok(Self {
            opts,
            sessions,
            active: Arc::new(ActiveSessions::default()),
        })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            server = %self.opts.server_addr,
            public = %self.opts.public_addr,
            target = %self.opts.target_addr,
            client = %self.opts.client_id,
            "tunnel: starting"
        );

        let mut running: JoinSet<()> = JoinSet::new();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if *shutdown.borrow() {
                break;
            }
            while running.try_join_next().is_some() {}

            if running.len() >= self.opts.max_sessions {
                tokio::select! {
                    _ = wait_shutdown(&mut shutdown) => break,
                    _ = running.join_next() => {}
                }
                continue;
            }

            let attempt = tokio::select! {
                _ = wait_shutdown(&mut shutdown) => break,
                r = self.attempt() => r,
            };

            let delay = match attempt {
                Ok((relay, target)) => {
                    backoff = INITIAL_BACKOFF;
                    self.spawn_session(&mut running, relay, target);
                    continue;
                }
                Err(AttemptError::Protocol(ProtocolError::Timeout)) => {
                    tracing::debug!(server = %self.opts.server_addr, "tunnel: no user yet; registering again");
                    continue;
                }
                Err(AttemptError::PortInUse(addr)) => {
                    tracing::warn!(
                        public = %addr,
                        cooldown = %humantime::format_duration(PORT_IN_USE_COOLDOWN),
                        "tunnel: public address in use"
                    );
                    PORT_IN_USE_COOLDOWN
                }
                Err(err) => {
                    let delay = jittered(backoff);
                    tracing::warn!(
                        server = %self.opts.server_addr,
                        err = %err,
                        backoff = %humantime::format_duration(delay),
                        "tunnel: attempt failed; retrying"
                    );
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    delay
                }
            };

            tokio::select! {
                _ = wait_shutdown(&mut shutdown) => break,
                _ = time::sleep(delay) => {}
            }
        }

        self.active.cancel_all();
        while running.join_next().await.is_some() {}
        tracing::info!(server = %self.opts.server_addr, "tunnel: stopped");
        Ok(())
    }

    /// One registration: dial, register, wait for the relay to pair a user, dial the target.
    pub async fn attempt(&self) -> Result<(TcpStream, TcpStream), AttemptError> {
        let server = self.opts.server_addr.trim();
        let mut relay = dial(server, self.opts.dial_timeout)
            .await
            .map_err(|source| AttemptError::DialRelay {
                addr: server.to_string(),
                source,
            })?;

        let token = RegistrationToken::new(self.opts.public_addr, self.opts.client_id);
        frame::write_registration(&mut relay, &token).await?;
        tracing::debug!(server = %server, public = %self.opts.public_addr, "tunnel: registered");

        match frame::read_response(&mut relay, self.opts.response_timeout).await? {
            Response::Ok => {}
            Response::PortInUse => return Err(AttemptError::PortInUse(self.opts.public_addr)),
        }

        let target_addr = self.opts.target_addr.trim();
        let target = dial(target_addr, self.opts.dial_timeout)
            .await
            .map_err(|source| AttemptError::DialTarget {
                addr: target_addr.to_string(),
                source,
            })?;
        Ok((relay, target))
    }

    fn spawn_session(&self, running: &mut JoinSet<()>, relay: TcpStream, target: TcpStream) {
        let info = SessionInfo {
            id: telemetry::new_session_id("c"),
            engine: Engine::Tunnel,
            external: relay.peer_addr().map(|a| a.to_string()).unwrap_or_default(),
            tunnel: relay.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            target: self.opts.target_addr.clone(),
            started_at_unix_ms: telemetry::now_unix_ms(),
        };
        tracing::info!(sid = %info.id, target = %info.target, "tunnel: user paired");

        let opts = self.opts.relay.clone();
        let sessions = self.sessions.clone();
        let active = self.active.clone();
        running.spawn(async move {
            session::run_tracked(
                info,
                relay,
                target,
                opts,
                &sessions,
                &active,
                ("to_target", "to_relay"),
            )
            .await;
        });
    }
}

/// Adds up to 25% random jitter.
fn jittered(base: Duration) -> Duration {
    let spread = (base.as_millis() / 4) as u64;
    base + Duration::from_millis(rng().random_range(0..=spread))
}
