//! Dial-mode client: local users are carried to an exit, which dials the configured
//! target for them.

use std::{
    net::{SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::tcprelay::{
    net,
    telemetry::{self, Engine, SessionInfo, SharedSessions},
    tunnel::{
        accept_until_shutdown, dial,
        frame::{self, ClientId, RegistrationToken, Response},
        session::{self, ActiveSessions, RelayOptions},
    },
};

#[derive(Debug, Clone)]
pub struct EntryOptions {
    pub listen_addr: SocketAddr,
    pub exit_addr: String,
    /// Target the exit is asked to dial.
    pub target: SocketAddrV4,
    pub client_id: ClientId,
    pub dial_timeout: Duration,
    pub response_timeout: Duration,
    pub relay: RelayOptions,
}

pub struct EntryServer {
    listen_addr: SocketAddr,
    inner: Arc<Inner>,
}

struct Inner {
    opts: EntryOptions,
    sessions: SharedSessions,
    active: ActiveSessions,
}

impl EntryServer {
    pub fn new(opts: EntryOptions, sessions: SharedSessions) -> anyhow::Result<Self> {
        if opts.exit_addr.trim().is_empty() {
            anyhow::bail!("entry: exit_addr is required");
        }
        Ok(Self {
            listen_addr: opts.listen_addr,
            inner: Arc::new(Inner {
                opts,
                sessions,
                active: ActiveSessions::default(),
            }),
        })
    }

    pub fn bind(&self) -> anyhow::Result<TcpListener> {
        let ln = net::bind_reusable(self.listen_addr, 1024)
            .with_context(|| format!("entry: bind {}", self.listen_addr))?;
        TcpListener::from_std(ln).context("entry: adopt listener")
    }

    pub async fn serve(&self, ln: TcpListener, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            addr = %ln.local_addr()?,
            exit = %self.inner.opts.exit_addr,
            target = %self.inner.opts.target,
            "entry: listening"
        );

        accept_until_shutdown("entry", &ln, shutdown, |stream, peer| {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_user(inner, stream, peer).await {
                    tracing::info!(peer = %peer, err = %format!("{err:#}"), "entry: connection dropped");
                }
            });
        })
        .await;

        self.inner.active.cancel_all();
        Ok(())
    }
}

async fn handle_user(inner: Arc<Inner>, user: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
    let opts = &inner.opts;
    let exit_addr = opts.exit_addr.trim();
    let mut exit = dial(exit_addr, opts.dial_timeout)
        .await
        .with_context(|| format!("dial exit {exit_addr}"))?;

    let token = RegistrationToken::new(opts.target, opts.client_id);
    frame::write_registration(&mut exit, &token).await?;
    match frame::read_response(&mut exit, opts.response_timeout).await? {
        Response::Ok => {}
        Response::PortInUse => anyhow::bail!("exit refused {}", opts.target),
    }

    let info = SessionInfo {
        id: telemetry::new_session_id("e"),
        engine: Engine::Entry,
        external: peer.to_string(),
        tunnel: exit.peer_addr().map(|a| a.to_string()).unwrap_or_default(),
        target: opts.target.to_string(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    };
    tracing::info!(sid = %info.id, peer = %peer, exit = %exit_addr, "entry: connected");

    session::run_tracked(
        info,
        user,
        exit,
        opts.relay.clone(),
        &inner.sessions,
        &inner.active,
        ("to_exit", "to_user"),
    )
    .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        time,
    };

    use super::*;
    use crate::tcprelay::{
        telemetry::SessionRegistry,
        tunnel::exit::{ExitOptions, ExitServer},
    };

    async fn echo_server() -> SocketAddrV4 {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(addr) = ln.local_addr().unwrap() else {
            panic!("expected IPv4");
        };
        tokio::spawn(async move {
            while let Ok((mut s, _)) = ln.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn relay_opts() -> RelayOptions {
        RelayOptions {
            read_timeout: Duration::from_millis(200),
            chunk_size: 4096,
            queue_depth: 16,
        }
    }

    async fn start_entry(exit: SocketAddr, target: SocketAddrV4) -> (SocketAddr, watch::Sender<bool>) {
        let entry = EntryServer::new(
            EntryOptions {
                listen_addr: "127.0.0.1:0".parse().unwrap(),
                exit_addr: exit.to_string(),
                target,
                client_id: ClientId::parse("entry").unwrap(),
                dial_timeout: Duration::from_secs(2),
                response_timeout: Duration::from_secs(2),
                relay: relay_opts(),
            },
            Arc::new(SessionRegistry::new()),
        )
        .unwrap();
        let ln = entry.bind().unwrap();
        let addr = ln.local_addr().unwrap();
        let (stop, rx) = watch::channel(false);
        tokio::spawn(async move { entry.serve(ln, rx).await });
        (addr, stop)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn entry_and_exit_carry_user_to_target() {
        let target = echo_server().await;

        let exit = ExitServer::new(
            ExitOptions {
                listen_addr: "127.0.0.1:0".parse().unwrap(),
                registration_timeout: Duration::from_secs(2),
                dial_timeout: Duration::from_secs(2),
                allow: vec![],
                relay: relay_opts(),
            },
            Arc::new(SessionRegistry::new()),
        );
        let exit_ln = exit.bind().unwrap();
        let exit_addr = exit_ln.local_addr().unwrap();
        let (_exit_stop, rx) = watch::channel(false);
        tokio::spawn(async move { exit.serve(exit_ln, rx).await });

        let (entry, _entry_stop) = start_entry(exit_addr, target).await;

        let mut user = TcpStream::connect(entry).await.unwrap();
        user.write_all(b"two hops").await.unwrap();
        let mut buf = [0u8; 8];
        time::timeout(Duration::from_secs(3), user.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"two hops");
    }

    #[tokio::test]
    async fn refused_registration_closes_user() {
        // An exit stand-in that always answers EX.
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let fake_exit = ln.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = ln.accept().await {
                tokio::spawn(async move {
                    let _ = frame::read_registration(&mut s, Duration::from_secs(2)).await;
                    let _ = frame::write_response(&mut s, Response::PortInUse).await;
                });
            }
        });

        let target = echo_server().await;
        let (entry, _stop) = start_entry(fake_exit, target).await;

        let mut user = TcpStream::connect(entry).await.unwrap();
        let mut out = Vec::new();
        time::timeout(Duration::from_secs(3), user.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap_or_default();
        assert!(out.is_empty());
    }
}
