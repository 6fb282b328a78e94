//! Dial-mode server: each connection names a target in its registration frame and the
//! exit dials it on the caller's behalf.

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
        frame::{self, Response},
        session::{self, ActiveSessions, RelayOptions},
    },
};

#[derive(Debug, Clone)]
pub struct ExitOptions {
    pub listen_addr: SocketAddr,
    pub registration_timeout: Duration,
    pub dial_timeout: Duration,
    /// Targets the exit may dial. Empty allows any.
    pub allow: Vec<SocketAddrV4>,
    pub relay: RelayOptions,
}

pub struct ExitServer {
    listen_addr: SocketAddr,
    inner: Arc<Inner>,
}

struct Inner {
    opts: ExitOptions,
    sessions: SharedSessions,
    active: ActiveSessions,
}

impl ExitServer {
    pub fn new(opts: ExitOptions, sessions: SharedSessions) -> Self {
        Self {
            listen_addr: opts.listen_addr,
            inner: Arc::new(Inner {
                opts,
                sessions,
                active: ActiveSessions::default(),
            }),
        }
    }

    pub fn bind(&self) -> anyhow::Result<TcpListener> {
        let ln = net::bind_reusable(self.listen_addr, 1024)
            .with_context(|| format!("exit: bind {}", self.listen_addr))?;
        TcpListener::from_std(ln).context("exit: adopt listener")
    }

    pub async fn serve(&self, ln: TcpListener, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(addr = %ln.local_addr()?, allow = self.inner.opts.allow.len(), "exit: listening");

        accept_until_shutdown("exit", &ln, shutdown, |stream, peer| {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_conn(inner, stream, peer).await {
                    tracing::info!(peer = %peer, err = %format!("{err:#}"), "exit: connection dropped");
                }
            });
        })
        .await;

        self.inner.active.cancel_all();
        Ok(())
    }
}

async fn handle_conn(inner: Arc<Inner>, mut conn: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
    let token = frame::read_registration(&mut conn, inner.opts.registration_timeout)
        .await
        .context("read registration")?;
    let target = token
        .target_addr()
        .with_context(|| format!("port {} out of range", token.port))?;

    if !inner.opts.allow.is_empty() && !inner.opts.allow.contains(&target) {
        anyhow::bail!("target {target} is not allowed");
    }

    let upstream = dial(target, inner.opts.dial_timeout)
        .await
        .with_context(|| format!("dial {target}"))?;

    frame::write_response(&mut conn, Response::Ok)
        .await
        .context("write OK")?;

    let info = SessionInfo {
        id: telemetry::new_session_id("x"),
        engine: Engine::Exit,
        external: peer.to_string(),
        tunnel: upstream.peer_addr().map(|a| a.to_string()).unwrap_or_default(),
        target: target.to_string(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    };
    tracing::info!(sid = %info.id, peer = %peer, client = %token.client_id, target = %target, "exit: dialed");

    session::run_tracked(
        info,
        conn,
        upstream,
        inner.opts.relay.clone(),
        &inner.sessions,
        &inner.active,
        ("to_target", "to_client"),
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
        tunnel::frame::{ClientId, RegistrationToken},
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

    async fn start(allow: Vec<SocketAddrV4>) -> (SocketAddr, watch::Sender<bool>) {
        let exit = ExitServer::new(
            ExitOptions {
                listen_addr: "127.0.0.1:0".parse().unwrap(),
                registration_timeout: Duration::from_secs(2),
                dial_timeout: Duration::from_secs(2),
                allow,
                relay: RelayOptions::default(),
            },
            Arc::new(SessionRegistry::new()),
        );
        let ln = exit.bind().unwrap();
        let addr = ln.local_addr().unwrap();
        let (stop, rx) = watch::channel(false);
        tokio::spawn(async move { exit.serve(ln, rx).await });
        (addr, stop)
    }

    async fn open(exit: SocketAddr, target: SocketAddrV4) -> TcpStream {
        let mut s = TcpStream::connect(exit).await.unwrap();
        let token = RegistrationToken::new(target, ClientId::parse("dialer").unwrap());
        frame::write_registration(&mut s, &token).await.unwrap();
        s
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dials_target_and_relays() {
        let target = echo_server().await;
        let (exit, _stop) = start(vec![]).await;

        let mut s = open(exit, target).await;
        let resp = frame::read_response(&mut s, Duration::from_secs(2)).await.unwrap();
        assert_eq!(resp, Response::Ok);

        s.write_all(b"through the exit").await.unwrap();
        let mut buf = [0u8; 16];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the exit");
    }

    #[tokio::test]
    async fn disallowed_target_is_closed() {
        let target = echo_server().await;
        let other = echo_server().await;
        let (exit, _stop) = start(vec![other]).await;

        let mut s = open(exit, target).await;
        let mut out = Vec::new();
        time::timeout(Duration::from_secs(2), s.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap_or_default();
        assert!(out.is_empty());
    }
}
