//! Registration-based TCP tunneling.
//!
//! A tunnel client behind NAT sends one fixed-size registration frame to a relay; the
//! relay opens a public listener for the requested address and splices the first
//! external connection onto that tunnel connection.

pub mod client;
pub mod entry;
pub mod exit;
pub mod frame;
pub mod reactor;
pub mod registry;
pub mod server;
pub mod session;

use std::{io, net::SocketAddr, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::watch,
};

/// Connects with an upper bound on the whole attempt.
pub(crate) async fn dial(addr: impl ToSocketAddrs, timeout: Duration) -> io::Result<TcpStream> {
    tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
}

/// Resolves once `shutdown` turns `true` (or its sender is gone).
pub(crate) async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|v| *v).await;
}

/// Hands every accepted connection to `on_conn` until shutdown. Accept errors are
/// logged and retried.
pub(crate) async fn accept_until_shutdown(
    role: &'static str,
    ln: &TcpListener,
    mut shutdown: watch::Receiver<bool>,
    mut on_conn: impl FnMut(TcpStream, SocketAddr),
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            accepted = ln.accept() => match accepted {
                Ok((stream, peer)) => on_conn(stream, peer),
                Err(err) => {
                    tracing::warn!(role, err = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
}
