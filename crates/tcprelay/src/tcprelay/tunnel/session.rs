//! Task-per-direction relay.
//!
//! Every session runs four loops on the multi-threaded runtime: a receive loop and a
//! send loop per socket, joined by two bounded queues. The loops share one liveness
//! flag; whichever loop fails first flips it and the other three observe it at their
//! next suspension point.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};

use crate::tcprelay::telemetry::{self, SessionInfo, SessionRegistry};

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Upper bound on a single blocked read; expiry only re-checks liveness.
    pub read_timeout: Duration,
    pub chunk_size: usize,
    /// Chunks buffered per direction before the receive side waits.
    pub queue_depth: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            chunk_size: 10 * 1024,
            queue_depth: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionReport {
    /// Bytes written to `b` that were read from `a`.
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Session liveness. Starts `true`; `false` is terminal.
#[derive(Debug, Clone)]
pub struct AliveFlag(Arc<watch::Sender<bool>>);

impl Default for AliveFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl AliveFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self(Arc::new(tx))
    }

    pub fn is_alive(&self) -> bool {
        *self.0.borrow()
    }

    pub fn kill(&self) {
        self.0.send_replace(false);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

async fn wait_dead(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|alive| !*alive).await;
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: String,
    alive: AliveFlag,
}

impl SessionHandle {
    pub fn is_alive(&self) -> bool {
        self.alive.is_alive()
    }

    pub fn cancel(&self) {
        self.alive.kill();
    }
}

/// Starts relaying between `a` and `b` in the background.
pub fn spawn(
    id: String,
    a: TcpStream,
    b: TcpStream,
    opts: RelayOptions,
) -> (SessionHandle, JoinHandle<SessionReport>) {
    let alive = AliveFlag::new();
    let handle = SessionHandle {
        id: id.clone(),
        alive: alive.clone(),
    };
    let task = tokio::spawn(async move { run(&id, a, b, opts, alive).await });
    (handle, task)
}

/// Relays until either side closes or fails, then returns once all four loops ended.
///
/// Both sockets are owned by the loops and closed when the last of them returns.
pub async fn run(
    id: &str,
    a: TcpStream,
    b: TcpStream,
    opts: RelayOptions,
    alive: AliveFlag,
) -> SessionReport {
    let peer_a = a.peer_addr().ok();
    let peer_b = b.peer_addr().ok();
    tracing::debug!(sid = %id, a = ?peer_a, b = ?peer_b, "session: start");

    let depth = opts.queue_depth.max(1);
    let (ra, wa) = a.into_split();
    let (rb, wb) = b.into_split();
    let (tx_ab, rx_ab) = mpsc::channel::<Bytes>(depth);
    let (tx_ba, rx_ba) = mpsc::channel::<Bytes>(depth);

    let recv_a = tokio::spawn(recv_loop(ra, tx_ab, alive.clone(), opts.clone()));
    let send_b = tokio::spawn(send_loop(wb, rx_ab, alive.clone()));
    let recv_b = tokio::spawn(recv_loop(rb, tx_ba, alive.clone(), opts));
    let send_a = tokio::spawn(send_loop(wa, rx_ba, alive.clone()));

    let (_, a_to_b, _, b_to_a) = tokio::join!(recv_a, send_b, recv_b, send_a);
    alive.kill();

    let report = SessionReport {
        a_to_b: a_to_b.unwrap_or_default(),
        b_to_a: b_to_a.unwrap_or_default(),
    };
    tracing::debug!(
        sid = %id,
        a_to_b = report.a_to_b,
        b_to_a = report.b_to_a,
        "session: end"
    );
    report
}

async fn recv_loop(
    mut rd: OwnedReadHalf,
    tx: mpsc::Sender<Bytes>,
    alive: AliveFlag,
    opts: RelayOptions,
) -> u64 {
    let mut dead = alive.subscribe();
    let mut buf = vec![0u8; opts.chunk_size.max(1)];
    let mut total = 0u64;

    loop {
        let res = tokio::select! {
            biased;
            _ = wait_dead(&mut dead) => break,
            r = time::timeout(opts.read_timeout, rd.read(&mut buf)) => r,
        };

        match res {
            Err(_elapsed) => continue,
            // EOF: dropping `tx` lets the paired send loop flush and end the session.
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                total += n as u64;
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                let queued = tokio::select! {
                    biased;
                    _ = wait_dead(&mut dead) => false,
                    r = tx.send(chunk) => r.is_ok(),
                };
                if !queued {
                    break;
                }
            }
            Ok(Err(err)) => {
                tracing::debug!(err = %err, "session: read failed");
                alive.kill();
                break;
            }
        }
    }

    total
}

async fn send_loop(mut wr: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>, alive: AliveFlag) -> u64 {
    let mut dead = alive.subscribe();
    let mut total = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = wait_dead(&mut dead) => break,
            c = rx.recv() => c,
        };
        let Some(chunk) = next else {
            break;
        };

        let written = tokio::select! {
            biased;
            _ = wait_dead(&mut dead) => break,
            r = wr.write_all(&chunk) => r,
        };
        if let Err(err) = written {
            tracing::debug!(err = %err, "session: write failed");
            break;
        }
        total += chunk.len() as u64;
    }

    alive.kill();
    total
}

/// Byte-counter labels for the `a → b` and `b → a` directions.
pub type Directions = (&'static str, &'static str);

/// Runs a session that is listed in `sessions` and cancellable through `active` for
/// its whole lifetime, then records its byte counts.
pub async fn run_tracked(
    info: SessionInfo,
    a: TcpStream,
    b: TcpStream,
    opts: RelayOptions,
    sessions: &SessionRegistry,
    active: &ActiveSessions,
    directions: Directions,
) -> SessionReport {
    let sid = info.id.clone();
    let engine = info.engine;
    sessions.add(info);

    let (handle, task) = spawn(sid.clone(), a, b, opts);
    active.push(handle);
    let report = task.await.unwrap_or_default();

    sessions.remove(&sid);
    telemetry::record_bytes(engine, directions.0, report.a_to_b);
    telemetry::record_bytes(engine, directions.1, report.b_to_a);
    tracing::info!(
        sid = %sid,
        engine = engine.as_str(),
        a_to_b = report.a_to_b,
        b_to_a = report.b_to_a,
        "session: closed"
    );
    report
}

/// Sessions spawned by one server; dead handles are dropped whenever a new one is added.
#[derive(Debug, Default)]
pub struct ActiveSessions {
    inner: Mutex<Vec<SessionHandle>>,
}

impl ActiveSessions {
    pub fn push(&self, h: SessionHandle) {
        let mut v = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        v.retain(|s| s.is_alive());
        v.push(h);
    }

    pub fn len(&self) -> usize {
        let v = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        v.iter().filter(|s| s.is_alive()).count()
    }

    pub fn cancel_all(&self) {
        let mut v = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for s in v.drain(..) {
            s.cancel();
        }
    }
}
