//! Single poll thread plus a sharded writer pool.
//!
//! The poll thread owns every socket slot and the pairing table; it only reads and
//! never blocks on a peer. Bytes it reads are handed to the writer shard that owns the
//! destination socket, and a full shard pauses reads from the source until it drains.
//! Registry calls run on the registrar thread. Connection teardown always goes through
//! [`Reactor::remove`].

pub mod pairing;
mod registrar;
pub mod writer;

use std::{
    collections::{HashMap, VecDeque},
    convert::Infallible,
    io::{self, Read},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::Context;
use bytes::Bytes;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::tcprelay::{
    net,
    telemetry::{self, Engine, SessionInfo, SharedSessions},
    tunnel::{
        frame::{self, FRAME_LEN, RegistrationToken, Response},
        registry::{ConflictPolicy, Lease, ListenerRegistry, RegistryError},
    },
};

use pairing::{ConnId, PairingTable};
use registrar::{Outcome, Registrar, Request};
use writer::{Conn, Job, Notice, Notifier, WriterPool};

const REGISTRATION: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONN: ConnId = 2;

const SWEEP_EVERY: Duration = Duration::from_millis(250);
const EVENTS_CAPACITY: usize = 1024;
const REGISTRATION_BACKLOG: i32 = 1024;

#[derive(Debug, Clone)]
pub struct ReactorOptions {
    pub listen_addr: SocketAddr,
    pub registration_timeout: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    pub chunk_size: usize,
    pub write_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Tunnel,
    External,
}

enum Slot {
    /// Tunnel connection still sending its registration frame.
    Awaiting {
        conn: Arc<Conn>,
        buf: Vec<u8>,
        since: Instant,
    },
    /// Frame received; the registrar is binding the target.
    Registering { conn: Arc<Conn> },
    /// Registered tunnel waiting for its external connection.
    Pending { conn: Arc<Conn>, target: SocketAddr },
    /// Public listener, paired with its pending tunnel.
    Public { lease: Lease<mio::net::TcpListener> },
    Data {
        conn: Arc<Conn>,
        side: Side,
        session: String,
    },
}

/// Running reactor; dropping it stops the poll thread without waiting for it.
pub struct ReactorHandle {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    join: Option<JoinHandle<()>>,
}

impl ReactorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the poll thread, closes every connection and joins the helper threads.
    pub fn shutdown(mut self) {
        self.signal_stop();
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                tracing::error!("reactor: poll thread panicked");
            }
        }
    }

    fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

impl Drop for ReactorHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.signal_stop();
        }
    }
}

/// Binds the registration listener and starts the poll thread. A bind failure is
/// returned to the caller.
pub fn spawn(
    opts: ReactorOptions,
    registry: Arc<ListenerRegistry>,
    sessions: SharedSessions,
) -> anyhow::Result<ReactorHandle> {
    let poll = Poll::new().context("reactor: create poll")?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER).context("reactor: create waker")?);

    let std_ln = net::bind_reusable(opts.listen_addr, REGISTRATION_BACKLOG)
        .with_context(|| format!("reactor: bind {}", opts.listen_addr))?;
    let local_addr = std_ln.local_addr()?;
    let mut listener = mio::net::TcpListener::from_std(std_ln);
    poll.registry()
        .register(&mut listener, REGISTRATION, Interest::READABLE)
        .context("reactor: register listener")?;

    let (notices_tx, notices) = mpsc::channel();
    let writers = WriterPool::new(
        opts.workers,
        opts.queue_capacity,
        opts.write_timeout,
        Notifier::new(notices_tx, waker.clone()),
    )
    .context("reactor: start writers")?;

    let (registered_tx, registered) = mpsc::channel();
    let registrar = Registrar::spawn(registry.clone(), registered_tx, waker.clone())
        .context("reactor: start registrar")?;

    let stop = Arc::new(AtomicBool::new(false));
    let reactor = Reactor {
        poll,
        listener,
        slots: HashMap::new(),
        pairs: PairingTable::default(),
        public_by_addr: HashMap::new(),
        backlog: HashMap::new(),
        next_id: FIRST_CONN,
        buf: vec![0u8; opts.chunk_size.max(1)],
        registry,
        sessions,
        writers: Some(writers),
        notices,
        registrar: Some(registrar),
        registered,
        stop: stop.clone(),
        opts,
    };

    let join = thread::Builder::new()
        .name("reactor-poll".into())
        .spawn(move || reactor.run())
        .context("reactor: spawn poll thread")?;

    tracing::info!(addr = %local_addr, "reactor: listening");

    Ok(ReactorHandle {
        local_addr,
        stop,
        waker,
        join: Some(join),
    })
}

struct Reactor {
    poll: Poll,
    listener: mio::net::TcpListener,
    slots: HashMap<ConnId, Slot>,
    pairs: PairingTable,
    /// Public listeners this reactor holds, for replacing its own registrations.
    public_by_addr: HashMap<SocketAddr, ConnId>,
    /// Jobs a full shard turned away, per destination, in submission order. The
    /// destination's source is not read while its entry exists.
    backlog: HashMap<ConnId, VecDeque<Job>>,
    next_id: ConnId,
    buf: Vec<u8>,
    registry: Arc<ListenerRegistry>,
    sessions: SharedSessions,
    writers: Option<WriterPool>,
    notices: mpsc::Receiver<Notice>,
    registrar: Option<Registrar>,
    registered: mpsc::Receiver<Outcome>,
    stop: Arc<AtomicBool>,
    opts: ReactorOptions,
}

enum FrameProgress {
    Incomplete,
    Done(RegistrationToken),
    Failed(String),
}

impl Reactor {
    fn run(mut self) {
        tracing::debug!(
            thread = ?thread::current().name(),
            workers = self.writers.as_ref().map(WriterPool::workers).unwrap_or(0),
            "reactor: poll loop started"
        );

        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut last_sweep = Instant::now();

        while !self.stop.load(Ordering::Acquire) {
            if let Err(err) = self.poll.poll(&mut events, Some(SWEEP_EVERY)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(err = %err, "reactor: poll failed");
                break;
            }

            for ev in events.iter() {
                match ev.token() {
                    REGISTRATION => self.accept_tunnels(),
                    WAKER => {}
                    Token(id) => self.dispatch(id),
                }
            }

            self.drain_notices();
            self.drain_registered();

            if last_sweep.elapsed() >= SWEEP_EVERY {
                self.sweep();
                last_sweep = Instant::now();
            }
        }

        self.close_all();
        tracing::debug!("reactor: poll loop stopped");
    }

    fn next_token(&mut self) -> ConnId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Queues `job` behind anything already held back for its destination. False means
    /// the job was held back and the caller should stop reading its source.
    fn submit(&mut self, job: Job) -> bool {
        let dest = job.dest().id;
        if let Some(held) = self.backlog.get_mut(&dest) {
            held.push_back(job);
            return false;
        }
        let Some(w) = &self.writers else {
            return true;
        };
        match w.try_submit(job) {
            Ok(()) => true,
            Err(job) => {
                tracing::debug!(conn = dest, "reactor: writer shard full; pausing source");
                self.backlog.entry(dest).or_default().push_back(job);
                false
            }
        }
    }

    /// Retries held-back jobs and resumes the sources whose destinations caught up.
    fn flush_backlog(&mut self) {
        let Some(w) = &self.writers else {
            return;
        };
        let mut caught_up = Vec::new();
        self.backlog.retain(|dest, held| {
            while let Some(job) = held.pop_front() {
                if let Err(job) = w.try_submit(job) {
                    held.push_front(job);
                    return true;
                }
            }
            caught_up.push(*dest);
            false
        });
        for dest in caught_up {
            // Reads stopped short of WouldBlock, so the source will not raise a new edge.
            if let Some(src) = self.pairs.peer(dest) {
                self.relay(src);
            }
        }
    }

    fn accept_tunnels(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let id = self.next_token();
                    if let Err(err) =
                        self.poll
                            .registry()
                            .register(&mut stream, Token(id), Interest::READABLE)
                    {
                        tracing::warn!(peer = %peer, err = %err, "reactor: register tunnel failed");
                        continue;
                    }
                    tracing::debug!(conn = id, peer = %peer, "reactor: tunnel connected");
                    self.slots.insert(
                        id,
                        Slot::Awaiting {
                            conn: Arc::new(Conn::new(id, stream, Some(peer))),
                            buf: Vec::with_capacity(FRAME_LEN),
                            since: Instant::now(),
                        },
                    );
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    tracing::warn!(err = %err, "reactor: accept tunnel failed");
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, id: ConnId) {
        match self.slots.get(&id) {
            Some(Slot::Awaiting { .. }) => self.read_frame(id),
            Some(Slot::Registering { .. } | Slot::Pending { .. }) => self.check_pending(id),
            Some(Slot::Public { .. }) => self.accept_external(id),
            Some(Slot::Data { .. }) => self.relay(id),
            None => {}
        }
    }

    fn read_frame(&mut self, id: ConnId) {
        let progress = match self.slots.get_mut(&id) {
            Some(Slot::Awaiting { conn, buf, .. }) => read_frame_bytes(conn, buf),
            _ => return,
        };
        match progress {
            FrameProgress::Incomplete => {}
            FrameProgress::Failed(reason) => {
                tracing::warn!(conn = id, reason = %reason, "reactor: registration rejected");
                self.remove(id);
            }
            FrameProgress::Done(token) => self.register_target(id, token),
        }
    }

    fn register_target(&mut self, id: ConnId, token: RegistrationToken) {
        let conn = match self.slots.get(&id) {
            Some(Slot::Awaiting { conn, .. }) => conn.clone(),
            _ => return,
        };
        let Some(target) = token.target_addr() else {
            tracing::warn!(conn = id, port = token.port, "reactor: port out of range");
            self.remove(id);
            return;
        };
        let target = SocketAddr::V4(target);

        // Our own previous listener must go first or the registrar would wait on us.
        if self.registry.policy() == ConflictPolicy::Replace {
            if let Some(old) = self.public_by_addr.get(&target).copied() {
                tracing::info!(addr = %target, "reactor: replacing own listener");
                self.remove(old);
            }
        }

        let req = Request {
            conn: id,
            target,
            client_id: token.client_id,
            owner: conn.peer,
        };
        if !self.registrar.as_ref().is_some_and(|r| r.submit(req)) {
            tracing::error!(conn = id, "reactor: registrar gone; dropping tunnel");
            self.remove(id);
            return;
        }
        self.slots.insert(id, Slot::Registering { conn });

        // Bytes that arrived right behind the frame would not raise another edge.
        self.check_pending(id);
    }

    fn drain_registered(&mut self) {
        while let Ok(outcome) = self.registered.try_recv() {
            self.adopt(outcome);
        }
    }

    /// Installs the public listener the registrar bound, or answers the tunnel.
    fn adopt(&mut self, outcome: Outcome) {
        let Outcome {
            conn: id,
            target,
            client_id,
            result,
        } = outcome;
        let conn = match self.slots.get(&id) {
            Some(Slot::Registering { conn }) => conn.clone(),
            _ => {
                if let Ok(lease) = result {
                    tracing::debug!(conn = id, addr = %target, "reactor: tunnel gone before its listener");
                    self.registry.release(lease);
                }
                return;
            }
        };

        let lease = match result {
            Ok(lease) => lease,
            Err(RegistryError::AddressInUse(addr)) => {
                tracing::info!(conn = id, addr = %addr, "reactor: target in use; answering EX");
                // Finish tears the tunnel down once EX is out.
                self.submit(Job::Write {
                    dest: conn.clone(),
                    data: Bytes::from_static(Response::PortInUse.as_bytes()),
                });
                self.submit(Job::Finish { dest: conn });
                return;
            }
            Err(err) => {
                tracing::warn!(conn = id, err = %err, "reactor: register target failed");
                self.remove(id);
                return;
            }
        };

        let Ok(mut lease) =
            lease.try_map(|l| Ok::<_, Infallible>(mio::net::TcpListener::from_std(l)));
        let lid = self.next_token();
        if let Err(err) =
            self.poll
                .registry()
                .register(lease.listener_mut(), Token(lid), Interest::READABLE)
        {
            tracing::warn!(addr = %target, err = %err, "reactor: register public listener failed");
            self.registry.release(lease);
            self.remove(id);
            return;
        }

        tracing::info!(
            conn = id,
            client = %client_id,
            addr = %target,
            "reactor: waiting for external connection"
        );
        self.slots.insert(id, Slot::Pending { conn, target });
        self.slots.insert(lid, Slot::Public { lease });
        self.public_by_addr.insert(target, lid);
        self.pairs.pair(id, lid);
    }

    /// Any readable event on a tunnel that is not yet paired is a failure.
    fn check_pending(&mut self, id: ConnId) {
        let conn = match self.slots.get(&id) {
            Some(Slot::Registering { conn } | Slot::Pending { conn, .. }) => conn,
            _ => return,
        };
        let mut one = [0u8; 1];
        let failed = match (&conn.stream).read(&mut one) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => None,
            Ok(0) => Some("closed".to_string()),
            Ok(_) => Some("unexpected data".to_string()),
            Err(err) => Some(err.to_string()),
        };
        if let Some(reason) = failed {
            tracing::info!(conn = id, reason = %reason, "reactor: tunnel lost before pairing");
            self.remove(id);
        }
    }

    fn accept_external(&mut self, lid: ConnId) {
        let accepted = match self.slots.get(&lid) {
            Some(Slot::Public { lease }) => lease.listener().accept(),
            _ => return,
        };
        let (mut stream, peer) = match accepted {
            Ok(v) => v,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return;
            }
            Err(err) => {
                tracing::warn!(conn = lid, err = %err, "reactor: accept external failed");
                self.remove(lid);
                return;
            }
        };

        // One external connection per registration: the public listener is done.
        let tid = self.pairs.unpair(lid);
        self.drop_slot(lid);
        let Some(tid) = tid else {
            return;
        };
        let (tunnel, target) = match self.slots.get(&tid) {
            Some(Slot::Pending { conn, target }) => (conn.clone(), *target),
            _ => return,
        };

        let eid = self.next_token();
        if let Err(err) = self
            .poll
            .registry()
            .register(&mut stream, Token(eid), Interest::READABLE)
        {
            tracing::warn!(peer = %peer, err = %err, "reactor: register external failed");
            self.remove(tid);
            return;
        }
        let external = Arc::new(Conn::new(eid, stream, Some(peer)));

        let sid = telemetry::new_session_id("r");
        self.sessions.add(SessionInfo {
            id: sid.clone(),
            engine: Engine::Reactor,
            external: external.peer_string(),
            tunnel: tunnel.peer_string(),
            target: target.to_string(),
            started_at_unix_ms: telemetry::now_unix_ms(),
        });
        tracing::info!(
            sid = %sid,
            external = %peer,
            tunnel = %tunnel.peer_string(),
            target = %target,
            "reactor: session paired"
        );

        self.pairs.pair(tid, eid);
        self.slots.insert(
            tid,
            Slot::Data {
                conn: tunnel.clone(),
                side: Side::Tunnel,
                session: sid.clone(),
            },
        );
        self.slots.insert(
            eid,
            Slot::Data {
                conn: external,
                side: Side::External,
                session: sid,
            },
        );

        // Queued on the tunnel's shard ahead of any relayed byte. If the shard is full
        // the external side is not read until OK is out.
        self.submit(Job::Write {
            dest: tunnel,
            data: Bytes::from_static(Response::Ok.as_bytes()),
        });
    }

    fn relay(&mut self, id: ConnId) {
        let (conn, side) = match self.slots.get(&id) {
            Some(Slot::Data { conn, side, .. }) => (conn.clone(), *side),
            _ => return,
        };
        let dest = match self.pairs.peer(id).and_then(|p| self.slots.get(&p)) {
            Some(Slot::Data { conn, .. }) => Some(conn.clone()),
            _ => None,
        };
        let Some(dest) = dest else {
            self.remove(id);
            return;
        };
        if self.backlog.contains_key(&dest.id) {
            // Paused; the kernel buffers the rest until the shard drains.
            return;
        }
        let direction = match side {
            Side::Tunnel => "to_external",
            Side::External => "to_tunnel",
        };

        loop {
            match (&conn.stream).read(&mut self.buf) {
                Ok(0) => {
                    tracing::debug!(conn = id, "reactor: peer closed; flushing");
                    self.submit(Job::Finish { dest });
                    return;
                }
                Ok(n) => {
                    telemetry::record_bytes(Engine::Reactor, direction, n as u64);
                    let job = Job::Write {
                        dest: dest.clone(),
                        data: Bytes::copy_from_slice(&self.buf[..n]),
                    };
                    if !self.submit(job) {
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    tracing::debug!(conn = id, err = %err, "reactor: read failed");
                    self.remove(id);
                    return;
                }
            }
        }
    }

    fn drain_notices(&mut self) {
        let mut drained = false;
        while let Ok(notice) = self.notices.try_recv() {
            match notice {
                Notice::Remove(id) => self.remove(id),
                Notice::Drained => drained = true,
            }
        }
        if drained {
            self.flush_backlog();
        }
    }

    /// The only teardown path: unpairs `id`, then closes it and its former peer.
    /// Unknown ids are ignored.
    fn remove(&mut self, id: ConnId) {
        let peer = self.pairs.unpair(id);
        self.drop_slot(id);
        if let Some(p) = peer {
            self.drop_slot(p);
        }
    }

    fn drop_slot(&mut self, id: ConnId) {
        self.backlog.remove(&id);
        match self.slots.remove(&id) {
            Some(
                Slot::Awaiting { conn, .. }
                | Slot::Registering { conn }
                | Slot::Pending { conn, .. },
            ) => {
                self.deregister(&conn);
                conn.close();
            }
            Some(Slot::Data { conn, session, .. }) => {
                self.deregister(&conn);
                if conn.close() {
                    tracing::debug!(conn = id, sid = %session, "reactor: closed");
                }
                self.sessions.remove(&session);
            }
            Some(Slot::Public { mut lease }) => {
                if let Err(err) = self.poll.registry().deregister(lease.listener_mut()) {
                    tracing::debug!(conn = id, err = %err, "reactor: deregister listener failed");
                }
                if self.public_by_addr.get(&lease.addr()) == Some(&id) {
                    self.public_by_addr.remove(&lease.addr());
                }
                self.registry.release(lease);
            }
            None => {}
        }
    }

    /// Takes a socket out of the poll set. Writer jobs may still hold the `Arc`, so
    /// this goes through the descriptor.
    #[cfg(unix)]
    fn deregister(&self, conn: &Conn) {
        use std::os::fd::AsRawFd;

        let fd = conn.stream.as_raw_fd();
        if let Err(err) = self
            .poll
            .registry()
            .deregister(&mut mio::unix::SourceFd(&fd))
        {
            tracing::debug!(conn = conn.id, err = %err, "reactor: deregister failed");
        }
    }

    /// Dropping the last `Arc` closes the socket, which removes it from the poll set.
    #[cfg(not(unix))]
    fn deregister(&self, _conn: &Conn) {}

    fn sweep(&mut self) {
        let timeout = self.opts.registration_timeout;
        let stale: Vec<ConnId> = self
            .slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Awaiting { since, .. } if since.elapsed() >= timeout => Some(*id),
                Slot::Public { lease } if lease.is_evicted() => Some(*id),
                _ => None,
            })
            .collect();
        for id in stale {
            if matches!(self.slots.get(&id), Some(Slot::Awaiting { .. })) {
                tracing::info!(conn = id, "reactor: registration timed out");
            } else {
                tracing::info!(conn = id, "reactor: listener evicted");
            }
            self.remove(id);
        }
    }

    fn close_all(&mut self) {
        let ids: Vec<ConnId> = self.slots.keys().copied().collect();
        for id in ids {
            self.remove(id);
        }
        // The registrar may be waiting on a lease that is still queued for us.
        self.release_registered();
        if let Some(r) = self.registrar.take() {
            r.shutdown();
        }
        self.release_registered();
        self.backlog.clear();
        if let Some(w) = self.writers.take() {
            w.shutdown();
        }
    }

    fn release_registered(&mut self) {
        while let Ok(outcome) = self.registered.try_recv() {
            if let Ok(lease) = outcome.result {
                self.registry.release(lease);
            }
        }
    }
}

fn read_frame_bytes(conn: &Conn, buf: &mut Vec<u8>) -> FrameProgress {
    let mut chunk = [0u8; FRAME_LEN];
    loop {
        let need = FRAME_LEN - buf.len();
        match (&conn.stream).read(&mut chunk[..need]) {
            Ok(0) => return FrameProgress::Failed(format!("closed after {} bytes", buf.len())),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if let Err(err) = frame::check_prefix(buf) {
                    return FrameProgress::Failed(err.to_string());
                }
                if buf.len() == FRAME_LEN {
                    return match RegistrationToken::decode(buf) {
                        Ok(t) => FrameProgress::Done(t),
                        Err(err) => FrameProgress::Failed(err.to_string()),
                    };
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return FrameProgress::Incomplete,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return FrameProgress::Failed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{ErrorKind, Write},
        net::{SocketAddrV4, TcpStream},
    };

    use super::*;
    use crate::tcprelay::{
        net::testing::{free_local_addr, free_local_addrs},
        telemetry::SessionRegistry,
        tunnel::{
            frame::{ClientId, RESPONSE_LEN},
            registry::RebindBackoff,
        },
    };

    struct Harness {
        handle: ReactorHandle,
        registry: Arc<ListenerRegistry>,
        sessions: SharedSessions,
    }

    fn start(policy: ConflictPolicy, workers: usize) -> Harness {
        start_with(policy, |o| o.workers = workers)
    }

    fn start_with(policy: ConflictPolicy, tweak: impl FnOnce(&mut ReactorOptions)) -> Harness {
        let registry = Arc::new(ListenerRegistry::new(
            policy,
            RebindBackoff {
                initial: Duration::from_millis(5),
                max: Duration::from_millis(50),
                deadline: Duration::from_secs(2),
            },
        ));
        let sessions = Arc::new(SessionRegistry::new());
        let mut opts = ReactorOptions {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            registration_timeout: Duration::from_secs(10),
            workers: 2,
            queue_capacity: 256,
            chunk_size: 4096,
            write_timeout: Duration::from_secs(5),
        };
        tweak(&mut opts);
        let handle = spawn(opts, registry.clone(), sessions.clone()).unwrap();
        Harness {
            handle,
            registry,
            sessions,
        }
    }

    fn eventually(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        f()
    }

    fn connect(addr: impl Into<SocketAddr>) -> TcpStream {
        let s = TcpStream::connect(addr.into()).unwrap();
        s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        s
    }

    fn register(h: &Harness, target: SocketAddrV4, id: &str) -> TcpStream {
        let mut tunnel = connect(h.handle.local_addr());
        let token = RegistrationToken::new(target, ClientId::parse(id).unwrap());
        tunnel.write_all(&token.encode()).unwrap();
        tunnel
    }

    fn read_response(s: &mut TcpStream) -> Option<Response> {
        let mut buf = [0u8; RESPONSE_LEN];
        s.read_exact(&mut buf).ok()?;
        Response::parse(&buf)
    }

    /// Registers `target`, connects to it and returns `(tunnel, external)` once paired.
    fn establish(h: &Harness, target: SocketAddrV4, id: &str) -> (TcpStream, TcpStream) {
        let mut tunnel = register(h, target, id);
        assert!(eventually(|| h.registry.contains(target.into())));
        let external = connect(target);
        assert_eq!(read_response(&mut tunnel), Some(Response::Ok));
        (tunnel, external)
    }

    fn round_trip(tunnel: &mut TcpStream, external: &mut TcpStream) -> Duration {
        let start = Instant::now();
        let mut buf = [0u8; 4];
        external.write_all(b"ping").unwrap();
        tunnel.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        tunnel.write_all(b"pong").unwrap();
        external.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
        start.elapsed()
    }

    fn is_closed(s: &mut TcpStream) -> bool {
        let mut b = [0u8; 1];
        matches!(s.read(&mut b), Ok(0) | Err(_))
    }

    #[test]
    fn registration_pairs_and_relays_both_ways() {
        let h = start(ConflictPolicy::Replace, 5);
        let target = free_local_addr();

        let mut tunnel = register(&h, target, "user1");
        assert!(eventually(|| h.registry.contains(target.into())));

        let mut external = connect(target);
        assert_eq!(read_response(&mut tunnel), Some(Response::Ok));
        assert!(eventually(|| !h.registry.contains(target.into())));
        assert_eq!(h.sessions.len(), 1);

        external.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        tunnel.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        tunnel.write_all(b"world").unwrap();
        external.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");

        drop(external);
        assert!(is_closed(&mut tunnel));
        assert!(eventually(|| h.sessions.len() == 0));
        h.handle.shutdown();
    }

    #[test]
    fn garbage_frame_is_dropped_without_listener() {
        let h = start(ConflictPolicy::Replace, 2);
        let mut tunnel = connect(h.handle.local_addr());
        tunnel.write_all(b"HELLO WORLD").unwrap();

        assert!(is_closed(&mut tunnel));
        assert_eq!(h.registry.len(), 0);
        h.handle.shutdown();
    }

    #[test]
    fn silent_tunnel_is_swept() {
        let h = start_with(ConflictPolicy::Replace, |o| {
            o.workers = 1;
            o.registration_timeout = Duration::from_millis(200);
        });
        let mut tunnel = connect(h.handle.local_addr());
        tunnel.write_all(b"<UVM>").unwrap();

        assert!(is_closed(&mut tunnel));
        h.handle.shutdown();
    }

    #[test]
    fn tunnel_loss_before_pairing_releases_listener() {
        let h = start(ConflictPolicy::Replace, 2);
        let target = free_local_addr();

        let tunnel = register(&h, target, "user1");
        assert!(eventually(|| h.registry.contains(target.into())));
        drop(tunnel);

        assert!(eventually(|| !h.registry.contains(target.into())));
        std::net::TcpListener::bind(target).expect("port released");
        h.handle.shutdown();
    }

    #[test]
    fn reregistration_replaces_previous_tunnel() {
        let h = start(ConflictPolicy::Replace, 2);
        let target = free_local_addr();

        let mut first = register(&h, target, "user1");
        assert!(eventually(|| h.registry.contains(target.into())));
        let mut second = register(&h, target, "user1");

        assert!(is_closed(&mut first));
        assert!(eventually(|| h.registry.len() == 1));

        let _external = connect(target);
        assert_eq!(read_response(&mut second), Some(Response::Ok));
        h.handle.shutdown();
    }

    #[test]
    fn reject_policy_answers_ex() {
        let h = start(ConflictPolicy::Reject, 2);
        let target = free_local_addr();

        let _first = register(&h, target, "a");
        assert!(eventually(|| h.registry.contains(target.into())));
        let mut second = register(&h, target, "b");

        assert_eq!(read_response(&mut second), Some(Response::PortInUse));
        assert!(is_closed(&mut second));
        assert_eq!(h.registry.snapshot()[0].client_id, ClientId::parse("a").unwrap());
        h.handle.shutdown();
    }

    #[test]
    fn fifty_sessions_keep_per_stream_order() {
        const SESSIONS: usize = 50;
        const MESSAGES: usize = 1000;

        let h = start(ConflictPolicy::Replace, 5);
        let targets = free_local_addrs(SESSIONS);

        let mut pairs = Vec::with_capacity(SESSIONS);
        for (i, target) in targets.iter().enumerate() {
            let mut tunnel = register(&h, *target, &format!("s{i}"));
            assert!(eventually(|| h.registry.contains((*target).into())));
            let external = connect(*target);
            assert_eq!(read_response(&mut tunnel), Some(Response::Ok));
            pairs.push((tunnel, external));
        }
        assert_eq!(h.sessions.len(), SESSIONS);

        let workers: Vec<_> = pairs
            .into_iter()
            .enumerate()
            .map(|(i, (mut tunnel, mut external))| {
                thread::spawn(move || {
                    let mut want = Vec::with_capacity(MESSAGES * 16);
                    for seq in 0..MESSAGES {
                        let msg = format!("{i:04}-{seq:010}\n");
                        assert_eq!(msg.len(), 16);
                        want.extend_from_slice(msg.as_bytes());
                    }
                    let writer = thread::spawn({
                        let want = want.clone();
                        move || {
                            for msg in want.chunks(16) {
                                external.write_all(msg).unwrap();
                            }
                            external
                        }
                    });
                    let mut got = vec![0u8; want.len()];
                    tunnel.read_exact(&mut got).unwrap();
                    let _external = writer.join().unwrap();
                    assert!(got == want, "session {i} reordered or lost bytes");
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        h.handle.shutdown();
    }

    #[test]
    fn shutdown_closes_live_sessions() {
        let h = start(ConflictPolicy::Replace, 1);
        let target = free_local_addr();
        let mut tunnel = register(&h, target, "x");
        assert!(eventually(|| h.registry.contains(target.into())));
        let mut external = connect(target);
        assert_eq!(read_response(&mut tunnel), Some(Response::Ok));

        let sessions = h.sessions.clone();
        h.handle.shutdown();
        assert!(is_closed(&mut tunnel));
        assert!(is_closed(&mut external));
        assert_eq!(sessions.len(), 0);
    }

    #[test]
    fn torn_down_sockets_leave_the_poll_set() {
        let h = start(ConflictPolicy::Replace, 2);
        let target = free_local_addr();

        // The kernel hands freed descriptors straight back out, so a socket still
        // registered under a stale token would misroute the next session's events.
        for i in 0..20 {
            let (mut tunnel, mut external) = establish(&h, target, &format!("c{i}"));
            let rtt = round_trip(&mut tunnel, &mut external);
            assert!(rtt < Duration::from_millis(500), "cycle {i}: {rtt:?}");
            drop(external);
            assert!(is_closed(&mut tunnel), "cycle {i}");
            assert!(eventually(|| h.sessions.len() == 0));
        }
        h.handle.shutdown();
    }

    #[test]
    fn squatted_target_does_not_stall_live_sessions() {
        let h = start(ConflictPolicy::Replace, 2);
        let (mut tunnel, mut external) = establish(&h, free_local_addr(), "live");

        let squatter = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let SocketAddr::V4(squatted) = squatter.local_addr().unwrap() else {
            panic!("expected IPv4");
        };
        let mut refused: Vec<TcpStream> = (0..5)
            .map(|i| register(&h, squatted, &format!("sq{i}")))
            .collect();

        for _ in 0..10 {
            let rtt = round_trip(&mut tunnel, &mut external);
            assert!(rtt < Duration::from_millis(500), "round trip took {rtt:?}");
        }
        // A foreign holder is not ours to evict: no response, just a close.
        for t in &mut refused {
            assert!(is_closed(t));
        }
        assert!(!h.registry.contains(squatted.into()));
        h.handle.shutdown();
    }

    #[test]
    fn stalled_tunnel_does_not_stall_other_sessions() {
        let write_timeout = Duration::from_secs(5);
        let h = start_with(ConflictPolicy::Replace, |o| {
            o.workers = 1;
            o.queue_capacity = 4;
            o.write_timeout = write_timeout;
        });
        let targets = free_local_addrs(3);
        let (_stalled_tunnel, stalled_external) = establish(&h, targets[0], "stalled");
        let (mut tunnel, mut external) = establish(&h, targets[1], "live");
        for s in [&tunnel, &external] {
            s.set_read_timeout(Some(Duration::from_secs(15))).unwrap();
        }

        // The stalled tunnel never reads while its external side floods.
        let stop = Arc::new(AtomicBool::new(false));
        let flood = {
            let stop = stop.clone();
            let mut external = stalled_external;
            external
                .set_write_timeout(Some(Duration::from_millis(100)))
                .unwrap();
            thread::spawn(move || {
                let chunk = vec![0u8; 64 * 1024];
                while !stop.load(Ordering::Relaxed) {
                    match external.write(&chunk) {
                        Ok(_) => {}
                        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                        Err(_) => break,
                    }
                }
            })
        };
        thread::sleep(Duration::from_millis(300));

        // The poll thread keeps taking registrations while the only writer is stuck.
        let start = Instant::now();
        let _waiting = register(&h, targets[2], "newcomer");
        assert!(eventually(|| h.registry.contains(targets[2].into())));
        assert!(start.elapsed() < Duration::from_secs(1), "{:?}", start.elapsed());

        // At most one write times out before the stalled tunnel is dropped.
        let rtt = round_trip(&mut tunnel, &mut external);
        assert!(rtt < write_timeout + Duration::from_secs(3), "round trip took {rtt:?}");
        assert!(eventually(|| h.sessions.len() == 1));
        let rtt = round_trip(&mut tunnel, &mut external);
        assert!(rtt < Duration::from_millis(500), "round trip took {rtt:?}");

        stop.store(true, Ordering::Relaxed);
        flood.join().unwrap();
        h.handle.shutdown();
    }
}
