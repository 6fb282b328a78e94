use std::{
    io::{self, Write},
    net::{Shutdown, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender, SyncSender, TrySendError},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytes::Bytes;
use mio::Waker;

use super::pairing::ConnId;

/// A socket shared between the poll thread (reads) and one writer shard (writes).
pub struct Conn {
    pub id: ConnId,
    pub stream: mio::net::TcpStream,
    pub peer: Option<SocketAddr>,
    open: AtomicBool,
}

impl Conn {
    pub fn new(id: ConnId, stream: mio::net::TcpStream, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            stream,
            peer,
            open: AtomicBool::new(true),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Shuts the socket down once; later calls are no-ops.
    pub fn close(&self) -> bool {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.stream.shutdown(Shutdown::Both);
            true
        } else {
            false
        }
    }

    pub fn peer_string(&self) -> String {
        self.peer.map(|p| p.to_string()).unwrap_or_default()
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

pub enum Job {
    Write { dest: Arc<Conn>, data: Bytes },
    /// Everything queued for `dest` before this marker has been written; tear the pair down.
    Finish { dest: Arc<Conn> },
}

impl Job {
    pub fn dest(&self) -> &Arc<Conn> {
        match self {
            Job::Write { dest, .. } | Job::Finish { dest } => dest,
        }
    }
}

/// What writer threads tell the poll thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// The connection failed or finished; tear its pair down.
    Remove(ConnId),
    /// A shard that turned a job away has room again.
    Drained,
}

/// Sends [`Notice`]s back to the poll thread and wakes it.
#[derive(Clone)]
pub struct Notifier {
    tx: Sender<Notice>,
    waker: Arc<Waker>,
}

impl Notifier {
    pub fn new(tx: Sender<Notice>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }

    fn send(&self, notice: Notice) {
        if self.tx.send(notice).is_ok() {
            if let Err(err) = self.waker.wake() {
                tracing::warn!(err = %err, "writer: wake poll thread failed");
            }
        }
    }

    fn remove(&self, id: ConnId) {
        self.send(Notice::Remove(id));
    }
}

struct Shard {
    tx: SyncSender<Job>,
    /// Set when a job was turned away; the worker reports [`Notice::Drained`] after its
    /// next job.
    wanted: Arc<AtomicBool>,
}

/// Fixed set of writer threads. Every destination maps to exactly one shard, so
/// writes to one socket never race and land in submission order.
pub struct WriterPool {
    shards: Vec<Shard>,
    threads: Vec<JoinHandle<()>>,
    notify: Notifier,
    write_timeout: Duration,
}

impl WriterPool {
    /// `workers == 0` makes [`WriterPool::try_submit`] write inline on the caller's thread.
    pub fn new(
        workers: usize,
        queue_capacity: usize,
        write_timeout: Duration,
        notify: Notifier,
    ) -> io::Result<Self> {
        let mut shards = Vec::with_capacity(workers);
        let mut threads = Vec::with_capacity(workers);
        for i in 0..workers {
            let (tx, rx) = mpsc::sync_channel::<Job>(queue_capacity.max(1));
            let wanted = Arc::new(AtomicBool::new(false));
            let t = thread::Builder::new()
                .name(format!("relay-writer-{i}"))
                .spawn({
                    let notify = notify.clone();
                    let wanted = wanted.clone();
                    move || worker(rx, write_timeout, notify, wanted)
                })?;
            shards.push(Shard { tx, wanted });
            threads.push(t);
        }
        Ok(Self {
            shards,
            threads,
            notify,
            write_timeout,
        })
    }

    pub fn workers(&self) -> usize {
        self.shards.len()
    }

    /// Queues `job` on its destination's shard without waiting. A full shard hands the
    /// job back, and a [`Notice::Drained`] follows once that shard makes progress.
    pub fn try_submit(&self, job: Job) -> Result<(), Job> {
        if self.shards.is_empty() {
            execute(job, self.write_timeout, &self.notify);
            return Ok(());
        }
        let dest = job.dest().id;
        let shard = &self.shards[dest % self.shards.len()];
        let job = match shard.tx.try_send(job) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(job)) => job,
            Err(TrySendError::Disconnected(_)) => {
                self.shard_gone(dest);
                return Ok(());
            }
        };

        // Raise the flag before retrying: the worker may have freed a slot in between.
        shard.wanted.store(true, Ordering::Release);
        match shard.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => Err(job),
            Err(TrySendError::Disconnected(_)) => {
                self.shard_gone(dest);
                Ok(())
            }
        }
    }

    fn shard_gone(&self, dest: ConnId) {
        tracing::error!(conn = dest, "writer: shard gone; dropping connection");
        self.notify.remove(dest);
    }

    /// Stops accepting jobs and waits for queued ones to drain.
    pub fn shutdown(mut self) {
        self.shards.clear();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

fn worker(rx: Receiver<Job>, write_timeout: Duration, notify: Notifier, wanted: Arc<AtomicBool>) {
    tracing::debug!(thread = ?thread::current().name(), "writer: started");
    while let Ok(job) = rx.recv() {
        execute(job, write_timeout, &notify);
        if wanted.swap(false, Ordering::AcqRel) {
            notify.send(Notice::Drained);
        }
    }
    tracing::debug!(thread = ?thread::current().name(), "writer: stopped");
}

fn execute(job: Job, write_timeout: Duration, notify: &Notifier) {
    match job {
        Job::Write { dest, data } => {
            if !dest.is_open() {
                return;
            }
            if let Err(err) = write_all(&dest, &data, write_timeout) {
                tracing::debug!(conn = dest.id, err = %err, "writer: write failed");
                // Later jobs for this socket are skipped instead of timing out one by one.
                dest.close();
                notify.remove(dest.id);
            }
        }
        Job::Finish { dest } => {
            if dest.is_open() {
                notify.remove(dest.id);
            }
        }
    }
}

/// Writes all of `buf` to a non-blocking socket, pausing on `WouldBlock` until `timeout`.
pub fn write_all(conn: &Conn, mut buf: &[u8], timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    let mut pause = Duration::from_micros(50);
    while !buf.is_empty() {
        if !conn.is_open() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        match (&conn.stream).write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                pause = Duration::from_micros(50);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                thread::sleep(pause);
                pause = (pause * 2).min(Duration::from_millis(5));
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
