use std::{
    collections::{HashMap, HashSet},
    io,
    net::SocketAddr,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::tcprelay::{net, telemetry, tunnel::frame::ClientId};

const PUBLIC_BACKLOG: i32 = 16;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0} is already registered")]
    AddressInUse(SocketAddr),
    #[error("previous listener on {0} was not released in time")]
    ReleaseTimeout(SocketAddr),
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// What happens when a target address is registered while a live entry holds it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Latest registration wins: evict the holder, wait for its socket, rebind.
    #[default]
    Replace,
    /// Keep the holder and answer the newcomer with `EX`.
    Reject,
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictPolicy::Replace => write!(f, "replace"),
            ConflictPolicy::Reject => write!(f, "reject"),
        }
    }
}

pub fn parse_conflict_policy(name: &str) -> anyhow::Result<ConflictPolicy> {
    match name.trim().to_ascii_lowercase().as_str() {
        "" | "replace" => Ok(ConflictPolicy::Replace),
        "reject" => Ok(ConflictPolicy::Reject),
        _ => anyhow::bail!("registry: unknown conflict policy {name:?} (expected replace|reject)"),
    }
}

/// Bounded exponential backoff used both while waiting for an evicted listener to go
/// away and while retrying `AddrInUse` binds.
#[derive(Debug, Clone)]
pub struct RebindBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub deadline: Duration,
}

impl Default for RebindBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(500),
            deadline: Duration::from_secs(3),
        }
    }
}

struct Entry {
    id: u64,
    client_id: ClientId,
    owner: Option<SocketAddr>,
    since_unix_ms: u64,
    alive: Weak<()>,
    evict: watch::Sender<bool>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerSnapshot {
    pub addr: SocketAddr,
    pub client_id: ClientId,
    pub owner: Option<SocketAddr>,
    pub since_unix_ms: u64,
}

/// A bound public listener handed out by [`ListenerRegistry::register`].
///
/// The registry tracks the lease, not the socket: once the lease is dropped (or
/// released) the socket is closed and the entry is dead.
pub struct Lease<L = std::net::TcpListener> {
    // Declared first so the socket is closed before `_alive` is dropped.
    listener: L,
    addr: SocketAddr,
    id: u64,
    evicted: watch::Receiver<bool>,
    _alive: Arc<()>,
}

impl<L> Lease<L> {
    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// True once a newer registration for the same address asked this holder to go.
    pub fn is_evicted(&self) -> bool {
        *self.evicted.borrow() || self.evicted.has_changed().is_err()
    }

    /// Detached eviction signal, for waiting while the listener is borrowed elsewhere.
    pub fn eviction(&self) -> watch::Receiver<bool> {
        self.evicted.clone()
    }

    /// Converts the socket (for example into a tokio or mio listener) while keeping
    /// the lease bookkeeping.
    pub fn try_map<U, E>(self, f: impl FnOnce(L) -> Result<U, E>) -> Result<Lease<U>, E> {
        let Lease {
            listener,
            addr,
            id,
            evicted,
            _alive,
        } = self;
        Ok(Lease {
            listener: f(listener)?,
            addr,
            id,
            evicted,
            _alive,
        })
    }
}

/// Resolves once the signal from [`Lease::eviction`] fires or the registry is gone.
pub async fn wait_evicted(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|v| *v).await;
}

impl<L> std::fmt::Debug for Lease<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("addr", &self.addr)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Address → public listener table.
///
/// The table lock is only held for bookkeeping. A registration first claims its address,
/// then waits for an evicted holder and binds without the lock, so a slow replacement
/// never delays registrations for other addresses. Registrations for the same address
/// queue on the claim. Callers on an async runtime should run
/// [`ListenerRegistry::register`] on a blocking thread.
pub struct ListenerRegistry {
    policy: ConflictPolicy,
    backoff: RebindBackoff,
    seq: AtomicU64,
    table: Mutex<Table>,
    unclaimed: Condvar,
}

#[derive(Default)]
struct Table {
    entries: HashMap<SocketAddr, Entry>,
    /// Addresses with a registration between its conflict check and its insert.
    claims: HashSet<SocketAddr>,
}

/// Exclusive right to register one address. Dropping it wakes queued registrations.
struct Claim<'a> {
    registry: &'a ListenerRegistry,
    addr: SocketAddr,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.registry.lock().claims.remove(&self.addr);
        self.registry.unclaimed.notify_all();
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ListenerRegistry {
    pub fn new(policy: ConflictPolicy, backoff: RebindBackoff) -> Self {
        Self {
            policy,
            backoff,
            seq: AtomicU64::new(1),
            table: Mutex::new(Table::default()),
            unclaimed: Condvar::new(),
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn register(
        &self,
        addr: SocketAddr,
        client_id: ClientId,
        owner: Option<SocketAddr>,
    ) -> Result<Lease, RegistryError> {
        let (claim, previous) = self.claim(addr, client_id)?;

        // Only a replaced holder can explain a busy port; anything else fails at once.
        let bound = match &previous {
            Some(old) => self
                .wait_released(addr, old)
                .and_then(|()| self.bind_with_backoff(addr)),
            None => net::bind_reusable(addr, PUBLIC_BACKLOG)
                .map_err(|source| RegistryError::Bind { addr, source }),
        };
        let listener = bound.inspect_err(|err| {
            if !matches!(err, RegistryError::ReleaseTimeout(_)) {
                metrics::counter!("tcprelay_registrations_total", "result" => "bind_failed")
                    .increment(1);
            }
        })?;

        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let alive = Arc::new(());
        let (evict, evicted) = watch::channel(false);
        self.lock().entries.insert(
            addr,
            Entry {
                id,
                client_id,
                owner,
                since_unix_ms: telemetry::now_unix_ms(),
                alive: Arc::downgrade(&alive),
                evict,
            },
        );
        drop(claim);
        metrics::counter!("tcprelay_registrations_total", "result" => "ok").increment(1);
        tracing::info!(addr = %addr, client = %client_id, owner = ?owner, "registry: listening");

        Ok(Lease {
            listener,
            addr,
            id,
            evicted,
            _alive: alive,
        })
    }

    /// Waits out any registration in flight for `addr`, applies the conflict policy and
    /// claims the address. Returns the entry that was taken out of the table, if any.
    fn claim(
        &self,
        addr: SocketAddr,
        client_id: ClientId,
    ) -> Result<(Claim<'_>, Option<Entry>), RegistryError> {
        let mut table = self.lock();
        while table.claims.contains(&addr) {
            table = self
                .unclaimed
                .wait(table)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let previous = match table.entries.remove(&addr) {
            Some(old) if old.is_live() && self.policy == ConflictPolicy::Reject => {
                table.entries.insert(addr, old);
                metrics::counter!("tcprelay_registrations_total", "result" => "in_use")
                    .increment(1);
                return Err(RegistryError::AddressInUse(addr));
            }
            Some(old) if old.is_live() => {
                tracing::info!(
                    addr = %addr,
                    old_client = %old.client_id,
                    new_client = %client_id,
                    "registry: replacing listener"
                );
                let _ = old.evict.send(true);
                Some(old)
            }
            other => other,
        };

        table.claims.insert(addr);
        Ok((Claim { registry: self, addr }, previous))
    }

    /// Closes the lease's socket and drops its entry unless a newer one replaced it.
    pub fn release<L>(&self, lease: Lease<L>) {
        let (addr, id) = (lease.addr, lease.id);
        drop(lease);
        let mut table = self.lock();
        if table.entries.get(&addr).is_some_and(|e| e.id == id) {
            table.entries.remove(&addr);
        }
        drop(table);
        tracing::debug!(addr = %addr, "registry: released");
    }

    /// Removes whatever entry holds `addr` and asks its holder to close. No-op when
    /// nothing is registered.
    pub fn release_addr(&self, addr: SocketAddr) -> bool {
        let removed = self.lock().entries.remove(&addr);
        match removed {
            Some(e) => {
                let _ = e.evict.send(true);
                e.is_live()
            }
            None => false,
        }
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        let mut table = self.lock();
        table.prune();
        table.entries.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        let mut table = self.lock();
        table.prune();
        table.entries.len()
    }

    pub fn snapshot(&self) -> Vec<ListenerSnapshot> {
        let mut table = self.lock();
        table.prune();
        let mut out: Vec<ListenerSnapshot> = table
            .entries
            .iter()
            .map(|(addr, e)| ListenerSnapshot {
                addr: *addr,
                client_id: e.client_id,
                owner: e.owner,
                since_unix_ms: e.since_unix_ms,
            })
            .collect();
        out.sort_by_key(|s| s.since_unix_ms);
        out
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_released(&self, addr: SocketAddr, old: &Entry) -> Result<(), RegistryError> {
        let start = Instant::now();
        let mut delay = self.backoff.initial;
        while old.is_live() {
            if start.elapsed() >= self.backoff.deadline {
                metrics::counter!("tcprelay_registrations_total", "result" => "release_timeout")
                    .increment(1);
                return Err(RegistryError::ReleaseTimeout(addr));
            }
            std::thread::sleep(delay);
            delay = (delay * 2).min(self.backoff.max);
        }
        Ok(())
    }

    /// Binds `addr`, retrying `AddrInUse` while a just-released socket finishes closing.
    fn bind_with_backoff(&self, addr: SocketAddr) -> Result<std::net::TcpListener, RegistryError> {
        let start = Instant::now();
        let mut delay = self.backoff.initial;
        let mut attempt = 1u32;
        loop {
            match net::bind_reusable(addr, PUBLIC_BACKLOG) {
                Ok(ln) => {
                    if attempt > 1 {
                        tracing::debug!(addr = %addr, attempt, "registry: bound after retry");
                    }
                    return Ok(ln);
                }
                Err(err)
                    if err.kind() == io::ErrorKind::AddrInUse
                        && start.elapsed() + delay < self.backoff.deadline =>
                {
                    tracing::debug!(
                        addr = %addr,
                        attempt,
                        retry_in = %humantime::format_duration(delay),
                        "registry: address busy; retrying"
                    );
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(self.backoff.max);
                    attempt += 1;
                }
                Err(source) => return Err(RegistryError::Bind { addr, source }),
            }
        }
    }
}

impl Table {
    fn prune(&mut self) {
        self.entries.retain(|_, e| e.is_live());
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::TcpStream,
        sync::atomic::AtomicBool,
        thread,
    };

    use super::*;
    use crate::tcprelay::net::testing::{free_local_addr, free_local_addrs};

    fn registry(policy: ConflictPolicy) -> Arc<ListenerRegistry> {
        Arc::new(ListenerRegistry::new(
            policy,
            RebindBackoff {
                initial: Duration::from_millis(5),
                max: Duration::from_millis(50),
                deadline: Duration::from_secs(2),
            },
        ))
    }

    fn id(s: &str) -> ClientId {
        ClientId::parse(s).unwrap()
    }

    #[test]
    fn register_binds_and_release_is_idempotent() {
        let reg = registry(ConflictPolicy::Replace);
        let addr: SocketAddr = free_local_addr().into();

        let lease = reg.register(addr, id("user1"), None).unwrap();
        assert_eq!(lease.listener().local_addr().unwrap(), addr);
        assert!(reg.contains(addr));
        TcpStream::connect(addr).expect("public listener accepts");

        reg.release(lease);
        assert!(!reg.contains(addr));
        assert!(!reg.release_addr(addr));
        assert!(!reg.release_addr(addr));

        // Port is free again.
        std::net::TcpListener::bind(addr).expect("rebind after release");
    }

    #[test]
    fn dropped_lease_is_dead_and_rebinds_without_waiting() {
        let reg = registry(ConflictPolicy::Reject);
        let addr: SocketAddr = free_local_addr().into();

        drop(reg.register(addr, id("a"), None).unwrap());
        assert_eq!(reg.len(), 0);

        // Reject only applies to live holders.
        let lease = reg.register(addr, id("b"), None).unwrap();
        assert_eq!(reg.len(), 1);
        drop(lease);
    }

    #[test]
    fn replace_waits_for_old_socket_before_binding() {
        let reg = registry(ConflictPolicy::Replace);
        let addr: SocketAddr = free_local_addr().into();

        let first = reg.register(addr, id("first"), None).unwrap();
        let dropped = Arc::new(AtomicBool::new(false));
        let holder = {
            let dropped = dropped.clone();
            thread::spawn(move || {
                while !first.is_evicted() {
                    thread::sleep(Duration::from_millis(5));
                }
                // Linger a bit: the registry must wait, not race the bind.
                thread::sleep(Duration::from_millis(100));
                dropped.store(true, Ordering::SeqCst);
                drop(first);
            })
        };

        let second = reg.register(addr, id("second"), None).unwrap();
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.snapshot()[0].client_id, id("second"));
        assert_eq!(second.listener().local_addr().unwrap(), addr);
        holder.join().unwrap();
    }

    #[test]
    fn double_registration_leaves_one_live_entry() {
        let reg = registry(ConflictPolicy::Replace);
        let addr: SocketAddr = free_local_addr().into();

        let first = reg.register(addr, id("user1"), None).unwrap();
        let holder = thread::spawn(move || {
            while !first.is_evicted() {
                thread::sleep(Duration::from_millis(5));
            }
            drop(first);
        });
        thread::sleep(Duration::from_millis(20));
        let second = reg.register(addr, id("user1"), None).unwrap();
        holder.join().unwrap();

        assert_eq!(reg.len(), 1);
        drop(second);
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn reject_policy_keeps_holder() {
        let reg = registry(ConflictPolicy::Reject);
        let addr: SocketAddr = free_local_addr().into();

        let first = reg.register(addr, id("a"), None).unwrap();
        let err = reg.register(addr, id("b"), None).unwrap_err();
        assert!(matches!(err, RegistryError::AddressInUse(a) if a == addr));
        assert!(!first.is_evicted());
        assert_eq!(reg.snapshot()[0].client_id, id("a"));
    }

    #[test]
    fn replace_gives_up_when_holder_never_leaves() {
        let reg = Arc::new(ListenerRegistry::new(
            ConflictPolicy::Replace,
            RebindBackoff {
                initial: Duration::from_millis(5),
                max: Duration::from_millis(20),
                deadline: Duration::from_millis(100),
            },
        ));
        let addr: SocketAddr = free_local_addr().into();

        let stubborn = reg.register(addr, id("a"), None).unwrap();
        let err = reg.register(addr, id("b"), None).unwrap_err();
        assert!(matches!(err, RegistryError::ReleaseTimeout(_)));
        assert!(stubborn.is_evicted());
    }

    #[test]
    fn release_addr_evicts_holder() {
        let reg = registry(ConflictPolicy::Replace);
        let addr: SocketAddr = free_local_addr().into();

        let lease = reg.register(addr, id("a"), None).unwrap();
        assert!(reg.release_addr(addr));
        assert!(lease.is_evicted());
        assert!(!reg.contains(addr));
    }

    #[test]
    fn bind_failure_is_reported_without_retrying() {
        let reg = registry(ConflictPolicy::Replace);
        let squatter = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = squatter.local_addr().unwrap();

        let start = Instant::now();
        let err = reg.register(addr, id("a"), None).unwrap_err();
        assert!(matches!(err, RegistryError::Bind { .. }));
        // Nothing was replaced, so the busy port is not worth the 2 s rebind budget.
        assert!(start.elapsed() < Duration::from_millis(500), "{:?}", start.elapsed());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn squatted_port_does_not_delay_other_addresses() {
        let reg = registry(ConflictPolicy::Replace);
        let squatter = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let squatted = squatter.local_addr().unwrap();
        let free: SocketAddr = free_local_addr().into();

        let busy = {
            let reg = reg.clone();
            thread::spawn(move || {
                (0..20)
                    .map(|_| reg.register(squatted, id("squat"), None).is_err())
                    .all(|failed| failed)
            })
        };

        let start = Instant::now();
        let lease = reg.register(free, id("free"), None).unwrap();
        assert!(start.elapsed() < Duration::from_millis(500), "{:?}", start.elapsed());
        assert!(busy.join().unwrap());
        assert_eq!(reg.len(), 1);
        drop(lease);
    }

    #[test]
    fn lingering_holder_does_not_delay_other_addresses() {
        let reg = registry(ConflictPolicy::Replace);
        let addrs = free_local_addrs(2);
        let (slow, other): (SocketAddr, SocketAddr) = (addrs[0].into(), addrs[1].into());

        // Never dropped until the end of the test, so the replacement waits out its deadline.
        let stubborn = reg.register(slow, id("old"), None).unwrap();
        let replacing = {
            let reg = reg.clone();
            thread::spawn(move || reg.register(slow, id("new"), None))
        };
        while !stubborn.is_evicted() {
            thread::sleep(Duration::from_millis(5));
        }

        let start = Instant::now();
        let lease = reg.register(other, id("other"), None).unwrap();
        assert!(start.elapsed() < Duration::from_millis(500), "{:?}", start.elapsed());
        assert!(reg.contains(other));

        let err = replacing.join().unwrap().unwrap_err();
        assert!(matches!(err, RegistryError::ReleaseTimeout(a) if a == slow));
        drop((stubborn, lease));
    }

    #[test]
    fn parse_policy_names() {
        assert_eq!(parse_conflict_policy("").unwrap(), ConflictPolicy::Replace);
        assert_eq!(parse_conflict_policy(" Reject ").unwrap(), ConflictPolicy::Reject);
        assert!(parse_conflict_policy("first").is_err());
    }
}
