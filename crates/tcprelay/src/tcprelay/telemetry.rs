use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Threaded,
    Reactor,
    Exit,
    Entry,
    Tunnel,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Threaded => "threaded",
            Engine::Reactor => "reactor",
            Engine::Exit => "exit",
            Engine::Entry => "entry",
            Engine::Tunnel => "tunnel",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub engine: Engine,
    /// Peer of the user-facing side.
    pub external: String,
    /// Peer of the tunnel (or target) side.
    pub tunnel: String,
    pub target: String,
    pub started_at_unix_ms: u64,
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionInfo>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn add(&self, s: SessionInfo) {
        metrics::counter!("tcprelay_sessions_total", "engine" => s.engine.as_str()).increment(1);
        metrics::gauge!("tcprelay_active_sessions").increment(1.0);
        self.sessions.insert(s.id.clone(), s);
    }

    pub fn remove(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            metrics::gauge!("tcprelay_active_sessions").decrement(1.0);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut out = Vec::with_capacity(self.sessions.len());
        for s in self.sessions.iter() {
            out.push(s.value().clone());
        }
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

/// Counts relayed bytes; `direction` names the receiving side (`"to_tunnel"`, `"to_target"`, ...).
pub fn record_bytes(engine: Engine, direction: &'static str, n: u64) {
    if n > 0 {
        metrics::counter!(
            "tcprelay_bytes_total",
            "engine" => engine.as_str(),
            "direction" => direction
        )
        .increment(n);
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_session_id(prefix: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}{n}")
}

pub type SharedSessions = Arc<SessionRegistry>;

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
