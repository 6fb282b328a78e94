use std::{
    fs,
    net::{SocketAddr, SocketAddrV4},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::tcprelay::{
    net,
    tunnel::{
        frame::ClientId,
        registry::{self, ConflictPolicy, RebindBackoff},
    },
};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap folds TCPRELAY_CONFIG into the flag; this covers callers that bypass the CLI.
    if let Some(p) = std::env::var_os("TCPRELAY_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|_| p.join("tcprelay.toml")));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["tcprelay.toml", "tcprelay.yaml", "tcprelay.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no tcprelay.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/tcprelay/tcprelay.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        use directories::ProjectDirs;

        let proj = ProjectDirs::from("com", "tcprelay", "tcprelay")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("tcprelay.toml"))
    }
}

/// Writes the default template when nothing exists at `path`. Returns whether a file was
/// created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!(
            "config: {} exists but is not a regular file",
            path.display()
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match extension_of(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = extension_of(path);
    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Empty disables the admin server.
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub relays: Vec<RelayConfig>,
    pub tunnels: Vec<TunnelConfig>,
    pub exits: Vec<ExitConfig>,
    pub entries: Vec<EntryConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEngine {
    Threaded,
    Reactor,
}

impl std::fmt::Display for RelayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayEngine::Threaded => write!(f, "threaded"),
            RelayEngine::Reactor => write!(f, "reactor"),
        }
    }
}

fn parse_engine(name: &str) -> anyhow::Result<RelayEngine> {
    match name.trim().to_ascii_lowercase().as_str() {
        "" | "threaded" => Ok(RelayEngine::Threaded),
        "reactor" => Ok(RelayEngine::Reactor),
        _ => anyhow::bail!("unknown engine {name:?} (expected threaded|reactor)"),
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub engine: RelayEngine,
    pub on_conflict: ConflictPolicy,
    pub registration_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub chunk_size: usize,
    /// Reactor writer threads; 0 writes inline on the poll thread.
    pub workers: usize,
    pub queue_capacity: usize,
    pub rebind: RebindBackoff,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub server_addr: String,
    pub target_addr: String,
    pub public_addr: SocketAddrV4,
    pub client_id: ClientId,
    pub dial_timeout: Duration,
    pub response_timeout: Duration,
    pub max_sessions: usize,
    pub read_timeout: Duration,
    pub chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct ExitConfig {
    pub listen_addr: SocketAddr,
    pub registration_timeout: Duration,
    pub dial_timeout: Duration,
    pub allow: Vec<SocketAddrV4>,
    pub read_timeout: Duration,
    pub chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct EntryConfig {
    pub listen_addr: SocketAddr,
    pub exit_addr: String,
    pub target: SocketAddrV4,
    pub client_id: ClientId,
    pub dial_timeout: Duration,
    pub response_timeout: Duration,
    pub read_timeout: Duration,
    pub chunk_size: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,

    #[serde(default)]
    relay: Vec<FileRelay>,

    #[serde(default)]
    tunnel: Vec<FileTunnel>,

    #[serde(default)]
    exit: Vec<FileExit>,

    #[serde(default)]
    entry: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRelay {
    listen_addr: Option<String>,
    engine: Option<String>,
    on_conflict: Option<String>,
    registration_timeout_ms: Option<i64>,
    read_timeout_ms: Option<i64>,
    write_timeout_ms: Option<i64>,
    chunk_size: Option<i64>,
    workers: Option<i64>,
    queue_capacity: Option<i64>,
    rebind_initial_ms: Option<i64>,
    rebind_max_ms: Option<i64>,
    rebind_deadline_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    server_addr: String,
    target_addr: String,
    public_host: Option<String>,
    public_port: u16,
    client_id: Option<String>,
    dial_timeout_ms: Option<i64>,
    response_timeout_ms: Option<i64>,
    max_sessions: Option<i64>,
    read_timeout_ms: Option<i64>,
    chunk_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileExit {
    listen_addr: String,
    registration_timeout_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    #[serde(default)]
    allow: Vec<String>,
    read_timeout_ms: Option<i64>,
    chunk_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileEntry {
    listen_addr: String,
    exit_addr: String,
    target: String,
    client_id: Option<String>,
    dial_timeout_ms: Option<i64>,
    response_timeout_ms: Option<i64>,
    read_timeout_ms: Option<i64>,
    chunk_size: Option<i64>,
}

const DEFAULT_LISTEN_ADDR: &str = ":10086";
const DEFAULT_CLIENT_ID: &str = "0";

fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default_ms),
    }
}

fn count(v: Option<i64>, default: usize) -> usize {
    match v {
        Some(n) if n >= 0 => n as usize,
        _ => default,
    }
}

fn positive(v: Option<i64>, default: usize) -> usize {
    match v {
        Some(n) if n > 0 => n as usize,
        _ => default,
    }
}

fn parse_listen_addr(s: &str) -> anyhow::Result<SocketAddr> {
    let s = net::normalize_bind_addr(s);
    s.parse::<SocketAddr>()
        .map_err(|_| anyhow::anyhow!("invalid listen address {s:?}"))
}

fn parse_client_id(s: Option<&str>) -> anyhow::Result<ClientId> {
    let s = s.map(str::trim).filter(|s| !s.is_empty()).unwrap_or(DEFAULT_CLIENT_ID);
    Ok(ClientId::parse(s)?)
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig::default(),
            relays: vec![],
            tunnels: vec![],
            exits: vec![],
            entries: vec![],
        };

        // --- Logging ---
        if let Some(l) = &fc.logging {
            let set = |dst: &mut String, v: &Option<String>| {
                if let Some(v) = v.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                    *dst = v.to_string();
                }
            };
            set(&mut cfg.logging.level, &l.level);
            set(&mut cfg.logging.format, &l.format);
            set(&mut cfg.logging.output, &l.output);
            cfg.logging.add_source = l.add_source;
        }

        // --- Relays ---
        for (i, r) in fc.relay.iter().enumerate() {
            let listen = r.listen_addr.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR);
            let engine = parse_engine(r.engine.as_deref().unwrap_or(""))
                .with_context(|| format!("config: relay[{i}]"))?;
            let defaults = RebindBackoff::default();
            cfg.relays.push(RelayConfig {
                listen_addr: parse_listen_addr(listen)
                    .with_context(|| format!("config: relay[{i}].listen_addr"))?,
                engine,
                on_conflict: registry::parse_conflict_policy(r.on_conflict.as_deref().unwrap_or(""))
                    .with_context(|| format!("config: relay[{i}].on_conflict"))?,
                registration_timeout: millis(r.registration_timeout_ms, 10_000),
                read_timeout: millis(r.read_timeout_ms, 5_000),
                write_timeout: millis(r.write_timeout_ms, 10_000),
                chunk_size: positive(r.chunk_size, 10 * 1024),
                workers: count(r.workers, 5),
                queue_capacity: positive(
                    r.queue_capacity,
                    match engine {
                        RelayEngine::Threaded => 64,
                        RelayEngine::Reactor => 1024,
                    },
                ),
                rebind: RebindBackoff {
                    initial: millis(r.rebind_initial_ms, defaults.initial.as_millis() as u64),
                    max: millis(r.rebind_max_ms, defaults.max.as_millis() as u64),
                    deadline: millis(r.rebind_deadline_ms, defaults.deadline.as_millis() as u64),
                },
            });
        }

        // --- Tunnel clients ---
        for (i, t) in fc.tunnel.iter().enumerate() {
            let server_addr = t.server_addr.trim().to_string();
            if server_addr.is_empty() {
                anyhow::bail!("config: tunnel[{i}] missing server_addr");
            }
            let target_addr = t.target_addr.trim().to_string();
            if target_addr.is_empty() {
                anyhow::bail!("config: tunnel[{i}] missing target_addr");
            }
            let host = net::ipv4_or_unspecified(t.public_host.as_deref().unwrap_or(""))
                .with_context(|| format!("config: tunnel[{i}].public_host"))?;
            cfg.tunnels.push(TunnelConfig {
                server_addr,
                target_addr,
                public_addr: SocketAddrV4::new(host, t.public_port),
                client_id: parse_client_id(t.client_id.as_deref())
                    .with_context(|| format!("config: tunnel[{i}].client_id"))?,
                dial_timeout: millis(t.dial_timeout_ms, 5_000),
                response_timeout: millis(t.response_timeout_ms, 30_000),
                max_sessions: positive(t.max_sessions, 16),
                read_timeout: millis(t.read_timeout_ms, 5_000),
                chunk_size: positive(t.chunk_size, 10 * 1024),
            });
        }

        // --- Exits ---
        for (i, x) in fc.exit.iter().enumerate() {
            let allow = x
                .allow
                .iter()
                .map(|a| net::parse_ipv4_target(a))
                .collect::<anyhow::Result<Vec<_>>>()
                .with_context(|| format!("config: exit[{i}].allow"))?;
            cfg.exits.push(ExitConfig {
                listen_addr: parse_listen_addr(&x.listen_addr)
                    .with_context(|| format!("config: exit[{i}].listen_addr"))?,
                registration_timeout: millis(x.registration_timeout_ms, 10_000),
                dial_timeout: millis(x.dial_timeout_ms, 5_000),
                allow,
                read_timeout: millis(x.read_timeout_ms, 5_000),
                chunk_size: positive(x.chunk_size, 10 * 1024),
            });
        }

        // --- Entries ---
        for (i, e) in fc.entry.iter().enumerate() {
            let exit_addr = e.exit_addr.trim().to_string();
            if exit_addr.is_empty() {
                anyhow::bail!("config: entry[{i}] missing exit_addr");
            }
            cfg.entries.push(EntryConfig {
                listen_addr: parse_listen_addr(&e.listen_addr)
                    .with_context(|| format!("config: entry[{i}].listen_addr"))?,
                exit_addr,
                target: net::parse_ipv4_target(&e.target)
                    .with_context(|| format!("config: entry[{i}].target"))?,
                client_id: parse_client_id(e.client_id.as_deref())
                    .with_context(|| format!("config: entry[{i}].client_id"))?,
                dial_timeout: millis(e.dial_timeout_ms, 5_000),
                response_timeout: millis(e.response_timeout_ms, 10_000),
                read_timeout: millis(e.read_timeout_ms, 5_000),
                chunk_size: positive(e.chunk_size, 10 * 1024),
            });
        }

        if cfg.relays.is_empty()
            && cfg.tunnels.is_empty()
            && cfg.exits.is_empty()
            && cfg.entries.is_empty()
        {
            anyhow::bail!("config: nothing to run (configure at least one relay, tunnel, exit or entry)");
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# tcprelay configuration (auto-generated)
#
# This file was created because tcprelay could not find a configuration file at the
# resolved config path. As written it runs a single relay that tunnel clients can
# register with on port 10086.

admin_addr = ":8080"

[logging]
level = "info"
format = "json"   # json | text
output = "stderr" # stderr | stdout | discard | <file path>
add_source = false

[[relay]]
listen_addr = ":10086"
engine = "threaded"    # threaded | reactor
on_conflict = "replace" # replace | reject
registration_timeout_ms = 10000
read_timeout_ms = 5000
write_timeout_ms = 10000
chunk_size = 10240
workers = 5

# [[tunnel]]
# server_addr = "relay.example.com:10086"
# target_addr = "127.0.0.1:3389"
# public_port = 13389
# client_id = "desktop"
# response_timeout_ms = 30000
# max_sessions = 16

# [[exit]]
# listen_addr = ":10087"
# allow = ["10.0.0.5:22"]

# [[entry]]
# listen_addr = "127.0.0.1:2222"
# exit_addr = "exit.example.com:10087"
# target = "10.0.0.5:22"
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# tcprelay configuration (auto-generated)
#
# This file was created because tcprelay could not find a configuration file at the
# resolved config path. As written it runs a single relay that tunnel clients can
# register with on port 10086.

admin_addr: ":8080"

logging:
  level: "info"
  format: "json"   # json | text
  output: "stderr" # stderr | stdout | discard | <file path>
  add_source: false

relay:
  - listen_addr: ":10086"
    engine: "threaded"     # threaded | reactor
    on_conflict: "replace" # replace | reject
    registration_timeout_ms: 10000
    read_timeout_ms: 5000
    write_timeout_ms: 10000
    chunk_size: 10240
    workers: 5

# tunnel:
#   - server_addr: "relay.example.com:10086"
#     target_addr: "127.0.0.1:3389"
#     public_port: 13389
#     client_id: "desktop"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "tcprelay_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    fn load_str(name: &str, file: &str, body: &str) -> anyhow::Result<Config> {
        let dir = temp_dir(name);
        let cfg_path = dir.join(file);
        std::fs::write(&cfg_path, body).expect("write");
        let out = load_config(&cfg_path);
        let _ = std::fs::remove_dir_all(&dir);
        out
    }

    #[test]
    fn default_templates_load() {
        let toml = load_str("tmpl_toml", "tcprelay.toml", DEFAULT_CONFIG_TEMPLATE_TOML)
            .expect("toml template");
        assert_eq!(toml.relays.len(), 1);
        assert_eq!(toml.relays[0].listen_addr, "0.0.0.0:10086".parse().unwrap());
        assert_eq!(toml.admin_addr, ":8080");

        let yaml = load_str("tmpl_yaml", "tcprelay.yaml", DEFAULT_CONFIG_TEMPLATE_YAML)
            .expect("yaml template");
        assert_eq!(yaml.relays.len(), 1);
        assert_eq!(yaml.relays[0].workers, 5);
    }

    #[test]
    fn relay_defaults_apply() {
        let cfg = load_str("relay_defaults", "tcprelay.toml", "[[relay]]\n").expect("load");
        let r = &cfg.relays[0];
        assert_eq!(r.engine, RelayEngine::Threaded);
        assert_eq!(r.on_conflict, ConflictPolicy::Replace);
        assert_eq!(r.registration_timeout, Duration::from_secs(10));
        assert_eq!(r.read_timeout, Duration::from_secs(5));
        assert_eq!(r.chunk_size, 10 * 1024);
        assert_eq!(r.workers, 5);
        assert_eq!(r.queue_capacity, 64);
        assert_eq!(cfg.logging.format, "json");
    }

    #[test]
    fn reactor_with_zero_workers_is_allowed() {
        let cfg = load_str(
            "reactor",
            "tcprelay.toml",
            "[[relay]]\nengine = \"Reactor\"\nworkers = 0\non_conflict = \"reject\"\n",
        )
        .expect("load");
        let r = &cfg.relays[0];
        assert_eq!(r.engine, RelayEngine::Reactor);
        assert_eq!(r.workers, 0);
        assert_eq!(r.queue_capacity, 1024);
        assert_eq!(r.on_conflict, ConflictPolicy::Reject);
    }

    #[test]
    fn tunnel_section_normalizes() {
        let body = r#"
[[tunnel]]
server_addr = " relay.example.com:10086 "
target_addr = "127.0.0.1:3389"
public_port = 13389
client_id = "desk"
"#;
        let cfg = load_str("tunnel", "tcprelay.toml", body).expect("load");
        let t = &cfg.tunnels[0];
        assert_eq!(t.server_addr, "relay.example.com:10086");
        assert_eq!(t.public_addr, "0.0.0.0:13389".parse().unwrap());
        assert_eq!(t.client_id, ClientId::parse("desk").unwrap());
        assert_eq!(t.response_timeout, Duration::from_secs(30));
        assert_eq!(t.max_sessions, 16);
    }

    #[test]
    fn yaml_exit_and_entry_load() {
        let body = r#"
exit:
  - listen_addr: ":10087"
    allow: ["10.0.0.5:22"]
entry:
  - listen_addr: "127.0.0.1:2222"
    exit_addr: "exit.example.com:10087"
    target: "10.0.0.5:22"
"#;
        let cfg = load_str("dial", "tcprelay.yml", body).expect("load");
        assert_eq!(cfg.exits[0].allow, vec!["10.0.0.5:22".parse::<SocketAddrV4>().unwrap()]);
        assert_eq!(cfg.entries[0].target, "10.0.0.5:22".parse().unwrap());
        assert_eq!(cfg.entries[0].client_id, ClientId::parse("0").unwrap());
    }

    #[test]
    fn bad_values_are_config_errors() {
        let cases = [
            ("engine", "[[relay]]\nengine = \"epoll\"\n", "engine"),
            ("policy", "[[relay]]\non_conflict = \"merge\"\n", "conflict"),
            (
                "client_id",
                "[[tunnel]]\nserver_addr = \"a:1\"\ntarget_addr = \"b:2\"\npublic_port = 1\nclient_id = \"this-id-is-way-too-long\"\n",
                "client_id",
            ),
            (
                "public_host",
                "[[tunnel]]\nserver_addr = \"a:1\"\ntarget_addr = \"b:2\"\npublic_port = 1\npublic_host = \"example.com\"\n",
                "public_host",
            ),
            ("unknown", "[[relay]]\nlisten = \":1\"\n", "unknown field"),
            ("empty", "admin_addr = \":8080\"\n", "nothing to run"),
        ];
        for (name, body, needle) in cases {
            let err = load_str(name, "tcprelay.toml", body).unwrap_err();
            let msg = format!("{err:#}").to_ascii_lowercase();
            assert!(msg.contains(needle), "{name}: expected {needle:?} in {msg}");
        }
    }

    #[test]
    fn ensure_config_file_creates_once() {
        let dir = temp_dir("ensure");
        let path = dir.join("nested").join("tcprelay.toml");
        assert!(ensure_config_file(&path).expect("create"));
        assert!(!ensure_config_file(&path).expect("exists"));
        assert!(load_config(&path).is_ok());

        let err = ensure_config_file(&dir.join("tcprelay.ini")).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_directory_discovers_config() {
        let dir = temp_dir("discover");
        std::fs::write(dir.join("tcprelay.yaml"), DEFAULT_CONFIG_TEMPLATE_YAML).expect("write");
        let resolved = resolve_config_path(Some(dir.clone())).expect("resolve");
        assert_eq!(resolved.path, dir.join("tcprelay.yaml"));
        assert!(matches!(resolved.source, ConfigPathSource::Flag));

        let missing = resolve_config_path(Some(dir.join("other"))).expect("resolve");
        assert_eq!(missing.path, dir.join("other.toml"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
