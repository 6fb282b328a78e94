use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::tcprelay::{
    admin,
    config::{self, Config, RelayConfig, RelayEngine},
    logging, net, telemetry,
    tunnel::{
        client::{Client, ClientOptions},
        entry::{EntryOptions, EntryServer},
        exit::{ExitOptions, ExitServer},
        reactor::{self, ReactorOptions},
        registry::ListenerRegistry,
        server::{Server, ServerOptions},
        session::RelayOptions,
    },
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        admin_addr = %cfg.admin_addr,
        relays = cfg.relays.len(),
        tunnels = cfg.tunnels.len(),
        exits = cfg.exits.len(),
        entries = cfg.entries.len(),
        "tcprelay: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let sessions = Arc::new(telemetry::SessionRegistry::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    let registries = spawn_relays(&cfg, &sessions, &shutdown_rx, &mut tasks)?;

    if !cfg.admin_addr.is_empty() {
        let addr: SocketAddr = net::normalize_bind_addr(&cfg.admin_addr)
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let state = admin::AdminState {
            prom: prom.clone(),
            sessions: sessions.clone(),
            registries,
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    for t in &cfg.tunnels {
        let client = Client::new(
            ClientOptions {
                server_addr: t.server_addr.clone(),
                target_addr: t.target_addr.clone(),
                public_addr: t.public_addr,
                client_id: t.client_id,
                dial_timeout: t.dial_timeout,
                response_timeout: t.response_timeout,
                max_sessions: t.max_sessions,
                relay: RelayOptions {
                    read_timeout: t.read_timeout,
                    chunk_size: t.chunk_size,
                    ..RelayOptions::default()
                },
            },
            sessions.clone(),
        )?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.run(shutdown).await });
    }

    for x in &cfg.exits {
        let exit = ExitServer::new(
            ExitOptions {
                listen_addr: x.listen_addr,
                registration_timeout: x.registration_timeout,
                dial_timeout: x.dial_timeout,
                allow: x.allow.clone(),
                relay: RelayOptions {
                    read_timeout: x.read_timeout,
                    chunk_size: x.chunk_size,
                    ..RelayOptions::default()
                },
            },
            sessions.clone(),
        );
        let ln = exit.bind()?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { exit.serve(ln, shutdown).await });
    }

    for e in &cfg.entries {
        let entry = EntryServer::new(
            EntryOptions {
                listen_addr: e.listen_addr,
                exit_addr: e.exit_addr.clone(),
                target: e.target,
                client_id: e.client_id,
                dial_timeout: e.dial_timeout,
                response_timeout: e.response_timeout,
                relay: RelayOptions {
                    read_timeout: e.read_timeout,
                    chunk_size: e.chunk_size,
                    ..RelayOptions::default()
                },
            },
            sessions.clone(),
        )?;
        let ln = entry.bind()?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { entry.serve(ln, shutdown).await });
    }

    // Wait for Ctrl-C / SIGTERM or a role that stops on its own.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            match res {
                Some(Ok(Ok(()))) => tracing::warn!("shutdown: a role exited"),
                Some(Ok(Err(err))) => return Err(err),
                Some(Err(join_err)) => return Err(join_err.into()),
                None => {}
            }
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(timeout = ?DRAIN_TIMEOUT, "shutdown: drain timed out, aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

/// Starts every configured relay and returns their registries for the admin API. Listeners
/// are bound before returning so a busy port fails startup.
fn spawn_relays(
    cfg: &Config,
    sessions: &telemetry::SharedSessions,
    shutdown: &watch::Receiver<bool>,
    tasks: &mut JoinSet<anyhow::Result<()>>,
) -> anyhow::Result<Vec<Arc<ListenerRegistry>>> {
    let mut registries = Vec::with_capacity(cfg.relays.len());
    for r in &cfg.relays {
        let registry = Arc::new(ListenerRegistry::new(r.on_conflict, r.rebind.clone()));
        registries.push(registry.clone());
        tracing::info!(
            listen_addr = %r.listen_addr,
            engine = %r.engine,
            on_conflict = %r.on_conflict,
            "relay: configured"
        );

        match r.engine {
            RelayEngine::Threaded => {
                let server = Server::new(threaded_options(r), registry, sessions.clone());
                let ln = server.bind()?;
                let shutdown = shutdown.clone();
                tasks.spawn(async move { server.serve(ln, shutdown).await });
            }
            RelayEngine::Reactor => {
                let handle = reactor::spawn(reactor_options(r), registry, sessions.clone())?;
                let mut shutdown = shutdown.clone();
                tasks.spawn(async move {
                    let _ = shutdown.wait_for(|v| *v).await;
                    tokio::task::spawn_blocking(move || handle.shutdown())
                        .await
                        .context("reactor: join")?;
                    Ok(())
                });
            }
        }
    }
    Ok(registries)
}

fn threaded_options(r: &RelayConfig) -> ServerOptions {
    ServerOptions {
        listen_addr: r.listen_addr,
        registration_timeout: r.registration_timeout,
        relay: RelayOptions {
            read_timeout: r.read_timeout,
            chunk_size: r.chunk_size,
            queue_depth: r.queue_capacity,
        },
    }
}

fn reactor_options(r: &RelayConfig) -> ReactorOptions {
    ReactorOptions {
        listen_addr: r.listen_addr,
        registration_timeout: r.registration_timeout,
        workers: r.workers,
        queue_capacity: r.queue_capacity,
        chunk_size: r.chunk_size,
        write_timeout: r.write_timeout,
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
