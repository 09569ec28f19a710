use std::{fs, path::Path, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::{
    config, gateway::Gateway, http_route::RouteRegistry, listener::Listener,
    listener::ListenerOptions, logging, manager::ListenerManager, session::SessionManager,
    watcher::{self, Watcher},
};

/// Gateway process entrypoint: wire everything up, serve until a signal.
///
/// Everything that can fail here is a fatal init error; once the accept
/// loops are running, failures are per-connection and handled locally.
pub async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let cfg = config::load_config(&config_path)
        .with_context(|| format!("load config: {}", config_path.display()))?;

    let _log_guard = logging::init(&cfg.logging)?;

    tracing::info!(
        config = %config_path.display(),
        listen_addr = %cfg.gateway.listen_addr,
        listener_file = %cfg.listener_file,
        auto_reload = cfg.auto_reload,
        "gateway: starting"
    );

    // The route registry and SSL material must be in place before any
    // http/https listener serves.
    let routes = Arc::new(
        RouteRegistry::from_config(&cfg.http_routes).context("init http routes")?,
    );
    if !cfg.ssl_file.trim().is_empty() {
        push_ssl_configs(Path::new(&cfg.ssl_file), &routes).await?;
    }

    let sessions = Arc::new(SessionManager::new());
    let listeners = Arc::new(ListenerManager::new());
    let gateway = Arc::new(Gateway::new(cfg.gateway.bind_addr(), sessions.clone()));

    let listener_cfgs = config::load_listener_configs(Path::new(&cfg.listener_file))
        .with_context(|| format!("load listener file: {}", cfg.listener_file))?;
    for lc in &listener_cfgs {
        let l = Listener::start(
            lc.clone(),
            sessions.clone(),
            &routes,
            ListenerOptions::default(),
        )
        .await
        .with_context(|| format!("start listener {}", lc.id))?;
        listeners.add_listener(&lc.id, l).await;
    }
    gateway.set_allowed_client_ids(watcher::allowed_client_ids(&listener_cfgs));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    if cfg.auto_reload {
        let w = Watcher::new(
            watcher::WatcherOptions {
                listener_file: PathBuf::from(&cfg.listener_file),
                interval: watcher::DEFAULT_INTERVAL,
                sessions: sessions.clone(),
                listeners: listeners.clone(),
                gateway: gateway.clone(),
                routes: routes.clone(),
                listener_opts: ListenerOptions::default(),
            },
            listener_cfgs,
        );
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { w.run(shutdown).await });
    }

    {
        let gateway = gateway.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { gateway.listen_and_serve(shutdown).await });
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("gateway: shutdown signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                let _ = shutdown_tx.send(true);
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        listeners.close_all().await;
                        return Err(err);
                    }
                    Err(join_err) => {
                        listeners.close_all().await;
                        return Err(join_err.into());
                    }
                }
            }
        }
    }

    listeners.close_all().await;

    // Bounded drain so a stuck task cannot stall process exit.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn push_ssl_configs(path: &Path, routes: &RouteRegistry) -> anyhow::Result<()> {
    let ssls = config::load_ssl_configs(path)
        .with_context(|| format!("load ssl file: {}", path.display()))?;

    for ssl in &ssls {
        let cert = fs::read_to_string(&ssl.cert_file)
            .with_context(|| format!("ssl {}: read cert {}", ssl.id, ssl.cert_file))?;
        let key = fs::read_to_string(&ssl.key_file)
            .with_context(|| format!("ssl {}: read key {}", ssl.id, ssl.key_file))?;
        let route = routes.get(&ssl.http_route_type).with_context(|| {
            format!("ssl {}: route type {} not configured", ssl.id, ssl.http_route_type)
        })?;
        route
            .update_ssl(&ssl.id, &cert, &key, &ssl.snis)
            .await
            .with_context(|| format!("ssl {}: push to router", ssl.id))?;
        tracing::info!(id = %ssl.id, snis = ?ssl.snis, "gateway: ssl installed");
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                tracing::warn!(err = %err, "gateway: install SIGTERM handler failed");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
