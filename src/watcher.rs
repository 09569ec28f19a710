use std::{collections::HashSet, path::PathBuf, sync::Arc, time::Duration};

use crate::{
    config::{self, ListenerConfig},
    gateway::Gateway,
    http_route::RouteRegistry,
    listener::{Listener, ListenerOptions},
    manager::ListenerManager,
    session::SessionManager,
};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct WatcherOptions {
    pub listener_file: PathBuf,
    pub interval: Duration,
    pub sessions: Arc<SessionManager>,
    pub listeners: Arc<ListenerManager>,
    pub gateway: Arc<Gateway>,
    pub routes: Arc<RouteRegistry>,
    pub listener_opts: ListenerOptions,
}

/// Periodic diff-apply of the listener config file, so endpoints come and
/// go without a restart.
pub struct Watcher {
    opts: WatcherOptions,
    current: Vec<ListenerConfig>,
}

impl Watcher {
    /// `current` is the set of configs already serving at startup.
    pub fn new(opts: WatcherOptions, current: Vec<ListenerConfig>) -> Self {
        Self { opts, current }
    }

    pub async fn run(
        mut self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut tick = tokio::time::interval(self.opts.interval);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tick.tick() => {
                    self.reload().await;
                }
            }
        }
    }

    /// One reload cycle. A parse error leaves everything as it was.
    pub async fn reload(&mut self) {
        let newest = match config::load_listener_configs(&self.opts.listener_file) {
            Ok(configs) => configs,
            Err(err) => {
                tracing::warn!(
                    file = %self.opts.listener_file.display(),
                    err = %err,
                    "watcher: parse listener file failed, skipping cycle"
                );
                return;
            }
        };

        let added = added_configs(&self.current, &newest);
        let deleted = deleted_configs(&self.current, &newest);
        if !added.is_empty() || !deleted.is_empty() {
            tracing::info!(add = added.len(), delete = deleted.len(), "watcher: applying changes");
        }

        // Deletes first so a moved bind address is free before re-use.
        for cfg in &deleted {
            tracing::info!(id = %cfg.id, "watcher: delete listener");
            self.opts.listeners.close_listener(&cfg.id).await;
        }

        for cfg in &added {
            // Replace semantics: a changed ID gives up its old listener
            // before the new one binds.
            self.opts.listeners.close_listener(&cfg.id).await;

            tracing::info!(id = %cfg.id, client_id = %cfg.client_id, "watcher: add listener");
            match Listener::start(
                cfg.clone(),
                self.opts.sessions.clone(),
                &self.opts.routes,
                self.opts.listener_opts.clone(),
            )
            .await
            {
                Ok(l) => self.opts.listeners.add_listener(&cfg.id, l).await,
                Err(err) => {
                    tracing::warn!(id = %cfg.id, err = %err, "watcher: start listener failed");
                }
            }
        }

        self.opts
            .gateway
            .set_allowed_client_ids(allowed_client_ids(&newest));
        self.current = newest;
    }
}

/// ClientIDs a listener set admits: the union across its configs.
pub fn allowed_client_ids(configs: &[ListenerConfig]) -> HashSet<String> {
    configs.iter().map(|c| c.client_id.clone()).collect()
}

/// Entries to start: IDs new to the table, plus IDs whose config changed by
/// deep equality.
fn added_configs(cur: &[ListenerConfig], newest: &[ListenerConfig]) -> Vec<ListenerConfig> {
    newest
        .iter()
        .filter(|n| !cur.iter().any(|c| c.id == n.id && c == *n))
        .cloned()
        .collect()
}

/// Entries to close: IDs absent from the new list.
fn deleted_configs(cur: &[ListenerConfig], newest: &[ListenerConfig]) -> Vec<ListenerConfig> {
    cur.iter()
        .filter(|c| !newest.iter().any(|n| n.id == c.id))
        .cloned()
        .collect()
}
