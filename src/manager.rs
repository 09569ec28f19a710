use std::collections::HashMap;

use crate::listener::Listener;

/// ID -> serving Listener. One table mutex; at most one Listener per ID.
pub struct ListenerManager {
    listeners: tokio::sync::Mutex<HashMap<String, Listener>>,
}

impl Default for ListenerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerManager {
    pub fn new() -> Self {
        Self {
            listeners: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Registers an already-serving listener. A listener it displaces is
    /// closed first so two can never serve under one ID.
    pub async fn add_listener(&self, id: &str, listener: Listener) {
        let mut listeners = self.listeners.lock().await;
        if let Some(old) = listeners.remove(id) {
            old.close().await;
        }
        listeners.insert(id.to_string(), listener);
    }

    /// Removes and closes. A missing ID is a no-op, and Listener::close
    /// itself is idempotent.
    pub async fn close_listener(&self, id: &str) {
        let mut listeners = self.listeners.lock().await;
        if let Some(l) = listeners.remove(id) {
            l.close().await;
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.listeners.lock().await.contains_key(id)
    }

    pub async fn close_all(&self) {
        let mut listeners = self.listeners.lock().await;
        for (_, l) in listeners.drain() {
            l.close().await;
        }
    }
}
