//! Named collection of connections.
//!
//! [`Registry`] owns every [`Connection`] by name. Global handlers registered
//! with [`Registry::on`] are attached to each connection it creates; removal
//! hooks let dependents such as the room and auth managers drop their
//! references when a connection goes away.
//!
//! Shared as `Arc<Registry>`; the maps sit behind short synchronous locks so
//! event handlers can look connections up without awaiting.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;

use crate::config::ConnectionOptions;
use crate::connection::{Connection, ConnectionError, ConnectionState};
use crate::events::{catch_panic, ConnectionEvent, EventHandler, EventKind};
use crate::transport::{Connector, WsConnector};

type RemovalHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Connection {0} already exists")]
    AlreadyExists(String),

    #[error("Connection {0} not found")]
    NotFound(String),
}

/// Outcome of a bulk connect.
#[derive(Debug, Default)]
pub struct BulkReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, ConnectionError)>,
}

impl BulkReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Registry {
    connector: Arc<dyn Connector>,
    connections: RwLock<HashMap<String, Connection>>,
    global_handlers: RwLock<Vec<(EventKind, EventHandler)>>,
    removal_hooks: RwLock<Vec<RemovalHook>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A registry whose connections use WebSockets.
    pub fn new() -> Self {
        Self::with_connector(Arc::new(WsConnector::new()))
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: RwLock::new(HashMap::new()),
            global_handlers: RwLock::new(Vec::new()),
            removal_hooks: RwLock::new(Vec::new()),
        }
    }

    /// Create and store a connection, attaching every current global
    /// handler. The connection is not opened.
    pub fn create(
        &self,
        name: impl Into<String>,
        url: impl Into<String>,
        options: ConnectionOptions,
    ) -> Result<Connection, RegistryError> {
        let name = name.into();
        let mut connections = self.connections.write();
        if connections.contains_key(&name) {
            return Err(RegistryError::AlreadyExists(name));
        }

        let conn = Connection::new(name.clone(), url, options, Arc::clone(&self.connector));
        for (kind, handler) in self.global_handlers.read().iter() {
            conn.add_handler(kind.clone(), Arc::clone(handler));
        }
        connections.insert(name.clone(), conn.clone());

        tracing::debug!(connection = %name, url = %conn.url(), "Connection created");
        Ok(conn)
    }

    /// Disconnect and drop a connection, then run the removal hooks.
    pub async fn remove(&self, name: &str) -> Result<(), RegistryError> {
        let conn = self
            .connections
            .write()
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        conn.disconnect().await;

        let hooks: Vec<RemovalHook> = self.removal_hooks.read().clone();
        for hook in hooks {
            if let Err(panic) = catch_panic(|| hook(name)) {
                tracing::error!(connection = %name, panic = %panic, "Removal hook panicked");
            }
        }

        tracing::info!(connection = %name, "Connection removed");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Connection> {
        self.connections.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.connections.read().contains_key(name)
    }

    /// Connection names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Current state of every connection, sorted by name.
    pub fn states(&self) -> Vec<(String, ConnectionState)> {
        let mut states: Vec<(String, ConnectionState)> = self
            .connections
            .read()
            .iter()
            .map(|(name, conn)| (name.clone(), conn.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    fn snapshot(&self) -> Vec<Connection> {
        self.connections.read().values().cloned().collect()
    }

    // ---- handlers ----

    /// Register a handler for connections created from now on.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&ConnectionEvent, &Connection) + Send + Sync + 'static,
    {
        self.add_global_handler(kind, Arc::new(handler), false);
    }

    /// Register a handler for future connections and attach it to every
    /// existing one.
    pub fn on_retroactive<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&ConnectionEvent, &Connection) + Send + Sync + 'static,
    {
        self.add_global_handler(kind, Arc::new(handler), true);
    }

    pub fn add_global_handler(&self, kind: EventKind, handler: EventHandler, retroactive: bool) {
        // Hold the connections lock so a concurrent create sees either the
        // new handler or the back-applied one, never neither.
        let connections = self.connections.read();
        self.global_handlers
            .write()
            .push((kind.clone(), Arc::clone(&handler)));
        if retroactive {
            for conn in connections.values() {
                conn.add_handler(kind.clone(), Arc::clone(&handler));
            }
        }
    }

    /// Run `hook(name)` whenever a connection is removed.
    pub fn on_remove<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.removal_hooks.write().push(Arc::new(hook));
    }

    // ---- bulk operations ----

    /// Connect every connection concurrently. One failure does not stop the
    /// others; failures are collected in the report.
    pub async fn connect_all(&self) -> BulkReport {
        let connections = self.snapshot();
        let results = join_all(connections.iter().map(|conn| async move {
            (conn.name().to_string(), conn.connect().await)
        }))
        .await;

        let mut report = BulkReport::default();
        for (name, result) in results {
            match result {
                Ok(()) => report.succeeded.push(name),
                Err(e) => {
                    tracing::warn!(connection = %name, error = %e, "Connect failed");
                    report.failed.push((name, e));
                }
            }
        }
        report.succeeded.sort();
        report.failed.sort_by(|a, b| a.0.cmp(&b.0));

        tracing::info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Connected all",
        );
        report
    }

    pub async fn disconnect_all(&self) {
        let connections = self.snapshot();
        join_all(connections.iter().map(Connection::disconnect)).await;
        tracing::info!(count = connections.len(), "Disconnected all");
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::transport::MemoryConnector;

    fn registry() -> Registry {
        let (connector, _listener) = MemoryConnector::pair();
        Registry::with_connector(Arc::new(connector))
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let registry = registry();
        registry
            .create("a", "mem://a", ConnectionOptions::default())
            .unwrap();

        let err = registry
            .create("a", "mem://other", ConnectionOptions::default())
            .unwrap_err();
        assert_matches!(err, RegistryError::AlreadyExists(name) if name == "a");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn names_are_sorted() {
        let registry = registry();
        for name in ["c", "a", "b"] {
            registry
                .create(name, format!("mem://{name}"), ConnectionOptions::default())
                .unwrap();
        }
        assert_eq!(registry.names(), vec!["a", "b", "c"]);
        assert!(registry.states().iter().all(|(_, s)| *s == ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn remove_unknown_is_not_found() {
        let registry = registry();
        assert_matches!(registry.remove("nope").await, Err(RegistryError::NotFound(_)));
    }
}
