//! Update client facade used by the view layer.

use std::sync::Arc;

use serde_json::Value;

use crate::credentials::CredentialStore;
use crate::realtime::proto::{COMMENT_EVENTS, NOTIFICATION_EVENTS, PROJECT_EVENTS, TASK_EVENTS};
use crate::realtime::registry::{listener, EventRegistry, Listener};
use crate::realtime::session::{ConnectionSession, ConnectionState, RealtimeConfig};
use crate::realtime::transport::{Connector, WsConnector};

/// One realtime connection plus the listeners that observe it.
///
/// Build one per application in the composition root and hand out references.
/// Listeners survive reconnects; they are only removed by
/// [`UpdateClient::unsubscribe`].
#[derive(Debug)]
pub struct UpdateClient {
    registry: EventRegistry,
    session: ConnectionSession,
}

impl UpdateClient {
    /// Creates a client that connects over websockets.
    pub fn new(config: RealtimeConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        let connector = Arc::new(WsConnector::new(config.connect_timeout));
        Self::with_connector(config, credentials, connector)
    }

    /// Creates a client over a caller-supplied transport.
    pub fn with_connector(
        config: RealtimeConfig,
        credentials: Arc<dyn CredentialStore>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let registry = EventRegistry::new();
        let session = ConnectionSession::new(config, credentials, connector, registry.clone());
        Self { registry, session }
    }

    /// Opens the realtime connection in the background.
    pub fn connect(&self) {
        self.session.connect();
    }

    /// Closes the connection and stops reconnecting.
    pub fn disconnect(&self) {
        self.session.disconnect();
    }

    /// Sends `{event, data}` if the connection is open.
    pub fn send(&self, event: &str, data: Value) {
        self.session.send(event, data);
    }

    /// Returns true while the transport is open.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Returns the underlying connection session.
    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    /// Returns the listener registry shared with the session.
    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    /// Registers `listener` for `event`.
    pub fn subscribe(&self, event: impl Into<String>, listener: Listener) {
        self.registry.subscribe(event, listener);
    }

    /// Removes `listener` from `event`. Returns false when it was not registered.
    pub fn unsubscribe(&self, event: &str, listener: &Listener) -> bool {
        self.registry.unsubscribe(event, listener)
    }

    /// Subscribes a closure and returns its handle for a later unsubscribe.
    pub fn on<F>(&self, event: impl Into<String>, callback: F) -> Listener
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let handle = listener(callback);
        self.registry.subscribe(event, Arc::clone(&handle));
        handle
    }

    /// `task.updated`, `task.created`, `task.deleted`, `task.status.changed`.
    pub fn subscribe_to_task_updates(&self, listener: &Listener) {
        self.subscribe_all(&TASK_EVENTS, listener);
    }

    /// `project.updated`, `project.created`, `project.deleted`.
    pub fn subscribe_to_project_updates(&self, listener: &Listener) {
        self.subscribe_all(&PROJECT_EVENTS, listener);
    }

    /// `comment.created`, `comment.updated`.
    pub fn subscribe_to_comments(&self, listener: &Listener) {
        self.subscribe_all(&COMMENT_EVENTS, listener);
    }

    /// `notification.new`.
    pub fn subscribe_to_notifications(&self, listener: &Listener) {
        self.subscribe_all(&NOTIFICATION_EVENTS, listener);
    }

    fn subscribe_all(&self, events: &[&str], listener: &Listener) {
        for event in events {
            self.registry.subscribe(*event, Arc::clone(listener));
        }
    }
}
