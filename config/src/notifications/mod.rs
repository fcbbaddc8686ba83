//! # Notification Service
//!
//! Pushes configuration lifecycle events to subscribers.
//!
//! Subscribers are transport handles ([`SubscriberSink`]) registered under
//! an id. A broadcast copies the registry first, so subscribing or
//! unsubscribing while a broadcast is in flight never disturbs it. Sinks
//! that report a closed connection are pruned after the broadcast.

pub mod websocket;

use chrono::Utc;
use dashmap::DashMap;
use errors::NotifyError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::diff::ConfigDiff;

/// Timestamp layout of the wire format.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub type SubscriberId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    ConfigChanged,
    ConfigReloaded,
    ValidationError,
    Rollback,
    SystemStatus
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigChanged => "config_changed",
            Self::ConfigReloaded => "config_reloaded",
            Self::ValidationError => "validation_error",
            Self::Rollback => "rollback",
            Self::SystemStatus => "system_status"
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Debug,
    Info,
    Warning,
    Error
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error"
        })
    }
}

/// One pushed message.
///
/// Serializes to
/// `{"id", "type", "level", "title", "message", "data", "timestamp"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: String
}

impl NotificationMessage {
    pub fn new(
        kind: NotificationType,
        level: NotificationLevel,
        title: impl Into<String>,
        message: impl Into<String>,
        data: Value
    ) -> Self {
        Self {
            id: utils::generate_uuid(),
            kind,
            level,
            title: title.into(),
            message: message.into(),
            data,
            timestamp: Utc::now().format(TIMESTAMP_FORMAT).to_string()
        }
    }
}

/// Transport handle of one subscriber.
pub trait SubscriberSink: Send + Sync {
    /// Delivers one serialized message without blocking.
    fn send(&self, payload: &str) -> Result<(), NotifyError>;
}

/// Sink backed by a bounded channel. A full queue drops the message; a
/// dropped receiver disconnects the subscriber.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    id: SubscriberId,
    tx: mpsc::Sender<String>
}

impl ChannelSink {
    pub fn new(id: impl Into<SubscriberId>, tx: mpsc::Sender<String>) -> Self {
        Self { id: id.into(), tx }
    }
}

impl SubscriberSink for ChannelSink {
    fn send(&self, payload: &str) -> Result<(), NotifyError> {
        self.tx
            .try_send(payload.to_string())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => NotifyError::Full {
                    subscriber_id: self.id.clone()
                },
                mpsc::error::TrySendError::Closed(_) => NotifyError::Closed {
                    subscriber_id: self.id.clone()
                }
            })
    }
}

/// In-process consumer of every notification.
pub trait NotificationHandler: Send + Sync {
    fn handle(&self, message: &NotificationMessage) -> anyhow::Result<()>;
}

impl<F> NotificationHandler for F
where
    F: Fn(&NotificationMessage) -> anyhow::Result<()> + Send + Sync
{
    fn handle(&self, message: &NotificationMessage) -> anyhow::Result<()> {
        self(message)
    }
}

/// History selection. `limit` keeps the most recent matches.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub kind: Option<NotificationType>,
    pub level: Option<NotificationLevel>,
    pub limit: Option<usize>
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NotificationStatus {
    pub subscriber_count: usize,
    pub history_size: usize,
    pub handler_count: usize
}

pub struct NotificationService {
    subscribers: DashMap<SubscriberId, Arc<dyn SubscriberSink>>,
    handlers: RwLock<Vec<Arc<dyn NotificationHandler>>>,
    history: Mutex<VecDeque<NotificationMessage>>,
    max_history: usize
}

impl NotificationService {
    pub fn new(max_history: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            max_history: max_history.max(1)
        }
    }

    /// Registers `sink` and sends it a welcome message.
    ///
    /// # M-CANONICAL-DOCS
    ///
    /// ## Purpose
    /// Adds a push target. The welcome is a `system_status` message whose
    /// `data.client_id` is the subscriber id.
    ///
    /// ## Error Handling
    /// When the welcome cannot be delivered because the transport is
    /// closed, the subscriber is not kept and the error is returned.
    pub fn subscribe(
        &self,
        subscriber_id: impl Into<SubscriberId>,
        sink: Arc<dyn SubscriberSink>
    ) -> Result<(), NotifyError> {
        let subscriber_id = subscriber_id.into();
        let welcome = NotificationMessage::new(
            NotificationType::SystemStatus,
            NotificationLevel::Info,
            "Connected",
            "Subscribed to configuration notifications",
            json!({ "client_id": subscriber_id })
        );
        let payload = serde_json::to_string(&welcome).map_err(|e| NotifyError::Transport {
            reason: e.to_string()
        })?;
        match sink.send(&payload) {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => return Err(e),
            Err(e) => warn!(subscriber_id = %subscriber_id, error = %e, "welcome message dropped")
        }
        self.subscribers.insert(subscriber_id.clone(), sink);
        info!(subscriber_id = %subscriber_id, subscribers = self.subscribers.len(), "subscriber added");
        Ok(())
    }

    /// Subscribes a new channel and returns its id and receiving end.
    pub fn subscribe_channel(
        &self,
        capacity: usize
    ) -> Result<(SubscriberId, mpsc::Receiver<String>), NotifyError> {
        let id = utils::generate_uuid();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribe(id.clone(), Arc::new(ChannelSink::new(id.clone(), tx)))?;
        Ok((id, rx))
    }

    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        let removed = self.subscribers.remove(subscriber_id).is_some();
        if removed {
            info!(subscriber_id, "subscriber removed");
        }
        removed
    }

    pub fn subscriber_ids(&self) -> Vec<SubscriberId> {
        let mut ids: Vec<SubscriberId> = self.subscribers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn add_handler(&self, handler: Arc<dyn NotificationHandler>) {
        self.handlers.write().push(handler);
    }

    /// Records, dispatches to handlers and broadcasts `message`. Returns the
    /// number of subscribers it reached.
    pub fn send_notification(&self, message: NotificationMessage) -> usize {
        {
            let mut history = self.history.lock();
            history.push_back(message.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        let handlers: Vec<Arc<dyn NotificationHandler>> = self.handlers.read().clone();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(&message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(kind = %message.kind, error = %e, "notification handler failed"),
                Err(_) => error!(kind = %message.kind, "notification handler panicked")
            }
        }

        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => {
                error!(kind = %message.kind, error = %e, "failed to serialize notification");
                return 0;
            }
        };

        let recipients: Vec<(SubscriberId, Arc<dyn SubscriberSink>)> = self
            .subscribers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut delivered = 0;
        let mut disconnected = Vec::new();
        for (id, sink) in recipients {
            match sink.send(&payload) {
                Ok(()) => delivered += 1,
                Err(e) if e.is_disconnect() => disconnected.push(id),
                Err(e) => warn!(subscriber_id = %id, error = %e, "notification not delivered")
            }
        }
        for id in &disconnected {
            self.subscribers.remove(id);
            info!(subscriber_id = %id, "pruned disconnected subscriber");
        }
        debug!(kind = %message.kind, delivered, pruned = disconnected.len(), "notification broadcast");
        delivered
    }

    pub fn notify_config_changed(&self, file_path: &str, change_type: &str) -> usize {
        self.send_notification(NotificationMessage::new(
            NotificationType::ConfigChanged,
            NotificationLevel::Info,
            "Configuration changed",
            format!("{file_path} was {change_type}"),
            json!({ "file_path": file_path, "change_type": change_type })
        ))
    }

    pub fn notify_config_reloaded(&self, old: &Value, new: &Value) -> usize {
        let key_count = |v: &Value| v.as_object().map_or(0, serde_json::Map::len);
        let diff = ConfigDiff::between(old, new);
        self.send_notification(NotificationMessage::new(
            NotificationType::ConfigReloaded,
            NotificationLevel::Info,
            "Configuration reloaded",
            "Configuration reloaded successfully",
            json!({
                "old_key_count": key_count(old),
                "new_key_count": key_count(new),
                "changed_keys": diff.changed_keys()
            })
        ))
    }

    pub fn notify_validation_error(&self, errors: &[String]) -> usize {
        self.send_notification(NotificationMessage::new(
            NotificationType::ValidationError,
            NotificationLevel::Error,
            "Configuration validation failed",
            format!("{} validation error(s)", errors.len()),
            json!({
                "error": errors.first(),
                "errors": errors,
                "error_count": errors.len()
            })
        ))
    }

    pub fn notify_rollback(&self, config_id: &str, from_version: Option<u32>, to_version: u32) -> usize {
        self.send_notification(NotificationMessage::new(
            NotificationType::Rollback,
            NotificationLevel::Warning,
            "Configuration rolled back",
            format!("{config_id} rolled back to v{to_version}"),
            json!({
                "config_id": config_id,
                "from_version": from_version,
                "to_version": to_version
            })
        ))
    }

    pub fn notify_system_status(&self, status: &str, data: Value) -> usize {
        self.send_notification(NotificationMessage::new(
            NotificationType::SystemStatus,
            NotificationLevel::Info,
            "System status",
            status,
            data
        ))
    }

    /// Matching messages in chronological order.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<NotificationMessage> {
        let history = self.history.lock();
        let matching: Vec<NotificationMessage> = history
            .iter()
            .filter(|m| filter.kind.is_none_or(|k| k == m.kind))
            .filter(|m| filter.level.is_none_or(|l| l == m.level))
            .cloned()
            .collect();
        match filter.limit {
            Some(limit) if matching.len() > limit => matching[matching.len() - limit..].to_vec(),
            _ => matching
        }
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    pub fn status(&self) -> NotificationStatus {
        NotificationStatus {
            subscriber_count: self.subscribers.len(),
            history_size: self.history.lock().len(),
            handler_count: self.handlers.read().len()
        }
    }
}

impl Default for NotificationService {
    fn default() -> Self {
        Self::new(1000)
    }
}
