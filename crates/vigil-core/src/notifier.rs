//! Notification sinks.
//!
//! The core only formats a short text and a level; delivery (SMS, mail, chat)
//! is up to the [`Notifier`] implementation.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifierError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub level: Level,
    pub text: String,
}

impl Notification {
    pub fn new(level: Level, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<(), NotifierError>;
}

/// Emits notifications as log events.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, notification: &Notification) -> Result<(), NotifierError> {
        match notification.level {
            Level::Info => tracing::info!(text = %notification.text, "notification"),
            Level::Warning => tracing::warn!(text = %notification.text, "notification"),
            Level::Error => tracing::error!(text = %notification.text, "notification"),
        }
        Ok(())
    }
}

/// Keeps every notification in memory.
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Notifier for MemoryNotifier {
    fn send(&self, notification: &Notification) -> Result<(), NotifierError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification.clone());
        Ok(())
    }
}
