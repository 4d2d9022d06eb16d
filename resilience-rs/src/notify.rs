//! # Notifications
//!
//! Observational sink for retry progress and final outcomes. The executor
//! never reads anything back from it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Severity of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Success => write!(f, "success"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Presentation hints for the consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationOptions {
    /// How long the notification should stay visible
    pub duration: Option<Duration>,
    /// Whether the consumer should play a sound
    pub sound: bool,
}

impl Default for NotificationOptions {
    fn default() -> Self {
        Self {
            duration: Some(Duration::from_secs(3)),
            sound: false,
        }
    }
}

/// A single progress or outcome message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub options: NotificationOptions,
    /// Structured retry details, present on retry notifications
    pub retry: Option<RetryProgress>,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            severity,
            options: NotificationOptions::default(),
            retry: None,
        }
    }

    pub fn with_options(mut self, options: NotificationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_progress(mut self, progress: RetryProgress) -> Self {
        self.retry = Some(progress);
        self
    }
}

/// Details of a scheduled retry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryProgress {
    pub operation_id: String,
    /// The attempt that just failed (1-based)
    pub attempt: u32,
    pub remaining_retries: u32,
    pub delay: Duration,
}

/// Receives notifications from the executor
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: Notification) {
        match notification.severity {
            Severity::Info | Severity::Success => info!(
                title = %notification.title,
                severity = %notification.severity,
                "{}",
                notification.message
            ),
            Severity::Warning => warn!(
                title = %notification.title,
                "{}",
                notification.message
            ),
            Severity::Error => error!(
                title = %notification.title,
                "{}",
                notification.message
            ),
        }
    }
}

/// Forwards notifications into a channel, for UIs
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    /// Creates the sink together with its receiving end
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, notification: Notification) {
        // a dropped receiver only means nobody is watching
        let _ = self.sender.send(notification);
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _notification: Notification) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut receiver) = ChannelSink::new();
        sink.notify(Notification::new("Retrying", "attempt 1 failed", Severity::Warning));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.title, "Retrying");
        assert_eq!(received.severity, Severity::Warning);
        assert!(received.retry.is_none());
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (sink, receiver) = ChannelSink::new();
        drop(receiver);
        sink.notify(Notification::new("Done", "ok", Severity::Success));
    }
}
