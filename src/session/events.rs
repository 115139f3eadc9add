//! Notifications for the presentation layer.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

const EVENT_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SensorStarted(bool),
    SensorStopped,
    Log { level: LogLevel, message: String },
    DebugToggled(bool),
}

/// Explicit event/log sink handed to the pipeline and the session.
///
/// Events are delivered at most once; when the consumer falls behind by more
/// than the queue size, new events are dropped rather than blocking the
/// sender.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<flume::Sender<SessionEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, flume::Receiver<SessionEvent>) {
        let (tx, rx) = flume::bounded(EVENT_QUEUE);
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that only forwards logs to `tracing`.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(event);
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!("{}", message),
            LogLevel::Info => info!("{}", message),
            LogLevel::Warning => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        self.emit(SessionEvent::Log { level, message });
    }
}
