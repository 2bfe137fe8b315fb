use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::mpsc;

/// Progress event published while a plan runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub step_id: String,
    pub level: LogLevel,
    pub kind: LogKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Debug => "debug",
        }
    }
}

/// Step lifecycle messages versus lines of remote command output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Status,
    Stdout,
    Stderr,
}

#[derive(Clone)]
pub struct LogStreamSender {
    sender: mpsc::Sender<LogMessage>,
}

impl LogStreamSender {
    pub fn new(sender: mpsc::Sender<LogMessage>) -> Self {
        Self { sender }
    }

    pub fn send(&self, step_id: &str, level: LogLevel, kind: LogKind, message: &str) {
        let log_msg = LogMessage {
            step_id: step_id.to_string(),
            level,
            kind,
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        // A dropped receiver only means nobody is watching.
        let _ = self.sender.send(log_msg);
    }

    pub fn info(&self, step_id: &str, message: &str) {
        self.send(step_id, LogLevel::Info, LogKind::Status, message);
    }

    pub fn warning(&self, step_id: &str, message: &str) {
        self.send(step_id, LogLevel::Warning, LogKind::Status, message);
    }

    pub fn error(&self, step_id: &str, message: &str) {
        self.send(step_id, LogLevel::Error, LogKind::Status, message);
    }

    pub fn stdout(&self, step_id: &str, line: &str) {
        self.send(step_id, LogLevel::Debug, LogKind::Stdout, line);
    }

    pub fn stderr(&self, step_id: &str, line: &str) {
        self.send(step_id, LogLevel::Debug, LogKind::Stderr, line);
    }
}

pub struct LogStreamReceiver {
    receiver: mpsc::Receiver<LogMessage>,
}

impl LogStreamReceiver {
    pub fn new(receiver: mpsc::Receiver<LogMessage>) -> Self {
        Self { receiver }
    }

    pub fn try_recv(&self) -> Result<LogMessage, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv(&self) -> Result<LogMessage, mpsc::RecvError> {
        self.receiver.recv()
    }

    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<LogMessage, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drains everything queued so far without blocking.
    pub fn drain(&self) -> Vec<LogMessage> {
        self.receiver.try_iter().collect()
    }
}

pub fn create_log_stream() -> (LogStreamSender, LogStreamReceiver) {
    let (sender, receiver) = mpsc::channel();
    (
        LogStreamSender::new(sender),
        LogStreamReceiver::new(receiver),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_messages_in_order() {
        let (sender, receiver) = create_log_stream();
        sender.info("build-app", "running");
        sender.stdout("build-app", "compiled");
        sender.error("build-app", "failed");

        let messages = receiver.drain();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].kind, LogKind::Status);
        assert_eq!(messages[1].kind, LogKind::Stdout);
        assert_eq!(messages[1].message, "compiled");
        assert_eq!(messages[2].level, LogLevel::Error);
    }

    #[test]
    fn sending_without_receiver_is_harmless() {
        let (sender, receiver) = create_log_stream();
        drop(receiver);
        sender.warning("reload-proxy", "nobody listening");
    }
}
