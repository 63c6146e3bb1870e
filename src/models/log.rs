//! Console log records

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Stdout,
    Stderr,
    /// Lifecycle marker emitted by the guest init
    State,
    /// Notes written by the orchestrator itself
    System,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Stdout => "stdout",
            LogType::Stderr => "stderr",
            LogType::State => "state",
            LogType::System => "system",
        }
    }
}

impl std::fmt::Display for LogType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub log_type: LogType,
    /// Milliseconds since the unix epoch, stamped on arrival
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl LogRecord {
    fn new(log_type: LogType, message: Option<String>, state: Option<String>) -> Self {
        Self {
            log_type,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            message,
            state,
        }
    }

    pub fn stdout(message: impl Into<String>) -> Self {
        Self::new(LogType::Stdout, Some(message.into()), None)
    }

    pub fn stderr(message: impl Into<String>) -> Self {
        Self::new(LogType::Stderr, Some(message.into()), None)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(LogType::System, Some(message.into()), None)
    }

    pub fn state(state: impl Into<String>, detail: Option<String>) -> Self {
        Self::new(LogType::State, detail, Some(state.into()))
    }

    /// Approximate memory footprint, used for the byte bound of the buffer
    pub fn payload_len(&self) -> usize {
        self.message.as_ref().map_or(0, String::len) + self.state.as_ref().map_or(0, String::len)
    }

    pub fn is_state(&self, name: &str) -> bool {
        self.log_type == LogType::State && self.state.as_deref() == Some(name)
    }
}
