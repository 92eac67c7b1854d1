// src/logging/mod.rs
// Log backend setup and handling of the agent's own log lines

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Target used when re-logging agent output.
pub const AGENT_TARGET: &str = "agent";
pub const RECENT_LOG_CAPACITY: usize = 500;

/// Install `env_logger`. `RUST_LOG` wins over `default_level`.
pub fn init(default_level: &str) {
    let env = env_logger::Env::default().default_filter_or(default_level);
    if let Err(e) = env_logger::Builder::from_env(env).format_timestamp_millis().try_init() {
        log::debug!("Logger already initialized: {}", e);
    }
}

/// Severity of an agent log line, read from frpc's `[E]`/`[W]`/`[I]`/`[D]`/`[T]` markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentLogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl AgentLogLevel {
    pub fn as_log_level(self) -> log::Level {
        match self {
            AgentLogLevel::Error => log::Level::Error,
            AgentLogLevel::Warn => log::Level::Warn,
            AgentLogLevel::Info => log::Level::Info,
            AgentLogLevel::Debug => log::Level::Debug,
        }
    }
}

pub fn classify_line(line: &str) -> AgentLogLevel {
    // 2024/01/01 12:00:00 [I] [service.go:301] login to server success
    for marker in ["[E]", "[W]", "[I]", "[D]", "[T]"] {
        if line.contains(marker) {
            return match marker {
                "[E]" => AgentLogLevel::Error,
                "[W]" => AgentLogLevel::Warn,
                "[I]" => AgentLogLevel::Info,
                _ => AgentLogLevel::Debug,
            };
        }
    }
    AgentLogLevel::Info
}

/// Re-log one agent line under the `agent` target and return its level.
pub fn log_agent_line(method: &str, line: &str) -> AgentLogLevel {
    let level = classify_line(line);
    log::log!(target: AGENT_TARGET, level.as_log_level(), "[{}] {}", method, line);
    level
}

/// Fixed-size buffer of the most recent agent lines.
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    lines: VecDeque<String>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(RECENT_LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    /// Up to `limit` most recent lines, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(limit);
        self.lines.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_frpc_markers() {
        assert_eq!(
            classify_line("2024/01/01 12:00:00 [E] [control.go:158] login to server failed"),
            AgentLogLevel::Error
        );
        assert_eq!(classify_line("2024/01/01 [W] [proxy.go:1] retrying"), AgentLogLevel::Warn);
        assert_eq!(classify_line("2024/01/01 [I] start proxy success"), AgentLogLevel::Info);
        assert_eq!(classify_line("2024/01/01 [T] heartbeat"), AgentLogLevel::Debug);
        assert_eq!(classify_line("plain output"), AgentLogLevel::Info);
    }

    #[test]
    fn test_log_buffer_keeps_tail() {
        let mut buffer = LogBuffer::with_capacity(3);
        for i in 0..5 {
            buffer.push_line(format!("line {}", i));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.tail(2), vec!["line 3".to_string(), "line 4".to_string()]);
        assert_eq!(buffer.tail(10).len(), 3);
    }
}
