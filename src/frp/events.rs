use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use uuid::Uuid;

use crate::logging::{log_agent_line, AgentLogLevel, LogBuffer};
use crate::process::types::LaunchMethod;

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub line: String,
    pub level: AgentLogLevel,
    pub method: LaunchMethod,
    pub at: DateTime<Utc>,
}

/// The agent of one run went away. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Serialize)]
pub struct ExitEvent {
    pub code: Option<i32>,
    pub method: LaunchMethod,
    pub at: DateTime<Utc>,
}

pub type LogCallback = Arc<dyn Fn(&LogEvent) + Send + Sync>;
pub type ExitCallback = Arc<dyn Fn(&ExitEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    log: Vec<(Uuid, LogCallback)>,
    exit: Vec<(Uuid, ExitCallback)>,
}

/// Fan-out point for agent output and exits. Callbacks run on the emitting task.
#[derive(Default)]
pub struct EventHub {
    listeners: Mutex<Listeners>,
    recent: Mutex<LogBuffer>,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_log(self: &Arc<Self>, callback: impl Fn(&LogEvent) + Send + Sync + 'static) -> Subscription {
        let id = Uuid::new_v4();
        self.listeners.lock().log.push((id, Arc::new(callback)));
        Subscription {
            id,
            hub: Arc::downgrade(self),
        }
    }

    pub fn on_exit(self: &Arc<Self>, callback: impl Fn(&ExitEvent) + Send + Sync + 'static) -> Subscription {
        let id = Uuid::new_v4();
        self.listeners.lock().exit.push((id, Arc::new(callback)));
        Subscription {
            id,
            hub: Arc::downgrade(self),
        }
    }

    /// Record, re-log and deliver one line of agent output.
    pub fn emit_log(&self, method: LaunchMethod, line: &str) {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }

        let level = log_agent_line(method.as_str(), line);
        self.recent.lock().push_line(line.to_string());

        let event = LogEvent {
            line: line.to_string(),
            level,
            method,
            at: Utc::now(),
        };

        // Snapshot so callbacks may subscribe or unsubscribe
        let callbacks: Vec<LogCallback> = self.listeners.lock().log.iter().map(|(_, cb)| cb.clone()).collect();
        for callback in callbacks {
            callback(&event);
        }
    }

    pub fn emit_exit(&self, method: LaunchMethod, code: Option<i32>) {
        log::info!("Agent ({}) exited with code {:?}", method, code);

        let event = ExitEvent {
            code,
            method,
            at: Utc::now(),
        };

        let callbacks: Vec<ExitCallback> = self.listeners.lock().exit.iter().map(|(_, cb)| cb.clone()).collect();
        for callback in callbacks {
            callback(&event);
        }
    }

    pub fn recent_logs(&self, limit: usize) -> Vec<String> {
        self.recent.lock().tail(limit)
    }

    pub fn listener_count(&self) -> usize {
        let listeners = self.listeners.lock();
        listeners.log.len() + listeners.exit.len()
    }

    fn remove(&self, id: Uuid) {
        let mut listeners = self.listeners.lock();
        listeners.log.retain(|(existing, _)| *existing != id);
        listeners.exit.retain(|(existing, _)| *existing != id);
    }
}

/// Handle returned by `on_log`/`on_exit`. Dropping it keeps the callback registered.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    hub: Weak<EventHub>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn unsubscribe(self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}
