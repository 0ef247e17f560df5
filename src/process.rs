//! Data structures for describing services and tracking their state.
//!
//! `ServiceRecord` is the immutable description of one configured dev server,
//! `ServiceSpec` adds launch options, and `ServiceState` is the view-side state
//! (status, recent lines, unread counter) that a front-end keeps per service.

use std::collections::HashMap;
use std::time::Instant;

use crate::output::{LogBuffer, LogLine, StreamKind};

/// One configured service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Display name, unique across the rack.
    pub name: String,
    /// Command line with the port already substituted.
    pub command: String,
    /// Working directory the command runs in.
    pub directory: String,
    /// Port the service listens on. Services without a port are never probed.
    pub port: Option<u16>,
}

/// A record plus the options used to launch it.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub record: ServiceRecord,
    /// Run the command through the platform shell instead of exec'ing it directly.
    pub shell: bool,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
}

impl ServiceSpec {
    pub fn new(record: ServiceRecord) -> Self {
        Self {
            record,
            shell: true,
            env: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }
}

/// The current lifecycle status of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Not running and never started.
    Idle,
    /// A child process is alive.
    Running { pid: Option<u32> },
    /// The last run exited.
    Exited { code: Option<i32> },
    /// The last start failed.
    Failed { error: String },
}

impl ServiceStatus {
    pub fn label(&self) -> String {
        match self {
            ServiceStatus::Idle => "idle".to_string(),
            ServiceStatus::Running { pid: Some(pid) } => format!("running (pid {})", pid),
            ServiceStatus::Running { pid: None } => "running".to_string(),
            ServiceStatus::Exited { code: Some(code) } => format!("exited ({})", code),
            ServiceStatus::Exited { code: None } => "exited".to_string(),
            ServiceStatus::Failed { error } => format!("failed: {}", error),
        }
    }
}

/// View-side state of a single service.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub record: ServiceRecord,
    pub status: ServiceStatus,
    pub started_at: Option<Instant>,
    /// Run id of the live child, if any.
    pub run: Option<u64>,
    /// Recent output lines.
    pub logs: LogBuffer,
    /// Lines received since the service was last marked as read.
    pub unread: usize,
}

impl ServiceState {
    pub fn new(record: ServiceRecord, max_lines: usize) -> Self {
        Self {
            record,
            status: ServiceStatus::Idle,
            started_at: None,
            run: None,
            logs: LogBuffer::new(max_lines),
            unread: 0,
        }
    }

    pub fn on_started(&mut self, run: u64, pid: Option<u32>) {
        self.status = ServiceStatus::Running { pid };
        self.started_at = Some(Instant::now());
        self.run = Some(run);
    }

    /// Whether `run` is the run this state currently tracks.
    pub fn is_current(&self, run: u64) -> bool {
        self.run == Some(run)
    }

    pub fn on_output(&mut self, text: String, stream: StreamKind) {
        self.logs.push(LogLine { text, stream });
    }

    /// Flags that output arrived since the last `mark_read`.
    pub fn on_activity(&mut self) {
        self.unread = self.unread.saturating_add(1);
    }

    pub fn on_exited(&mut self, code: Option<i32>) {
        self.status = ServiceStatus::Exited { code };
        self.started_at = None;
        self.run = None;
    }

    pub fn on_failed(&mut self, error: String) {
        self.status = ServiceStatus::Failed { error };
        self.started_at = None;
        self.run = None;
    }

    pub fn mark_read(&mut self) {
        self.unread = 0;
    }

    pub fn has_unread(&self) -> bool {
        self.unread > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ServiceRecord {
        ServiceRecord {
            name: "web".into(),
            command: "run --port 8787".into(),
            directory: ".".into(),
            port: Some(8787),
        }
    }

    #[test]
    fn activity_marks_unread_until_read() {
        let mut state = ServiceState::new(record(), 10);
        assert!(!state.has_unread());
        state.on_output("ready".into(), StreamKind::Stdout);
        state.on_activity();
        state.on_activity();
        assert_eq!(state.unread, 2);
        state.mark_read();
        assert!(!state.has_unread());
        assert_eq!(state.logs.len(), 1);
    }

    #[test]
    fn status_labels() {
        assert_eq!(ServiceStatus::Idle.label(), "idle");
        assert_eq!(
            ServiceStatus::Running { pid: Some(42) }.label(),
            "running (pid 42)"
        );
        assert_eq!(ServiceStatus::Exited { code: Some(1) }.label(), "exited (1)");
        assert_eq!(ServiceStatus::Exited { code: None }.label(), "exited");
    }
}
