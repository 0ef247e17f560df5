//! Console front-end state.
//!
//! `Console` is the sink side of the supervisor: it keeps a `ServiceState` per
//! service, turns events into printable lines and tracks which services have
//! unread output. It never touches processes; the event loop in `main`
//! translates `ConsoleCommand`s into supervisor calls.

use std::time::Duration;

use crate::events::Event;
use crate::output::StreamKind;
use crate::process::{ServiceRecord, ServiceState};

/// Commands accepted on the console's standard input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Start every idle service.
    Start,
    /// Terminate every running service.
    Stop,
    /// Run one probe round.
    Check,
    /// Print the status table.
    Status,
    /// Clear unread markers on every service.
    MarkAllRead,
    /// Stop everything, notify, and exit.
    Close,
    /// Print the command list.
    Help,
}

impl ConsoleCommand {
    /// Parses one input line. Blank lines and unknown words yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let word = line.trim().to_ascii_lowercase();
        let command = match word.as_str() {
            "start" | "start-all" => ConsoleCommand::Start,
            "stop" | "stop-all" => ConsoleCommand::Stop,
            "check" => ConsoleCommand::Check,
            "status" | "ls" => ConsoleCommand::Status,
            "read" | "mark-read" => ConsoleCommand::MarkAllRead,
            "close" | "quit" | "exit" | "q" => ConsoleCommand::Close,
            "help" | "?" => ConsoleCommand::Help,
            _ => return None,
        };
        Some(command)
    }
}

pub const HELP: &str = "commands: start, stop, check, status, read, close, help";

/// View state for every service, in configuration order.
#[derive(Debug)]
pub struct Console {
    pub services: Vec<ServiceState>,
    prefix_width: usize,
}

impl Console {
    pub fn new<'a>(records: impl IntoIterator<Item = &'a ServiceRecord>, max_lines: usize) -> Self {
        let services: Vec<ServiceState> = records
            .into_iter()
            .map(|record| ServiceState::new(record.clone(), max_lines))
            .collect();
        let prefix_width = services
            .iter()
            .map(|s| s.record.name.len() + 2)
            .max()
            .unwrap_or(0);
        Self {
            services,
            prefix_width,
        }
    }

    /// Applies an event and returns the line to print for it, if any.
    pub fn handle_event(&mut self, event: &Event) -> Option<String> {
        match event {
            Event::ServiceStarting { id, command } => {
                Some(self.tool_line(*id, &format!("starting: {}", command)))
            }
            Event::ServiceStarted { id, run, pid } => {
                self.services.get_mut(*id)?.on_started(*run, *pid);
                None
            }
            Event::ServiceSkipped { id } => Some(self.tool_line(*id, "already running")),
            Event::ServiceOutput { id, line, stream } => {
                self.services
                    .get_mut(*id)?
                    .on_output(line.clone(), *stream);
                Some(self.output_line(*id, line, *stream))
            }
            Event::OutputActivity { id } => {
                self.services.get_mut(*id)?.on_activity();
                None
            }
            Event::ServiceExited { id, run, code } => {
                let service = self.services.get_mut(*id)?;
                // Late report from a run that was terminated or replaced.
                if !service.is_current(*run) {
                    return None;
                }
                service.on_exited(*code);
                let text = match code {
                    Some(0) => "finished successfully".to_string(),
                    Some(code) => format!("finished with code {}", code),
                    None => "finished".to_string(),
                };
                Some(self.tool_line(*id, &text))
            }
            Event::ServiceFailed { id, error } => {
                self.services.get_mut(*id)?.on_failed(error.clone());
                Some(self.tool_line(*id, &format!("failed: {}", error)))
            }
            Event::ServiceTerminated { id } => Some(self.tool_line(*id, "terminated")),
            Event::ProbeCompleted(result) => Some(result.to_string()),
            Event::StreamClosed { .. }
            | Event::Command(_)
            | Event::InputClosed
            | Event::Shutdown => None,
        }
    }

    /// Clears every unread marker and returns how many services had one.
    pub fn mark_all_read(&mut self) -> usize {
        let mut cleared = 0;
        for service in &mut self.services {
            if service.has_unread() {
                cleared += 1;
            }
            service.mark_read();
        }
        cleared
    }

    /// One row per service: name, port, status, unread count.
    pub fn status_lines(&self) -> Vec<String> {
        let width = self.prefix_width.saturating_sub(2);
        self.services
            .iter()
            .map(|service| {
                let port = service
                    .record
                    .port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let marker = if service.has_unread() { "*" } else { " " };
                let mut row = format!(
                    "{} {:<width$}  port {:<5}  {:<20}  {} unread",
                    marker,
                    service.record.name,
                    port,
                    service.status.label(),
                    service.unread,
                    width = width
                );
                if let Some(started) = service.started_at {
                    row.push_str(&format!("  up {}", format_duration(started.elapsed())));
                }
                if let Some(last) = service.logs.last() {
                    row.push_str(&format!("  | {}", last.text));
                }
                row
            })
            .collect()
    }

    fn name(&self, id: usize) -> &str {
        self.services
            .get(id)
            .map(|s| s.record.name.as_str())
            .unwrap_or("service")
    }

    fn prefix(&self, id: usize) -> String {
        let prefix = format!("[{}]", self.name(id));
        format!("{:<width$} ", prefix, width = self.prefix_width)
    }

    fn output_line(&self, id: usize, line: &str, stream: StreamKind) -> String {
        match stream {
            StreamKind::Stdout => format!("{}{}", self.prefix(id), line),
            StreamKind::Stderr => format!("{}! {}", self.prefix(id), line),
        }
    }

    fn tool_line(&self, id: usize, text: &str) -> String {
        format!("{}-- {}", self.prefix(id), text)
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let minutes = secs / 60;
    let seconds = secs % 60;
    format!("{:02}:{:02}", minutes, seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeOutcome, ProbeResult};
    use crate::process::ServiceStatus;

    fn records() -> Vec<ServiceRecord> {
        vec![
            ServiceRecord {
                name: "web".into(),
                command: "run --port 8787".into(),
                directory: ".".into(),
                port: Some(8787),
            },
            ServiceRecord {
                name: "worker".into(),
                command: "run --port ".into(),
                directory: ".".into(),
                port: None,
            },
        ]
    }

    #[test]
    fn parses_commands() {
        assert_eq!(ConsoleCommand::parse("start"), Some(ConsoleCommand::Start));
        assert_eq!(ConsoleCommand::parse("  STOP \n"), Some(ConsoleCommand::Stop));
        assert_eq!(ConsoleCommand::parse("read"), Some(ConsoleCommand::MarkAllRead));
        assert_eq!(ConsoleCommand::parse("quit"), Some(ConsoleCommand::Close));
        assert_eq!(ConsoleCommand::parse(""), None);
        assert_eq!(ConsoleCommand::parse("restart"), None);
    }

    #[test]
    fn output_is_prefixed_and_marks_unread() {
        let records = records();
        let mut console = Console::new(&records, 100);
        let line = console
            .handle_event(&Event::ServiceOutput {
                id: 0,
                line: "ready".into(),
                stream: StreamKind::Stdout,
            })
            .unwrap();
        assert_eq!(line, "[web]    ready");
        assert!(console.handle_event(&Event::OutputActivity { id: 0 }).is_none());
        assert!(console.services[0].has_unread());
        assert!(!console.services[1].has_unread());

        assert_eq!(console.mark_all_read(), 1);
        assert!(!console.services[0].has_unread());
        assert_eq!(console.mark_all_read(), 0);
    }

    #[test]
    fn lifecycle_events_update_status() {
        let records = records();
        let mut console = Console::new(&records, 100);
        console.handle_event(&Event::ServiceStarted {
            id: 1,
            run: 1,
            pid: Some(42),
        });
        assert_eq!(console.services[1].status, ServiceStatus::Running { pid: Some(42) });
        let line = console
            .handle_event(&Event::ServiceExited {
                id: 1,
                run: 1,
                code: Some(2),
            })
            .unwrap();
        assert_eq!(line, "[worker] -- finished with code 2");
        assert_eq!(console.services[1].status, ServiceStatus::Exited { code: Some(2) });
    }

    #[test]
    fn exit_from_replaced_run_is_ignored() {
        let records = records();
        let mut console = Console::new(&records, 100);
        console.handle_event(&Event::ServiceStarted {
            id: 0,
            run: 1,
            pid: Some(10),
        });
        console.handle_event(&Event::ServiceTerminated { id: 0 });
        console.handle_event(&Event::ServiceStarted {
            id: 0,
            run: 2,
            pid: Some(11),
        });
        let line = console.handle_event(&Event::ServiceExited {
            id: 0,
            run: 1,
            code: None,
        });
        assert!(line.is_none());
        assert_eq!(console.services[0].status, ServiceStatus::Running { pid: Some(11) });
        assert!(console.services[0].started_at.is_some());

        let line = console.handle_event(&Event::ServiceExited {
            id: 0,
            run: 2,
            code: Some(0),
        });
        assert_eq!(line.as_deref(), Some("[web]    -- finished successfully"));
        assert_eq!(console.services[0].status, ServiceStatus::Exited { code: Some(0) });
    }

    #[test]
    fn probe_results_use_report_format() {
        let records = records();
        let mut console = Console::new(&records, 100);
        let line = console
            .handle_event(&Event::ProbeCompleted(ProbeResult {
                id: 0,
                name: "web".into(),
                port: 8787,
                outcome: ProbeOutcome::Status(200),
            }))
            .unwrap();
        assert_eq!(line, "web (Port 8787) - Status: 200");
    }

    #[test]
    fn status_lines_flag_unread_services() {
        let records = records();
        let mut console = Console::new(&records, 100);
        console.handle_event(&Event::OutputActivity { id: 1 });
        let lines = console.status_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("  web"));
        assert!(lines[1].starts_with("* worker"));
        assert!(lines[1].contains("1 unread"));
        assert!(lines[0].contains("port 8787"));
        assert!(lines[1].contains("port -"));

        console.handle_event(&Event::ServiceStarted {
            id: 0,
            run: 1,
            pid: None,
        });
        console.handle_event(&Event::ServiceOutput {
            id: 0,
            line: "listening".into(),
            stream: StreamKind::Stdout,
        });
        let lines = console.status_lines();
        assert!(lines[0].contains("up 00:00"));
        assert!(lines[0].ends_with("| listening"));
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(Duration::from_secs(75)), "01:15");
    }
}
