//! Event definitions for the supervisor event loop.
//!
//! Everything the supervision core reports flows through `Event`. Background
//! tasks (output pumps, exit waiters, probes) only ever send events; the task
//! that owns the `Supervisor` applies them. Front-ends subscribe by draining the
//! receiving end of the channel.

use crate::output::StreamKind;
use crate::probe::ProbeResult;

/// Represents an event in the application's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A service is about to be spawned with the given command line.
    ServiceStarting { id: usize, command: String },
    /// A service was spawned.
    ServiceStarted { id: usize, run: u64, pid: Option<u32> },
    /// A start request was skipped because the service is already running.
    ServiceSkipped { id: usize },
    /// A decoded line of output was received from a service.
    ServiceOutput { id: usize, line: String, stream: StreamKind },
    /// Some output arrived for a service. Sent once per line, after the line itself.
    OutputActivity { id: usize },
    /// An output stream reached end-of-file or was cut off by termination.
    StreamClosed { id: usize, run: u64, stream: StreamKind },
    /// A run exited with an optional exit code (None usually implies signal termination).
    ServiceExited { id: usize, run: u64, code: Option<i32> },
    /// A service could not be spawned or its exit status could not be collected.
    ServiceFailed { id: usize, error: String },
    /// A termination signal was sent to a service.
    ServiceTerminated { id: usize },
    /// A probe round finished for one service.
    ProbeCompleted(ProbeResult),
    /// A line typed on the console.
    Command(String),
    /// The console input stream closed.
    InputClosed,
    /// An OS signal asked the application to shut down.
    Shutdown,
}

impl Event {
    /// Index of the service this event concerns, if any.
    pub fn service_id(&self) -> Option<usize> {
        match self {
            Event::ServiceStarting { id, .. }
            | Event::ServiceStarted { id, .. }
            | Event::ServiceSkipped { id }
            | Event::ServiceOutput { id, .. }
            | Event::OutputActivity { id }
            | Event::StreamClosed { id, .. }
            | Event::ServiceExited { id, .. }
            | Event::ServiceFailed { id, .. }
            | Event::ServiceTerminated { id } => Some(*id),
            Event::ProbeCompleted(result) => Some(result.id),
            Event::Command(_) | Event::InputClosed | Event::Shutdown => None,
        }
    }
}
