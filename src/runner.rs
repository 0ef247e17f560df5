//! Process execution and supervision.
//!
//! `ProcessHandle` owns at most one child per service. `Supervisor` owns one
//! handle per configured service and drives bulk start/stop, probe rounds and
//! the shutdown notification round. Everything it learns is reported as an
//! `Event`; background tasks never touch the handle table directly, so it needs
//! no lock as long as a single task owns the `Supervisor`.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NotifyOrder;
use crate::error::{Result, SupervisorError};
use crate::events::Event;
use crate::output::{OutputPump, StreamKind};
use crate::probe::{service_url, ProbeResult, ServiceProbe, DEFAULT_BASE_URL};
use crate::process::{ServiceRecord, ServiceSpec};

/// Tunables for probing and closing.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub base_url: String,
    pub probe_timeout: Duration,
    pub notify_attempts: u32,
    pub notify_delay: Duration,
    pub notify_timeout: Duration,
    pub notify_order: NotifyOrder,
    pub strip_ansi: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            probe_timeout: Duration::from_secs(5),
            notify_attempts: 2,
            notify_delay: Duration::from_millis(500),
            notify_timeout: Duration::from_secs(5),
            notify_order: NotifyOrder::AfterStop,
            strip_ansi: false,
        }
    }
}

/// Owns the child process of a single service.
#[derive(Debug)]
pub struct ProcessHandle {
    spec: ServiceSpec,
    running: Option<RunningChild>,
    next_run: u64,
}

#[derive(Debug)]
struct RunningChild {
    run: u64,
    pid: Option<u32>,
    // Moves into an `ExitWaiter` once someone starts waiting on the run.
    child: Option<Child>,
    cancel: CancellationToken,
}

/// What a successful `start` hands back to the caller.
#[derive(Debug)]
pub struct SpawnedRun {
    pub run: u64,
    pub pid: Option<u32>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
    /// Fires when the run is terminated.
    pub cancel: CancellationToken,
}

/// Waits for one run to exit, sending it a termination signal if the run is
/// cancelled first.
#[derive(Debug)]
pub struct ExitWaiter {
    run: u64,
    child: Child,
    cancel: CancellationToken,
}

impl ExitWaiter {
    pub fn run(&self) -> u64 {
        self.run
    }

    /// Resolves to the exit code, or `None` when the child died from a signal.
    pub async fn wait(mut self) -> std::io::Result<Option<i32>> {
        let status = tokio::select! {
            status = self.child.wait() => status?,
            _ = self.cancel.cancelled() => {
                terminate_child(&mut self.child);
                self.child.wait().await?
            }
        };
        Ok(status.code())
    }
}

impl ProcessHandle {
    pub fn new(spec: ServiceSpec) -> Self {
        Self {
            spec,
            running: None,
            next_run: 1,
        }
    }

    pub fn record(&self) -> &ServiceRecord {
        &self.spec.record
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().and_then(|r| r.pid)
    }

    pub fn current_run(&self) -> Option<u64> {
        self.running.as_ref().map(|r| r.run)
    }

    /// Spawns the service's command.
    ///
    /// Fails with `AlreadyRunning` if a child is present. Returns as soon as the
    /// process is spawned.
    pub fn start(&mut self) -> Result<SpawnedRun> {
        if self.running.is_some() {
            return Err(SupervisorError::AlreadyRunning {
                name: self.spec.record.name.clone(),
            });
        }
        let mut command = build_command(&self.spec)?;
        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            name: self.spec.record.name.clone(),
            source,
        })?;

        let run = self.next_run;
        self.next_run += 1;
        let pid = child.id();
        let cancel = CancellationToken::new();
        let spawned = SpawnedRun {
            run,
            pid,
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            cancel: cancel.clone(),
        };
        self.running = Some(RunningChild {
            run,
            pid,
            child: Some(child),
            cancel,
        });
        Ok(spawned)
    }

    /// Detaches the child so its exit can be awaited elsewhere.
    ///
    /// Returns `None` when idle or when a waiter was already taken for this run.
    /// The handle stays `Running` until `clear_run` is called for the run.
    pub fn take_exit_waiter(&mut self) -> Option<ExitWaiter> {
        let running = self.running.as_mut()?;
        let child = running.child.take()?;
        Some(ExitWaiter {
            run: running.run,
            child,
            cancel: running.cancel.clone(),
        })
    }

    /// Suspends until the child exits and returns its exit code.
    ///
    /// The stored child is cleared on return.
    pub async fn wait(&mut self) -> Result<Option<i32>> {
        let waiter = self
            .take_exit_waiter()
            .ok_or_else(|| SupervisorError::NotRunning {
                name: self.spec.record.name.clone(),
            })?;
        let run = waiter.run();
        let result = waiter.wait().await;
        self.clear_run(run);
        result.map_err(|source| SupervisorError::Wait {
            name: self.spec.record.name.clone(),
            source,
        })
    }

    /// Sends a termination signal to the child, if any, and forgets it.
    ///
    /// Does not wait for the process to die. Returns `false` when idle.
    pub fn terminate(&mut self) -> bool {
        let Some(mut running) = self.running.take() else {
            return false;
        };
        if let Some(child) = running.child.as_mut() {
            terminate_child(child);
        }
        // Stops the output pumps, and signals the child if an exit waiter owns it.
        running.cancel.cancel();
        true
    }

    /// Marks `run` as finished. Reports from older runs are ignored.
    pub fn clear_run(&mut self, run: u64) -> bool {
        if self.current_run() != Some(run) {
            return false;
        }
        self.running = None;
        true
    }
}

/// Manages the lifecycle and I/O of every configured service.
pub struct Supervisor {
    handles: Vec<ProcessHandle>,
    event_tx: mpsc::Sender<Event>,
    probe: ServiceProbe,
    config: SupervisorConfig,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Creates a new `Supervisor`; every service starts out idle.
    pub fn new(
        specs: Vec<ServiceSpec>,
        event_tx: mpsc::Sender<Event>,
        config: SupervisorConfig,
    ) -> anyhow::Result<Self> {
        let handles = specs.into_iter().map(ProcessHandle::new).collect();
        Ok(Self {
            handles,
            event_tx,
            probe: ServiceProbe::new()?,
            config,
            tasks: Vec::new(),
        })
    }

    pub fn records(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.handles.iter().map(ProcessHandle::record)
    }

    pub fn is_running(&self, id: usize) -> bool {
        self.handles.get(id).map(ProcessHandle::is_running).unwrap_or(false)
    }

    pub fn running_count(&self) -> usize {
        self.handles.iter().filter(|h| h.is_running()).count()
    }

    /// Starts every idle service. Running services are skipped, and failures are
    /// reported as events rather than returned.
    ///
    /// Returns the number of services that were spawned.
    pub async fn start_all(&mut self) -> usize {
        let mut started = 0;
        for id in 0..self.handles.len() {
            match self.start_one(id).await {
                Ok(_) => started += 1,
                Err(SupervisorError::AlreadyRunning { name }) => {
                    debug!(service = %name, "already running, skipping");
                    self.emit(Event::ServiceSkipped { id });
                }
                Err(err) => {
                    warn!("{}", err);
                    self.emit(Event::ServiceFailed {
                        id,
                        error: err.to_string(),
                    });
                }
            }
        }
        started
    }

    /// Starts a single service and attaches its output pumps and exit waiter.
    pub async fn start_one(&mut self, id: usize) -> Result<u64> {
        self.tasks.retain(|task| !task.is_finished());
        let strip_ansi = self.config.strip_ansi;
        let record = self
            .handles
            .get(id)
            .ok_or(SupervisorError::UnknownService(id))?
            .record()
            .clone();
        if self.handles[id].is_running() {
            return Err(SupervisorError::AlreadyRunning { name: record.name });
        }
        self.emit(Event::ServiceStarting {
            id,
            command: record.command.clone(),
        });
        let handle = &mut self.handles[id];
        let spawned = handle.start()?;
        let waiter = handle.take_exit_waiter();
        info!(service = %record.name, pid = ?spawned.pid, "started");
        self.emit(Event::ServiceStarted {
            id,
            run: spawned.run,
            pid: spawned.pid,
        });

        if let Some(stdout) = spawned.stdout {
            let pump = OutputPump::new(id, spawned.run, StreamKind::Stdout, strip_ansi);
            let tx = self.event_tx.clone();
            let cancel = spawned.cancel.clone();
            self.tasks.push(tokio::spawn(pump.run(stdout, tx, cancel)));
        }
        if let Some(stderr) = spawned.stderr {
            let pump = OutputPump::new(id, spawned.run, StreamKind::Stderr, strip_ansi);
            let tx = self.event_tx.clone();
            let cancel = spawned.cancel.clone();
            self.tasks.push(tokio::spawn(pump.run(stderr, tx, cancel)));
        }
        if let Some(waiter) = waiter {
            let tx = self.event_tx.clone();
            let run = spawned.run;
            self.tasks.push(tokio::spawn(async move {
                let event = match waiter.wait().await {
                    Ok(code) => Event::ServiceExited { id, run, code },
                    Err(err) => Event::ServiceFailed {
                        id,
                        error: format!("failed to collect exit status: {}", err),
                    },
                };
                let _ = tx.send(event).await;
            }));
        }
        Ok(spawned.run)
    }

    /// Applies an exit reported by a waiter task.
    ///
    /// Returns `false` when the report belongs to a run that was already
    /// terminated or replaced.
    pub fn record_exit(&mut self, id: usize, run: u64) -> bool {
        let Some(handle) = self.handles.get_mut(id) else {
            return false;
        };
        let cleared = handle.clear_run(run);
        if cleared {
            info!(service = %handle.record().name, run, "exited");
        }
        cleared
    }

    /// Terminates a single service. Idle services are left alone.
    pub fn stop_one(&mut self, id: usize) -> Result<bool> {
        let handle = self
            .handles
            .get_mut(id)
            .ok_or(SupervisorError::UnknownService(id))?;
        let terminated = handle.terminate();
        if terminated {
            info!(service = %handle.record().name, "terminated");
            self.emit(Event::ServiceTerminated { id });
        }
        Ok(terminated)
    }

    /// Terminates every running service without waiting for them to exit.
    ///
    /// Returns the number of services that were signalled.
    pub fn stop_all(&mut self) -> usize {
        let mut stopped = 0;
        for id in 0..self.handles.len() {
            if let Ok(true) = self.stop_one(id) {
                stopped += 1;
            }
        }
        stopped
    }

    /// Probes every service that has a port, concurrently.
    ///
    /// The returned future owns everything it needs, so callers can await it in
    /// place or spawn it. It resolves once every probe has answered or timed
    /// out, with results in service order.
    pub fn check_all(&self) -> impl Future<Output = Vec<ProbeResult>> + Send + 'static {
        let targets = self.probe_targets();
        let probe = self.probe.clone();
        let timeout = self.config.probe_timeout;
        let event_tx = self.event_tx.clone();
        async move {
            let mut set = JoinSet::new();
            for (id, name, port, url) in targets {
                let probe = probe.clone();
                set.spawn(async move {
                    let outcome = probe.probe(&url, timeout).await;
                    ProbeResult {
                        id,
                        name,
                        port,
                        outcome,
                    }
                });
            }
            let mut results = Vec::with_capacity(set.len());
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(result) => results.push(result),
                    Err(err) => warn!("probe task failed: {}", err),
                }
            }
            results.sort_by_key(|result| result.id);
            for result in &results {
                debug!(service = %result.name, outcome = %result.outcome, "probed");
                emit_on(&event_tx, Event::ProbeCompleted(result.clone()));
            }
            results
        }
    }

    /// Sends the shutdown notification requests to every service with a port.
    ///
    /// Each port gets `notify_attempts` GETs, `notify_delay` apart. Errors are
    /// swallowed.
    pub fn shutdown_notify(&self) -> impl Future<Output = ()> + Send + 'static {
        let targets = self.probe_targets();
        let probe = self.probe.clone();
        let attempts = self.config.notify_attempts;
        let delay = self.config.notify_delay;
        let timeout = self.config.notify_timeout;
        async move {
            let mut set = JoinSet::new();
            for (_, name, _, url) in targets {
                let probe = probe.clone();
                set.spawn(async move {
                    for attempt in 0..attempts {
                        if attempt > 0 {
                            tokio::time::sleep(delay).await;
                        }
                        let outcome = probe.probe(&url, timeout).await;
                        debug!(service = %name, attempt, outcome = %outcome, "shutdown notify");
                    }
                });
            }
            while set.join_next().await.is_some() {}
        }
    }

    /// Terminates every service and runs the shutdown notification round, in the
    /// configured order.
    pub async fn close_all(&mut self) {
        match self.config.notify_order {
            NotifyOrder::AfterStop => {
                self.stop_all();
                self.shutdown_notify().await;
            }
            NotifyOrder::BeforeStop => {
                self.shutdown_notify().await;
                self.stop_all();
            }
        }
    }

    /// Waits for outstanding pump and exit-waiter tasks, aborting whatever is
    /// still running after `timeout`.
    pub async fn join_tasks(&mut self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
            }
        }
    }

    fn probe_targets(&self) -> Vec<(usize, String, u16, String)> {
        self.handles
            .iter()
            .enumerate()
            .filter_map(|(id, handle)| {
                let record = handle.record();
                let port = record.port?;
                Some((
                    id,
                    record.name.clone(),
                    port,
                    service_url(&self.config.base_url, port),
                ))
            })
            .collect()
    }

    fn emit(&self, event: Event) {
        emit_on(&self.event_tx, event);
    }
}

// The task that owns the supervisor usually also drains this channel, so a
// blocking send here could deadlock on a full queue.
fn emit_on(tx: &mpsc::Sender<Event>, event: Event) {
    match tx.try_send(event) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(event)) => {
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(event).await;
            });
        }
    }
}

fn build_command(spec: &ServiceSpec) -> Result<Command> {
    let record = &spec.record;
    if record.command.trim().is_empty() {
        return Err(SupervisorError::EmptyCommand(record.name.clone()));
    }
    let mut command = if spec.shell {
        shell_command(&record.command)
    } else {
        let mut parts =
            shell_words::split(&record.command).map_err(|err| SupervisorError::InvalidCommand {
                name: record.name.clone(),
                reason: err.to_string(),
            })?;
        if parts.is_empty() {
            return Err(SupervisorError::EmptyCommand(record.name.clone()));
        }
        let program = parts.remove(0);
        let mut command = Command::new(program);
        command.args(parts);
        command
    };
    if !record.directory.is_empty() {
        command.current_dir(&record.directory);
    }
    if !spec.env.is_empty() {
        command.envs(&spec.env);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // A terminated child is left for the runtime to reap, so dropping the
    // handle must not escalate to SIGKILL.
    command.kill_on_drop(false);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    Ok(command)
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(line);
    command
}

#[cfg(not(unix))]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(line);
    command
}

#[cfg(unix)]
fn terminate_child(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // The child leads its own process group; signal the group so shell
    // grandchildren go down with it.
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, libc::SIGTERM);
        let _ = libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_child(child: &mut Child) {
    let _ = child.start_kill();
}
