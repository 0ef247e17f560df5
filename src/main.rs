//! devrack entry point.
//!
//! Parses command-line arguments, loads the service list, and runs the event
//! loop that connects the supervisor to the console.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use devrack::config::{self, Config};
use devrack::console::{Console, ConsoleCommand, HELP};
use devrack::events::Event;
use devrack::probe::ProbeResult;
use devrack::process::ServiceSpec;
use devrack::runner::{Supervisor, SupervisorConfig};

const DEFAULT_CONFIG_FILE: &str = "devrack.toml";
const LEGACY_CONFIG_FILE: &str = "commands.json";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Launch, watch and probe a rack of local dev servers",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to a devrack.toml or commands.json file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any config file in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
    /// Command line template; {PORT} is replaced with each service's port.
    #[arg(long, global = true)]
    command_template: Option<String>,
    /// Health check timeout (ms).
    #[arg(long, global = true)]
    probe_timeout_ms: Option<u64>,
    /// Max log lines kept per service.
    #[arg(long, global = true)]
    max_lines: Option<usize>,
    /// Strip ANSI escape codes from service output.
    #[arg(long, global = true)]
    strip_ansi: bool,
    /// Do not read console commands from stdin.
    #[arg(long, global = true)]
    no_input: bool,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Commands {
    /// Start every service and stream its output (default).
    Run,
    /// Probe every service with a port once and print the results.
    Check,
    /// Send the shutdown notification requests to every service with a port.
    Notify,
    /// Print the configured services and their commands.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let (specs, settings) = load_specs(&cli)?;
    if specs.is_empty() {
        bail!(
            "no services defined (use {} or {})",
            DEFAULT_CONFIG_FILE,
            LEGACY_CONFIG_FILE
        );
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::List => {
            print_services(&specs);
            Ok(())
        }
        Commands::Check => {
            // One-shot commands have no sink; events are dropped.
            let (event_tx, _) = mpsc::channel(1);
            let supervisor = Supervisor::new(specs, event_tx, settings.supervisor)?;
            for result in supervisor.check_all().await {
                println!("{}", result);
            }
            Ok(())
        }
        Commands::Notify => {
            let (event_tx, _) = mpsc::channel(1);
            let supervisor = Supervisor::new(specs, event_tx, settings.supervisor)?;
            supervisor.shutdown_notify().await;
            Ok(())
        }
        Commands::Run => run(specs, settings).await,
    }
}

async fn run(specs: Vec<ServiceSpec>, settings: RunSettings) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let mut supervisor = Supervisor::new(specs, event_tx.clone(), settings.supervisor)?;
    let mut console = Console::new(supervisor.records(), settings.max_lines);

    if settings.input_enabled {
        spawn_stdin_listener(event_tx.clone());
        println!("{}", HELP);
    }
    spawn_signal_listener(event_tx.clone());

    supervisor.start_all().await;
    let mut check_round: Option<JoinHandle<Vec<ProbeResult>>> = None;

    while let Some(event) = event_rx.recv().await {
        match &event {
            Event::ServiceExited { id, run, .. } => {
                supervisor.record_exit(*id, *run);
            }
            Event::Command(line) => {
                let Some(command) = ConsoleCommand::parse(line) else {
                    if !line.trim().is_empty() {
                        println!("unknown command: {} ({})", line.trim(), HELP);
                    }
                    continue;
                };
                match command {
                    ConsoleCommand::Start => {
                        supervisor.start_all().await;
                    }
                    ConsoleCommand::Stop => {
                        supervisor.stop_all();
                    }
                    ConsoleCommand::Check => {
                        let busy = check_round
                            .as_ref()
                            .map(|round| !round.is_finished())
                            .unwrap_or(false);
                        if busy {
                            println!("check already in progress");
                        } else {
                            check_round = Some(tokio::spawn(supervisor.check_all()));
                        }
                    }
                    ConsoleCommand::Status => {
                        for line in console.status_lines() {
                            println!("{}", line);
                        }
                    }
                    ConsoleCommand::MarkAllRead => {
                        let cleared = console.mark_all_read();
                        println!("marked {} service(s) as read", cleared);
                    }
                    ConsoleCommand::Close => break,
                    ConsoleCommand::Help => println!("{}", HELP),
                }
                continue;
            }
            Event::InputClosed => {
                debug!("console input closed");
                break;
            }
            Event::Shutdown => {
                info!("shutdown requested");
                break;
            }
            _ => {}
        }
        if let Some(line) = console.handle_event(&event) {
            println!("{}", line);
        }
    }

    info!("closing all services");
    supervisor.close_all().await;
    if let Some(round) = check_round {
        round.abort();
    }
    supervisor.join_tasks(Duration::from_secs(2)).await;
    Ok(())
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

fn init_logging(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    // Service output owns stdout; diagnostics go to stderr.
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = tx.send(Event::Shutdown).await;
    });
}

fn spawn_stdin_listener(tx: mpsc::Sender<Event>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(Event::Command(line)).is_err() {
                return;
            }
        }
        let _ = tx.blocking_send(Event::InputClosed);
    });
}

fn print_services(specs: &[ServiceSpec]) {
    for spec in specs {
        let record = &spec.record;
        let port = record
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let directory = if record.directory.is_empty() {
            "."
        } else {
            record.directory.as_str()
        };
        println!(
            "{}  port {}  in {}  $ {}",
            record.name, port, directory, record.command
        );
    }
}

fn load_specs(cli: &Cli) -> Result<(Vec<ServiceSpec>, RunSettings)> {
    let config = if cli.no_config && cli.config.is_none() {
        Config::default()
    } else {
        match cli.config.clone().or_else(default_config_path) {
            Some(path) => config::load_config(&path)?,
            None => Config::default(),
        }
    };
    let specs = config::build_specs(&config, cli.command_template.as_deref())?;
    let settings = RunSettings::from_cli(cli, &config);
    Ok((specs, settings))
}

fn default_config_path() -> Option<PathBuf> {
    [DEFAULT_CONFIG_FILE, LEGACY_CONFIG_FILE]
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
}

/// Runtime configuration derived from CLI arguments and the config file.
#[derive(Debug, Clone)]
struct RunSettings {
    max_lines: usize,
    input_enabled: bool,
    supervisor: SupervisorConfig,
}

impl RunSettings {
    fn from_cli(cli: &Cli, config: &Config) -> Self {
        let defaults = SupervisorConfig::default();
        let millis = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        let supervisor = SupervisorConfig {
            base_url: config.base_url.clone().unwrap_or(defaults.base_url),
            probe_timeout: millis(
                cli.probe_timeout_ms.or(config.probe_timeout_ms),
                defaults.probe_timeout,
            ),
            notify_attempts: config.notify_attempts.unwrap_or(defaults.notify_attempts),
            notify_delay: millis(config.notify_delay_ms, defaults.notify_delay),
            notify_timeout: millis(config.notify_timeout_ms, defaults.notify_timeout),
            notify_order: config.notify_order.unwrap_or(defaults.notify_order),
            strip_ansi: cli.strip_ansi || config.strip_ansi.unwrap_or(defaults.strip_ansi),
        };
        Self {
            max_lines: cli.max_lines.or(config.max_lines).unwrap_or(10_000),
            input_enabled: !cli.no_input,
            supervisor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_config_file() {
        let cli = Cli::parse_from([
            "devrack",
            "--probe-timeout-ms",
            "1500",
            "--strip-ansi",
            "--no-input",
            "check",
        ]);
        let config: Config = toml::from_str(
            r#"
probe_timeout_ms = 9000
notify_delay_ms = 100
max_lines = 50
"#,
        )
        .unwrap();
        let settings = RunSettings::from_cli(&cli, &config);
        assert!(matches!(cli.command, Some(Commands::Check)));
        assert_eq!(settings.supervisor.probe_timeout, Duration::from_millis(1500));
        assert_eq!(settings.supervisor.notify_delay, Duration::from_millis(100));
        assert_eq!(settings.supervisor.notify_attempts, 2);
        assert!(settings.supervisor.strip_ansi);
        assert!(!settings.input_enabled);
        assert_eq!(settings.max_lines, 50);
    }

    #[test]
    fn defaults_match_reference_timings() {
        let cli = Cli::parse_from(["devrack"]);
        let settings = RunSettings::from_cli(&cli, &Config::default());
        assert!(cli.command.is_none());
        assert_eq!(settings.supervisor.probe_timeout, Duration::from_secs(5));
        assert_eq!(settings.supervisor.notify_delay, Duration::from_millis(500));
        assert_eq!(settings.supervisor.base_url, "http://127.0.0.1");
        assert_eq!(settings.max_lines, 10_000);
    }
}
