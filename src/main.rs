mod config;
mod events;
mod guard;
mod guard_dir;
mod jitter;
mod killswitch;
mod link;
mod probe;
mod shutdown;
mod status;
mod verdict;

use clap::{Parser, Subcommand};
use config::{ConfigError, KillSwitchConfig, DEFAULT_CONFIG_PATH};
use guard::GuardSet;
use guard_dir::{GuardDir, GuardDirSync, GuardFileError};
use jitter::Jitter;
use killswitch::{ArmState, KillSwitch};
use link::SystemLinkDetector;
use probe::TcpProber;
use shutdown::{CommandShutdown, LogOnlyShutdown, ShutdownAction};
use status::{StatusFile, StatusTracker};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;
use verdict::VerdictEngine;

/// Connectivity-loss kill switch: while armed, periodically checks that the
/// host can reach the network and shuts it down when it cannot.
#[derive(Parser, Debug)]
#[command(name = "killswitch", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    /// Probe timeout in milliseconds (overrides config)
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Fixed RNG seed for interval jitter and target selection (overrides config)
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Validate config and print resolved settings, don't run
    #[arg(long, global = true)]
    dry_run: bool,

    /// Extra logging (every probe and scheduled poll)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the monitor (default). SIGUSR1 toggles arming; SIGINT/SIGTERM exit.
    Run {
        /// Start disarmed instead of armed
        #[arg(long)]
        disarmed: bool,

        /// Activate a guard for the lifetime of this process (repeatable)
        #[arg(long = "guard", value_name = "NAME")]
        guards: Vec<String>,

        /// Log the shutdown instead of running the shutdown command
        #[arg(long)]
        log_only: bool,
    },
    /// Hold or release a guard by name
    Guard {
        #[command(subcommand)]
        action: GuardAction,
    },
    /// Print the running monitor's status file
    Status,
}

#[derive(Subcommand, Debug)]
enum GuardAction {
    /// Create the guard file, vetoing shutdowns until released
    Activate { name: String },
    /// Remove the guard file
    Release { name: String },
    /// List held guards
    List,
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<KillSwitchConfig, ConfigError> {
    let mut config = KillSwitchConfig::load(&cli.config)?;
    if let Some(timeout_ms) = cli.timeout_ms {
        config.probe.timeout_ms = timeout_ms;
    }
    if let Some(seed) = cli.seed {
        config.poll.seed = Some(seed);
    }
    if let Some(Command::Run { log_only: true, .. }) = &cli.command {
        config.shutdown.log_only = true;
    }
    config.validate()?;
    Ok(config)
}

fn print_resolved(config: &KillSwitchConfig) {
    println!("killswitch v{}", env!("CARGO_PKG_VERSION"));
    for (label, pool) in [
        ("dns targets", config.probe.dns_pool()),
        ("web targets", config.probe.web_pool()),
    ] {
        let targets: Vec<String> = pool
            .unwrap_or_default()
            .iter()
            .map(|t| t.to_string())
            .collect();
        println!("{label:<14} {}", targets.join(", "));
    }
    println!("{:<14} {} ms", "probe timeout", config.probe.timeout_ms);
    if let Ok(bounds) = config.poll.bounds() {
        println!(
            "{:<14} [{}, {}) ms",
            "poll interval",
            bounds.low_ms(),
            bounds.high_ms()
        );
    }
    println!(
        "{:<14} {:?}",
        "link errors", config.link.on_enumeration_error
    );
    println!("{:<14} {}", "guard dir", config.guards.dir.display());
    if config.shutdown.log_only {
        println!("{:<14} log only", "shutdown");
    } else {
        println!(
            "{:<14} {} {}",
            "shutdown",
            config.shutdown.command,
            config.shutdown.args.join(" ")
        );
    }
    println!("{:<14} {}", "status file", config.status.file.display());
}

/// Wire the production collaborators into a disarmed kill switch.
fn build_switch(
    config: &KillSwitchConfig,
    guards: GuardSet,
) -> Result<KillSwitch, Box<dyn std::error::Error>> {
    let dns_pool = config.probe.dns_pool()?;
    let web_pool = config.probe.web_pool()?;
    let timeout = config.probe.timeout()?;
    let bounds = config.poll.bounds()?;

    // Separate streams so target picks don't shift the interval sequence.
    let seed = config.poll.seed;
    let engine = VerdictEngine::new(
        Arc::new(SystemLinkDetector::new(
            config.link.on_enumeration_error,
            config.link.ignore_interfaces.clone(),
        )),
        Arc::new(TcpProber),
        dns_pool,
        web_pool,
        timeout,
        Jitter::seeded(seed),
    )?;

    let shutdown: Arc<dyn ShutdownAction> = if config.shutdown.log_only {
        Arc::new(LogOnlyShutdown)
    } else {
        Arc::new(CommandShutdown::new(
            config.shutdown.command.clone(),
            config.shutdown.args.clone(),
        ))
    };

    Ok(KillSwitch::new(
        engine,
        guards,
        shutdown,
        bounds,
        Jitter::seeded(seed.map(|s| s.wrapping_add(1))),
    ))
}

async fn run(config: KillSwitchConfig, start_disarmed: bool, cli_guards: Vec<String>) -> ExitCode {
    if !config.shutdown.log_only && !nix::unistd::geteuid().is_root() {
        tracing::warn!("not running as root; the shutdown command will probably fail");
    }

    let guards = GuardSet::with_names(config.guards.names.iter().cloned());
    for name in &cli_guards {
        if !guard::is_valid_guard_name(name) {
            tracing::error!(guard = %name, "invalid guard name");
            return ExitCode::FAILURE;
        }
        guards.activate(name);
    }

    let ks = match build_switch(&config, guards.clone()) {
        Ok(ks) => ks,
        Err(e) => {
            tracing::error!(error = %e, "cannot build kill switch");
            return ExitCode::FAILURE;
        }
    };

    if let Some(dir) = config.status.file.parent() {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(error = %e, dir = %dir.display(), "cannot create status directory");
        }
    }
    let status_writer = status::spawn_writer(
        StatusTracker::new(config.status.file.clone(), guards.clone()),
        ks.events().subscribe(),
    );

    ks.attach_guard_dir(GuardDirSync::new(GuardDir::new(config.guards.dir.clone())));
    let sync_every = Duration::from_millis(config.guards.sync_interval_ms);
    let sync_switch = ks.clone();
    let guard_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sync_every);
        loop {
            ticker.tick().await;
            sync_switch.refresh_guards();
        }
    });

    let (mut usr1, mut term) = match (
        signal(SignalKind::user_defined1()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(usr1), Ok(term)) => (usr1, term),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        pid = std::process::id(),
        guard_dir = %config.guards.dir.display(),
        "killswitch running"
    );
    if !start_disarmed {
        ks.arm();
    }

    loop {
        tokio::select! {
            _ = usr1.recv() => {
                ks.set_armed(ks.state() != ArmState::Armed);
            }
            _ = term.recv() => {
                tracing::info!("SIGTERM received, exiting");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, exiting");
                break;
            }
        }
    }

    ks.disarm();
    guard_task.abort();
    status_writer.abort();
    StatusFile::new(config.status.file.clone()).remove();
    ExitCode::SUCCESS
}

fn guard_command(config: &KillSwitchConfig, action: GuardAction) -> Result<(), GuardFileError> {
    let dir = GuardDir::new(config.guards.dir.clone());
    match action {
        GuardAction::Activate { name } => {
            dir.activate(&name)?;
            println!("guard {name} active");
        }
        GuardAction::Release { name } => {
            dir.release(&name)?;
            println!("guard {name} released");
        }
        GuardAction::List => {
            for name in dir.scan()? {
                println!("{name}");
            }
        }
    }
    Ok(())
}

fn status_command(config: &KillSwitchConfig) -> ExitCode {
    let file = StatusFile::new(config.status.file.clone());
    match file.read() {
        Ok(data) => match serde_json::to_string_pretty(&data) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("error: {e} (is the monitor running?)");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.dry_run {
        print_resolved(&config);
        println!("Dry run mode: config validated, not running.");
        return ExitCode::SUCCESS;
    }

    match cli.command {
        None => run(config, false, Vec::new()).await,
        Some(Command::Run {
            disarmed, guards, ..
        }) => run(config, disarmed, guards).await,
        Some(Command::Guard { action }) => match guard_command(&config, action) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        },
        Some(Command::Status) => status_command(&config),
    }
}
