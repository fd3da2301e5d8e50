//! instancectl - application-server instance supervisor
//!
//! CLI entry point. Every invocation loads the configuration, performs one
//! lifecycle operation and exits.

use std::fs;
use std::path::Path;

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use tracing::{debug, info};

use instancectl::cli::{Cli, Command, OutputFormat, get_log_path};
use instancectl::config::Config;
use instancectl::error::Error;
use instancectl::process::SystemProcesses;
use instancectl::supervisor::{InstanceState, InstanceStatus, StartOutcome, StopOutcome, Supervisor};

type Ctl = Supervisor<SystemProcesses>;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Logging isn't initialised yet, so problems go to stderr
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level).map(str::to_uppercase).as_deref() {
        None | Some("INFO") => tracing::Level::INFO,
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config_path = Config::locate(cli.config.as_ref());
    let config = Config::load(&config_path).context("Failed to load configuration")?;
    info!(
        path = %config_path.display(),
        instances = config.instances.len(),
        "instancectl loaded config"
    );

    let mut ctl = Supervisor::new(config, config_path, SystemProcesses::new());

    debug!(command = ?cli.command, "main: dispatching command");
    let result = match cli.command {
        Command::Add { name } => cmd_add(&mut ctl, &name),
        Command::Remove { name } => cmd_remove(&mut ctl, &name),
        Command::List { format } => cmd_list(&ctl, format),
        Command::Start { name, background } => cmd_start(&ctl, &name, background),
        Command::Stop { name } => cmd_stop(&ctl, &name),
        Command::Restart { name } => cmd_restart(&ctl, &name),
        Command::Status { name, format } => cmd_status(&ctl, &name, format),
        Command::Kill { name } => cmd_kill(&ctl, &name),
        Command::Cli { name, command, file } => cmd_cli(&ctl, &name, command.as_deref(), file.as_deref()),
    };

    // Precondition failures are an answer, not a crash
    if let Err(report) = &result {
        if let Some(err) = report.downcast_ref::<Error>().filter(|e| e.is_precondition()) {
            info!(error = %err, "main: precondition not met");
            println!("{} {}", "!".yellow(), err.to_string().yellow());
            return Ok(());
        }
    }
    result
}

/// Provision and register a new instance
fn cmd_add(ctl: &mut Ctl, name: &str) -> Result<()> {
    debug!(%name, "cmd_add: called");
    let outcome = ctl.add(name)?;

    if outcome.provisioned {
        println!("{} Provisioned {}", "✓".green(), outcome.directory.display());
    } else {
        println!("{} Reusing existing directory {}", "✓".green(), outcome.directory.display());
    }
    if outcome.configured {
        println!("{} Added {} to {}", "✓".green(), name.cyan(), ctl.config_path().display());
    }
    Ok(())
}

/// Remove a stopped instance
fn cmd_remove(ctl: &mut Ctl, name: &str) -> Result<()> {
    debug!(%name, "cmd_remove: called");
    let outcome = ctl.remove(name)?;
    println!(
        "{} Removed {} ({})",
        "✓".green(),
        name.cyan(),
        outcome.directory.display()
    );
    Ok(())
}

/// Start an instance in the foreground or background
fn cmd_start(ctl: &Ctl, name: &str, background: bool) -> Result<()> {
    debug!(%name, background, "cmd_start: called");
    if !background {
        println!("Starting {} in the foreground...", name.cyan());
    }

    match ctl.start(name, background)? {
        StartOutcome::AlreadyRunning { pid } => {
            println!("{} is already running (PID: {})", name.cyan(), pid);
        }
        StartOutcome::Started { pid } => {
            println!("{} Started {} (PID: {})", "✓".green(), name.cyan(), pid);
        }
        StartOutcome::Exited { code } => {
            return exit_status(&format!("{} exited", name), code);
        }
    }
    Ok(())
}

/// Stop an instance gracefully
fn cmd_stop(ctl: &Ctl, name: &str) -> Result<()> {
    debug!(%name, "cmd_stop: called");
    print_stop(name, ctl.stop(name)?);
    Ok(())
}

/// Kill an instance
fn cmd_kill(ctl: &Ctl, name: &str) -> Result<()> {
    debug!(%name, "cmd_kill: called");
    print_stop(name, ctl.kill(name)?);
    Ok(())
}

/// Stop then start an instance in the background
fn cmd_restart(ctl: &Ctl, name: &str) -> Result<()> {
    debug!(%name, "cmd_restart: called");
    let (stopped, started) = ctl.restart(name)?;
    print_stop(name, stopped);
    match started {
        StartOutcome::Started { pid } | StartOutcome::AlreadyRunning { pid } => {
            println!("{} Started {} (PID: {})", "✓".green(), name.cyan(), pid);
        }
        StartOutcome::Exited { code } => return exit_status(&format!("{} exited", name), code),
    }
    Ok(())
}

fn print_stop(name: &str, outcome: StopOutcome) {
    match outcome {
        StopOutcome::NotRunning { stale: true } => {
            println!("{} is not running (cleared stale record)", name.cyan());
        }
        StopOutcome::NotRunning { stale: false } => {
            println!("{} is not running", name.cyan());
        }
        StopOutcome::Stopped { pid, forced: true } => {
            println!("{} Killed {} (PID: {})", "✓".green(), name.cyan(), pid);
        }
        StopOutcome::Stopped { pid, forced: false } => {
            println!("{} Stopped {} (PID: {})", "✓".green(), name.cyan(), pid);
        }
    }
}

/// Show one instance
fn cmd_status(ctl: &Ctl, name: &str, format: OutputFormat) -> Result<()> {
    debug!(%name, ?format, "cmd_status: called");
    let status = ctl.status(name)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&status)?),
        OutputFormat::Text => println!("{}", status_line(&status)),
        OutputFormat::Table => print!("{}", render_table(std::slice::from_ref(&status))),
    }
    Ok(())
}

/// Show every configured instance
fn cmd_list(ctl: &Ctl, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_list: called");
    let statuses = ctl.list()?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&statuses)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&statuses)?),
        OutputFormat::Text => {
            for status in &statuses {
                println!("{}", status_line(status));
            }
        }
        OutputFormat::Table => {
            if statuses.is_empty() {
                println!("No instances configured");
            } else {
                print!("{}", render_table(&statuses));
            }
        }
    }
    Ok(())
}

/// Run the management CLI
fn cmd_cli(ctl: &Ctl, name: &str, command: Option<&str>, file: Option<&Path>) -> Result<()> {
    debug!(%name, ?command, ?file, "cmd_cli: called");
    let codes = ctl.cli(name, command, file)?;
    match codes.iter().copied().find(|&code| code != 0) {
        Some(code) => exit_status("Management CLI failed", code),
        None => Ok(()),
    }
}

fn exit_status(what: &str, code: i32) -> Result<()> {
    if code == 0 {
        println!("{} (code 0)", what);
        Ok(())
    } else {
        Err(eyre!("{} with code {}", what, code))
    }
}

fn status_line(status: &InstanceStatus) -> String {
    match status.pid {
        Some(pid) => format!("{}: {} (PID: {})", status.name, paint(status.state), pid),
        None => format!("{}: {}", status.name, paint(status.state)),
    }
}

fn paint(state: InstanceState) -> ColoredString {
    match state {
        InstanceState::Running => state.to_string().green(),
        InstanceState::Stopped => state.to_string().red(),
        InstanceState::Unmanaged => state.to_string().dimmed(),
    }
}

fn render_table(statuses: &[InstanceStatus]) -> String {
    let width = statuses.iter().map(|s| s.name.len()).max().unwrap_or(0).max("NAME".len());

    let mut out = format!("{:<width$}  {:<9}  {}\n", "NAME", "STATE", "PID", width = width);
    for status in statuses {
        let pid = status.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<width$}  {:<9}  {}\n",
            status.name,
            status.state.to_string(),
            pid,
            width = width
        ));
    }
    out
}
