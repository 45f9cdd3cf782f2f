//! monwatch - display hotplug watcher daemon
//!
//! Watches RandR output-change notifications, fingerprints the
//! attached displays' EDID data, and runs a user script whenever the
//! fingerprint or connection state changes. The server on this
//! platform may never push hotplug notifications on its own, so a
//! periodic poll keeps its output view fresh.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use monwatch_daemon::config::DaemonConfig;
use monwatch_daemon::daemon::{ReconcileOptions, Reconciler};
use monwatch_daemon::dispatch::ScriptDispatcher;
use monwatch_daemon::lifecycle::{spawn_signal_listener, ShutdownHandle};
use monwatch_system::{DisplaySource, RandrSource};

/// Marker set on the re-executed background copy so it does not
/// detach a second time.
const DETACHED_ENV: &str = "MONWATCH_DETACHED";

/// Watch display outputs and run a script when they change
#[derive(Parser, Debug)]
#[command(name = "monwatch", version, about)]
struct Cli {
    /// Stay attached to the terminal and log to stderr
    #[arg(short = 'd')]
    foreground: bool,

    /// Action script to run on changes (default: ~/.monwatch)
    #[arg(short = 'f', value_name = "FILE")]
    script: Option<PathBuf>,

    /// Poll interval in seconds
    #[arg(short = 'i', value_name = "SECONDS",
          value_parser = clap::value_parser!(u64).range(1..=60))]
    interval: Option<u64>,

    /// Print the current display fingerprint and exit
    #[arg(short = 'E',
          conflicts_with_all = ["foreground", "script", "interval", "init_action", "detect_on_poll"])]
    print_fingerprint: bool,

    /// Run the action script once at startup with an "init" status
    #[arg(long)]
    init_action: bool,

    /// Run change detection on poll ticks too, not only on
    /// notifications
    #[arg(long)]
    detect_on_poll: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Usage problems exit 1; --help/--version are not errors.
            let failure = err.use_stderr();
            let _ = err.print();
            std::process::exit(if failure { 1 } else { 0 });
        }
    };

    if cli.print_fingerprint {
        return print_fingerprint();
    }

    let mut config = DaemonConfig::load().context("configuration failed")?;
    apply_cli(&mut config, &cli);
    config.validate().context("configuration failed")?;
    let script = config.resolve_script()?;

    if !cli.foreground && std::env::var_os(DETACHED_ENV).is_none() {
        return detach();
    }

    init_tracing(&config, cli.foreground);
    info!("started");

    let source = RandrSource::connect()?;
    let shutdown = ShutdownHandle::new();
    spawn_signal_listener(shutdown.clone())?;

    let options = ReconcileOptions {
        poll_interval: config.poll_interval(),
        startup_action: config.startup_action,
        detect_on_poll: config.detect_on_poll,
    };
    let mut reconciler =
        Reconciler::new(source, ScriptDispatcher::new(script), shutdown, options);
    reconciler.run().await?;

    info!("terminated");
    Ok(())
}

/// -E: one fingerprint over a fresh enumeration, no loop.
fn print_fingerprint() -> Result<()> {
    let mut source = RandrSource::connect()?;
    let snapshot = source.refresh_snapshot()?;
    println!("{}", snapshot.fingerprint());
    Ok(())
}

fn apply_cli(config: &mut DaemonConfig, cli: &Cli) {
    if let Some(script) = &cli.script {
        config.script = Some(script.clone());
    }
    if let Some(interval) = cli.interval {
        config.interval = interval;
    }
    if cli.init_action {
        config.startup_action = true;
    }
    if cli.detect_on_poll {
        config.detect_on_poll = true;
    }
}

/// Re-exec ourselves with stdio detached; the child sees the marker
/// and takes the normal startup path.
fn detach() -> Result<()> {
    let exe = std::env::current_exe().context("failed to locate own executable")?;
    std::process::Command::new(exe)
        .args(std::env::args_os().skip(1))
        .env(DETACHED_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to detach")?;
    Ok(())
}

/// stderr lines in the foreground, journald once detached.
fn init_tracing(config: &DaemonConfig, foreground: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    if foreground {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        return;
    }

    match tracing_journald::layer() {
        Ok(journald) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(journald)
                .init();
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_flags() {
        let cli = Cli::try_parse_from(["monwatch"]).unwrap();
        assert!(!cli.foreground);
        assert!(!cli.print_fingerprint);
        assert!(cli.script.is_none());
        assert!(cli.interval.is_none());
    }

    #[test]
    fn flags_parse() {
        let cli =
            Cli::try_parse_from(["monwatch", "-d", "-f", "/tmp/action", "-i", "10"]).unwrap();
        assert!(cli.foreground);
        assert_eq!(cli.script.as_deref(), Some(std::path::Path::new("/tmp/action")));
        assert_eq!(cli.interval, Some(10));
    }

    #[test]
    fn interval_is_range_checked() {
        assert!(Cli::try_parse_from(["monwatch", "-i", "0"]).is_err());
        assert!(Cli::try_parse_from(["monwatch", "-i", "61"]).is_err());
        assert!(Cli::try_parse_from(["monwatch", "-i", "60"]).is_ok());
    }

    #[test]
    fn fingerprint_flag_excludes_the_rest() {
        assert!(Cli::try_parse_from(["monwatch", "-E"]).is_ok());
        assert!(Cli::try_parse_from(["monwatch", "-E", "-d"]).is_err());
        assert!(Cli::try_parse_from(["monwatch", "-E", "-f", "/tmp/a"]).is_err());
        assert!(Cli::try_parse_from(["monwatch", "-E", "-i", "5"]).is_err());
    }

    #[test]
    fn cli_overrides_config() {
        let mut config = DaemonConfig::default();
        let cli = Cli::try_parse_from([
            "monwatch",
            "-f",
            "/tmp/action",
            "-i",
            "20",
            "--init-action",
        ])
        .unwrap();

        apply_cli(&mut config, &cli);
        assert_eq!(config.script.as_deref(), Some(std::path::Path::new("/tmp/action")));
        assert_eq!(config.interval, 20);
        assert!(config.startup_action);
        assert!(!config.detect_on_poll);
    }
}
