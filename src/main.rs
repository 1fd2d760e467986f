#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # gwlink
//!
//! Command-line client for remote hardware gateways.
//!
//! ## Subcommands
//!
//! - `gwlink job <JOB_ID>`: stream a job's output until it finishes and exit
//!   with the job's result
//! - `gwlink gdbserver --gateway <ID>`: serve a local port that tunnels GDB
//!   remote-protocol traffic to the gateway's debug probe
//!
//! ## Exit codes
//!
//! | Code | Meaning                                                       |
//! |------|---------------------------------------------------------------|
//! | 0    | job finished (and, with a test runner, all tests passed)      |
//! | 1    | test failure or session error                                 |
//! | 130  | interrupted with Ctrl+C                                       |
//! | *n*  | remote exit code relayed by `--test-runner exit-code`         |

use std::io::IsTerminal;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use console::Style;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use gwlink::descriptor::{ConnectionDescriptor, SessionKind};
use gwlink::error::{exit_code_notice, SessionError};
use gwlink::input::{spawn_stdin_reader, CbreakGuard};
use gwlink::matcher::{MatcherKind, MatcherOptions};
use gwlink::{Config, JobOutputSession, SessionOptions, TunnelServer};

/// Job output streaming and GDB tunnelling for remote gateways.
#[derive(Parser)]
#[command(name = "gwlink", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
    /// Verbose logging and full error chains.
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream the output of a job until it completes.
    Job(JobArgs),
    /// Tunnel a local GDB server port to a gateway.
    Gdbserver(GdbserverArgs),
}

#[derive(Args)]
struct JobArgs {
    job_id: String,
    /// How to interpret the output.
    #[arg(long, value_enum, default_value_t = MatcherKind::Raw)]
    test_runner: MatcherKind,
    /// Line that precedes the remote exit code.
    #[arg(long, required_if_eq("test_runner", "exit-code"))]
    separator: Option<String>,
    /// Give up when no message arrives for this many seconds.
    #[arg(long, value_parser = parse_seconds)]
    message_timeout: Option<Duration>,
    /// Give up when the job runs longer than this many seconds.
    #[arg(long, value_parser = parse_seconds)]
    overall_timeout: Option<Duration>,
    /// Forward local keyboard input to the job.
    #[arg(long)]
    interactive: bool,
    /// Disable colored test output.
    #[arg(long)]
    no_color: bool,
}

#[derive(Args)]
struct GdbserverArgs {
    /// Gateway to connect to.
    #[arg(long)]
    gateway: String,
    /// Local interface to bind (`*` for all). Defaults to `[tunnel] host`.
    #[arg(long)]
    host: Option<String>,
    /// Local port. Defaults to `[tunnel] port`.
    #[arg(long)]
    port: Option<u16>,
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|e| format!("{e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            report(e, cli.debug);
            std::process::exit(1);
        }
    };

    let log_filter = if cli.debug {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone())
    };
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();
    debug!("gwlink v{} starting", env!("CARGO_PKG_VERSION"));

    let code = match cli.command {
        Commands::Job(args) => run_job(&config, args, cli.debug).await,
        Commands::Gdbserver(args) => run_gdbserver(&config, args, cli.debug).await,
    };
    std::process::exit(code);
}

/// Print the one-line diagnostic in red; with `--debug`, the full cause chain.
fn report<E>(err: E, debug: bool)
where
    E: std::error::Error + Send + Sync + 'static,
{
    let red = Style::new().red().for_stderr();
    eprintln!("{}", red.apply_to(err.to_string()));
    if debug {
        eprintln!("{:?}", anyhow::Error::from(err));
    }
}

async fn run_job(config: &Config, args: JobArgs, debug: bool) -> i32 {
    let kind = SessionKind::Job {
        job_id: args.job_id,
    };
    let descriptor = match ConnectionDescriptor::from_config(&config.api, &kind) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            report(e, debug);
            return 1;
        }
    };

    let mut options = SessionOptions::from(&config.session);
    options.message_timeout = args.message_timeout;
    options.overall_timeout = args.overall_timeout;

    let matcher = args.test_runner.build(&MatcherOptions {
        colorize: !args.no_color && std::io::stdout().is_terminal(),
        separator: args.separator.map(String::into_bytes),
    });

    let session = match JobOutputSession::new(descriptor, options, matcher, std::io::stdout()) {
        Ok(session) => session,
        Err(e) => {
            report(e, debug);
            return 1;
        }
    };

    let interrupt = CancellationToken::new();
    let ctrl_c = {
        let token = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        })
    };

    let mut session = session.with_interrupt(interrupt);
    let _cbreak = if args.interactive {
        let guard = CbreakGuard::enter();
        session = session.with_input(spawn_stdin_reader());
        Some(guard)
    } else {
        None
    };

    let outcome = session.run().await;
    ctrl_c.abort();

    match outcome {
        Ok(result) => {
            if let Some(notice) = exit_code_notice(result.exit_code) {
                eprintln!("{}", Style::new().yellow().for_stderr().apply_to(notice));
            }
            result.exit_code
        }
        Err(SessionError::Interrupted) => SessionError::Interrupted.exit_code(),
        Err(e) => {
            let code = e.exit_code();
            report(e, debug);
            code
        }
    }
}

async fn run_gdbserver(config: &Config, args: GdbserverArgs, debug: bool) -> i32 {
    let host = args.host.unwrap_or_else(|| config.tunnel.host.clone());
    let port = args.port.unwrap_or(config.tunnel.port);
    let kind = SessionKind::GdbTunnel {
        gateway_id: args.gateway,
    };

    let descriptor = match ConnectionDescriptor::from_config(&config.api, &kind) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            report(e, debug);
            return 1;
        }
    };
    let connect_timeout = Duration::from_secs(config.session.connect_timeout_secs);

    let handle = match TunnelServer::bind(&host, port, descriptor, connect_timeout)
        .await
        .and_then(TunnelServer::spawn)
    {
        Ok(handle) => handle,
        Err(e) => {
            report(e, debug);
            return 1;
        }
    };

    println!(
        "Serving GDB on {host}:{}. Press Ctrl+C to quit.",
        handle.local_addr().port()
    );
    if let Err(e) = tokio::signal::ctrl_c().await {
        report(e, debug);
    }
    info!("Tunnel: received SIGINT");

    match handle.shutdown().await {
        Ok(()) => 0,
        Err(e) => {
            report(e, debug);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn exit_code_runner_requires_separator() {
        let parsed = Cli::try_parse_from(["gwlink", "job", "j1", "--test-runner", "exit-code"]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from([
            "gwlink",
            "job",
            "j1",
            "--test-runner",
            "exit-code",
            "--separator",
            "__EXIT__",
        ]);
        assert!(parsed.is_ok());
    }

    #[test]
    fn fractional_timeouts_parse() {
        assert_eq!(parse_seconds("2.5").unwrap(), Duration::from_millis(2500));
        assert!(parse_seconds("soon").is_err());
        assert!(parse_seconds("-1").is_err());
    }
}
