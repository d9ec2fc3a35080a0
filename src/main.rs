//! proc-supervisor - run a program with captured output, cancellation and timeouts.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use proc_supervisor::config::{ConfigLoader, KillModeConfig, SupervisorConfig};
use proc_supervisor::display;
use proc_supervisor::process::{InputStream, ProcessSupervisor, SupervisorError};

#[derive(Parser)]
#[command(
    name = "proc-supervisor",
    about = "Run a program under supervision",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file to use instead of the default search paths.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program, printing its combined stdout and stderr.
    Run {
        /// Kill the program after this many seconds.
        #[arg(short, long, value_name = "SECS", value_parser = parse_seconds)]
        timeout: Option<Duration>,
        /// Send SIGTERM first and wait this many seconds before killing.
        #[arg(long, value_name = "SECS", value_parser = parse_seconds)]
        graceful: Option<Duration>,
        /// Forward this program's stdin to the child.
        #[arg(long)]
        stdin: bool,
        /// Print output lines without timestamps.
        #[arg(long)]
        raw: bool,
        /// Program to run.
        program: String,
        /// Arguments for the program.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("invalid number of seconds: {value}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn run(
    program: &str,
    args: &[String],
    config: &SupervisorConfig,
    stdin_enabled: bool,
    raw: bool,
) -> Result<ExitCode, SupervisorError> {
    let mut supervisor = ProcessSupervisor::from_config(program, args, config);
    let mut lines = supervisor.stream_output()?;
    let input = if stdin_enabled {
        Some(supervisor.open_input_stream()?)
    } else {
        None
    };

    if let Err(e) = supervisor.start() {
        display::print_error(&e.to_string());
        let code = supervisor.try_outcome().map_or(1, |o| o.shell_code());
        return Ok(exit_code(code));
    }
    display::print_start(program, args, supervisor.id());

    if let Some(input) = input {
        forward_stdin(input);
    }

    let handle = supervisor.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, killing process");
            handle.kill();
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(line) = lines.next().await {
            display::print_line(&line, raw);
        }
    });

    let outcome = supervisor.outcome().await;
    let _ = printer.await;
    display::print_outcome(&outcome);

    Ok(exit_code(outcome.shell_code()))
}

/// Copy this program's stdin into the child.
///
/// Reading happens on a plain thread so a pending terminal read never keeps
/// the runtime from shutting down.
fn forward_stdin(mut input: InputStream) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; 8192];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = input.write_all(&chunk).await {
                tracing::debug!(error = %e, "Stopped forwarding stdin");
                break;
            }
        }
        let _ = input.shutdown().await;
    });
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let loader = cli
        .config
        .map_or_else(ConfigLoader::new, ConfigLoader::with_path);
    let mut config = match loader.load() {
        Ok(config) => config,
        Err(e) => {
            display::print_error(&e.to_string());
            return ExitCode::from(2);
        }
    };

    match cli.command {
        Commands::Run {
            timeout,
            graceful,
            stdin,
            raw,
            program,
            args,
        } => {
            if let Some(timeout) = timeout {
                config.timeout_ms = Some(duration_millis(timeout));
            }
            if let Some(grace) = graceful {
                config.kill_mode = KillModeConfig::Graceful;
                config.grace_period_ms = duration_millis(grace);
            }
            tracing::info!(
                program = %program,
                timeout = ?config.timeout(),
                kill_mode = ?config.kill_mode(),
                "Starting supervisor"
            );

            match run(&program, &args, &config, stdin, raw).await {
                Ok(code) => code,
                Err(e) => {
                    display::print_error(&e.to_string());
                    ExitCode::from(2)
                }
            }
        }
    }
}
