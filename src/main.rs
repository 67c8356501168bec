//! Binary entrypoint for meshcore-bridge.
//!
//! Commands:
//! - `start [--bind <addr>] [--port <path>]` - run the bridge and its HTTP API
//! - `init` - write a starter `config.toml`
//! - `status` - print the resolved configuration as JSON
//! - `smoketest [--command <cmd>] [--timeout <s>]` - start a session, run one command, exit 0/1
//!
//! See the library crate docs for module-level details: `meshcore_bridge::`.
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use meshcore_bridge::bridge::Bridge;
use meshcore_bridge::config::{Config, ConfigSource};
use meshcore_bridge::http::run_http;

#[derive(Parser)]
#[command(name = "meshcore-bridge")]
#[command(about = "HTTP bridge keeping a persistent meshcore-cli session")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge and serve the HTTP API
    Start {
        /// Listen address, e.g. 0.0.0.0:5001
        #[arg(short, long)]
        bind: Option<String>,
        /// MeshCore serial device (e.g., /dev/ttyUSB0)
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Show the resolved configuration
    Status,
    /// Start a session, run one command and print the result
    SmokeTest {
        /// Command to run once the session is up
        #[arg(long, default_value = "infos")]
        command: String,
        /// Seconds to wait for the command
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { bind, port } => {
            let (mut config, source) = Config::load_or_default(&cli.config).await?;
            if let Some(bind) = bind {
                config.http.bind = bind;
            }
            if let Some(port) = port {
                config.cli.serial_port = port;
            }
            init_logging(&Some(config.clone()), cli.verbose);
            report_config_source(&cli.config, source);
            info!("Starting meshcore-bridge v{}", env!("CARGO_PKG_VERSION"));

            let bridge = Bridge::start(&config).await?;
            let served = run_http(bridge.clone(), &config.http.bind).await;
            bridge.shutdown().await;
            served?;
        }
        Commands::Init => {
            init_logging(&None, cli.verbose);
            if Path::new(&cli.config).exists() {
                bail!("{} already exists; refusing to overwrite", cli.config);
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let (config, source) = Config::load_or_default(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            report_config_source(&cli.config, source);
            let payload = serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "config_file": cli.config,
                "device_name": config.bridge.device_name,
                "cli_binary": config.cli.binary,
                "cli_args": config.cli.command_args(),
                "transport": if config.cli.uses_tcp() { "tcp" } else { "serial" },
                "device_present": config.cli.required_device().map(|d| d.exists()),
                "http_bind": config.http.bind,
                "msgs_file": config.msgs_file_path(),
                "msgs_file_present": config.msgs_file_path().exists(),
                "settings_file": config.settings_file_path(),
                "adverts_file": config.adverts_file_path(),
                "init_commands": config.cli.init_commands,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::SmokeTest { command, timeout } => {
            let (config, source) = Config::load_or_default(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            report_config_source(&cli.config, source);
            info!("Starting smoke test: {}", command);

            let bridge = Bridge::start(&config).await?;
            let result = bridge
                .execute_command(&command, Some(Duration::from_secs(timeout.max(1))))
                .await;
            let health = bridge.health().await;
            bridge.shutdown().await;

            let (ok, payload) = match result {
                Ok(output) => (
                    true,
                    serde_json::json!({
                        "status": "ok",
                        "command": command,
                        "stdout": output.stdout,
                        "stderr": output.stderr,
                        "returncode": output.returncode,
                        "session_generation": health.session.generation,
                    }),
                ),
                Err(e) => {
                    error!("Smoke test failed: {}", e);
                    (
                        false,
                        serde_json::json!({
                            "status": "failed",
                            "command": command,
                            "error": e.to_string(),
                            "code": e.code(),
                            "timeout_seconds": timeout,
                        }),
                    )
                }
            };
            println!("{}", payload);
            std::process::exit(if ok { 0 } else { 1 });
        }
    }

    Ok(())
}

fn report_config_source(path: &str, source: ConfigSource) {
    if source == ConfigSource::Defaults {
        warn!("Config file {} not found; using defaults", path);
    }
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| log::LevelFilter::from_str(&c.logging.level).ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Under a supervisor stdout is not a TTY; the file alone is enough there
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
