//! cangw CLI Entry Point
//!
//! Describes the supported connection, prints an example configuration,
//! monitors a bus, or runs a gateway from a TOML file.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "tracing-support")]
use cangw::core::logging::TracingLogHandler;
use cangw::core::metadata::get_protocol_registry;
use cangw::gateway::{self, GatewayConfig};
use cangw::prelude::*;
use cangw::protocols::cannelloni::{CannelloniConfig, CannelloniConnection};

/// CAN Gateway - Cannelloni CAN-over-UDP client
#[derive(Parser, Debug)]
#[command(name = "cangw", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Describe supported connections and their parameters
    Describe {
        /// Connection to describe
        protocol: Option<String>,
    },

    /// Print an example configuration
    Example,

    /// Print every frame received on a local UDP endpoint
    Listen {
        /// Local endpoint to bind
        #[arg(long, default_value = "0.0.0.0:20000")]
        bind: String,

        /// Bus name shown in output
        #[arg(long, default_value = "can0")]
        bus_name: String,

        /// Seconds between reconnect attempts
        #[arg(long, default_value_t = 5)]
        reconnect_secs: u64,
    },

    /// Run a gateway from a TOML configuration file
    Run {
        /// Configuration file
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Describe { protocol } => describe(protocol.as_deref()),
        Commands::Example => {
            println!("{}", EXAMPLE_CONFIG);
            Ok(())
        }
        Commands::Listen {
            bind,
            bus_name,
            reconnect_secs,
        } => listen(&bind, bus_name, Duration::from_secs(reconnect_secs)).await,
        Commands::Run { config } => run(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn describe(name: Option<&str>) -> Result<()> {
    let registry = get_protocol_registry();
    let protocols: Vec<_> = match name {
        Some(name) => vec![registry
            .get_protocol(name)
            .ok_or_else(|| GatewayError::Config(format!("Unknown protocol: {}", name)))?],
        None => registry.protocols().iter().collect(),
    };

    for protocol in protocols {
        println!("{} ({})", protocol.name, protocol.display_name);
        println!("  {}", protocol.description);
        for driver in &protocol.drivers {
            let rec = if driver.is_recommended {
                " (recommended)"
            } else {
                ""
            };
            println!();
            println!("  Driver: {}{}", driver.display_name, rec);
            println!("    {}", driver.description);
            println!("    Parameters:");
            for param in &driver.parameters {
                let default = param
                    .default_value
                    .as_ref()
                    .map(|v| format!(" [default: {}]", v))
                    .unwrap_or_default();
                println!(
                    "      {:<22} {}{}",
                    param.name, param.description, default
                );
            }
            if let Ok(example) = serde_json::to_string_pretty(&driver.example_config) {
                println!("    Example:");
                for line in example.lines() {
                    println!("      {}", line);
                }
            }
        }
        println!();
    }

    println!("Generate a configuration with:");
    println!("  cangw example > cangw.toml");
    Ok(())
}

fn parse_bind(bind: &str) -> Result<(String, u16)> {
    let (host, port) = bind.rsplit_once(':').ok_or_else(|| {
        GatewayError::Config(format!("Invalid bind address: {}. Expected 'host:port'", bind))
    })?;
    let port = port
        .parse::<u16>()
        .map_err(|_| GatewayError::Config(format!("Invalid port: {}", port)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

async fn listen(bind: &str, bus_name: String, reconnect_delay: Duration) -> Result<()> {
    let (host, port) = parse_bind(bind)?;
    let config = CannelloniConfig::new(host, port)
        .with_bus_name(bus_name.clone())
        .with_reconnect_delay(reconnect_delay);
    config.validate()?;

    let conn = CannelloniConnection::new(config);
    #[cfg(feature = "tracing-support")]
    conn.set_log_handler(Arc::new(TracingLogHandler::new(bus_name.clone())));
    conn.monitor(Arc::new(move |frame: &CanbusFrame| {
        println!("  {}  {}", bus_name, frame);
    }))?;

    if let Err(e) = conn.open().await {
        #[cfg(feature = "tracing-support")]
        tracing::warn!("{}; retrying in {:?}", e, reconnect_delay);
        #[cfg(not(feature = "tracing-support"))]
        eprintln!("{}; retrying in {:?}", e, reconnect_delay);
    }

    wait_for_shutdown().await;
    conn.close().await
}

async fn run(path: PathBuf) -> Result<()> {
    let config = GatewayConfig::load(&path)?;
    let conn = gateway::create_connection(&config)?;
    let signals = gateway::resolve_signals(&config)?;
    #[cfg(feature = "tracing-support")]
    conn.set_log_handler(Arc::new(TracingLogHandler::new(
        conn.config().bus_name.clone(),
    )));

    #[cfg(feature = "tracing-support")]
    tracing::info!(
        "Starting gateway '{}' on {} with {} signals",
        config.gateway.name,
        conn,
        signals.len()
    );

    let listener: Arc<dyn CanbusFrameListener> = Arc::new(|_frame: &CanbusFrame| {
        #[cfg(feature = "tracing-support")]
        tracing::trace!("Signal frame {}", _frame);
    });
    gateway::subscribe_signals(&conn, &signals, listener)?;

    if let Err(_e) = conn.open().await {
        #[cfg(feature = "tracing-support")]
        tracing::warn!("{}; a reconnect is scheduled", _e);
    }

    let data = conn.data();
    let mut ticker = tokio::time::interval(config.report_interval());
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                for (_name, _value) in gateway::sample_signals(&data, &signals) {
                    #[cfg(feature = "tracing-support")]
                    {
                        match _value {
                            Some(v) => tracing::info!("{} = {}", _name, v),
                            None => tracing::info!("{} = n/a", _name),
                        }
                    }
                }
            }
        }
    }

    #[cfg(feature = "tracing-support")]
    tracing::info!("Shutting down gateway '{}'", config.gateway.name);
    conn.close().await
}

async fn wait_for_shutdown() {
    if tokio::signal::ctrl_c().await.is_err() {
        // no signal handler available; run until killed
        std::future::pending::<()>().await;
    }
}

const EXAMPLE_CONFIG: &str = r#"# cangw Configuration - Cannelloni Example

[gateway]
name = "Battery Monitor"
report_interval_ms = 5000

[connection]
host = "0.0.0.0"
port = 20000
bus_name = "can0"
reconnect_delay_secs = 60
shutdown_timeout_ms = 5000

# address = "<address>:<bit_offset>:<bit_length>[:<be|le>[:<type>]]"
[[signals]]
name = "soc"
address = "0x355:0:16:le:u16"

[[signals]]
name = "soh"
address = "0x355:16:16:le:u16"
rate_limit_ms = 1000
data_filter = 0xFFFF00000000

[[signals]]
name = "battery_voltage"
address = { address = 0x356, bit_offset = 0, bit_length = 16, byte_ordering = "le", data_type = "int16" }
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config = GatewayConfig::from_toml_str(EXAMPLE_CONFIG).unwrap();
        assert_eq!(config.signals.len(), 3);
    }

    #[test]
    fn test_parse_bind() {
        assert_eq!(parse_bind("0.0.0.0:20000").unwrap(), ("0.0.0.0".to_string(), 20000));
        assert_eq!(parse_bind("[::1]:3000").unwrap(), ("::1".to_string(), 3000));
        assert!(parse_bind("localhost").is_err());
        assert!(parse_bind("localhost:http").is_err());
    }
}
