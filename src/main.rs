use clap::{Parser, Subcommand};
use lab_hl7::{
    config::{EngineConfig, LoggingSettings},
    device::DeviceModel,
    mllp::{self, MessageHandler, MllpServer},
    validation::{self, Direction},
    Message,
};
use serde_json::json;
use std::error::Error;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "lab-hl7")]
#[command(about = "HL7 laboratory interface engine for hematology analyzers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MLLP listener until interrupted
    Serve {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to bind, overriding the configured host and port
        #[arg(short, long)]
        address: Option<SocketAddr>,
    },

    /// Parse an HL7 file and print what the engine extracts from it
    Parse {
        file: PathBuf,

        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Device profile used for extraction
        #[arg(short, long)]
        device: Option<DeviceModel>,
    },

    /// Send an HL7 file to an MLLP listener and print the reply
    Send {
        file: PathBuf,

        #[arg(short, long, default_value = "127.0.0.1:4000")]
        address: String,

        /// Seconds to wait for a reply
        #[arg(short, long, default_value_t = 10)]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, address } => {
            let mut config = EngineConfig::load(config.as_deref())?;
            if let Some(address) = address {
                config.server.host = address.ip().to_string();
                config.server.port = address.port();
                config.validate()?;
            }
            let _guard = init_logging(&config.logging)?;
            run_server(config).await?;
        }
        Commands::Parse {
            file,
            config,
            device,
        } => {
            let mut config = EngineConfig::load(config.as_deref())?;
            if let Some(device) = device {
                config.device.model = device;
            }
            let _guard = init_logging(&config.logging)?;
            run_parse(&file, &config)?;
        }
        Commands::Send {
            file,
            address,
            wait,
        } => {
            let _guard = init_logging(&LoggingSettings::default())?;
            run_send(&file, &address, Duration::from_secs(wait)).await?;
        }
    }

    Ok(())
}

/// Console logging, plus daily rolling files when a directory is configured.
/// `RUST_LOG` overrides the configured level.
fn init_logging(settings: &LoggingSettings) -> Result<Option<WorkerGuard>, Box<dyn Error>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.level)?,
    };

    let (file_layer, guard) = match &settings.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &settings.file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()?;
    Ok(guard)
}

/// Runs the engine until Ctrl-C, then stops it gracefully
async fn run_server(config: EngineConfig) -> Result<(), Box<dyn Error>> {
    let device = config
        .device
        .model
        .build(&config.outbound, &config.mappings.hl7);
    let database = config
        .database
        .backend
        .build(&config.database, &config.mappings.storage);
    database.connect()?;

    let handler = MessageHandler::from_config(&config, device, database.clone());
    let server = MllpServer::new(
        config.server.address(),
        handler,
        config.server.max_frame_bytes,
        config.server.audit_capacity,
    );
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    server.stop().await;
    database.disconnect();
    Ok(())
}

fn run_parse(file: &Path, config: &EngineConfig) -> Result<(), Box<dyn Error>> {
    let raw = std::fs::read(file)?;
    let device = config
        .device
        .model
        .build(&config.outbound, &config.mappings.hl7);
    let message = device.parse_message(&raw)?;

    let mut report = json!({
        "device": device.model().name(),
        "envelope": message.envelope(),
        "version": message.version,
        "segments": message.segments.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        "observations": message.observations(),
        "validation": validation::check(&message, Direction::Inbound),
    });
    if message.is_oru() {
        report["results"] = serde_json::to_value(device.extract_result_data(&message))?;
    }
    if message.is_orm() {
        report["order"] = serde_json::to_value(device.extract_order_info(&message))?;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_send(file: &Path, address: &str, wait: Duration) -> Result<(), Box<dyn Error>> {
    let text = std::fs::read_to_string(file)?;
    // files are usually saved with newlines between segments
    let segments: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut body = segments.join("\r");
    body.push('\r');

    match mllp::send_message(address, &body, wait).await? {
        Some(reply) => {
            let reply = String::from_utf8_lossy(&reply).replace('\r', "\n");
            println!("{}", reply.trim_end());
            if let Ok(parsed) = Message::parse(&reply) {
                if let Some(msa) = parsed.get_segment("MSA") {
                    info!("Reply {} for {}", msa.value(1).unwrap_or("?"), msa.value(2).unwrap_or("?"));
                }
            }
        }
        None => println!("No reply received"),
    }
    Ok(())
}
