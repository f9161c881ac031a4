use clap::{Parser, Subcommand};
use lib::correlator::{ExtractedResult, SendOptions};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Tether CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration file with a fresh master secret. Set session.id
    /// (and relay.url if needed) before connecting.
    Init {
        /// Config file path (default: TETHER_CONFIG_PATH or ~/.tether/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Send a message into the session and wait for the correlated answer.
    Send {
        /// Config file path (default: TETHER_CONFIG_PATH or ~/.tether/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Message text to send.
        message: String,

        /// Per-request timeout in milliseconds (default from config).
        #[arg(long, value_name = "MS")]
        timeout: Option<u64>,

        /// Permission mode tag passed through with the message.
        #[arg(long, value_name = "MODE")]
        permission_mode: Option<String>,
    },

    /// Watch session traffic (sync messages, statuses) as JSON lines.
    Watch {
        /// Config file path (default: TETHER_CONFIG_PATH or ~/.tether/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("tether {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Send {
            config,
            message,
            timeout,
            permission_mode,
        }) => {
            if let Err(e) = run_send(config, message, timeout, permission_mode).await {
                log::error!("send failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Watch { config }) => {
            if let Err(e) = run_watch(config).await {
                log::error!("watch failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    if path.exists() {
        anyhow::bail!("config already exists at {}", path.display());
    }
    let mut config = lib::config::Config::default();
    config.session.secret = Some(lib::crypto::Keyring::generate_secret()?);
    lib::config::save_config(&config, &path)?;
    println!("initialized configuration at {}", path.display());
    println!("set session.id (and relay.url if needed) before connecting");
    Ok(())
}

async fn run_send(
    config_path: Option<std::path::PathBuf>,
    message: String,
    timeout: Option<u64>,
    permission_mode: Option<String>,
) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let client = lib::client::SessionClient::connect(&config).await?;
    let options = SendOptions {
        timeout_ms: timeout,
        permission_mode,
        on_progress: None,
    };
    let result = client.send_and_wait(&message, options).await?;
    match result.extracted {
        ExtractedResult::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        ExtractedResult::Artifacts(files) => {
            for file in files {
                println!("{}", file);
            }
        }
        ExtractedResult::Text(text) => println!("{}", text.trim()),
    }
    client.shutdown().await;
    Ok(())
}

async fn run_watch(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let client = lib::client::SessionClient::connect(&config).await?;
    let mut events = client.subscribe();
    println!("watching session; ctrl+c to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("watch lagged {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    client.shutdown().await;
    Ok(())
}
