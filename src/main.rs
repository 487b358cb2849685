use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use trustlink::api::ApiServerBuilder;
use trustlink::db::{self, DeviceRepo};
use trustlink::pairing::load_providers;
use trustlink::{Authenticator, Config, ConnectionRelay, DeviceKeypair, LocalBus, TtlChallengeStore};

/// Capacity of the in-process challenge store
const CHALLENGE_CAPACITY: u64 = 100_000;

/// trustlink - Device authentication, OAuth pairing and real-time relay
#[derive(Parser)]
#[command(name = "trustlink", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "TRUSTLINK_PORT")]
    port: Option<u16>,

    /// `SQLite` database path
    #[arg(long, env = "TRUSTLINK_DATABASE")]
    database: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Generate a device keypair
    Keygen,
    /// Sign a payload with a device secret key
    Sign {
        /// Base64 secret key as printed by `keygen`
        #[arg(long, env = "TRUSTLINK_DEVICE_SECRET")]
        secret_key: String,
        /// Payload to sign (a challenge, or a new public key when rotating)
        payload: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,trustlink=info",
        1 => "info,trustlink=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Command::Keygen) => {
            keygen();
            Ok(())
        }
        Some(Command::Sign {
            secret_key,
            payload,
        }) => sign(&secret_key, &payload),
        Some(Command::Serve) | None => serve(cli.port, cli.database).await,
    }
}

async fn serve(port: Option<u16>, database: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(port) = port {
        config.api_server.port = port;
    }
    if let Some(database) = database {
        config.database_path = database;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        database = %config.database_path.display(),
        handshake = %config.auth.handshake,
        "starting trustlink"
    );

    let pool = db::init(&config.database_path)?;
    let challenges = Arc::new(TtlChallengeStore::new(
        config.auth.challenge_ttl,
        CHALLENGE_CAPACITY,
    ));
    let authenticator = Authenticator::new(DeviceRepo::new(pool), challenges);
    let relay = ConnectionRelay::new(Arc::new(LocalBus::default()));
    let providers = load_providers(&config.providers_path)?;

    ApiServerBuilder::new(authenticator, relay, config.api_server.port)
        .config(&config)
        .providers(providers)
        .build()
        .run()
        .await?;

    Ok(())
}

fn keygen() {
    let keypair = DeviceKeypair::generate();
    println!("public_key: {}", keypair.public_key());
    println!("secret_key: {}", keypair.secret_key());
}

fn sign(secret_key: &str, payload: &str) -> anyhow::Result<()> {
    let keypair = DeviceKeypair::from_secret(secret_key)?;
    println!("{}", keypair.sign(payload.as_bytes()));
    Ok(())
}
