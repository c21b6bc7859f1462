use clap::Parser;
use flowplane_sidecar::{
    cli::{Cli, Command, EXIT_NOT_ENTITLED, EXIT_OK},
    config::SidecarConfig,
    observability::{init_observability, log_config_info},
    startup::{spawn_signal_handler, Sidecar},
    sync::{LoopExit, ProbeExit},
    Result, APP_NAME, VERSION,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn install_rustls_provider() {
    use rustls::crypto::{ring, CryptoProvider};

    if CryptoProvider::get_default().is_none() {
        // Losing the race to another installer is fine; a provider is set either way.
        let _ = ring::default_provider().install_default();
    }
}

#[tokio::main]
async fn main() {
    install_rustls_provider();

    // Load .env file if it exists (optional - won't fail if missing)
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Sidecar failed");
            eprintln!("{}: {}", APP_NAME, e);
            e.exit_code()
        }
    };

    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = SidecarConfig::from_env()?;
    cli.apply_overrides(&mut config);

    let metrics = init_observability(&config.observability, cli.verbose)?;
    config.validate()?;

    info!(app_name = APP_NAME, version = VERSION, "Starting Flowplane sidecar");
    log_config_info(&config, cli.mode());

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let sidecar = Sidecar::new(config, metrics, &shutdown)?;

    let code = match cli.command {
        Command::Watch => match sidecar.watch(shutdown.clone()).await? {
            LoopExit::Shutdown => EXIT_OK,
            LoopExit::SelfNotEntitled(id) => {
                error!(spiffe_id = %id, "Stopping: workload is not entitled to secrets");
                EXIT_NOT_ENTITLED
            }
        },
        Command::Init => match sidecar.init(shutdown.clone()).await? {
            ProbeExit::Ready => {
                info!("Secret available, exiting init");
                EXIT_OK
            }
            ProbeExit::Shutdown => {
                info!("Init interrupted before the secret became available");
                1
            }
            ProbeExit::SelfNotEntitled(id) => {
                error!(spiffe_id = %id, "Stopping: workload is not entitled to secrets");
                EXIT_NOT_ENTITLED
            }
        },
    };

    shutdown.cancel();
    Ok(code)
}
