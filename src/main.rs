use std::{fs, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter::LevelFilter, layer::SubscriberExt,
};

use podd::{
    PodController, PodSpec,
    clock::SystemClock,
    runtime::ShellRuntime,
    server,
};

const LOG_PREFIX: &str = "podd.log";

#[derive(Parser)]
#[command(name = "podd")]
#[command(about = "A single-process pod supervisor", long_about = None)]
struct Cli {
    /// Path to the pod spec to start (JSON or YAML)
    #[arg(long, default_value = "/spec.json")]
    spec: PathBuf,

    /// Port the status server listens on
    #[arg(long, default_value_t = 8888)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing()?;
    run(cli).await.inspect_err(|err| error!("Failed to run: {err:#}"))
}

async fn run(cli: Cli) -> Result<(), anyhow::Error> {
    let spec = PodSpec::load(&cli.spec)
        .with_context(|| format!("failed to load pod spec from {}", cli.spec.display()))?;
    info!(
        init_containers = spec.init_containers.len(),
        containers = spec.containers.len(),
        "[podd] pod spec loaded"
    );

    let controller = Arc::new(PodController::new(
        spec,
        Arc::new(ShellRuntime),
        Arc::new(SystemClock),
    )?);
    controller.start().await.context("failed to start pod controller")?;
    info!("[podd] pod controller started");

    let app = server::router(controller.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;
    info!("[podd] status server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("status server exited")?;
    info!("[podd] shutting down");
    controller.stop();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl-C: {err}");
    }
}

fn init_tracing() -> Result<(), anyhow::Error> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_ansi(true)
        .with_filter(EnvFilter::from_default_env());

    // A JSON file layer is opt-in: set PODD_LOG_DIR to enable daily rolling
    // logs alongside the console output.
    let file_layer = match std::env::var("PODD_LOG_DIR") {
        Ok(dir) => {
            let log_dir = PathBuf::from(dir);
            fs::create_dir_all(&log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, LOG_PREFIX);
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(file_appender)
                    .with_filter(LevelFilter::DEBUG)
                    .boxed(),
            )
        }
        Err(_) => None,
    };

    tracing::subscriber::set_global_default(
        Registry::default().with(console_layer).with(file_layer),
    )
    .map_err(|e| anyhow::anyhow!("setting default subscriber failed: {e}"))?;
    Ok(())
}
