use cla_proxy::logging::LogLevel;
use cla_proxy::{build_router, AppState, HttpUpstream, ProxyConfig, SharedLogger, Upstream};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "cla-proxy",
    about = "OpenAI-compatible chat completions proxy for a model-serving backend",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Request journal path
    #[arg(long, default_value = "cla-proxy.log")]
    log_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,

    /// Print the models the backend serves and exit
    #[arg(long)]
    list_models: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in cla_proxy::config::config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.tracing_directive().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }

    // Validates proxies, certificate and API key eagerly
    let upstream = HttpUpstream::new(&config)?;

    if cli.list_models {
        let listing = upstream.models().await?;
        for id in cla_proxy::models::model_ids(&listing) {
            println!("{id}");
        }
        return Ok(());
    }

    let logger = SharedLogger::new(&cli.log_file, LogLevel::from_config(&config.logging.level))?;

    info!("cla-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("  Backend:   {}", config.backend.endpoint);
    info!("  Model:     {}", config.backend.model);
    info!("  Timeout:   {}s", config.backend.timeout);
    info!("  Client TLS: {}", if config.backend.auth.is_some() { "certificate" } else { "none" });
    info!("  Proxies:   {}", config.backend.proxies.len());
    info!("  Log file:  {}", cli.log_file.display());

    logger.info(
        "startup",
        format!(
            "Starting cla-proxy backend={} bind={}",
            config.backend.endpoint,
            config.bind_addr()
        ),
    );

    let bind_addr = config.bind_addr();
    let state = Arc::new(AppState {
        config,
        upstream: Arc::new(upstream),
        logger,
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
