use clap::Parser;
use gemini_openai_proxy::config::config_search_paths;
use gemini_openai_proxy::{build_router, AppState, Backend, GeminiClient, ProxyConfig, SharedLogger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "gemini-openai-proxy",
    about = "OpenAI-compatible API proxy in front of Google Gemini",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Gemini API key (overrides config and environment)
    #[arg(long)]
    api_key: Option<String>,

    /// Log file path
    #[arg(long, default_value = "gemini-openai-proxy.log")]
    log_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gemini_openai_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    // Fails before binding when no key is available
    let api_key = config.resolve_api_key(cli.api_key.as_deref())?;
    let backend: Arc<dyn Backend> = Arc::new(GeminiClient::new(&config.backend, api_key)?);

    let logger = SharedLogger::new(&cli.log_file)?;

    info!("gemini-openai-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("  Backend:   {}", config.backend.base_url);
    info!("  Port:      {}", config.port);
    info!("  Models:    {} overrides", config.models.len());
    info!("  System:    {:?}", config.merge.system);
    info!("  Log file:  {}", cli.log_file.display());

    logger.info(
        "startup",
        format!(
            "Starting gemini-openai-proxy base_url={} port={}",
            config.backend.base_url, config.port
        ),
    );

    let state = Arc::new(AppState {
        config: config.clone(),
        backend,
        logger,
    });

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  OPENAI_BASE_URL=http://localhost:{}/v1", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
