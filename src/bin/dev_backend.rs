use playlist_task_client::config::Config;
use playlist_task_client::devserver::{self, DevServerOptions};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run().await {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let options = DevServerOptions::from_config(&config.dev_backend);
    if let Some(frames) = options.drop_after_frames {
        tracing::warn!(frames, "channels will be dropped abnormally");
    }

    let listener = TcpListener::bind(config.dev_backend.bind.as_str()).await?;
    devserver::serve(listener, options, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    })
    .await?;
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}
