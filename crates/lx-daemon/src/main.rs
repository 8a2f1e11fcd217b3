//! lx-daemon entry point.

use eyre::Result;
use lx_daemon::config::Config;
use lx_daemon::ipc;
use lx_daemon::service::Service;
use lx_io::net::{Endpoint, Listener};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lx_daemon=info")),
        )
        .init();

    let config = Config::from_env()?;
    std::fs::create_dir_all(&config.home)?;

    let endpoint = match std::env::var("LYNX_IPC") {
        Ok(spec) if !spec.is_empty() => Endpoint::parse(&spec)?,
        _ => {
            #[cfg(unix)]
            {
                lx_io::net::default_ipc_endpoint(&config.home)
            }
            #[cfg(not(unix))]
            {
                Endpoint::parse("127.0.0.1:8017")?
            }
        }
    };

    let service = Service::new(config).await?;
    let listener = Listener::bind(&endpoint).await?;

    tokio::select! {
        result = ipc::serve(service.clone(), listener) => result?,
        _ = service.quit_requested() => {
            tracing::info!("shutting down (ipc request)");
            service.shutdown();
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            service.shutdown();
        }
    }

    Ok(())
}
