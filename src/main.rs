use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vpn_panel::core::Core;
use vpn_panel::settings::Settings;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    let bind = format!("{}:{}", settings.host, settings.port);

    let core = match Core::start(settings).await {
        Ok(core) => Arc::new(core),
        Err(err) => {
            error!(error = %err, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, bind = %bind, "cannot bind API listener");
            return ExitCode::FAILURE;
        }
    };
    info!(bind = %bind, "panel API listening");

    let router = vpn_panel::http::router(Arc::clone(&core));
    let serve = axum::serve(listener, router).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    });

    let result = serve.await;

    match Arc::try_unwrap(core) {
        Ok(core) => core.shutdown().await,
        Err(_) => info!("core still referenced at exit, skipping orderly shutdown"),
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "server error");
            ExitCode::FAILURE
        }
    }
}
