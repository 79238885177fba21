//! linewire demo server
//!
//! Greets each new connection, echoes every message back and logs
//! disconnections. Stops gracefully on Ctrl-C.

use linewire::config::Config;
use linewire::{logger, recovery, LogFields, Server};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        tls = config.tls.is_some(),
        read_timeout = ?config.read_timeout,
        shutdown_timeout = ?config.shutdown_timeout,
        "Starting linewire server"
    );

    let mut server = Server::from_config(&config);
    server
        .use_handler(logger(LogFields::default()))
        .use_handler(recovery())
        .syn(|c| Box::pin(async move { c.string("welcome").await }))
        .ack(|c| {
            Box::pin(async move {
                let body = match c.read_all() {
                    Ok(body) => body,
                    Err(e) => return c.error(e),
                };
                c.string(String::from_utf8_lossy(&body)).await;
            })
        })
        .fin(|c| {
            Box::pin(async move {
                if let Some(req) = c.request() {
                    info!(peer = %req.remote_addr, "bye");
                }
            })
        });
    let server = std::sync::Arc::new(server);

    let shutdown_timeout = config.shutdown_timeout;
    let srv = server.clone();
    let mut serving = tokio::spawn(async move {
        match &config.tls {
            Some(tls) => {
                srv.run_tls(
                    &config.listen,
                    &tls.cert.to_string_lossy(),
                    &tls.key.to_string_lossy(),
                )
                .await
            }
            None => srv.run(&config.listen).await,
        }
    });

    tokio::select! {
        result = &mut serving => return Ok(result??),
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown requested");
            if let Err(e) = server.shutdown(shutdown_timeout).await {
                error!(error = %e, "Shutdown incomplete");
            }
        }
    }

    serving.await??;
    info!("Server stopped");
    Ok(())
}
