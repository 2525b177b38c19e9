mod admin;
mod cli;
mod dav;

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use tealfs_rs::Node;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();

    let node = Arc::new(Node::start(args.node_config()).await?);
    info!("tealfs: node {} on {}", node.id(), node.address());

    let webdav = serve(
        "webdav",
        &args.webdav_address,
        dav::router(node.filesystem()),
        node.shutdown_signal(),
    )
    .await?;
    let admin = serve(
        "admin",
        &args.admin_address,
        admin::router(node.clone()),
        node.shutdown_signal(),
    )
    .await?;

    #[cfg(unix)]
    {
        let sigterm_fut = sigterm();
        tokio::pin!(sigterm_fut);

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown: ctrl-c");
            },
            () = &mut sigterm_fut => {
                info!("shutdown: SIGTERM");
            },
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("shutdown: ctrl-c");
    }

    node.shutdown().await;
    for (name, server) in [("webdav", webdav), ("admin", admin)] {
        if let Err(err) = server.await {
            warn!("{name}: server task failed: {err}");
        }
    }
    info!("exit: node {} stopped", node.id());

    Ok(())
}

/// `serve` binds `address` and runs `router` until the node starts shutting down.
async fn serve(
    name: &'static str,
    address: &str,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind {name} on {address}"))?;
    info!("{name}: listening on {}", listener.local_addr()?);

    Ok(tokio::spawn(async move {
        let stop = async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        };
        if let Err(err) = axum::serve(listener, router)
            .with_graceful_shutdown(stop)
            .await
        {
            warn!("{name}: server error: {err}");
        }
        info!("{name}: stopped");
    }))
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut s) => {
            s.recv().await;
        }
        Err(err) => {
            warn!("shutdown: SIGTERM handler unavailable: {err}");
            std::future::pending::<()>().await;
        }
    }
}
