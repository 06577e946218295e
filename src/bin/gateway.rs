// ABOUTME: Entry point for the gateway process: session manager, reaper and WS front door
// ABOUTME: Creates one session for the invoking user; the login surface plugs in around this

use iobus::session::ProcessSpawner;
use iobus::{BusConfig, Gateway, Principal, SessionManager};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn usage() -> ! {
    eprintln!(
        "usage: iobus-gateway [--listen <addr:port>] [--bridge <path>] [--runtime-dir <dir>]"
    );
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> iobus::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .init();

    let mut listen = "127.0.0.1:8090".to_string();
    let mut bridge = PathBuf::from("iobus-bridge");
    let mut runtime_dir = PathBuf::from("/run/iobus");
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" => listen = args.next().unwrap_or_else(|| usage()),
            "--bridge" => bridge = args.next().map(PathBuf::from).unwrap_or_else(|| usage()),
            "--runtime-dir" => {
                runtime_dir = args.next().map(PathBuf::from).unwrap_or_else(|| usage())
            }
            _ => usage(),
        }
    }

    std::fs::create_dir_all(&runtime_dir)?;
    let config = BusConfig::default().with_runtime_dir(&runtime_dir);
    let manager = SessionManager::new(
        config,
        Arc::new(ProcessSpawner {
            program: bridge,
            runtime_dir,
        }),
    );
    let reaper = manager.spawn_reaper();

    // Until the HTTP login surface is wired in, serve the invoking user.
    let principal = Principal {
        username: std::env::var("USER").unwrap_or_else(|_| "root".to_string()),
        uid: unsafe { libc::geteuid() },
        privileged: unsafe { libc::geteuid() } == 0,
    };
    let session = manager.create(principal).await?;
    tracing::info!(
        session = %session.id(),
        "connect with ws://{listen}/bus?session={}",
        session.id()
    );

    let listener = TcpListener::bind(&listen).await?;
    let shutdown = CancellationToken::new();
    let gateway = Gateway::new(manager.clone());

    tokio::select! {
        result = gateway.run(listener, shutdown.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            shutdown.cancel();
        }
    }

    reaper.abort();
    manager.shutdown_all().await;
    Ok(())
}
