// ABOUTME: Entry point for the per-session bridge worker process
// ABOUTME: Spawned by the session manager; serves one endpoint until told to stop

use iobus::{BridgeWorker, BusConfig};
use std::path::PathBuf;

fn usage() -> ! {
    eprintln!("usage: iobus-bridge --endpoint <socket-path> [--session <id>]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> iobus::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .init();

    let mut endpoint: Option<PathBuf> = None;
    let mut session: Option<String> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--endpoint" => endpoint = args.next().map(PathBuf::from),
            "--session" => session = args.next(),
            _ => usage(),
        }
    }
    let Some(endpoint) = endpoint else { usage() };

    if let Some(session) = &session {
        tracing::info!(%session, "bridge worker starting");
    }

    let shutdown = iobus::bridge::shutdown_signal();
    BridgeWorker::new(BusConfig::default())
        .run(&endpoint, shutdown)
        .await?;
    Ok(())
}
