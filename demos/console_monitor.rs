//! Console monitor for an xAPI codec
//!
//! Run with: cargo run --example console_monitor [CODEC_ADDR]
//!
//! Examples:
//!   cargo run --example console_monitor                   # connects to 127.0.0.1:4000
//!   cargo run --example console_monitor 10.0.0.20         # connects to 10.0.0.20:4000
//!   cargo run --example console_monitor 10.0.0.20:4001    # connects to 10.0.0.20:4001
//!
//! The codec must already accept an unauthenticated xAPI session on the
//! given port (for example a serial-over-TCP bridge).
//!
//! ## What it shows
//!
//! - Call lifecycle events (created, updated, removed)
//! - Protocol errors reported by the codec
//! - Subscription drift repaired by the resync monitor
//! - The first level of the local phonebook

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use vcodec_rs::{
    CallEvent, CallTracker, CallTrackerConfig, Connection, DirectoryConfig, DirectoryEvent,
    DirectoryTree, Engine, EngineConfig, FolderRef, Partition, XapiProtocol,
};

const DEFAULT_PORT: u16 = 4000;

fn parse_codec_addr(arg: &str) -> Result<SocketAddr, String> {
    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    Err(format!(
        "Invalid codec address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: console_monitor [CODEC_ADDR]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  CODEC_ADDR   Codec address (default: 127.0.0.1:4000)");
}

fn print_call(event: &CallEvent) {
    match event {
        CallEvent::Created(call) => println!(
            "[call {}] created: {} {:?} {}",
            call.id,
            call.status,
            call.direction,
            call.display_name.as_deref().or(call.number.as_deref()).unwrap_or("?")
        ),
        CallEvent::Updated(call) => println!("[call {}] {}", call.id, call.status),
        CallEvent::Removed(call) => println!(
            "[call {}] removed after {}s connected",
            call.id,
            call.start_time
                .zip(call.end_time)
                .map(|(start, end)| end.saturating_duration_since(start).as_secs())
                .unwrap_or(0)
        ),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let addr = match args.get(1) {
        Some(arg) => match parse_codec_addr(arg) {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        },
        None => SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vcodec_rs=info".parse()?)
                .add_directive("console_monitor=debug".parse()?),
        )
        .init();

    let config = EngineConfig::with_name(addr.to_string()).resync_interval(Duration::from_secs(60));
    let engine = Engine::new(config, XapiProtocol::new());

    let calls = CallTracker::new(&engine, CallTrackerConfig::default());
    let directory = DirectoryTree::new(&engine, DirectoryConfig::default());

    let mut call_events = calls.events();
    tokio::spawn(async move {
        while let Ok(event) = call_events.recv().await {
            print_call(&event);
        }
    });

    let mut errors = engine.errors();
    tokio::spawn(async move {
        while let Ok(error) = errors.recv().await {
            println!("[codec error] {}", error);
        }
    });

    let mut directory_events = directory.events();
    let browser = Arc::clone(&directory);
    tokio::spawn(async move {
        while let Ok(event) = directory_events.recv().await {
            if let DirectoryEvent::FolderPopulated { folder, .. } = event {
                for node in browser.children(&folder).unwrap_or_default() {
                    println!("[phonebook {}] {}", folder, node.name());
                }
            }
        }
    });

    let resync = engine.spawn_resync_task();

    println!("Connecting to codec at {}", addr);
    let connection = Connection::connect(Arc::clone(&engine), addr).await?;

    // Ask for the phonebook once the connection is up
    let lister = Arc::clone(&directory);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if let Err(e) = lister.populate_folder(&FolderRef::root(Partition::Local)) {
            eprintln!("Phonebook request failed: {}", e);
        }
    });

    tokio::select! {
        result = connection.run() => {
            if let Err(e) = result {
                eprintln!("Connection error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
    }

    resync.abort();
    let stats = engine.stats();
    println!(
        "frames={} deliveries={} drift_repairs={} errors={}",
        stats.frames, stats.deliveries, stats.drift_repairs, stats.protocol_errors
    );
    engine.shutdown();

    Ok(())
}
