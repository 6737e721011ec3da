//! `tbus` – host a bus or expose one to a host.
//!
//! - `tbus host` runs a root bus, accepts remote devices over TCP and prints
//!   the discovered device tree whenever something attaches.
//! - `tbus expose` connects a local bus holding a demo echo device to a host.
//!
//! Settings come from `~/.tbus/config.toml`, then `TBUS_*` environment
//! variables, then command-line flags. Ctrl-C shuts either command down.

mod config;
mod demo;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tbus_core::{Bus, BusCtl, LocalBus, Master, signal};
use tbus_protocol::RouteAddr;
use tbus_protocol::wire::ROUTING_ADDRS_MAX;
use tbus_stream::{HostEvent, RemoteBusPort, RemoteDeviceHost};
use tbus_types::{BUS_CLASS_ID, DeviceInfo, TbusError};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use config::Config;

#[derive(Parser)]
#[command(name = "tbus", version, about = "Tree-structured device bus")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept remote devices into a root bus.
    Host {
        /// Address to listen on.
        #[arg(long)]
        listen: Option<String>,
        /// Invocation timeout in milliseconds; 0 waits forever.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Expose a bus with a demo echo device to a host.
    Expose {
        /// Host address to connect to.
        #[arg(long)]
        connect: Option<String>,
        /// Device id reported by the exposed bus.
        #[arg(long)]
        device_id: Option<u32>,
        /// Label reported by the exposed bus, as `key=value`. Repeatable.
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))
}

#[tokio::main]
async fn main() -> ExitCode {
    // RUST_LOG selects levels (default "info"); TBUS_LOG_FORMAT=json switches
    // to newline-delimited JSON.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if std::env::var("TBUS_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }

    let cli = Cli::parse();
    let mut cfg = load_config();

    let (stop, shutdown) = signal::abort_signal();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "Ctrl-C received, shutting down".yellow().bold());
        let _ = stop.send(true);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    let result = match cli.command {
        Command::Host { listen, timeout_ms } => {
            if let Some(listen) = listen {
                cfg.listen_addr = listen;
            }
            if let Some(ms) = timeout_ms {
                cfg.invocation_timeout_ms = ms;
            }
            host(&cfg, shutdown).await
        }
        Command::Expose {
            connect,
            device_id,
            labels,
        } => {
            if let Some(connect) = connect {
                cfg.connect_addr = connect;
            }
            if let Some(id) = device_id {
                cfg.device_id = id;
            }
            cfg.labels.extend(labels);
            expose(&cfg, shutdown).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// File settings with environment overrides. A missing or unreadable file
/// falls back to defaults.
fn load_config() -> Config {
    let mut cfg = match config::load() {
        Ok(Some(cfg)) => {
            info!(path = %config::config_path().display(), "config loaded");
            cfg
        }
        Ok(None) => Config::default(),
        Err(e) => {
            warn!(error = %e, "using default configuration");
            Config::default()
        }
    };
    config::apply_env_overrides(&mut cfg);
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// host
// ─────────────────────────────────────────────────────────────────────────────

async fn host(cfg: &Config, shutdown: watch::Receiver<bool>) -> Result<(), TbusError> {
    let root = LocalBus::new();
    let master = Master::new(root.clone())
        .await?
        .with_timeout(cfg.invocation_timeout());

    let (tx, mut events) = mpsc::unbounded_channel();
    let listener = RemoteDeviceHost::bind(cfg.listen_addr.as_str())
        .await?
        .with_notify(tx);
    info!(addr = %listener.local_addr()?, "listening for remote devices");
    println!(
        "  Listening on {}",
        listener.local_addr()?.to_string().bold()
    );

    let bus: Arc<dyn Bus> = root.clone();
    let accept = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { listener.run(bus, shutdown).await }
    });

    let stop = signal::aborted(Some(shutdown));
    tokio::pin!(stop);
    loop {
        let event = tokio::select! {
            biased;
            _ = &mut stop => break,
            event = events.recv() => event,
        };
        match event {
            Some(HostEvent::Attached(info)) => {
                info!(addr = info.address, class_id = info.class_id, "device attached");
                print_tree(&discover(&master).await);
            }
            Some(HostEvent::Detached(info)) => {
                info!(addr = info.address, class_id = info.class_id, "device detached");
                println!("  {} {}", "-".red().bold(), describe(&info));
            }
            None => break,
        }
    }

    master.close().await?;
    match accept.await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "accept loop panicked");
            Ok(())
        }
    }
}

/// Every device reachable from the root bus with its full address, in
/// depth-first order. Buses that fail to enumerate are logged and skipped.
async fn discover(master: &Master) -> Vec<(RouteAddr, DeviceInfo)> {
    let mut tree = Vec::new();
    let mut buses = vec![RouteAddr::new()];
    while let Some(route) = buses.pop() {
        let devices = match BusCtl::new(master.clone(), &route).enumerate().await {
            Ok(enumeration) => enumeration.devices,
            Err(e) => {
                warn!(route = %route, error = %e, "enumeration failed");
                continue;
            }
        };
        for info in devices {
            let at = route.join(info.address);
            if info.class_id == BUS_CLASS_ID && at.len() < ROUTING_ADDRS_MAX {
                buses.push(at.clone());
            }
            tree.push((at, info));
        }
    }
    tree.sort_by(|a, b| a.0.as_slice().cmp(b.0.as_slice()));
    tree
}

fn describe(info: &DeviceInfo) -> String {
    let mut line = format!(
        "class {:#06x} id {}",
        info.class_id, info.device_id
    );
    for (k, v) in &info.labels {
        line.push_str(&format!(" {k}={v}"));
    }
    line
}

fn print_tree(tree: &[(RouteAddr, DeviceInfo)]) {
    println!();
    println!("  {}", "Device tree".bold().cyan());
    if tree.is_empty() {
        println!("    {}", "(empty)".dimmed());
    }
    for (route, info) in tree {
        let indent = "  ".repeat(route.len());
        let kind = if info.class_id == BUS_CLASS_ID {
            "bus".yellow()
        } else {
            "device".green()
        };
        println!(
            "  {indent}{} {} {}",
            route.to_string().bold(),
            kind,
            describe(info).dimmed()
        );
    }
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// expose
// ─────────────────────────────────────────────────────────────────────────────

async fn expose(cfg: &Config, shutdown: watch::Receiver<bool>) -> Result<(), TbusError> {
    let mut info = DeviceInfo::new(BUS_CLASS_ID).with_device_id(cfg.device_id);
    for (k, v) in &cfg.labels {
        info = info.with_label(k.clone(), v.clone());
    }
    let bus = LocalBus::with_info(info);
    let echo = demo::echo_device();
    let slot = bus.plug(echo.clone()).await?;
    info!(slot, class_id = demo::ECHO_CLASS_ID, "demo echo device plugged");

    let heartbeat = tokio::spawn(demo::heartbeat(
        echo.handle(),
        cfg.heartbeat(),
        shutdown.clone(),
    ));

    println!("  Connecting to {}", cfg.connect_addr.bold());
    let port = RemoteBusPort::new(bus);
    let result = port
        .connect(cfg.connect_addr.as_str(), Some(shutdown))
        .await;
    heartbeat.abort();
    if result.is_ok() {
        println!("  {}", "Disconnected".dimmed());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbus_core::{DispatchTable, ServiceDevice};

    #[test]
    fn label_flag_parses_key_value() {
        assert_eq!(
            parse_label("room=lab").unwrap(),
            ("room".to_string(), "lab".to_string())
        );
        assert_eq!(
            parse_label("url=a=b").unwrap(),
            ("url".to_string(), "a=b".to_string())
        );
        assert!(parse_label("novalue").is_err());
    }

    #[test]
    fn cli_parses_expose_flags() {
        let cli = Cli::try_parse_from([
            "tbus", "expose", "--connect", "10.0.0.1:7180", "--label", "a=1", "--label", "b=2",
        ])
        .unwrap();
        match cli.command {
            Command::Expose {
                connect, labels, ..
            } => {
                assert_eq!(connect.as_deref(), Some("10.0.0.1:7180"));
                assert_eq!(labels.len(), 2);
            }
            Command::Host { .. } => panic!("parsed the wrong subcommand"),
        }
    }

    #[tokio::test]
    async fn discovery_walks_nested_buses() -> Result<(), Box<dyn std::error::Error>> {
        let root = LocalBus::new();
        let nested = LocalBus::with_info(DeviceInfo::new(BUS_CLASS_ID).with_label("room", "lab"));
        root.plug(nested.clone()).await?;
        root.plug(demo::echo_device()).await?;
        nested.plug(Arc::new(ServiceDevice::new(
            DeviceInfo::new(0x42),
            DispatchTable::new(),
        )))
        .await?;
        let master = Master::new(root).await?;

        let tree = discover(&master).await;
        let routes: Vec<Vec<u8>> = tree.iter().map(|(r, _)| r.as_slice().to_vec()).collect();
        assert_eq!(routes, vec![vec![1], vec![1, 1], vec![2]]);
        assert_eq!(tree[1].1.class_id, 0x42);
        assert_eq!(tree[2].1.class_id, demo::ECHO_CLASS_ID);
        assert!(describe(&tree[0].1).contains("room=lab"));
        Ok(())
    }
}
