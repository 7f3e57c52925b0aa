//! `cubelink` – cube fleet coordinator
//!
//! ```text
//! cubelink [broker|client]
//! ```
//!
//! 1. Loads `~/.cubelink/config.toml`, writing the defaults on first run.
//! 2. Runs the selected role:
//!    * **broker** – hosts the WebSocket bus, registers bridges, assigns
//!      discovered cubes and drives the shared lamp.  Press Enter to cycle
//!      the lamp color by hand; type `status` to list bridges.
//!    * **client** – joins a broker and follows cube telemetry, with one
//!      delayed reconnect attempt after a drop.
//! 3. Prints fleet events as they happen.
//! 4. Intercepts **Ctrl-C** and shuts down gracefully.

mod config;
mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use config::{Config, Role};
use cubelink_agent::{AgentExit, ReconnectAgent};
use cubelink_controller::{ControllerDispatcher, DispatchPump, LampCycle};
use cubelink_middleware::{BrokerGateway, MessageBus, WsBroker, WsClient};
use cubelink_types::{CubeError, FleetEvent, FleetNotice};

fn main() {
    let _guard = telemetry::init_tracing("cubelink");

    print_banner();

    let mut cfg = match config::load_or_create() {
        Ok((cfg, path)) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            Config::default()
        }
    };

    if let Some(arg) = std::env::args().nth(1) {
        match arg.parse::<Role>() {
            Ok(role) => cfg.role = role,
            Err(e) => {
                eprintln!("{} {e}", "error:".red().bold());
                eprintln!("usage: cubelink [broker|client]");
                std::process::exit(2);
            }
        }
    }

    // ── Shutdown signal ───────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        shutdown_tx.send_replace(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            std::process::exit(1);
        }
    };

    println!("  Role: {}\n", cfg.role.to_string().bold().cyan());
    let result = runtime.block_on(async {
        match cfg.role {
            Role::Broker => run_broker(&cfg, shutdown_rx).await,
            Role::Client => run_client(&cfg, shutdown_rx).await,
        }
    });
    // The operator console may be parked in a blocking stdin read.
    runtime.shutdown_background();

    match result {
        Ok(()) => println!("{}", "  ✓ Exiting cubelink.".green()),
        Err(e) => {
            error!(error = %e, "cubelink stopped");
            println!("{}: {}", "Fatal".red().bold(), e);
            std::process::exit(1);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Broker role
// ─────────────────────────────────────────────────────────────────────────────

async fn run_broker(cfg: &Config, mut shutdown: watch::Receiver<bool>) -> Result<(), CubeError> {
    let (bus, events) = MessageBus::new();
    let dispatcher = Arc::new(ControllerDispatcher::new(Arc::new(bus.clone()), cfg.controller_config()));

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| CubeError::Transport(format!("failed to bind {addr}: {e}")))?;
    println!("  Broker listening on {}", format!("ws://{addr}").bold());
    println!(
        "  Bridge capacity {} · press {} to cycle the lamp, type {} for the fleet\n",
        cfg.bridge_capacity,
        "Enter".bold(),
        "status".bold()
    );

    let mut tasks = vec![
        tokio::spawn(WsBroker::new(bus.clone()).serve(listener)),
        tokio::spawn(DispatchPump::new(dispatcher.clone()).run(events)),
        tokio::spawn(print_status(dispatcher.subscribe())),
        tokio::spawn(operator_console(dispatcher.clone())),
    ];
    if let Some(timeout) = cfg.controller_config().handshake_timeout {
        tasks.push(tokio::spawn(reap_stale_handshakes(dispatcher.clone(), timeout)));
    }

    wait_for_shutdown(&mut shutdown).await;
    for task in &tasks {
        task.abort();
    }
    print_fleet(&*dispatcher).await;
    info!("broker stopped");
    Ok(())
}

/// Periodic sweep so a stuck bridge is released even when no new cube is
/// being announced.
async fn reap_stale_handshakes<G: BrokerGateway>(dispatcher: Arc<ControllerDispatcher<G>>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        dispatcher.reap_stale_handshakes().await;
    }
}

/// Enter cycles the lamp color; `status` prints the fleet.
async fn operator_console<G: BrokerGateway + 'static>(dispatcher: Arc<ControllerDispatcher<G>>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut cycle = LampCycle::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match line.trim() {
                "" => dispatcher.broadcast_lamp(cycle.next_color()).await,
                "status" => print_fleet(&*dispatcher).await,
                other => println!("  unknown command '{other}' (Enter = lamp, status = fleet)"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "operator console closed");
                break;
            }
        }
    }
}

async fn print_fleet<G: BrokerGateway>(dispatcher: &ControllerDispatcher<G>) {
    let bridges = dispatcher.bridges().await;
    if bridges.is_empty() {
        println!("  {}", "no bridges connected".dimmed());
        return;
    }
    for bridge in bridges {
        let cubes: Vec<String> = bridge.cubes.iter().map(ToString::to_string).collect();
        println!(
            "  {} {}/{} {}{}",
            bridge.id.to_string().bold(),
            bridge.cubes.len(),
            bridge.capacity,
            cubes.join(", "),
            if bridge.busy { " (busy)".yellow().to_string() } else { String::new() }
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client role
// ─────────────────────────────────────────────────────────────────────────────

async fn run_client(cfg: &Config, mut shutdown: watch::Receiver<bool>) -> Result<(), CubeError> {
    let client = WsClient::new(cfg.broker_url.clone(), cfg.client_id.as_str());
    println!("  Connecting to {} as {}\n", client.url().bold(), cfg.client_id.bold());
    let mut agent = ReconnectAgent::new(client, cfg.agent_config());
    let handle = agent.handle();

    let status = tokio::spawn(print_status(agent.subscribe()));
    let mut stop_rx = shutdown.clone();
    let stopper = tokio::spawn(async move {
        wait_for_shutdown(&mut stop_rx).await;
        handle.shutdown();
    });

    let exit = agent.run().await;
    let result = match exit {
        AgentExit::Shutdown => Ok(()),
        AgentExit::ConnectFailed(e) => Err(e),
        AgentExit::ReconnectFailed(e) => {
            println!(
                "  {} reconnect failed ({e}); staying disconnected. Restart to try again.",
                "✗".red().bold()
            );
            wait_for_shutdown(&mut shutdown).await;
            Ok(())
        }
    };
    stopper.abort();
    status.abort();
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared helpers
// ─────────────────────────────────────────────────────────────────────────────

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            // Handler never installed: run until killed.
            std::future::pending::<()>().await;
        }
    }
}

async fn print_status(mut rx: broadcast::Receiver<FleetNotice>) {
    let json = telemetry::json_output();
    loop {
        match rx.recv().await {
            Ok(notice) if json => match serde_json::to_string(&notice) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "failed to encode fleet event"),
            },
            Ok(notice) => println!(
                "  {} {}",
                notice.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S").to_string().dimmed(),
                describe(&notice.event)
            ),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "status feed fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// One-line human description of a fleet event.
fn describe(event: &FleetEvent) -> String {
    match event {
        FleetEvent::BridgeAdded { bridge, capacity } => {
            format!("{} bridge {bridge} (capacity {capacity})", "+".green().bold())
        }
        FleetEvent::BridgeRemoved { bridge, released } => {
            format!("{} bridge {bridge} ({} cube(s) released)", "-".red().bold(), released.len())
        }
        FleetEvent::CubeAssigned { bridge, cube } => format!("cube {cube} → {bridge}"),
        FleetEvent::CubeConnected { bridge: Some(bridge), cube } => {
            format!("cube {cube} {} via {bridge}", "connected".green())
        }
        FleetEvent::CubeConnected { bridge: None, cube } => format!("cube {cube} {}", "connected".green()),
        FleetEvent::CubeDisconnected { cube } => format!("cube {cube} {}", "disconnected".yellow()),
        FleetEvent::LampChanged { color, cubes } => format!("lamp {color} on {} cube(s)", cubes.len()),
        FleetEvent::BatteryChanged { cube, level } => format!("cube {cube} battery {level}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"              __         ___       __  "#.bold().cyan());
    println!("{}", r#"  _______ __/ /  ___ / (_)__  / /__"#.bold().cyan());
    println!("{}", r#" / __/ // / _ \/ -_) / / _ \/  '_/"#.bold().cyan());
    println!("{}", r#" \__/\_,_/_.__/\__/_/_/_//_/_/\_\ "#.bold().cyan());
    println!();
    println!("  {} {}", "cubelink".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Cube fleet coordinator");
    println!();
}
