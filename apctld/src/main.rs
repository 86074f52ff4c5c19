use std::process;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use apctl_core::config::RemoteConfigClient;
use apctl_core::core::{Core, CoreConfig};
use apctl_core::logging;
use apctl_core::{config::ConfigClient, inventory};

mod cli;
mod wifi_diag;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

enum SignalMessage {
    Shutdown,
    Reload,
}

async fn signal_channel() -> Result<mpsc::Receiver<SignalMessage>, exitcode::ExitCode> {
    let (sender, receiver) = mpsc::channel(32);
    let mut sigint = signal(SignalKind::interrupt()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGINT handler");
        exitcode::IOERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGTERM handler");
        exitcode::IOERR
    })?;
    let mut sighup = signal(SignalKind::hangup()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGHUP handler");
        exitcode::IOERR
    })?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(_) = sigint.recv() => {
                    if sender.send(SignalMessage::Shutdown).await.is_err() { break; }
                }
                Some(_) = sigterm.recv() => {
                    if sender.send(SignalMessage::Shutdown).await.is_err() { break; }
                }
                Some(_) = sighup.recv() => {
                    if sender.send(SignalMessage::Reload).await.is_err() { break; }
                }
                else => break,
            }
        }
    });

    Ok(receiver)
}

async fn connect_netlink() -> Result<apctl_core::plumber::netlink_ops::RealNetlinkOps, exitcode::ExitCode> {
    let (connection, handle, _) = rtnetlink::new_connection().map_err(|error| {
        tracing::error!(?error, "failed to open rtnetlink connection");
        exitcode::OSERR
    })?;
    tokio::spawn(connection);
    Ok(apctl_core::plumber::netlink_ops::RealNetlinkOps::new(handle))
}

async fn run_daemon(args: cli::Cli) -> Result<(), exitcode::ExitCode> {
    let reload_handle = logging::init(&args.log_file).map_err(|error| {
        eprintln!("error setting up logging: {error}");
        exitcode::IOERR
    })?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting apctld");

    let mut signal_receiver = signal_channel().await?;

    let config = RemoteConfigClient::connect(&args.config_socket).await.map_err(|error| {
        tracing::error!(%error, "failed to connect to configuration tree daemon");
        exitcode::UNAVAILABLE
    })?;
    let config = Arc::new(config);

    let netlink = connect_netlink().await?;

    tokio::fs::create_dir_all(&args.config_dir).await.map_err(|error| {
        tracing::error!(?error, "failed to create radio daemon config directory");
        exitcode::CANTCREAT
    })?;

    let mut devices = inventory::enumerate(&netlink).await.map_err(|error| {
        tracing::error!(%error, "failed to enumerate network devices");
        exitcode::OSERR
    })?;

    let wan_assigned_path = vec!["network".to_string(), "wan".to_string(), "interface".to_string()];
    let wan_assigned: Option<String> = match config.read(&wan_assigned_path).await {
        Ok(apctl_core::config::PropertyResult::Present(value)) => value.as_str().map(str::to_string),
        _ => None,
    };
    if let Some((wan_name, promoted)) = inventory::choose_wan(&devices, wan_assigned.as_deref()).map(|(d, promoted)| (d.name.clone(), promoted)) {
        if let Some(device) = devices.iter_mut().find(|d| d.name == wan_name) {
            device.ring = Some("wan".to_string());
        }
        if promoted {
            if let Err(error) = config.set(&wan_assigned_path, serde_json::json!(wan_name)).await {
                tracing::warn!(%error, "failed to persist promoted wan interface choice");
            }
        }
    }

    for device in &devices {
        if let Err(error) = inventory::reconcile_nic(config.as_ref(), &args.self_node, device, &["kind", "disabled", "ring"]).await {
            tracing::warn!(nic = %device.name, %error, "failed to reconcile nic with configuration tree");
        }
    }

    let core = Arc::new(Core::new(
        config.clone(),
        netlink,
        CoreConfig {
            daemon_binary: args.daemon_binary.clone(),
            config_dir: args.config_dir.clone(),
            daemon_run_dir: "/var/run/apctld".into(),
            self_node: args.self_node.clone(),
            node_index: args.node_index,
            verbosity: args.verbosity,
        },
    ));

    *core.devices.lock().await = devices;

    core.refresh_rings().await.map_err(|error| {
        tracing::error!(%error, "failed to load ring configuration");
        exitcode::CONFIG
    })?;
    core.refresh_vaps().await.map_err(|error| {
        tracing::error!(%error, "failed to load vap configuration");
        exitcode::CONFIG
    })?;
    core.watch_config_tree().await.map_err(|error| {
        tracing::error!(%error, "failed to register configuration tree watches");
        exitcode::UNAVAILABLE
    })?;

    let run_handle = tokio::spawn({
        let core = core.clone();
        async move { core.run().await }
    });

    loop {
        match signal_receiver.recv().await {
            Some(SignalMessage::Shutdown) => {
                tracing::info!("shutting down");
                core.stop();
                break;
            }
            Some(SignalMessage::Reload) => {
                tracing::info!("reloading logs and radio daemon config");
                if let Err(error) = logging::reload(&reload_handle, &args.log_file) {
                    tracing::warn!(?error, "failed to reload log file");
                }
                if let Err(error) = core.supervisor.reload() {
                    tracing::warn!(%error, "failed to signal radio daemon reload");
                }
            }
            None => break,
        }
    }

    let _ = run_handle.await;
    Ok(())
}

async fn run_wifi_diag(quiet: bool, verbose: bool, interface: Option<String>) -> exitcode::ExitCode {
    let reports = wifi_diag::run(interface.as_deref()).await;
    if reports.is_empty() {
        if !quiet {
            eprintln!("no wireless NICs found");
        }
        return exitcode::UNAVAILABLE;
    }

    let all_valid = reports.iter().all(|r| r.valid);
    if !quiet {
        for report in &reports {
            wifi_diag::print_report(report, verbose);
        }
    }
    if all_valid {
        exitcode::OK
    } else {
        1
    }
}

#[tokio::main]
async fn main() {
    let args = cli::parse();

    let code = match args.command.clone() {
        Some(cli::SubCommand::Wifi { quiet, verbose, interface }) => run_wifi_diag(quiet, verbose, interface).await,
        None => match run_daemon(args).await {
            Ok(()) => exitcode::OK,
            Err(code) => code,
        },
    };

    process::exit(code);
}
