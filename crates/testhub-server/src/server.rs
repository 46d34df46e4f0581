use anyhow::{Context, Result};
use libtesthub::Dispatcher;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::connection::handle_connection;
use crate::control::handle_control_client;
use crate::remote;

type ActiveConnections = Arc<Mutex<Vec<JoinHandle<()>>>>;

pub async fn run(cfg: RuntimeConfig) -> Result<()> {
    ensure_runtime_dir(&cfg.runtime_dir)?;
    let listener = bind_socket(&cfg.socket_path)?;
    let control_listener = bind_socket(&cfg.control_socket_path)?;
    fs::write(&cfg.pid_file, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", cfg.pid_file.display()))?;

    info!(
        pid = std::process::id(),
        socket = %cfg.socket_path.display(),
        control_socket = %cfg.control_socket_path.display(),
        "testhub started"
    );

    let dispatcher = Arc::new(Dispatcher::new(remote::collaborators(
        &cfg.services,
        cfg.rpc_timeout,
    )));
    let cfg = Arc::new(cfg);
    let active: ActiveConnections = Arc::new(Mutex::new(Vec::new()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            signal_tx.send_replace(true);
        }
    });

    let control_task = tokio::spawn(control_loop(
        control_listener,
        Arc::clone(&dispatcher),
        shutdown_rx.clone(),
        shutdown_tx.clone(),
        Arc::clone(&active),
    ));
    accept_loop(
        listener,
        Arc::clone(&dispatcher),
        Arc::clone(&cfg),
        shutdown_rx,
        Arc::clone(&active),
    )
    .await;

    shutdown_tx.send_replace(true);
    let _ = control_task.await;
    for handle in active.lock().await.drain(..) {
        handle.abort();
    }
    dispatcher.shutdown().await;

    let _ = fs::remove_file(&cfg.socket_path);
    let _ = fs::remove_file(&cfg.control_socket_path);
    let _ = fs::remove_file(&cfg.pid_file);
    info!("testhub stopped");
    Ok(())
}

async fn accept_loop(
    listener: UnixListener,
    dispatcher: Arc<Dispatcher>,
    cfg: Arc<RuntimeConfig>,
    mut shutdown_rx: watch::Receiver<bool>,
    active: ActiveConnections,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("shutdown requested, stopping accept loop");
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };
                let handle = tokio::spawn(handle_connection(
                    stream,
                    Arc::clone(&dispatcher),
                    Arc::clone(&cfg),
                ));
                let mut active = active.lock().await;
                active.retain(|h| !h.is_finished());
                active.push(handle);
            }
        }
    }
}

async fn control_loop(
    listener: UnixListener,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    active: ActiveConnections,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("control accept failed: {err}");
                        continue;
                    }
                };
                let dispatcher = Arc::clone(&dispatcher);
                let shutdown_tx = shutdown_tx.clone();
                let handle = tokio::spawn(async move {
                    if let Err(err) = handle_control_client(stream, dispatcher, shutdown_tx).await {
                        warn!("control client failed: {err:#}");
                    }
                });
                active.lock().await.push(handle);
            }
        }
    }
}

fn ensure_runtime_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create runtime dir {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    Ok(())
}

fn bind_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_stale_socket(path)?;
    let listener =
        UnixListener::bind(path).with_context(|| format!("failed to bind {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}
