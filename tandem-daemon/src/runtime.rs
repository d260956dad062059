use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use tandem_core::{PeerAddress, SyncConfig, WatcherConfig};
use tandem_vcs::GitCli;

use crate::error::{io_err, DaemonError};
use crate::listener;
use crate::notifier::HttpNotifier;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::paths::{socket_path, tandem_root};
use crate::protocol::{DaemonRequest, DaemonResponse, CMD_PULL, CMD_STATUS, CMD_STOP, CMD_SYNC};
use crate::remote::{self, RemoteLaunch};
use crate::sync_loop::{SyncHandle, SyncLoop};
use crate::watch::{self, WatchAdapter};

/// Everything `tandem start` resolved from flags and config.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub home: PathBuf,
    /// Directory being synchronized.
    pub root: PathBuf,
    pub peer: PeerAddress,
    pub config: SyncConfig,
    /// Also start the peer side over ssh.
    pub launch_remote: bool,
    pub log_json: bool,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(options: DaemonOptions) -> Result<(), DaemonError> {
    init_tracing(options.log_json);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(options))
}

/// Run the daemon runtime.
pub async fn run(options: DaemonOptions) -> Result<(), DaemonError> {
    let DaemonOptions {
        home,
        root,
        peer,
        config,
        launch_remote,
        ..
    } = options;
    config.validate()?;
    ensure_runtime_dirs(&home)?;
    let root = fs::canonicalize(&root).map_err(|e| io_err(&root, e))?;

    let vcs = Arc::new(GitCli::from_config(&root, &config));
    let notifier = Arc::new(HttpNotifier::new(config.http_port, config.notify_timeout()));
    let orchestrator = Orchestrator::new(vcs, OrchestratorSettings::from(&config));

    let ssh_client = std::env::var("SSH_CLIENT").ok();
    let resolved = remote::initial_peer(&peer, ssh_client.as_deref());
    let remote_launch = match (&resolved, launch_remote) {
        (Some(target), true) => Some(RemoteLaunch::new(
            target,
            root.clone(),
            std::env::var("USER").ok(),
            config.http_port,
        )),
        (None, true) => {
            tracing::warn!("cannot launch an auto peer over ssh; start it on the peer instead");
            None
        }
        _ => None,
    };

    tracing::info!(
        root = %root.display(),
        peer = %peer,
        port = config.http_port,
        "starting tandem",
    );

    let (sync_loop, sync) = SyncLoop::new(&config, orchestrator, notifier, peer, resolved);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let sync_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let result = sync_loop.run(shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let adapter = WatchAdapter::new(&root, config.metadata_dir.clone(), sync.clone());
        let watcher = config.watcher.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let result = match watcher {
                WatcherConfig::Builtin => watch::run_builtin_watcher(adapter, shutdown_rx).await,
                WatcherConfig::Command { program, args } => {
                    watch::run_command_watcher(adapter, program, args, shutdown_rx).await
                }
            };
            let _ = shutdown.send(());
            result
        })
    };

    let listener_handle = {
        let shutdown = shutdown_tx.clone();
        let sync = sync.clone();
        let port = config.http_port;
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let result = listener::serve(port, sync, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let sync = sync.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let result = socket_server_task(home, sync, shutdown.clone(), shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    // ssh exiting does not broadcast shutdown.
    let remote_handle = {
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            match remote_launch {
                Some(launch) => remote::run_remote(launch, shutdown_rx).await,
                None => Ok(()),
            }
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };
    drop(sync);

    let (
        watcher_result,
        sync_result,
        listener_result,
        socket_result,
        remote_result,
        signal_result,
    ) = tokio::join!(
        watcher_handle,
        sync_handle,
        listener_handle,
        socket_handle,
        remote_handle,
        signal_handle
    );

    handle_join("watcher", watcher_result)?;
    handle_join("sync_loop", sync_result)?;
    handle_join("trigger_listener", listener_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("remote", remote_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

async fn socket_server_task(
    home: PathBuf,
    sync: SyncHandle,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let sync = sync.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, sync, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    sync: SyncHandle,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = dispatch(&request, &sync, &shutdown_tx).await;
        write_response(&mut writer, &response).await?;
        if request.cmd == CMD_STOP {
            break;
        }
    }

    Ok(())
}

async fn dispatch(
    request: &DaemonRequest,
    sync: &SyncHandle,
    shutdown_tx: &broadcast::Sender<()>,
) -> DaemonResponse {
    match request.cmd.as_str() {
        CMD_STATUS => match sync.status().await {
            Ok(status) => match serde_json::to_value(status) {
                Ok(mut payload) => {
                    payload["running"] = json!(true);
                    DaemonResponse::ok(payload)
                }
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            Err(err) => DaemonResponse::error(err.to_string()),
        },
        CMD_SYNC => match sync.trigger().await {
            Ok(()) => DaemonResponse::ok(json!({ "triggered": true })),
            Err(err) => DaemonResponse::error(err.to_string()),
        },
        CMD_PULL => match sync.request_pull(None).await {
            Ok(()) => DaemonResponse::ok(json!({ "pull_requested": true })),
            Err(err) => DaemonResponse::error(err.to_string()),
        },
        CMD_STOP => {
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let root = tandem_root(home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// `RUST_LOG` overrides the default `info` filter. Records from crates that
/// log through the `log` facade are bridged in by `try_init`.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::OrchestratorState;
    use crate::sync_loop::{SyncMessage, SyncStats, SyncStatus};
    use crate::scheduler::SchedulerSnapshot;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn fake_status() -> SyncStatus {
        SyncStatus {
            state: OrchestratorState::Ready,
            scheduler: SchedulerSnapshot {
                cooldown_pending: false,
                fire_requested: false,
                in_flight: false,
            },
            pending_changed: 2,
            pending_removed: 0,
            pull_requested: false,
            peer: "box:/srv/notes".to_string(),
            remote_url: Some("box:/srv/notes".to_string()),
            head: None,
            started_at: chrono::Utc::now(),
            stats: SyncStats::default(),
        }
    }

    /// Answers status requests and records everything else.
    fn fake_loop() -> (SyncHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, mut rx) = mpsc::channel::<SyncMessage>(8);
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    SyncMessage::Status(reply) => {
                        let _ = reply.send(fake_status());
                    }
                    SyncMessage::Trigger => {
                        let _ = seen_tx.send("trigger".to_string());
                    }
                    SyncMessage::PullRequested { .. } => {
                        let _ = seen_tx.send("pull".to_string());
                    }
                    SyncMessage::Watch(_) | SyncMessage::Notified { .. } => {}
                }
            }
        });
        (SyncHandle::new(tx), seen_rx)
    }

    #[tokio::test]
    async fn status_payload_reports_running_and_pending_counts() {
        let (sync, _seen) = fake_loop();
        let (shutdown_tx, _) = broadcast::channel(1);

        let response = dispatch(&DaemonRequest::new(CMD_STATUS), &sync, &shutdown_tx).await;
        assert!(response.ok);
        let data = response.data.expect("data");
        assert_eq!(data["running"], json!(true));
        assert_eq!(data["state"], json!("ready"));
        assert_eq!(data["pending_changed"], json!(2));
    }

    #[tokio::test]
    async fn sync_and_pull_commands_reach_the_loop() {
        let (sync, mut seen) = fake_loop();
        let (shutdown_tx, _) = broadcast::channel(1);

        assert!(dispatch(&DaemonRequest::new(CMD_SYNC), &sync, &shutdown_tx).await.ok);
        assert!(dispatch(&DaemonRequest::new(CMD_PULL), &sync, &shutdown_tx).await.ok);
        assert_eq!(seen.recv().await.as_deref(), Some("trigger"));
        assert_eq!(seen.recv().await.as_deref(), Some("pull"));
    }

    #[tokio::test]
    async fn stop_broadcasts_shutdown_and_unknown_is_an_error() {
        let (sync, _seen) = fake_loop();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let unknown = dispatch(&DaemonRequest::new("reboot"), &sync, &shutdown_tx).await;
        assert!(!unknown.ok);
        assert!(unknown.error.expect("error").contains("reboot"));

        assert!(dispatch(&DaemonRequest::new(CMD_STOP), &sync, &shutdown_tx).await.ok);
        shutdown_rx.recv().await.expect("shutdown signal");
    }

    #[tokio::test]
    async fn socket_round_trip_with_blocking_client() {
        let home = TempDir::new().expect("home");
        ensure_runtime_dirs(home.path()).expect("dirs");
        let (sync, _seen) = fake_loop();
        let (shutdown_tx, _) = broadcast::channel(4);

        let server = tokio::spawn(socket_server_task(
            home.path().to_path_buf(),
            sync,
            shutdown_tx.clone(),
            shutdown_tx.subscribe(),
        ));

        let home_path = home.path().to_path_buf();
        let status = tokio::task::spawn_blocking(move || {
            let status = crate::protocol::request_status(&home_path).expect("status");
            crate::protocol::request_stop(&home_path).expect("stop");
            status
        })
        .await
        .expect("join");

        assert_eq!(status["running"], json!(true));
        server.await.expect("join").expect("server");
        assert!(!socket_path(home.path()).exists(), "socket removed on shutdown");
    }

    #[test]
    fn stale_socket_file_is_removed() {
        let home = TempDir::new().expect("home");
        ensure_runtime_dirs(home.path()).expect("dirs");
        let socket = socket_path(home.path());
        fs::write(&socket, b"").expect("stale file");

        prepare_socket_for_bind(&socket).expect("prepare");
        assert!(!socket.exists());
    }
}
