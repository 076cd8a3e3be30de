use tokio::io::AsyncBufReadExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use telecast_client::connection::{ConnEvent, ConnectionManager};
use telecast_client::engine::{EngineCommand, SyncEngine};
use telecast_client::mpv::MpvPlayer;
use telecast_client::prefs::PrefsStore;
use telecast_proto::config::{self, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = config::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("telecast.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(log_filter.as_str())
        .with_ansi(false)
        .init();

    // Print the log path to stderr so the operator can tail it immediately.
    eprintln!("telecast log: {}", log_path.display());
    info!("telecast starting…");

    let config = Config::load().unwrap_or_default();
    let mut prefs = PrefsStore::load(config::config_dir().join("prefs.toml"));

    // Server address: environment beats saved preference beats config file.
    let address = env_value("TELECAST_SERVER")
        .or_else(|| prefs.get().server_address.clone())
        .unwrap_or_else(|| config.server.address.clone());
    let token =
        env_value("TELECAST_TOKEN").unwrap_or_else(|| config.server.auth_token.clone());
    if prefs.get().server_address.is_none() && env_value("TELECAST_SERVER").is_none() {
        // Remember the first resolved address so the next run sticks to it.
        let _ = prefs.set_server_address(Some(address.clone()));
    }
    info!(address = %address, "resolved server address");

    let (mut mpv, player) = MpvPlayer::spawn(&config.mpv).await?;

    let (events_tx, events_rx) = mpsc::channel::<ConnEvent>(256);
    let conn = ConnectionManager::spawn(address, token, &config.sync, events_tx);

    let engine = SyncEngine::new(config.sync.clone(), conn, player);
    let mut view = engine.subscribe_view();
    let mut notices = engine.subscribe_notices();

    // Log item/signal transitions so a tailed log reads like a playlist.
    tokio::spawn(async move {
        let mut last = (None, None);
        loop {
            let state = view.borrow_and_update().clone();
            let item = state.now_playing.as_ref().map(|n| n.name.clone());
            let current = (item, Some(state.signal));
            if current != last {
                info!(
                    channel = state.channel.as_deref().unwrap_or("-"),
                    item = current.0.as_deref().unwrap_or("-"),
                    signal = ?state.signal,
                    connection = ?state.connection,
                    "now playing"
                );
                last = current;
            }
            if view.changed().await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => warn!(?notice, "notice"),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let (command_tx, command_rx) = mpsc::channel::<EngineCommand>(16);

    // Minimal operator console on stdin: `switch <code>`, `token <tok>`, `quit`.
    let console_tx = command_tx.clone();
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut parts = line.trim().splitn(2, ' ');
            match (parts.next(), parts.next()) {
                (Some("switch"), Some(code)) => {
                    let _ = console_tx
                        .send(EngineCommand::SwitchChannel(code.trim().to_string()))
                        .await;
                }
                (Some("token"), Some(token)) => {
                    let _ = console_tx
                        .send(EngineCommand::SetToken(token.trim().to_string()))
                        .await;
                }
                (Some("quit"), _) | (Some("q"), _) => {
                    let _ = console_tx.send(EngineCommand::Shutdown).await;
                    break;
                }
                (Some(""), _) | (None, _) => {}
                (Some(other), _) => eprintln!("unknown command: {other}"),
            }
        }
    });

    let shutdown_tx = command_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received; shutting down");
            let _ = shutdown_tx.send(EngineCommand::Shutdown).await;
        }
    });

    engine.run(events_rx, command_rx).await;
    mpv.kill().await;
    info!("telecast stopped");
    Ok(())
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
