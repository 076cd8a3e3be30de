//! Connection manager — owns the lifecycle of the logical server
//! connection: auth handshake, subscription, reconnect with jittered
//! backoff, and the read loop that feeds schedule updates to the engine.

use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use telecast_proto::config::SyncConfig;
use telecast_proto::protocol::{self, ClientMessage, ServerMessage, PROTOCOL_VERSION};
use telecast_proto::schedule::GradeUpdate;

use crate::error::SyncError;

/// Lifecycle state of the logical connection.  Owned exclusively by the
/// manager; everything else reads it from published view state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The credential was rejected.  Not retried until a new token arrives.
    AuthFailed,
}

/// Events pushed into the engine.
#[derive(Debug)]
pub enum ConnEvent {
    State(ConnectionState),
    AuthRejected {
        reason: String,
    },
    /// A schedule update from connection number `generation`.  The engine
    /// drops updates from any generation older than the newest it has seen,
    /// so nothing in flight across a reconnect can ever be applied.
    Update {
        generation: u64,
        update: GradeUpdate,
    },
}

#[derive(Debug)]
pub(crate) enum ConnCommand {
    Send(ClientMessage),
    SetChannel(Option<String>),
    SetToken(String),
    Shutdown,
}

/// Cheaply cloneable sender surface for the engine.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<ConnCommand>,
}

impl ConnectionHandle {
    pub async fn switch_channel(&self, channel: &str) {
        let _ = self
            .tx
            .send(ConnCommand::Send(ClientMessage::SwitchChannel {
                channel: channel.to_string(),
            }))
            .await;
    }

    /// Record the channel to resubscribe to on the next handshake.
    pub async fn set_channel(&self, channel: Option<String>) {
        let _ = self.tx.send(ConnCommand::SetChannel(channel)).await;
    }

    /// Supply a fresh credential; unparks an auth-failed manager.
    pub async fn set_token(&self, token: String) {
        let _ = self.tx.send(ConnCommand::SetToken(token)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(ConnCommand::Shutdown).await;
    }

    /// Handle wired to nothing, for driving the engine in unit tests.
    #[cfg(test)]
    pub(crate) fn null() -> (Self, mpsc::Receiver<ConnCommand>) {
        let (tx, rx) = mpsc::channel(16);
        (Self { tx }, rx)
    }
}

/// Exponential reconnect backoff with jitter, so a fleet of clients does
/// not hammer a recovering server in lockstep.
struct Backoff {
    floor: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    fn new(floor: Duration, cap: Duration) -> Self {
        Self {
            floor,
            cap,
            current: floor,
        }
    }

    fn reset(&mut self) {
        self.current = self.floor;
    }

    /// Next delay: jittered in `[base/2, base]`, base doubling up to the cap.
    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (base * 2).min(self.cap);
        base.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
    }
}

enum ServeEnd {
    Shutdown,
    AuthRejected(String),
    Transport(SyncError),
}

pub struct ConnectionManager {
    address: String,
    token: String,
    /// Channel to name in the `Subscribe` handshake; updated every time a
    /// grade for a different channel is confirmed, so reconnects resume
    /// where the viewer was.
    channel: Option<String>,
    backoff: Backoff,
    generation: u64,
    events_tx: mpsc::Sender<ConnEvent>,
    command_rx: mpsc::Receiver<ConnCommand>,
}

impl ConnectionManager {
    /// Spawn the reconnect loop and return the engine's handle to it.
    pub fn spawn(
        address: String,
        token: String,
        sync: &SyncConfig,
        events_tx: mpsc::Sender<ConnEvent>,
    ) -> ConnectionHandle {
        let (tx, command_rx) = mpsc::channel(16);
        let manager = Self {
            address,
            token,
            channel: None,
            backoff: Backoff::new(sync.backoff_floor(), sync.backoff_cap()),
            generation: 0,
            events_tx,
            command_rx,
        };
        tokio::spawn(manager.run());
        ConnectionHandle { tx }
    }

    async fn run(mut self) {
        loop {
            self.generation += 1;
            self.publish(ConnectionState::Connecting).await;
            match self.connect_and_serve().await {
                ServeEnd::Shutdown => {
                    info!("connection manager shutting down");
                    return;
                }
                ServeEnd::AuthRejected(reason) => {
                    warn!(reason = %reason, "authentication rejected; waiting for a new token");
                    let _ = self
                        .events_tx
                        .send(ConnEvent::AuthRejected {
                            reason: reason.clone(),
                        })
                        .await;
                    self.publish(ConnectionState::AuthFailed).await;
                    if !self.wait_for_new_token().await {
                        return;
                    }
                    self.backoff.reset();
                }
                ServeEnd::Transport(err) => {
                    self.publish(ConnectionState::Disconnected).await;
                    let delay = self.backoff.next_delay();
                    debug!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "transport lost; reconnecting"
                    );
                    if !self.sleep_or_command(delay).await {
                        return;
                    }
                }
            }
        }
    }

    async fn publish(&self, state: ConnectionState) {
        let _ = self.events_tx.send(ConnEvent::State(state)).await;
    }

    /// Park until a new credential arrives.  Returns false on shutdown.
    async fn wait_for_new_token(&mut self) -> bool {
        loop {
            match self.command_rx.recv().await {
                Some(ConnCommand::SetToken(token)) => {
                    self.token = token;
                    return true;
                }
                Some(ConnCommand::SetChannel(channel)) => self.channel = channel,
                Some(ConnCommand::Send(msg)) => {
                    warn!(?msg, "dropping command while auth-failed")
                }
                Some(ConnCommand::Shutdown) | None => return false,
            }
        }
    }

    /// Wait out the backoff delay while staying responsive to commands.
    /// Returns false on shutdown.
    async fn sleep_or_command(&mut self, delay: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                cmd = self.command_rx.recv() => match cmd {
                    Some(ConnCommand::SetToken(token)) => {
                        self.token = token;
                        self.backoff.reset();
                        return true;
                    }
                    Some(ConnCommand::SetChannel(channel)) => self.channel = channel,
                    Some(ConnCommand::Send(msg)) => {
                        warn!(?msg, "dropping command while disconnected")
                    }
                    Some(ConnCommand::Shutdown) | None => return false,
                },
            }
        }
    }

    async fn connect_and_serve(&mut self) -> ServeEnd {
        let stream = match TcpStream::connect(&self.address).await {
            Ok(s) => s,
            Err(e) => return ServeEnd::Transport(SyncError::TransportLost(e.into())),
        };
        let (mut rd, mut wr) = stream.into_split();
        let mut buf: Vec<u8> = Vec::with_capacity(4096);

        // Auth handshake — one credential presentation per attempt.
        let auth = ClientMessage::Auth {
            token: self.token.clone(),
        };
        if let Err(e) = write_frame(&mut wr, &auth).await {
            return ServeEnd::Transport(SyncError::TransportLost(e));
        }
        match read_frame::<ServerMessage>(&mut rd, &mut buf).await {
            Ok(ServerMessage::Hello { protocol_version }) => {
                if protocol_version != PROTOCOL_VERSION {
                    return ServeEnd::Transport(SyncError::VersionMismatch {
                        server: protocol_version,
                        client: PROTOCOL_VERSION,
                    });
                }
            }
            Ok(ServerMessage::AuthRejected { reason }) => return ServeEnd::AuthRejected(reason),
            Ok(other) => {
                return ServeEnd::Transport(SyncError::TransportLost(anyhow::anyhow!(
                    "unexpected handshake reply: {other:?}"
                )))
            }
            Err(e) => return ServeEnd::Transport(SyncError::TransportLost(e)),
        }

        let subscribe = ClientMessage::Subscribe {
            channel: self.channel.clone(),
        };
        if let Err(e) = write_frame(&mut wr, &subscribe).await {
            return ServeEnd::Transport(SyncError::TransportLost(e));
        }

        self.backoff.reset();
        info!(address = %self.address, generation = self.generation, "connected");
        self.publish(ConnectionState::Connected).await;

        loop {
            tokio::select! {
                msg = read_frame::<ServerMessage>(&mut rd, &mut buf) => match msg {
                    Ok(ServerMessage::GradeUpdate(update)) => {
                        let _ = self.events_tx.send(ConnEvent::Update {
                            generation: self.generation,
                            update,
                        }).await;
                    }
                    Ok(ServerMessage::Hello { .. }) => debug!("ignoring repeated hello"),
                    // The server can revoke a credential mid-stream.
                    Ok(ServerMessage::AuthRejected { reason }) => {
                        return ServeEnd::AuthRejected(reason)
                    }
                    Err(e) => return ServeEnd::Transport(SyncError::TransportLost(e)),
                },
                cmd = self.command_rx.recv() => match cmd {
                    Some(ConnCommand::Send(msg)) => {
                        if let Err(e) = write_frame(&mut wr, &msg).await {
                            return ServeEnd::Transport(SyncError::TransportLost(e));
                        }
                    }
                    Some(ConnCommand::SetChannel(channel)) => self.channel = channel,
                    Some(ConnCommand::SetToken(token)) => self.token = token,
                    Some(ConnCommand::Shutdown) | None => return ServeEnd::Shutdown,
                },
            }
        }
    }
}

async fn read_frame<T: DeserializeOwned>(
    rd: &mut OwnedReadHalf,
    buf: &mut Vec<u8>,
) -> anyhow::Result<T> {
    loop {
        if let Some((msg, consumed)) = protocol::decode::<T>(buf)? {
            buf.drain(..consumed);
            return Ok(msg);
        }
        let n = rd.read_buf(buf).await?;
        if n == 0 {
            anyhow::bail!("connection closed by server");
        }
    }
}

async fn write_frame<T: Serialize>(wr: &mut OwnedWriteHalf, msg: &T) -> anyhow::Result<()> {
    let encoded = protocol::encode(msg)?;
    wr.write_all(&encoded).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut bases = Vec::new();
        for _ in 0..8 {
            bases.push(backoff.current);
            let delay = backoff.next_delay();
            let base = *bases.last().unwrap();
            assert!(delay <= base, "jitter never exceeds the base");
            assert!(delay >= base / 2, "jitter never halves below base/2");
        }
        assert_eq!(
            bases,
            [1, 2, 4, 8, 16, 30, 30, 30].map(Duration::from_secs)
        );
    }

    #[test]
    fn backoff_resets_to_the_floor() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert!(backoff.current > Duration::from_secs(1));
        backoff.reset();
        assert_eq!(backoff.current, Duration::from_secs(1));
    }

    #[test]
    fn backoff_delays_are_jittered() {
        // With a 10 s base the odds of 32 identical draws are nil.
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(10));
        let first = backoff.next_delay();
        let distinct = (0..32).any(|_| backoff.next_delay() != first);
        assert!(distinct, "expected jitter to vary the delay");
    }
}
