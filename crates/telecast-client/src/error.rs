use thiserror::Error;

/// Failure taxonomy of the synchronization engine.
///
/// Everything here is handled internally — retried, rate-limited, or turned
/// into a `Notice`.  Presentation code only ever observes `ViewState` and
/// `Notice`; none of these variants propagate to it as errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Connection lost or never established.  Retried with backoff.
    #[error("transport lost")]
    TransportLost(#[source] anyhow::Error),
    /// Credential rejected.  Fatal until the user supplies a new token.
    #[error("authentication rejected: {reason}")]
    AuthRejected { reason: String },
    /// Server speaks a protocol version this client cannot handle.
    #[error("protocol version mismatch: server {server}, client {client}")]
    VersionMismatch { server: u32, client: u32 },
    /// Malformed or invariant-violating schedule payload.  The update is
    /// dropped; the previous snapshot stays authoritative.
    #[error("bad schedule payload")]
    BadPayload(#[source] anyhow::Error),
    /// A player control command was rejected.  Retried on a later tick
    /// with fresh data, rate-limited.
    #[error("player control failed")]
    PlayerControl(#[source] anyhow::Error),
    /// No confirming snapshot arrived for a requested switch.
    #[error("switch to '{channel}' timed out")]
    SwitchTimeout { channel: String },
}
