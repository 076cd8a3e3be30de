use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::schedule::GradeUpdate;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  The client checks it in `Hello` and refuses to talk to an
/// incompatible server.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame body.  A length header beyond this is
/// treated as a corrupt stream rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum ClientMessage {
    /// First message on every connection.  The server answers with `Hello`
    /// or `AuthRejected` before anything else.
    Auth { token: String },
    /// Sent after `Hello`.  `None` subscribes to the server's default
    /// channel; on reconnect the client resubscribes to its last confirmed
    /// channel so the stream resumes where the viewer was.
    Subscribe { channel: Option<String> },
    /// Request a different channel's grade.  Confirmed by the next
    /// `GradeUpdate` whose channel code matches.
    SwitchChannel { channel: String },
}

/// Messages pushed from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerMessage {
    /// Auth accepted.
    Hello { protocol_version: u32 },
    /// Auth failed — fatal for this credential; the client must not retry
    /// until the user supplies a new token.
    AuthRejected { reason: String },
    /// Full schedule replacement.
    GradeUpdate(GradeUpdate),
}

/// Encode one message as a 4-byte big-endian length header + JSON body.
pub fn encode<T: Serialize>(msg: &T) -> anyhow::Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    if json.len() > MAX_FRAME_LEN {
        anyhow::bail!("frame body too large: {} bytes", json.len());
    }
    let len = json.len() as u32;
    let mut result = Vec::with_capacity(4 + json.len());
    result.extend_from_slice(&len.to_be_bytes());
    result.extend_from_slice(&json);
    Ok(result)
}

/// Try to decode one message from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame
/// (read more and call again), `Ok(Some((msg, consumed)))` on success, and
/// `Err` on a corrupt header or body.
pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> anyhow::Result<Option<(T, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame length header {} exceeds limit", len);
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let msg: T = serde_json::from_slice(&buf[4..4 + len])?;
    Ok(Some((msg, 4 + len)))
}
