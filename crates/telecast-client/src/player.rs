//! Capability handle to the local player.
//!
//! The reconciler is the only writer of this handle.  Whatever services the
//! request channel (the mpv driver in production, an in-memory fake in
//! tests) owns the actual player exclusively; everything else goes through
//! `PlayerHandle`.

use tokio::sync::{mpsc, oneshot};

/// One player control request, answered over a oneshot channel.
#[derive(Debug)]
pub enum PlayerRequest {
    Load {
        src: String,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    SeekTo {
        secs: f64,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Play {
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Pause {
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    /// Current playback time in the loaded media, `None` when nothing is
    /// loaded yet.
    CurrentTime {
        reply: oneshot::Sender<anyhow::Result<Option<f64>>>,
    },
}

/// Cheaply cloneable handle to the player backend task.
#[derive(Debug, Clone)]
pub struct PlayerHandle {
    tx: mpsc::Sender<PlayerRequest>,
}

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

impl PlayerHandle {
    /// Create a handle plus the receiver a backend must service.
    pub fn channel() -> (Self, mpsc::Receiver<PlayerRequest>) {
        let (tx, rx) = mpsc::channel(64);
        (Self { tx }, rx)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<anyhow::Result<T>>) -> PlayerRequest,
    ) -> anyhow::Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("player backend gone"))?;
        tokio::time::timeout(REQUEST_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("player request timed out"))?
            .map_err(|_| anyhow::anyhow!("player reply channel dropped"))?
    }

    pub async fn load(&self, src: &str) -> anyhow::Result<()> {
        let src = src.to_string();
        self.request(|reply| PlayerRequest::Load { src, reply }).await
    }

    pub async fn seek_to(&self, secs: f64) -> anyhow::Result<()> {
        self.request(|reply| PlayerRequest::SeekTo { secs, reply })
            .await
    }

    pub async fn play(&self) -> anyhow::Result<()> {
        self.request(|reply| PlayerRequest::Play { reply }).await
    }

    pub async fn pause(&self) -> anyhow::Result<()> {
        self.request(|reply| PlayerRequest::Pause { reply }).await
    }

    pub async fn current_time(&self) -> anyhow::Result<Option<f64>> {
        self.request(|reply| PlayerRequest::CurrentTime { reply })
            .await
    }
}
