//! The session/transport boundary.
//!
//! The transport delivers remote audio tracks and chat messages and carries
//! everything the agent publishes back into the room: its audio track, whole
//! chat messages, participant metadata and transcription records.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Topic that transcription records are published on.
pub const TRANSCRIPTION_TOPIC: &str = "transcription";

/// A block of interleaved 16-bit PCM samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub data: Vec<i16>,
    pub sample_rate: u32,
    pub num_channels: u16,
}

impl AudioFrame {
    pub fn new(data: Vec<i16>, sample_rate: u32, num_channels: u16) -> Self {
        Self {
            data,
            sample_rate,
            num_channels,
        }
    }
}

/// A chat message received from the room.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub message: String,
    pub deleted: bool,
    pub timestamp: i64,
}

impl ChatMessage {
    /// Deleted and blank messages never enter the pipeline.
    pub fn is_actionable(&self) -> bool {
        !self.deleted && !self.message.trim().is_empty()
    }
}

/// A record published on [`TRANSCRIPTION_TOPIC`] for every finalized utterance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionRecord {
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl TranscriptionRecord {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// A remote participant's audio track the agent is subscribed to.
pub struct RemoteAudioTrack {
    pub sid: String,
    pub participant: String,
    frames: mpsc::Receiver<AudioFrame>,
}

impl RemoteAudioTrack {
    pub fn new(
        sid: impl Into<String>,
        participant: impl Into<String>,
        frames: mpsc::Receiver<AudioFrame>,
    ) -> Self {
        Self {
            sid: sid.into(),
            participant: participant.into(),
            frames,
        }
    }

    /// Waits for the next frame. Returns `None` once the track is unpublished or closed.
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        self.frames.recv().await
    }
}

impl std::fmt::Debug for RemoteAudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAudioTrack")
            .field("sid", &self.sid)
            .field("participant", &self.participant)
            .finish()
    }
}

/// A handle to one stream of transport events.
///
/// The session holds its subscriptions for its whole lifetime and closes them
/// at teardown, after which the transport stops delivering to them.
pub struct Subscription<T> {
    name: &'static str,
    rx: mpsc::Receiver<T>,
    closed: bool,
}

impl<T> Subscription<T> {
    pub fn new(name: &'static str, rx: mpsc::Receiver<T>) -> Self {
        Self {
            name,
            rx,
            closed: false,
        }
    }

    /// Receives the next event, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<T> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    /// Stops delivery. Events already queued are discarded.
    pub fn close(&mut self) {
        if !self.closed {
            tracing::debug!("closing {} subscription", self.name);
            self.closed = true;
            self.rx.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// The output audio source backing the agent's published track.
#[async_trait]
pub trait AudioSource: Send + Sync {
    fn sample_rate(&self) -> u32;

    fn num_channels(&self) -> u16;

    /// Queues a frame for playback. May wait while the playback buffer is full.
    async fn capture_frame(&self, frame: AudioFrame) -> Result<()>;
}

/// The room the agent participates in.
#[async_trait]
pub trait Transport: Send + Sync {
    fn room_name(&self) -> &str;

    /// Publishes the agent's audio track and returns the source feeding it.
    async fn publish_audio_track(
        &self,
        name: &str,
        sample_rate: u32,
        num_channels: u16,
    ) -> Result<Arc<dyn AudioSource>>;

    /// Sends a whole chat message from the agent.
    async fn send_chat_message(&self, text: &str) -> Result<()>;

    /// Replaces the agent participant's metadata.
    async fn update_metadata(&self, metadata: &str) -> Result<()>;

    /// Publishes an arbitrary payload on a data topic.
    async fn publish_data(&self, payload: Vec<u8>, topic: &str) -> Result<()>;

    fn on_chat_message(&self) -> Result<Subscription<ChatMessage>>;

    fn on_track_subscribed(&self) -> Result<Subscription<RemoteAudioTrack>>;
}

/// Serializes and publishes a transcription record for a finalized utterance.
pub async fn publish_transcription(transport: &dyn Transport, text: &str) -> Result<()> {
    let record = TranscriptionRecord::now(text);
    let payload = serde_json::to_vec(&record)?;
    transport.publish_data(payload, TRANSCRIPTION_TOPIC).await
}
