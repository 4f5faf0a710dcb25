//! Turns one remote audio track into finalized utterances.

use crate::activity::{ActivityState, ActivityTracker};
use crate::speech::{AudioInput, RecognitionStream, SpeechEvent, SpeechToText};
use crate::transport::{RemoteAudioTrack, Transport, publish_transcription};
use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UtteranceState {
    #[default]
    Idle,
    Accumulating,
}

/// Assembles incremental recognition results into whole utterances.
///
/// Finalized fragments are joined with single spaces; the utterance is
/// released on end-of-speech and the buffer starts over empty.
#[derive(Debug, Default)]
pub struct TranscriptProcessor {
    buffer: String,
    state: UtteranceState,
}

impl TranscriptProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> UtteranceState {
        self.state
    }

    pub fn buffered_text(&self) -> &str {
        &self.buffer
    }

    /// Feeds one event; returns the utterance when this event ends it.
    pub fn on_event(&mut self, event: &SpeechEvent) -> Option<String> {
        let text = event.best_text().trim();
        if !text.is_empty() {
            self.state = UtteranceState::Accumulating;
            if event.is_final {
                if !self.buffer.is_empty() {
                    self.buffer.push(' ');
                }
                self.buffer.push_str(text);
            }
        }

        if !event.end_of_speech || self.state == UtteranceState::Idle {
            return None;
        }

        self.state = UtteranceState::Idle;
        let utterance = std::mem::take(&mut self.buffer);
        (!utterance.is_empty()).then_some(utterance)
    }

    /// Drops any partial, unfinalized text.
    pub fn discard(&mut self) {
        if !self.buffer.is_empty() {
            tracing::debug!("discarding unfinished utterance: {:?}", self.buffer);
        }
        self.buffer.clear();
        self.state = UtteranceState::Idle;
    }
}

/// Consumes recognition events, publishing and forwarding every finalized utterance.
pub async fn process_recognition_events(
    mut events: BoxStream<'static, Result<SpeechEvent>>,
    transport: Arc<dyn Transport>,
    utterances: mpsc::Sender<String>,
) -> Result<()> {
    let mut processor = TranscriptProcessor::new();
    let result = async {
        while let Some(event) = events.next().await {
            let event = event.context("speech recognition failed")?;
            let Some(utterance) = processor.on_event(&event) else {
                continue;
            };
            tracing::info!("user said: {:?}", utterance);
            if let Err(e) = publish_transcription(&*transport, &utterance).await {
                tracing::warn!("failed to publish transcription: {:?}", e);
            }
            if utterances.send(utterance).await.is_err() {
                tracing::debug!("session stopped accepting utterances");
                break;
            }
        }
        Ok(())
    }
    .await;
    processor.discard();
    result
}

/// Forwards track frames to the recognizer while the agent is listening.
///
/// Frames that arrive while the agent thinks or speaks are still read from the
/// track, so the producer never backs up, and then dropped. The recognizer
/// input is closed on every exit path.
pub async fn pump_frames(
    mut track: RemoteAudioTrack,
    mut input: Box<dyn AudioInput>,
    tracker: &ActivityTracker,
) -> Result<()> {
    let result = async {
        let mut dropped = 0usize;
        while let Some(frame) = track.next_frame().await {
            if tracker.state() != ActivityState::Listening {
                dropped += 1;
                continue;
            }
            input
                .push_frame(frame)
                .context("failed to push audio to recognizer")?;
        }
        tracing::debug!(
            "track {} ended, {} frames dropped while not listening",
            track.sid,
            dropped
        );
        Ok(())
    }
    .await;

    if let Err(e) = input.close().await {
        tracing::warn!("failed to close recognition stream: {:?}", e);
    }
    result
}

/// Runs recognition for one subscribed track until the track ends.
pub async fn process_track(
    track: RemoteAudioTrack,
    speech_to_text: Arc<dyn SpeechToText>,
    tracker: Arc<ActivityTracker>,
    transport: Arc<dyn Transport>,
    utterances: mpsc::Sender<String>,
) -> Result<()> {
    tracing::info!(
        "processing audio track {} from {}",
        track.sid,
        track.participant
    );
    let RecognitionStream { input, events } = speech_to_text
        .stream()
        .context("failed to open recognition stream")?;

    let (pumped, processed) = tokio::join!(
        pump_frames(track, input, &tracker),
        process_recognition_events(events, transport, utterances),
    );
    pumped?;
    processed
}
