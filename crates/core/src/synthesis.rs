//! Streams reply text into the synthesizer and the resulting audio into the agent's track.

use crate::activity::ActivityTracker;
use crate::transport::{AudioFrame, AudioSource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisEvent {
    Started,
    Audio(AudioFrame),
    Finished,
}

/// The push side of a synthesis stream.
#[async_trait]
pub trait TextInput: Send {
    fn push_text(&mut self, text: &str) -> Result<()>;

    /// Signals end of input. The synthesizer voices everything pushed so far
    /// and then ends its event stream.
    async fn flush(&mut self) -> Result<()>;
}

pub struct SynthesisStream {
    pub input: Box<dyn TextInput>,
    pub events: BoxStream<'static, Result<SynthesisEvent>>,
}

/// The text-to-speech boundary.
pub trait SpeechSynthesizer: Send + Sync {
    fn sample_rate(&self) -> u32;

    fn num_channels(&self) -> u16;

    fn stream(&self) -> Result<SynthesisStream>;
}

/// Opens one synthesis job per response cycle.
pub struct SynthesisRelay {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    audio_out: Arc<dyn AudioSource>,
    tracker: Arc<ActivityTracker>,
}

impl SynthesisRelay {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        audio_out: Arc<dyn AudioSource>,
        tracker: Arc<ActivityTracker>,
    ) -> Self {
        Self {
            synthesizer,
            audio_out,
            tracker,
        }
    }

    /// Opens a synthesis stream and starts forwarding its audio to the output track.
    pub fn start(&self) -> Result<SynthesisJob> {
        let SynthesisStream { input, events } = self
            .synthesizer
            .stream()
            .context("failed to open synthesis stream")?;
        let task = tokio::spawn(forward_audio(
            events,
            self.audio_out.clone(),
            self.tracker.clone(),
        ));
        Ok(SynthesisJob {
            input: Some(input),
            task: Some(task),
            tracker: self.tracker.clone(),
        })
    }
}

async fn forward_audio(
    mut events: BoxStream<'static, Result<SynthesisEvent>>,
    audio_out: Arc<dyn AudioSource>,
    tracker: Arc<ActivityTracker>,
) -> Result<()> {
    let result = async {
        while let Some(event) = events.next().await {
            match event.context("synthesis stream failed")? {
                SynthesisEvent::Started => {
                    tracker.set_sending_audio(true);
                }
                SynthesisEvent::Audio(frame) => {
                    audio_out
                        .capture_frame(frame)
                        .await
                        .context("failed to capture synthesized audio")?;
                }
                SynthesisEvent::Finished => {
                    tracker.set_sending_audio(false);
                }
            }
        }
        Ok(())
    }
    .await;

    // A stream that errors out never reports Finished.
    tracker.set_sending_audio(false);
    result
}

/// One in-flight text-to-speech stream.
///
/// Dropping a job without finishing it aborts the synthesis and clears the
/// sending-audio flag.
pub struct SynthesisJob {
    input: Option<Box<dyn TextInput>>,
    task: Option<JoinHandle<Result<()>>>,
    tracker: Arc<ActivityTracker>,
}

impl SynthesisJob {
    pub fn push_text(&mut self, text: &str) -> Result<()> {
        match self.input.as_mut() {
            Some(input) => input.push_text(text),
            None => Err(anyhow::anyhow!("synthesis input already closed")),
        }
    }

    /// Signals end of input and waits until every queued frame has been published.
    pub async fn finish(&mut self) -> Result<()> {
        if let Some(mut input) = self.input.take() {
            if let Err(e) = input.flush().await {
                self.abort().await;
                return Err(e.context("failed to flush synthesis input"));
            }
        }
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let result = task.await;
        self.task = None;
        result.context("synthesis task panicked")?
    }

    /// Cancels the job without waiting for the remaining audio.
    pub async fn abort(&mut self) {
        self.input = None;
        if let Some(task) = self.task.take() {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!("synthesis task failed while aborting: {}", e);
                }
            }
        }
        self.tracker.set_sending_audio(false);
    }
}

impl Drop for SynthesisJob {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.tracker.set_sending_audio(false);
        }
    }
}
