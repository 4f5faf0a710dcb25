//! The speech-to-text boundary.

use crate::transport::AudioFrame;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechAlternative {
    pub text: String,
    pub confidence: f32,
}

/// An incremental recognition result.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechEvent {
    /// Candidate transcripts, best first.
    pub alternatives: Vec<SpeechAlternative>,
    /// The text of this fragment will not be revised any more.
    pub is_final: bool,
    /// The speaker stopped talking after this fragment.
    pub end_of_speech: bool,
}

impl SpeechEvent {
    pub fn new(text: impl Into<String>, is_final: bool, end_of_speech: bool) -> Self {
        Self {
            alternatives: vec![SpeechAlternative {
                text: text.into(),
                confidence: 1.0,
            }],
            is_final,
            end_of_speech,
        }
    }

    /// The best alternative's text, or an empty string when there is none.
    pub fn best_text(&self) -> &str {
        self.alternatives
            .first()
            .map(|alternative| alternative.text.as_str())
            .unwrap_or("")
    }
}

/// The push side of a recognition stream.
#[async_trait]
pub trait AudioInput: Send {
    fn push_frame(&mut self, frame: AudioFrame) -> Result<()>;

    /// Asks the recognizer to finalize whatever audio it has buffered.
    async fn flush(&mut self) -> Result<()>;

    /// Ends the input. The event stream ends after the remaining results are delivered.
    async fn close(&mut self) -> Result<()>;
}

/// One recognition session over one audio stream.
pub struct RecognitionStream {
    pub input: Box<dyn AudioInput>,
    pub events: BoxStream<'static, Result<SpeechEvent>>,
}

pub trait SpeechToText: Send + Sync {
    fn stream(&self) -> Result<RecognitionStream>;
}
