//! Speech recognition over the OpenAI transcription endpoint.
//!
//! The endpoint is not streaming, so audio is segmented locally with an
//! energy-based endpointer and each finished segment is uploaded as a WAV
//! file. Every transcript comes back as one final fragment that also ends
//! the utterance.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dialogue_core::openai::{OpenAiClient, check_status};
use dialogue_core::speech::{AudioInput, RecognitionStream, SpeechEvent, SpeechToText};
use dialogue_core::stream::from_receiver;
use dialogue_core::transport::AudioFrame;
use dialogue_native_utils::audio;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct EndpointerConfig {
    /// Frame RMS (0.0..=1.0) at or above which a frame counts as speech.
    pub speech_threshold: f32,
    /// Silence after speech that ends a segment.
    pub trailing_silence: Duration,
    /// Segments with less speech than this are discarded as noise.
    pub min_speech: Duration,
    /// Segments are cut at this length even while speech continues.
    pub max_segment: Duration,
}

impl Default for EndpointerConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 0.015,
            trailing_silence: Duration::from_millis(800),
            min_speech: Duration::from_millis(250),
            max_segment: Duration::from_secs(30),
        }
    }
}

/// A finished stretch of speech, mono PCM16.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

fn samples_for(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * sample_rate as f64) as usize
}

fn to_mono(frame: &AudioFrame) -> Vec<i16> {
    let channels = frame.num_channels.max(1) as usize;
    if channels == 1 {
        return frame.data.clone();
    }
    frame
        .data
        .chunks(channels)
        .map(|c| (c.iter().map(|&s| s as i32).sum::<i32>() / channels as i32) as i16)
        .collect()
}

/// Splits a frame sequence into speech segments by frame energy.
#[derive(Debug)]
pub struct Endpointer {
    config: EndpointerConfig,
    samples: Vec<i16>,
    sample_rate: u32,
    speech_samples: usize,
    silence_samples: usize,
}

impl Endpointer {
    pub fn new(config: EndpointerConfig) -> Self {
        Self {
            config,
            samples: Vec::new(),
            sample_rate: audio::RECOGNITION_SAMPLE_RATE,
            speech_samples: 0,
            silence_samples: 0,
        }
    }

    pub fn in_speech(&self) -> bool {
        self.speech_samples > 0
    }

    /// Feeds one frame; returns a segment when this frame completes one.
    pub fn push(&mut self, frame: &AudioFrame) -> Option<Segment> {
        let mono = to_mono(frame);
        if mono.is_empty() {
            return None;
        }
        if self.in_speech() && frame.sample_rate != self.sample_rate {
            tracing::warn!(
                "sample rate changed mid-segment ({} -> {}), cutting segment",
                self.sample_rate,
                frame.sample_rate
            );
            let finished = self.finish();
            self.sample_rate = frame.sample_rate;
            return finished;
        }
        self.sample_rate = frame.sample_rate;

        let is_speech = audio::rms(&mono) >= self.config.speech_threshold;
        if !is_speech && !self.in_speech() {
            return None;
        }

        if is_speech {
            self.speech_samples += mono.len();
            self.silence_samples = 0;
        } else {
            self.silence_samples += mono.len();
        }
        self.samples.extend_from_slice(&mono);

        let silence_limit = samples_for(self.config.trailing_silence, self.sample_rate);
        let length_limit = samples_for(self.config.max_segment, self.sample_rate);
        if self.silence_samples >= silence_limit || self.samples.len() >= length_limit {
            return self.finish();
        }
        None
    }

    /// Ends the current segment regardless of trailing silence.
    pub fn finish(&mut self) -> Option<Segment> {
        let samples = std::mem::take(&mut self.samples);
        let speech = std::mem::take(&mut self.speech_samples);
        self.silence_samples = 0;
        if speech == 0 {
            return None;
        }
        if speech < samples_for(self.config.min_speech, self.sample_rate) {
            tracing::debug!("discarding {} samples of noise", samples.len());
            return None;
        }
        Some(Segment {
            samples,
            sample_rate: self.sample_rate,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Clone)]
pub struct WhisperSpeechToText {
    client: OpenAiClient,
    model: String,
    endpointer: EndpointerConfig,
}

impl WhisperSpeechToText {
    pub fn new(client: OpenAiClient, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
            endpointer: EndpointerConfig::default(),
        }
    }

    pub fn with_endpointer(mut self, endpointer: EndpointerConfig) -> Self {
        self.endpointer = endpointer;
        self
    }

    async fn transcribe(&self, segment: Segment) -> Result<String> {
        let wav = audio::encode_wav(&segment.samples, segment.sample_rate)?;
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("speech.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "json")
            .part("file", part);

        let response = self
            .client
            .post("audio/transcriptions")
            .multipart(form)
            .send()
            .await?;
        let response = check_status(response, "transcription").await?;
        let body = response.json::<TranscriptionResponse>().await?;
        Ok(body.text)
    }
}

impl SpeechToText for WhisperSpeechToText {
    fn stream(&self) -> Result<RecognitionStream> {
        let (segments_tx, mut segments_rx) = mpsc::channel::<Segment>(8);
        let (events_tx, events_rx) = mpsc::channel(8);

        let recognizer = self.clone();
        // Segments are transcribed one at a time so results keep their order.
        tokio::spawn(async move {
            while let Some(segment) = segments_rx.recv().await {
                let duration = segment.samples.len() as f64 / segment.sample_rate as f64;
                tracing::debug!("transcribing {:.2}s of speech", duration);
                match recognizer.transcribe(segment).await {
                    Ok(text) if text.trim().is_empty() => {}
                    Ok(text) => {
                        if events_tx
                            .send(Ok(SpeechEvent::new(text, true, true)))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    // One lost segment should not end recognition for the track.
                    Err(e) => tracing::error!("transcription failed: {:?}", e),
                }
            }
        });

        Ok(RecognitionStream {
            input: Box::new(WhisperInput {
                endpointer: Endpointer::new(self.endpointer.clone()),
                segments_tx: Some(segments_tx),
            }),
            events: from_receiver(events_rx),
        })
    }
}

struct WhisperInput {
    endpointer: Endpointer,
    segments_tx: Option<mpsc::Sender<Segment>>,
}

impl WhisperInput {
    fn sender(&self) -> Result<&mpsc::Sender<Segment>> {
        self.segments_tx
            .as_ref()
            .context("recognition stream already closed")
    }
}

#[async_trait]
impl AudioInput for WhisperInput {
    fn push_frame(&mut self, frame: AudioFrame) -> Result<()> {
        let Some(segment) = self.endpointer.push(&frame) else {
            return Ok(());
        };
        if let Err(e) = self.sender()?.try_send(segment) {
            tracing::warn!("transcription backlog full, dropping segment: {}", e);
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(segment) = self.endpointer.finish() {
            self.sender()?
                .send(segment)
                .await
                .context("transcription worker stopped")?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.segments_tx.is_none() {
            return Ok(());
        }
        let flushed = self.flush().await;
        self.segments_tx = None;
        flushed
    }
}
