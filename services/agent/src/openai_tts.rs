//! Speech synthesis over the OpenAI speech endpoint.
//!
//! Reply text arrives in small chunks; it is cut into sentences so the first
//! sentence can be voiced while the model is still writing the rest.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dialogue_core::openai::{OpenAiClient, check_status};
use dialogue_core::stream::from_receiver;
use dialogue_core::synthesis::{SpeechSynthesizer, SynthesisEvent, SynthesisStream, TextInput};
use dialogue_core::transport::AudioFrame;
use dialogue_native_utils::audio::{Pcm16Decoder, SYNTHESIS_PCM16_SAMPLE_RATE};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;

const SAMPLE_RATE: u32 = SYNTHESIS_PCM16_SAMPLE_RATE as u32;
/// 100ms of audio per emitted frame.
const FRAME_SAMPLES: usize = (SAMPLE_RATE / 10) as usize;

/// Accumulates streamed text and releases it one sentence at a time.
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `text` and returns every sentence it completed.
    ///
    /// A sentence ends at `.`, `!` or `?` followed by whitespace, so the last
    /// sentence of a chunk waits for the next chunk or `finish`.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut sentences = Vec::new();
        loop {
            let boundary = self
                .buffer
                .char_indices()
                .zip(self.buffer.chars().skip(1))
                .find(|((_, c), next)| matches!(c, '.' | '!' | '?') && next.is_whitespace())
                .map(|((i, c), _)| i + c.len_utf8());
            let Some(end) = boundary else {
                break;
            };
            let sentence: String = self.buffer.drain(..end).collect();
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
        }
        sentences
    }

    /// Returns whatever text is left over.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
    response_format: &'static str,
}

#[derive(Clone)]
pub struct OpenAiSynthesizer {
    client: OpenAiClient,
    model: String,
    voice: String,
}

impl OpenAiSynthesizer {
    pub fn new(client: OpenAiClient, model: &str, voice: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
            voice: voice.to_string(),
        }
    }

    /// Voices one sentence, sending its audio as frames.
    async fn speak(
        &self,
        sentence: &str,
        started: &mut bool,
        events: &mpsc::Sender<Result<SynthesisEvent>>,
    ) -> Result<()> {
        let request = SpeechRequest {
            model: &self.model,
            voice: &self.voice,
            input: sentence,
            response_format: "pcm",
        };
        let response = self.client.post("audio/speech").json(&request).send().await?;
        let response = check_status(response, "speech synthesis").await?;

        let mut body = response.bytes_stream();
        let mut decoder = Pcm16Decoder::new();
        let mut pending: Vec<i16> = Vec::with_capacity(FRAME_SAMPLES * 2);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("speech audio stream interrupted")?;
            pending.extend(decoder.push(&chunk));
            while pending.len() >= FRAME_SAMPLES {
                let frame: Vec<i16> = pending.drain(..FRAME_SAMPLES).collect();
                emit(frame, started, events).await?;
            }
        }
        if !pending.is_empty() {
            emit(pending, started, events).await?;
        }
        Ok(())
    }
}

async fn emit(
    samples: Vec<i16>,
    started: &mut bool,
    events: &mpsc::Sender<Result<SynthesisEvent>>,
) -> Result<()> {
    if !*started {
        *started = true;
        events
            .send(Ok(SynthesisEvent::Started))
            .await
            .context("synthesis stream dropped")?;
    }
    events
        .send(Ok(SynthesisEvent::Audio(AudioFrame::new(samples, SAMPLE_RATE, 1))))
        .await
        .context("synthesis stream dropped")
}

impl SpeechSynthesizer for OpenAiSynthesizer {
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn num_channels(&self) -> u16 {
        1
    }

    fn stream(&self) -> Result<SynthesisStream> {
        let (sentences_tx, mut sentences_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::channel(16);

        let synthesizer = self.clone();
        tokio::spawn(async move {
            let mut started = false;
            while let Some(sentence) = sentences_rx.recv().await {
                tracing::debug!("synthesizing {:?}", sentence);
                if let Err(e) = synthesizer.speak(&sentence, &mut started, &events_tx).await {
                    if events_tx.is_closed() {
                        return;
                    }
                    tracing::error!("failed to synthesize sentence: {:?}", e);
                }
            }
            if started {
                let _ = events_tx.send(Ok(SynthesisEvent::Finished)).await;
            }
        });

        Ok(SynthesisStream {
            input: Box::new(SentenceInput {
                splitter: SentenceSplitter::new(),
                sentences_tx: Some(sentences_tx),
            }),
            events: from_receiver(events_rx),
        })
    }
}

struct SentenceInput {
    splitter: SentenceSplitter,
    sentences_tx: Option<mpsc::UnboundedSender<String>>,
}

impl SentenceInput {
    fn send(&self, sentence: String) -> Result<()> {
        self.sentences_tx
            .as_ref()
            .context("synthesis input already flushed")?
            .send(sentence)
            .context("synthesis worker stopped")
    }
}

#[async_trait]
impl TextInput for SentenceInput {
    fn push_text(&mut self, text: &str) -> Result<()> {
        for sentence in self.splitter.push(text) {
            self.send(sentence)?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(rest) = self.splitter.finish() {
            self.send(rest)?;
        }
        // Dropping the sender lets the worker finish once the queue drains.
        self.sentences_tx = None;
        Ok(())
    }
}
