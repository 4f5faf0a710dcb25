//! A single-participant room on the local machine.
//!
//! The microphone is the participant's one audio track, lines typed on stdin
//! are their chat messages, and the agent's published track plays on the
//! speaker. Everything the agent sends to the room is logged.

use crate::config::INPUT_CHUNK_SIZE;
use anyhow::{Context, Result};
use async_trait::async_trait;
use dialogue_core::transport::{
    AudioFrame, AudioSource, ChatMessage, RemoteAudioTrack, Subscription, TRANSCRIPTION_TOPIC,
    Transport,
};
use dialogue_native_utils::audio;
use ringbuf::HeapProd;
use ringbuf::traits::{Consumer, Producer};
use rubato::FastFixedIn;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

pub const LOCAL_TRACK_SID: &str = "TR_local_mic";
pub const LOCAL_PARTICIPANT: &str = "local-user";

/// How long `capture_frame` waits between attempts while the speaker buffer is full.
const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);
/// Synthesized frames are 100ms at 24kHz; this chunk size divides them evenly.
const SPEAKER_RESAMPLER_CHUNK: usize = 240;

/// The feeding side of a [`LocalRoom`].
pub struct LocalRoomHandles {
    pub chat_tx: mpsc::Sender<ChatMessage>,
    pub track_tx: mpsc::Sender<RemoteAudioTrack>,
}

pub struct LocalRoom {
    name: String,
    speaker: Arc<SpeakerSource>,
    chat_rx: Mutex<Option<mpsc::Receiver<ChatMessage>>>,
    track_rx: Mutex<Option<mpsc::Receiver<RemoteAudioTrack>>>,
    metadata: Mutex<Option<String>>,
}

impl LocalRoom {
    pub fn new(name: &str, speaker: Arc<SpeakerSource>) -> (Self, LocalRoomHandles) {
        let (chat_tx, chat_rx) = mpsc::channel(32);
        let (track_tx, track_rx) = mpsc::channel(4);
        let room = Self {
            name: name.to_string(),
            speaker,
            chat_rx: Mutex::new(Some(chat_rx)),
            track_rx: Mutex::new(Some(track_rx)),
            metadata: Mutex::new(None),
        };
        (room, LocalRoomHandles { chat_tx, track_tx })
    }

    /// The last metadata the agent set, if any.
    pub fn metadata(&self) -> Option<String> {
        self.metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for LocalRoom {
    fn room_name(&self) -> &str {
        &self.name
    }

    async fn publish_audio_track(
        &self,
        name: &str,
        sample_rate: u32,
        num_channels: u16,
    ) -> Result<Arc<dyn AudioSource>> {
        if sample_rate != self.speaker.sample_rate() || num_channels != self.speaker.num_channels() {
            anyhow::bail!(
                "speaker expects {}Hz/{}ch audio, track {:?} is {}Hz/{}ch",
                self.speaker.sample_rate(),
                self.speaker.num_channels(),
                name,
                sample_rate,
                num_channels
            );
        }
        tracing::info!("Publishing track {:?} to the speaker", name);
        Ok(self.speaker.clone())
    }

    async fn send_chat_message(&self, text: &str) -> Result<()> {
        tracing::info!("[chat] agent: {}", text);
        Ok(())
    }

    async fn update_metadata(&self, metadata: &str) -> Result<()> {
        tracing::debug!("[metadata] {}", metadata);
        *self.metadata.lock().unwrap_or_else(PoisonError::into_inner) = Some(metadata.to_string());
        Ok(())
    }

    async fn publish_data(&self, payload: Vec<u8>, topic: &str) -> Result<()> {
        let payload = String::from_utf8_lossy(&payload);
        if topic == TRANSCRIPTION_TOPIC {
            tracing::info!("[transcription] {}", payload);
        } else {
            tracing::debug!("[data:{}] {}", topic, payload);
        }
        Ok(())
    }

    fn on_chat_message(&self) -> Result<Subscription<ChatMessage>> {
        let rx = self
            .chat_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .context("chat messages already subscribed")?;
        Ok(Subscription::new("chat", rx))
    }

    fn on_track_subscribed(&self) -> Result<Subscription<RemoteAudioTrack>> {
        let rx = self
            .track_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .context("tracks already subscribed")?;
        Ok(Subscription::new("tracks", rx))
    }
}

/// Reads chat lines until EOF. Blank lines are skipped.
pub async fn forward_chat_lines<R>(reader: R, chat_tx: mpsc::Sender<ChatMessage>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut count = 0u64;
    while let Some(line) = lines.next_line().await.context("failed to read chat input")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        count += 1;
        let message = ChatMessage {
            id: format!("local-{count}"),
            message: line.to_string(),
            deleted: false,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        if chat_tx.send(message).await.is_err() {
            break;
        }
    }
    tracing::debug!("chat input closed after {} messages", count);
    Ok(())
}

/// Resamples mono microphone audio to the recognition rate and emits it as PCM16 frames.
///
/// Returns when the microphone channel closes or the track is dropped.
pub async fn pump_microphone(
    mut samples_rx: mpsc::Receiver<Vec<f32>>,
    device_sample_rate: u32,
    frames_tx: mpsc::Sender<AudioFrame>,
) -> Result<()> {
    let mut resampler = audio::create_resampler(
        device_sample_rate as f64,
        audio::RECOGNITION_SAMPLE_RATE as f64,
        INPUT_CHUNK_SIZE,
    )?;
    let mut buffer: VecDeque<f32> = VecDeque::with_capacity(INPUT_CHUNK_SIZE * 2);

    while let Some(samples) = samples_rx.recv().await {
        buffer.extend(samples);
        while buffer.len() >= INPUT_CHUNK_SIZE {
            let chunk: Vec<f32> = buffer.drain(..INPUT_CHUNK_SIZE).collect();
            let resampled = audio::resample(&mut resampler, &chunk);
            if resampled.is_empty() {
                continue;
            }
            let frame = AudioFrame::new(
                audio::convert_f32_to_i16(&resampled),
                audio::RECOGNITION_SAMPLE_RATE,
                1,
            );
            if frames_tx.send(frame).await.is_err() {
                tracing::debug!("microphone track dropped");
                return Ok(());
            }
        }
    }
    Ok(())
}

struct SpeakerState {
    producer: HeapProd<f32>,
    resampler: Option<FastFixedIn<f32>>,
}

/// The agent's output track: frames go into the speaker's ring buffer.
///
/// `capture_frame` waits while the ring is full, which paces synthesis to
/// real-time playback.
pub struct SpeakerSource {
    sample_rate: u32,
    state: tokio::sync::Mutex<SpeakerState>,
}

impl SpeakerSource {
    pub fn new(producer: HeapProd<f32>, sample_rate: u32, device_sample_rate: u32) -> Result<Self> {
        let resampler = if sample_rate == device_sample_rate {
            None
        } else {
            Some(audio::create_resampler(
                sample_rate as f64,
                device_sample_rate as f64,
                SPEAKER_RESAMPLER_CHUNK,
            )?)
        };
        Ok(Self {
            sample_rate,
            state: tokio::sync::Mutex::new(SpeakerState {
                producer,
                resampler,
            }),
        })
    }
}

#[async_trait]
impl AudioSource for SpeakerSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn num_channels(&self) -> u16 {
        1
    }

    async fn capture_frame(&self, frame: AudioFrame) -> Result<()> {
        if frame.sample_rate != self.sample_rate {
            anyhow::bail!(
                "frame at {}Hz sent to a {}Hz track",
                frame.sample_rate,
                self.sample_rate
            );
        }
        let mono = audio::convert_i16_to_f32(&frame.data);
        let mono = audio::downmix_to_mono(&mono, frame.num_channels as usize);

        let mut state = self.state.lock().await;
        let samples = match state.resampler.as_mut() {
            Some(resampler) => audio::resample(resampler, &mono),
            None => mono,
        };

        let mut offset = 0;
        while offset < samples.len() {
            offset += state.producer.push_slice(&samples[offset..]);
            if offset < samples.len() {
                tokio::time::sleep(BACKPRESSURE_POLL).await;
            }
        }
        Ok(())
    }
}

/// Fills an interleaved output buffer from the ring, copying each sample to
/// the first two channels. Returns the number of frames that were silence.
pub fn fill_output(data: &mut [f32], channels: usize, consumer: &mut impl Consumer<Item = f32>) -> usize {
    let channels = channels.max(1);
    let mut silence = 0;
    for frame in data.chunks_mut(channels) {
        let sample = consumer.try_pop().unwrap_or(0.0);
        if sample == 0.0 {
            silence += 1;
        }
        for (channel, out) in frame.iter_mut().enumerate() {
            *out = if channel < 2 { sample } else { 0.0 };
        }
    }
    silence
}
