//! In-memory stand-ins for the external services, shared by the unit tests.

use crate::completion::CompletionService;
use crate::history::Message;
use crate::speech::{AudioInput, RecognitionStream, SpeechEvent, SpeechToText};
use crate::stream::{TextStream, from_receiver};
use crate::synthesis::{SpeechSynthesizer, SynthesisEvent, SynthesisStream, TextInput};
use crate::transport::{AudioFrame, AudioSource, ChatMessage, RemoteAudioTrack, Subscription, Transport};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub struct RecordingAudioSource {
    frames: Mutex<Vec<AudioFrame>>,
}

impl RecordingAudioSource {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
        }
    }

    pub fn frames(&self) -> Vec<AudioFrame> {
        self.frames.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioSource for RecordingAudioSource {
    fn sample_rate(&self) -> u32 {
        24_000
    }

    fn num_channels(&self) -> u16 {
        1
    }

    async fn capture_frame(&self, frame: AudioFrame) -> Result<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

/// The test's side of a [`RecordingTransport`]: injects room events.
pub struct TransportHandles {
    pub chat_tx: mpsc::Sender<ChatMessage>,
    pub track_tx: mpsc::Sender<RemoteAudioTrack>,
}

impl TransportHandles {
    pub async fn send_chat(&self, text: &str) {
        let message = ChatMessage {
            id: format!("msg-{text}"),
            message: text.to_string(),
            deleted: false,
            timestamp: 0,
        };
        self.chat_tx.send(message).await.unwrap();
    }
}

pub struct RecordingTransport {
    room_name: String,
    pub audio_out: Arc<RecordingAudioSource>,
    chat_rx: Mutex<Option<mpsc::Receiver<ChatMessage>>>,
    track_rx: Mutex<Option<mpsc::Receiver<RemoteAudioTrack>>>,
    chat_sent: Mutex<Vec<String>>,
    metadata: Mutex<Vec<String>>,
    data: Mutex<Vec<(String, Vec<u8>)>>,
    published_tracks: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn new(room_name: &str) -> (Arc<Self>, TransportHandles) {
        let (chat_tx, chat_rx) = mpsc::channel(16);
        let (track_tx, track_rx) = mpsc::channel(4);
        let transport = Arc::new(Self {
            room_name: room_name.to_string(),
            audio_out: Arc::new(RecordingAudioSource::new()),
            chat_rx: Mutex::new(Some(chat_rx)),
            track_rx: Mutex::new(Some(track_rx)),
            chat_sent: Mutex::new(Vec::new()),
            metadata: Mutex::new(Vec::new()),
            data: Mutex::new(Vec::new()),
            published_tracks: Mutex::new(Vec::new()),
        });
        (transport, TransportHandles { chat_tx, track_tx })
    }

    pub fn chat_sent(&self) -> Vec<String> {
        self.chat_sent.lock().unwrap().clone()
    }

    pub fn metadata(&self) -> Vec<String> {
        self.metadata.lock().unwrap().clone()
    }

    pub fn data(&self) -> Vec<(String, Vec<u8>)> {
        self.data.lock().unwrap().clone()
    }

    pub fn published_tracks(&self) -> Vec<String> {
        self.published_tracks.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn room_name(&self) -> &str {
        &self.room_name
    }

    async fn publish_audio_track(
        &self,
        name: &str,
        _sample_rate: u32,
        _num_channels: u16,
    ) -> Result<Arc<dyn AudioSource>> {
        self.published_tracks.lock().unwrap().push(name.to_string());
        Ok(self.audio_out.clone())
    }

    async fn send_chat_message(&self, text: &str) -> Result<()> {
        self.chat_sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn update_metadata(&self, metadata: &str) -> Result<()> {
        self.metadata.lock().unwrap().push(metadata.to_string());
        Ok(())
    }

    async fn publish_data(&self, payload: Vec<u8>, topic: &str) -> Result<()> {
        self.data.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }

    fn on_chat_message(&self) -> Result<Subscription<ChatMessage>> {
        let rx = self
            .chat_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("chat already subscribed"))?;
        Ok(Subscription::new("chat", rx))
    }

    fn on_track_subscribed(&self) -> Result<Subscription<RemoteAudioTrack>> {
        let rx = self
            .track_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("tracks already subscribed"))?;
        Ok(Subscription::new("tracks", rx))
    }
}

/// Emits `Started` on the first pushed chunk, one audio frame per chunk
/// (one sample per character), and `Finished` on flush.
pub struct ScriptedSynthesizer {
    pushed: Arc<Mutex<Vec<String>>>,
    voiced: bool,
}

impl ScriptedSynthesizer {
    pub fn new() -> Self {
        Self {
            pushed: Arc::new(Mutex::new(Vec::new())),
            voiced: true,
        }
    }

    /// Records pushed text but never produces audio, so `sending_audio` stays off.
    pub fn silent() -> Self {
        Self {
            voiced: false,
            ..Self::new()
        }
    }

    pub fn pushed_text(&self) -> Vec<String> {
        self.pushed.lock().unwrap().clone()
    }
}

struct ScriptedTextInput {
    pushed: Arc<Mutex<Vec<String>>>,
    events_tx: Option<mpsc::Sender<Result<SynthesisEvent>>>,
    started: bool,
    voiced: bool,
}

#[async_trait]
impl TextInput for ScriptedTextInput {
    fn push_text(&mut self, text: &str) -> Result<()> {
        let events_tx = self
            .events_tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("input flushed"))?;
        self.pushed.lock().unwrap().push(text.to_string());
        if !self.voiced {
            return Ok(());
        }
        if !self.started {
            self.started = true;
            events_tx.try_send(Ok(SynthesisEvent::Started))?;
        }
        let frame = AudioFrame::new(vec![0; text.chars().count()], 24_000, 1);
        events_tx.try_send(Ok(SynthesisEvent::Audio(frame)))?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(events_tx) = self.events_tx.take() {
            if self.started {
                events_tx.send(Ok(SynthesisEvent::Finished)).await?;
            }
        }
        Ok(())
    }
}

impl SpeechSynthesizer for ScriptedSynthesizer {
    fn sample_rate(&self) -> u32 {
        24_000
    }

    fn num_channels(&self) -> u16 {
        1
    }

    fn stream(&self) -> Result<SynthesisStream> {
        let (events_tx, events_rx) = mpsc::channel(64);
        Ok(SynthesisStream {
            input: Box::new(ScriptedTextInput {
                pushed: self.pushed.clone(),
                events_tx: Some(events_tx),
                started: false,
                voiced: self.voiced,
            }),
            events: from_receiver(events_rx),
        })
    }
}

/// Replies with pre-scripted chunk sequences, one per request, and records every request.
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<Vec<Result<String>>>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedCompletion {
    pub fn new(replies: Vec<Vec<Result<String>>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn chunks(chunks: &[&str]) -> Vec<Result<String>> {
        chunks.iter().map(|chunk| Ok(chunk.to_string())).collect()
    }

    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, messages: &[Message]) -> Result<TextStream> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted reply left"))?;
        Ok(futures::stream::iter(reply).boxed())
    }
}

/// A recognizer whose events are fed by the test and whose input records pushed frames.
pub struct ChannelSpeechToText {
    events_rx: Mutex<Option<mpsc::Receiver<Result<SpeechEvent>>>>,
    pub frames: Arc<Mutex<Vec<AudioFrame>>>,
    pub closed: Arc<AtomicBool>,
}

impl ChannelSpeechToText {
    pub fn new() -> (Arc<Self>, mpsc::Sender<Result<SpeechEvent>>) {
        let (events_tx, events_rx) = mpsc::channel(16);
        let stt = Arc::new(Self {
            events_rx: Mutex::new(Some(events_rx)),
            frames: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        });
        (stt, events_tx)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct RecordingAudioInput {
    frames: Arc<Mutex<Vec<AudioFrame>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl AudioInput for RecordingAudioInput {
    fn push_frame(&mut self, frame: AudioFrame) -> Result<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl SpeechToText for ChannelSpeechToText {
    fn stream(&self) -> Result<RecognitionStream> {
        let events_rx = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("recognizer already streaming"))?;
        Ok(RecognitionStream {
            input: Box::new(RecordingAudioInput {
                frames: self.frames.clone(),
                closed: self.closed.clone(),
            }),
            events: from_receiver(events_rx),
        })
    }
}
