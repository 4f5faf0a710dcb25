//! The session controller: wires transport events to the pipeline and owns
//! every task it starts.

use crate::Input;
use crate::activity::{ActivityTracker, spawn_metadata_publisher};
use crate::completion::{CompletionRelay, CompletionService, CycleOutcome, Reply};
use crate::history::{Message, MessageHistory};
use crate::retrieval::RetrievalAugmenter;
use crate::speech::SpeechToText;
use crate::synthesis::{SpeechSynthesizer, SynthesisRelay};
use crate::transcript::process_track;
use crate::transport::Transport;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Name of the agent's published audio track.
pub const AGENT_TRACK_NAME: &str = "agent-mic";
/// Time given to the participant to subscribe to the agent's track before it speaks.
pub const INTRO_DELAY: Duration = Duration::from_secs(1);

pub const DEFAULT_INTRO: &str = "Hey! I'm here to help you build your ideas, find other members you can \
connect with, and help you get discovered. So, what's your name, and tell me a little bit about what you're building.";

pub const DEFAULT_SIP_INTRO: &str = "Hey, thanks for calling! I'm here to help you build your ideas and find \
other members you can connect with. What's your name, and what are you building?";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub intro: String,
    /// Spoken instead of `intro` in phone rooms (names starting with `sip`).
    pub sip_intro: String,
    pub intro_delay: Duration,
    pub track_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            intro: DEFAULT_INTRO.to_string(),
            sip_intro: DEFAULT_SIP_INTRO.to_string(),
            intro_delay: INTRO_DELAY,
            track_name: AGENT_TRACK_NAME.to_string(),
        }
    }
}

impl SessionConfig {
    pub fn intro_for_room(&self, room_name: &str) -> &str {
        if room_name.starts_with("sip") {
            &self.sip_intro
        } else {
            &self.intro
        }
    }
}

/// The external collaborators a session talks to.
pub struct Services {
    pub transport: Arc<dyn Transport>,
    pub speech_to_text: Arc<dyn SpeechToText>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub completion: Arc<dyn CompletionService>,
    /// `None` disables retrieval; utterances go to the model unmodified.
    pub augmenter: Option<RetrievalAugmenter>,
}

/// Everything a response cycle needs, shared between cycles.
struct Pipeline {
    completion: CompletionRelay,
    synthesis: SynthesisRelay,
    augmenter: Option<RetrievalAugmenter>,
}

impl Pipeline {
    async fn run(&self, input: Input, cancel: &CancellationToken) -> Result<CycleOutcome> {
        let reply = match input {
            Input::Introduction(text) => Reply::Scripted(text),
            Input::Chat(text) => Reply::Model(Message::user(text)),
            Input::Utterance(text) => {
                let prompt = match &self.augmenter {
                    Some(augmenter) => tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
                        prompt = augmenter.augment(&text) => {
                            if prompt.augmented {
                                tracing::debug!("utterance augmented with {} records", prompt.match_count);
                            }
                            prompt.text
                        }
                    },
                    None => text,
                };
                Reply::Model(Message::user(prompt))
            }
        };
        let synthesis = self.synthesis.start()?;
        self.completion.process(reply, synthesis, cancel).await
    }
}

struct Cycle {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The single running response cycle.
///
/// Starting a new cycle cancels the current one and waits for its teardown
/// first, so two replies never speak over each other.
#[derive(Default)]
struct CycleSlot {
    current: Option<Cycle>,
    next_id: u64,
}

impl CycleSlot {
    async fn start(&mut self, pipeline: Arc<Pipeline>, input: Input) {
        self.cancel().await;

        self.next_id += 1;
        let id = self.next_id;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tracing::debug!("cycle {} started", id);
            match pipeline.run(input, &token).await {
                Ok(CycleOutcome::Completed(_)) => tracing::debug!("cycle {} completed", id),
                Ok(CycleOutcome::Cancelled) => tracing::info!("cycle {} interrupted", id),
                Err(e) => tracing::error!("cycle {} failed: {:?}", id, e),
            }
        });
        self.current = Some(Cycle { id, cancel, handle });
    }

    async fn cancel(&mut self) {
        let Some(cycle) = self.current.take() else {
            return;
        };
        if !cycle.handle.is_finished() {
            tracing::info!("interrupting cycle {}", cycle.id);
        }
        cycle.cancel.cancel();
        if let Err(e) = cycle.handle.await {
            tracing::error!("cycle {} panicked: {}", cycle.id, e);
        }
    }

    async fn wait(&mut self) {
        if let Some(cycle) = self.current.take() {
            if let Err(e) = cycle.handle.await {
                tracing::error!("cycle {} panicked: {}", cycle.id, e);
            }
        }
    }
}

pub struct Session {
    services: Services,
    history: MessageHistory,
    config: SessionConfig,
    tracker: Arc<ActivityTracker>,
}

impl Session {
    pub fn new(services: Services, history: MessageHistory, config: SessionConfig) -> Self {
        Self {
            services,
            history,
            config,
            tracker: Arc::new(ActivityTracker::new()),
        }
    }

    pub fn tracker(&self) -> Arc<ActivityTracker> {
        self.tracker.clone()
    }

    /// Runs the session until `shutdown` is cancelled or the room stops delivering input.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Session {
            services,
            history,
            config,
            tracker,
        } = self;
        let transport = services.transport.clone();

        let audio_out = transport
            .publish_audio_track(
                &config.track_name,
                services.synthesizer.sample_rate(),
                services.synthesizer.num_channels(),
            )
            .await
            .context("failed to publish agent audio track")?;
        tracing::info!("published audio track {:?}", config.track_name);

        let mut chat = transport
            .on_chat_message()
            .context("failed to subscribe to chat messages")?;
        let mut tracks = transport
            .on_track_subscribed()
            .context("failed to subscribe to audio tracks")?;
        let publisher = spawn_metadata_publisher(&tracker, transport.clone());

        let pipeline = Arc::new(Pipeline {
            completion: CompletionRelay::new(
                services.completion.clone(),
                history,
                tracker.clone(),
                transport.clone(),
            ),
            synthesis: SynthesisRelay::new(services.synthesizer.clone(), audio_out, tracker.clone()),
            augmenter: services.augmenter,
        });
        let mut slot = CycleSlot::default();
        let mut track_tasks = JoinSet::new();
        let (utterance_tx, mut utterance_rx) = mpsc::channel::<String>(16);

        // Give the participant time to subscribe so the greeting is heard in full.
        let interrupted = tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = tokio::time::sleep(config.intro_delay) => false,
        };

        if !interrupted {
            let intro = config.intro_for_room(transport.room_name()).to_string();
            slot.start(pipeline.clone(), Input::Introduction(intro)).await;

            let mut chat_open = true;
            let mut tracks_open = true;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("session shutting down");
                        break;
                    }
                    message = chat.recv(), if chat_open => match message {
                        Some(message) if message.is_actionable() => {
                            tracing::info!("chat message received: {:?}", message.message);
                            slot.start(pipeline.clone(), Input::Chat(message.message)).await;
                        }
                        Some(message) => {
                            tracing::debug!("ignoring chat message {}", message.id);
                        }
                        None => chat_open = false,
                    },
                    track = tracks.recv(), if tracks_open => match track {
                        Some(track) => {
                            track_tasks.spawn(process_track(
                                track,
                                services.speech_to_text.clone(),
                                tracker.clone(),
                                transport.clone(),
                                utterance_tx.clone(),
                            ));
                        }
                        None => tracks_open = false,
                    },
                    Some(utterance) = utterance_rx.recv() => {
                        slot.start(pipeline.clone(), Input::Utterance(utterance)).await;
                    }
                    Some(finished) = track_tasks.join_next() => match finished {
                        Ok(Ok(())) => tracing::info!("audio track finished"),
                        Ok(Err(e)) => tracing::error!("audio track processing failed: {:?}", e),
                        Err(e) => tracing::error!("audio track task panicked: {}", e),
                    },
                }

                if !chat_open && !tracks_open && track_tasks.is_empty() {
                    tracing::info!("room closed, finishing current reply");
                    // Utterances finalized by the last track are still queued.
                    while let Ok(utterance) = utterance_rx.try_recv() {
                        slot.start(pipeline.clone(), Input::Utterance(utterance)).await;
                    }
                    slot.wait().await;
                    break;
                }
            }
        }

        slot.cancel().await;
        track_tasks.shutdown().await;
        chat.close();
        tracks.close();
        publisher.abort();
        tracing::info!("session ended");
        Ok(())
    }
}
