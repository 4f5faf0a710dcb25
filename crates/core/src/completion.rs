use crate::activity::ActivityTracker;
use crate::history::{Message, MessageHistory};
use crate::stream::{TextStream, once_text};
use crate::synthesis::SynthesisJob;
use crate::transport::Transport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// The language-model completion boundary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Submits the ordered message list and returns the reply as it streams in.
    async fn complete(&self, messages: &[Message]) -> Result<TextStream>;
}

/// Maps text to a vector for similarity search.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns `None` when the input yields no embedding (for example, empty text).
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>>;
}

/// Where the text of a reply comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Ask the model, with this message appended to the history.
    Model(Message),
    /// Speak fixed text without consulting the model.
    Scripted(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The whole reply was streamed, published and voiced.
    Completed(String),
    /// A newer cycle took over before this one finished.
    Cancelled,
}

/// Drives the completion service and relays its streamed reply to synthesis and chat.
pub struct CompletionRelay {
    service: Arc<dyn CompletionService>,
    history: Mutex<MessageHistory>,
    tracker: Arc<ActivityTracker>,
    transport: Arc<dyn Transport>,
}

impl CompletionRelay {
    pub fn new(
        service: Arc<dyn CompletionService>,
        history: MessageHistory,
        tracker: Arc<ActivityTracker>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            service,
            history: Mutex::new(history),
            tracker,
            transport,
        }
    }

    /// Appends `message` to the history and asks the model for a reply to the whole conversation.
    pub async fn respond(&self, message: Message) -> Result<TextStream> {
        let request = {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push(message);
            history.to_request()
        };
        tracing::debug!("requesting completion with {} messages", request.len());
        self.service
            .complete(&request)
            .await
            .context("completion request failed")
    }

    pub fn history(&self) -> Vec<Message> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn record_reply(&self, text: &str) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Message::agent(text));
    }

    /// Runs one reply through to the end: the model's, or a scripted one.
    ///
    /// A model reply is kept in the history once it has been relayed in full.
    pub async fn process(
        &self,
        reply: Reply,
        mut synthesis: SynthesisJob,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome> {
        // The reply streams in, so the state flips before the first chunk.
        self.tracker.set_processing(true);

        let from_model = matches!(reply, Reply::Model(_));
        let stream = match reply {
            Reply::Model(message) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(self.cancelled(synthesis).await),
                stream = self.respond(message) => stream,
            },
            Reply::Scripted(text) => Ok(once_text(text)),
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                self.tracker.set_processing(false);
                synthesis.abort().await;
                return Err(e);
            }
        };

        let outcome = self.relay(stream, synthesis, cancel).await?;
        if let CycleOutcome::Completed(text) = &outcome {
            if from_model && !text.is_empty() {
                self.record_reply(text);
            }
        }
        Ok(outcome)
    }

    /// Forwards a reply stream to `synthesis` and the chat.
    ///
    /// Chunks are pushed to synthesis as they arrive and accumulated into one
    /// string, which is sent as a single chat message once the stream is
    /// exhausted. Finalization (processing flag off, chat message, synthesis
    /// flush) also runs when the stream fails part-way; cancellation turns the
    /// flag off and drops the remaining audio instead.
    ///
    /// Setting `processing` here is a no-op when called from
    /// [`process`](Self::process), which raises it before the request.
    pub async fn relay(
        &self,
        mut stream: TextStream,
        mut synthesis: SynthesisJob,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome> {
        self.tracker.set_processing(true);

        let mut full_text = String::new();
        let mut failure = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(self.cancelled(synthesis).await),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    if let Err(e) = synthesis.push_text(&chunk) {
                        tracing::warn!("failed to push text to synthesis: {:?}", e);
                    }
                    full_text.push_str(&chunk);
                }
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
                None => break,
            }
        }
        drop(stream);

        self.tracker.set_processing(false);
        if !full_text.is_empty() {
            tracing::info!("agent said: {:?}", full_text);
            if let Err(e) = self.transport.send_chat_message(&full_text).await {
                tracing::warn!("failed to send chat message: {:?}", e);
            }
        }

        let drained = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(self.cancelled(synthesis).await),
            drained = synthesis.finish() => drained,
        };

        if let Some(e) = failure {
            if let Err(drain_error) = drained {
                tracing::warn!("synthesis failed while finalizing: {:?}", drain_error);
            }
            return Err(e.context("completion stream failed"));
        }
        drained?;
        Ok(CycleOutcome::Completed(full_text))
    }

    async fn cancelled(&self, mut synthesis: SynthesisJob) -> CycleOutcome {
        tracing::debug!("reply cancelled");
        self.tracker.set_processing(false);
        synthesis.abort().await;
        CycleOutcome::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityState;
    use crate::history::Role;
    use crate::synthesis::SynthesisRelay;
    use crate::testing::{RecordingTransport, ScriptedCompletion, ScriptedSynthesizer};

    struct Fixture {
        relay: CompletionRelay,
        synthesis: SynthesisRelay,
        synthesizer: Arc<ScriptedSynthesizer>,
        transport: Arc<RecordingTransport>,
        tracker: Arc<ActivityTracker>,
    }

    fn fixture(service: Arc<dyn CompletionService>) -> Fixture {
        fixture_with(Arc::new(ActivityTracker::new()), service)
    }

    fn fixture_with(tracker: Arc<ActivityTracker>, service: Arc<dyn CompletionService>) -> Fixture {
        fixture_full(tracker, service, Arc::new(ScriptedSynthesizer::new()))
    }

    fn fixture_full(
        tracker: Arc<ActivityTracker>,
        service: Arc<dyn CompletionService>,
        synthesizer: Arc<ScriptedSynthesizer>,
    ) -> Fixture {
        let (transport, _handles) = RecordingTransport::new("room");
        let synthesis = SynthesisRelay::new(
            synthesizer.clone(),
            transport.audio_out.clone(),
            tracker.clone(),
        );
        let relay = CompletionRelay::new(
            service,
            MessageHistory::new("be brief", 4),
            tracker.clone(),
            transport.clone(),
        );
        Fixture {
            relay,
            synthesis,
            synthesizer,
            transport,
            tracker,
        }
    }

    #[tokio::test]
    async fn test_reply_chunks_reach_synthesis_and_chat() {
        // --- Arrange ---
        let service = Arc::new(ScriptedCompletion::new(vec![ScriptedCompletion::chunks(&[
            "Hel", "lo!",
        ])]));
        let f = fixture(service.clone());
        let job = f.synthesis.start().unwrap();

        // --- Act ---
        let outcome = f
            .relay
            .process(Reply::Model(Message::user("hi")), job, &CancellationToken::new())
            .await
            .unwrap();

        // --- Assert ---
        assert_eq!(outcome, CycleOutcome::Completed("Hello!".to_string()));
        assert_eq!(
            f.synthesizer.pushed_text(),
            vec!["Hel".to_string(), "lo!".to_string()]
        );
        assert_eq!(f.transport.chat_sent(), vec!["Hello!".to_string()]);
        assert_eq!(f.tracker.state(), ActivityState::Listening);

        let requests = service.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0][0], Message::system("be brief"));
        assert_eq!(requests[0][1], Message::user("hi"));

        let history = f.relay.history();
        assert_eq!(history, vec![Message::user("hi"), Message::agent("Hello!")]);
    }

    #[tokio::test]
    async fn test_processing_flips_once_per_cycle() {
        // --- Arrange ---
        let service = Arc::new(ScriptedCompletion::new(vec![
            ScriptedCompletion::chunks(&["Hel", "lo!"]),
            vec![Ok("Partial".to_string()), Err(anyhow::anyhow!("connection reset"))],
        ]));
        let tracker = Arc::new(ActivityTracker::new());
        let mut changes = tracker.changes();
        let f = fixture_full(tracker, service, Arc::new(ScriptedSynthesizer::silent()));

        // --- Act ---
        let job = f.synthesis.start().unwrap();
        f.relay
            .process(Reply::Model(Message::user("hi")), job, &CancellationToken::new())
            .await
            .unwrap();
        let job = f.synthesis.start().unwrap();
        let failed = f
            .relay
            .process(Reply::Model(Message::user("again")), job, &CancellationToken::new())
            .await;
        let job = f.synthesis.start().unwrap();
        let stream = futures::stream::iter(vec![Ok("Direct.".to_string())]).boxed();
        f.relay.relay(stream, job, &CancellationToken::new()).await.unwrap();

        // --- Assert ---
        assert!(failed.is_err());
        let mut seen = Vec::new();
        while let Ok(state) = changes.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                ActivityState::Thinking,
                ActivityState::Listening,
                ActivityState::Thinking,
                ActivityState::Listening,
                ActivityState::Thinking,
                ActivityState::Listening,
            ]
        );
        assert!(f.transport.audio_out.frames().is_empty());
    }

    #[tokio::test]
    async fn test_processing_is_set_before_the_first_chunk() {
        // --- Arrange ---
        let tracker = Arc::new(ActivityTracker::new());
        let seen_at_request = Arc::new(Mutex::new(Vec::new()));
        let mut service = MockCompletionService::new();
        {
            let tracker = tracker.clone();
            let seen_at_request = seen_at_request.clone();
            service
                .expect_complete()
                .returning(move |_| {
                    seen_at_request.lock().unwrap().push(tracker.state());
                    Ok(futures::stream::iter(vec![Ok("Hel".to_string()), Ok("lo!".to_string())])
                        .boxed())
                })
                .once();
        }
        let f = fixture_with(tracker, Arc::new(service));
        let job = f.synthesis.start().unwrap();

        // --- Act ---
        f.relay
            .process(Reply::Model(Message::user("hi")), job, &CancellationToken::new())
            .await
            .unwrap();

        // --- Assert ---
        assert_eq!(*seen_at_request.lock().unwrap(), vec![ActivityState::Thinking]);
        assert_eq!(f.tracker.state(), ActivityState::Listening);
        assert_eq!(f.transport.chat_sent().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_error_still_finalizes() {
        let service = Arc::new(ScriptedCompletion::new(vec![vec![
            Ok("Partial".to_string()),
            Err(anyhow::anyhow!("connection reset")),
        ]]));
        let f = fixture(service);
        let job = f.synthesis.start().unwrap();

        let result = f
            .relay
            .process(Reply::Model(Message::user("hi")), job, &CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert_eq!(f.tracker.state(), ActivityState::Listening);
        assert_eq!(f.transport.chat_sent(), vec!["Partial".to_string()]);
        // The partial answer was voiced but is not kept as context.
        assert_eq!(f.relay.history(), vec![Message::user("hi")]);
        assert_eq!(f.transport.audio_out.frames().len(), 1);
    }

    #[tokio::test]
    async fn test_relay_works_on_any_stream() {
        let mut service = MockCompletionService::new();
        service.expect_complete().never();
        let f = fixture(Arc::new(service));
        let job = f.synthesis.start().unwrap();
        let stream = futures::stream::iter(vec![Ok("One. ".to_string()), Ok("Two.".to_string())]).boxed();

        let outcome = f.relay.relay(stream, job, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, CycleOutcome::Completed("One. Two.".to_string()));
        assert_eq!(f.transport.chat_sent(), vec!["One. Two.".to_string()]);
        assert_eq!(f.transport.audio_out.frames().len(), 2);
        // Relaying alone never touches the history.
        assert!(f.relay.history().is_empty());
    }

    #[tokio::test]
    async fn test_request_failure_leaves_state_listening() {
        let mut service = MockCompletionService::new();
        service
            .expect_complete()
            .returning(|_| Err(anyhow::anyhow!("401 unauthorized")));
        let f = fixture(Arc::new(service));
        let job = f.synthesis.start().unwrap();

        let result = f
            .relay
            .process(Reply::Model(Message::user("hi")), job, &CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert_eq!(f.tracker.state(), ActivityState::Listening);
        assert!(f.transport.chat_sent().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_reply_skips_model_and_history() {
        let mut service = MockCompletionService::new();
        service.expect_complete().never();
        let f = fixture(Arc::new(service));
        let job = f.synthesis.start().unwrap();

        let outcome = f
            .relay
            .process(
                Reply::Scripted("Hey there!".to_string()),
                job,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, CycleOutcome::Completed("Hey there!".to_string()));
        assert_eq!(f.transport.chat_sent(), vec!["Hey there!".to_string()]);
        assert!(f.relay.history().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_cycle_publishes_nothing() {
        let mut service = MockCompletionService::new();
        service
            .expect_complete()
            .returning(|_| Ok(futures::stream::pending().boxed()));
        let f = fixture(Arc::new(service));
        let job = f.synthesis.start().unwrap();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let outcome = f
            .relay
            .process(Reply::Model(Message::user("hi")), job, &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, CycleOutcome::Cancelled);
        assert_eq!(f.tracker.state(), ActivityState::Listening);
        assert!(f.transport.chat_sent().is_empty());
        assert_eq!(f.relay.history()[0].role, Role::User);
    }
}
