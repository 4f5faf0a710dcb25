use crate::transport::Transport;
use anyhow::Result;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// The coarse, externally observable label summarizing the agent's internal flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl ActivityState {
    /// Speaking wins over thinking, thinking over listening.
    pub fn from_flags(sending_audio: bool, processing: bool) -> Self {
        if sending_audio {
            ActivityState::Speaking
        } else if processing {
            ActivityState::Thinking
        } else {
            ActivityState::Listening
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityState::Idle => "idle",
            ActivityState::Listening => "listening",
            ActivityState::Thinking => "thinking",
            ActivityState::Speaking => "speaking",
        }
    }
}

#[derive(Serialize)]
struct AgentMetadata {
    agent_state: ActivityState,
}

/// Serializes a state the way it is published as participant metadata.
pub fn metadata_json(state: ActivityState) -> Result<String> {
    Ok(serde_json::to_string(&AgentMetadata { agent_state: state })?)
}

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    sending_audio: bool,
    processing: bool,
}

#[derive(Default)]
struct Inner {
    flags: Flags,
    listeners: Vec<mpsc::UnboundedSender<ActivityState>>,
}

/// Holds the two flags every stage reports into and derives one [`ActivityState`] from them.
///
/// Stages run on a multi-threaded runtime, so flag mutation and recomputation
/// happen under one lock. When the derived value changes it is stored in a
/// `watch` channel for readers of the latest state, and queued in order for
/// every [`changes`](Self::changes) receiver.
pub struct ActivityTracker {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ActivityState>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    /// Starts out `Idle` until the first flag update.
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ActivityState::Idle);
        Self {
            inner: Mutex::new(Inner::default()),
            state_tx,
        }
    }

    /// Updates the given flags (last write wins) and returns the derived state.
    pub fn set_flags(&self, sending_audio: Option<bool>, processing: Option<bool>) -> ActivityState {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let flags = &mut inner.flags;
        if let Some(sending_audio) = sending_audio {
            flags.sending_audio = sending_audio;
        }
        if let Some(processing) = processing {
            flags.processing = processing;
        }
        let flags = *flags;
        let state = ActivityState::from_flags(flags.sending_audio, flags.processing);

        // Publishing under the lock keeps observers in the same order as the writes.
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            inner.listeners.retain(|listener| listener.send(state).is_ok());
            tracing::debug!(
                sending_audio = flags.sending_audio,
                processing = flags.processing,
                "agent state -> {}",
                state.as_str()
            );
        }
        state
    }

    pub fn set_sending_audio(&self, sending_audio: bool) -> ActivityState {
        self.set_flags(Some(sending_audio), None)
    }

    pub fn set_processing(&self, processing: bool) -> ActivityState {
        self.set_flags(None, Some(processing))
    }

    /// Recomputes the state from the current flags.
    pub fn refresh(&self) -> ActivityState {
        self.set_flags(None, None)
    }

    pub fn state(&self) -> ActivityState {
        *self.state_tx.borrow()
    }

    /// Latest-value view of the state. Intermediate states may be skipped.
    pub fn subscribe(&self) -> watch::Receiver<ActivityState> {
        self.state_tx.subscribe()
    }

    /// Every state change from now on, in the order it happened.
    pub fn changes(&self) -> mpsc::UnboundedReceiver<ActivityState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .push(tx);
        rx
    }
}

/// Forwards every state change to the transport as participant metadata.
///
/// Publication is fire-and-forget: failures are logged and the task keeps going.
pub fn spawn_metadata_publisher(
    tracker: &ActivityTracker,
    transport: Arc<dyn Transport>,
) -> JoinHandle<()> {
    let mut changes = tracker.changes();
    tokio::spawn(async move {
        while let Some(state) = changes.recv().await {
            let metadata = match metadata_json(state) {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::error!("failed to serialize agent state: {}", e);
                    continue;
                }
            };
            if let Err(e) = transport.update_metadata(&metadata).await {
                tracing::warn!("failed to publish agent state {}: {:?}", state.as_str(), e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;
    use std::time::Duration;

    #[test]
    fn test_state_is_a_function_of_flags() {
        assert_eq!(ActivityState::from_flags(false, false), ActivityState::Listening);
        assert_eq!(ActivityState::from_flags(false, true), ActivityState::Thinking);
        assert_eq!(ActivityState::from_flags(true, false), ActivityState::Speaking);
        assert_eq!(ActivityState::from_flags(true, true), ActivityState::Speaking);
    }

    #[test]
    fn test_tracker_starts_idle() {
        let tracker = ActivityTracker::new();
        assert_eq!(tracker.state(), ActivityState::Idle);
        assert_eq!(tracker.refresh(), ActivityState::Listening);
    }

    #[test]
    fn test_final_state_does_not_depend_on_call_order() {
        let a = ActivityTracker::new();
        a.set_processing(true);
        a.set_sending_audio(true);
        a.set_processing(false);

        let b = ActivityTracker::new();
        b.set_sending_audio(true);
        b.set_processing(false);

        assert_eq!(a.state(), b.state());
        assert_eq!(a.state(), ActivityState::Speaking);
    }

    #[test]
    fn test_unchanged_flags_emit_no_transition() {
        let tracker = ActivityTracker::new();
        tracker.set_processing(true);
        let mut state_rx = tracker.subscribe();

        tracker.set_processing(true);
        tracker.set_flags(None, None);
        assert!(!state_rx.has_changed().unwrap());

        tracker.set_processing(false);
        assert!(state_rx.has_changed().unwrap());
        assert_eq!(*state_rx.borrow_and_update(), ActivityState::Listening);
    }

    #[test]
    fn test_metadata_json_uses_lowercase_state() {
        assert_eq!(
            metadata_json(ActivityState::Thinking).unwrap(),
            r#"{"agent_state":"thinking"}"#
        );
    }

    #[tokio::test]
    async fn test_publisher_forwards_state_changes() {
        // --- Arrange ---
        let tracker = ActivityTracker::new();
        let (transport, _handles) = RecordingTransport::new("room");
        let publisher = spawn_metadata_publisher(&tracker, transport.clone());

        // --- Act ---
        tracker.set_processing(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.set_processing(false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.abort();

        // --- Assert ---
        assert_eq!(
            transport.metadata(),
            vec![
                r#"{"agent_state":"thinking"}"#.to_string(),
                r#"{"agent_state":"listening"}"#.to_string(),
            ]
        );
    }

    #[test]
    fn test_changes_keep_every_transition_in_order() {
        let tracker = ActivityTracker::new();
        let mut changes = tracker.changes();

        tracker.refresh();
        tracker.set_processing(true);
        tracker.set_sending_audio(true);
        tracker.set_processing(false);
        tracker.set_sending_audio(false);

        let mut seen = Vec::new();
        while let Ok(state) = changes.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                ActivityState::Listening,
                ActivityState::Thinking,
                ActivityState::Speaking,
                ActivityState::Listening,
            ]
        );
    }

    #[tokio::test]
    async fn test_publisher_sends_back_to_back_changes() {
        // --- Arrange ---
        let tracker = ActivityTracker::new();
        let (transport, _handles) = RecordingTransport::new("room");
        let publisher = spawn_metadata_publisher(&tracker, transport.clone());

        // --- Act ---
        tracker.refresh();
        tracker.set_processing(true);
        tracker.set_sending_audio(true);
        tracker.set_processing(false);
        tracker.set_sending_audio(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher.abort();

        // --- Assert ---
        assert_eq!(
            transport.metadata(),
            vec![
                r#"{"agent_state":"listening"}"#.to_string(),
                r#"{"agent_state":"thinking"}"#.to_string(),
                r#"{"agent_state":"speaking"}"#.to_string(),
                r#"{"agent_state":"listening"}"#.to_string(),
            ]
        );
    }
}
