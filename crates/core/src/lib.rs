pub mod activity;
pub mod completion;
pub mod history;
pub mod openai;
pub mod retrieval;
pub mod session;
pub mod speech;
pub mod stream;
pub mod supabase;
pub mod synthesis;
pub mod transcript;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use activity::{ActivityState, ActivityTracker};
pub use completion::{CompletionRelay, CompletionService, CycleOutcome, Embedder, Reply};
pub use history::{Message, MessageHistory, Role};
pub use openai::OpenAiClient;
pub use retrieval::{AugmentedPrompt, RetrievalAugmenter, RetrievalError, RetrievalMatch, SimilaritySearch};
pub use session::{Services, Session, SessionConfig};
pub use speech::{AudioInput, RecognitionStream, SpeechEvent, SpeechToText};
pub use supabase::SupabaseSearch;
pub use synthesis::{SpeechSynthesizer, SynthesisEvent, SynthesisJob, SynthesisRelay, SynthesisStream, TextInput};
pub use transport::{AudioFrame, AudioSource, ChatMessage, RemoteAudioTrack, Subscription, Transport};

/// Represents the inputs that can start a response cycle.
///
/// Every cycle runs utterance/message → (retrieval) → completion → synthesis →
/// audio output. The session owns at most one running cycle at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// A finalized utterance from the participant's audio. Goes through retrieval.
    Utterance(String),
    /// A chat message typed by the participant. Skips transcription and retrieval.
    Chat(String),
    /// The fixed greeting spoken once at session start. Never sent to the model.
    Introduction(String),
}
