//! Retrieval-augmented prompting.
//!
//! An utterance is embedded, the similarity store is asked for the closest
//! community records, and the utterance is rewritten into a prompt that carries
//! those records as context. Retrieval is best effort: any failure falls back
//! to the plain utterance so the conversation keeps going.

use crate::completion::Embedder;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::fmt::Write as _;
use std::sync::Arc;

/// Minimum similarity a record needs to be included.
pub const MATCH_THRESHOLD: f32 = 0.30;
/// Maximum number of records included in a prompt.
pub const MATCH_COUNT: usize = 4;

/// Instructions placed ahead of the retrieved records.
pub const DEFAULT_PREAMBLE: &str = "One of your main goals is to help people build their ideas and connect them \
with other members of the community. You only have information on participants from previous seasons. \
Given the following records from previous seasons, answer using only that information when you are asked \
for recommendations, or to find or connect with people. If you are unsure and the answer is not explicitly \
provided in the records below, say \"Sorry, I can't find anyone to connect you with.\", then ask a clarifying \
question. Here are the closest matches from previous seasons:";

/// One record returned by the similarity store.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RetrievalMatch {
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub niche: String,
    #[serde(default, rename = "description", deserialize_with = "lenient_string")]
    pub summary: String,
    #[serde(default, rename = "youtube_transcript", deserialize_with = "lenient_string")]
    pub full_description: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub social: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub season: String,
}

impl RetrievalMatch {
    fn render_into(&self, out: &mut String) {
        // Writing into a String cannot fail.
        let _ = writeln!(out, "Title of Demo Day Submission: {}", self.title);
        let _ = writeln!(out, "Niche: {}", self.niche);
        let _ = writeln!(out, "Summary: {}", self.summary);
        let _ = writeln!(out, "Full Description: {}", self.full_description);
        let _ = writeln!(out, "Social: {}", self.social);
        let _ = writeln!(out, "Season: {}", self.season);
    }
}

// Records come from a loosely typed table: fields may be null or numeric.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("failed to embed utterance")]
    Embedding(#[source] anyhow::Error),
    #[error("similarity search failed")]
    Search(#[source] anyhow::Error),
}

/// The similarity-search boundary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    /// Returns at most `count` records scoring above `threshold`, best first.
    async fn match_records(
        &self,
        embedding: &[f32],
        threshold: f32,
        count: usize,
    ) -> Result<Vec<RetrievalMatch>>;
}

/// The prompt handed to the completion relay for one utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentedPrompt {
    pub text: String,
    pub match_count: usize,
    /// `false` when the utterance was passed through unmodified.
    pub augmented: bool,
}

impl AugmentedPrompt {
    pub fn passthrough(utterance: &str) -> Self {
        Self {
            text: utterance.to_string(),
            match_count: 0,
            augmented: false,
        }
    }
}

/// Builds the augmented prompt text: preamble, records in query order, then the utterance.
pub fn render_prompt(preamble: &str, matches: &[RetrievalMatch], utterance: &str) -> String {
    let mut text = String::with_capacity(preamble.len() + utterance.len() + 256 * matches.len());
    text.push_str(preamble.trim_end());
    text.push('\n');
    for record in matches {
        record.render_into(&mut text);
    }
    text.push_str("\nuser's message: ");
    text.push_str(utterance);
    text
}

pub struct RetrievalAugmenter {
    embedder: Arc<dyn Embedder>,
    search: Arc<dyn SimilaritySearch>,
    preamble: String,
}

impl RetrievalAugmenter {
    pub fn new(embedder: Arc<dyn Embedder>, search: Arc<dyn SimilaritySearch>) -> Self {
        Self {
            embedder,
            search,
            preamble: DEFAULT_PREAMBLE.to_string(),
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = preamble.into();
        self
    }

    /// Embeds the utterance and rewrites it with the matching records.
    ///
    /// An embedding with no result skips retrieval and returns the utterance unmodified.
    pub async fn try_augment(&self, utterance: &str) -> Result<AugmentedPrompt, RetrievalError> {
        let Some(embedding) = self
            .embedder
            .embed(utterance)
            .await
            .map_err(RetrievalError::Embedding)?
        else {
            tracing::debug!("no embedding for utterance, skipping retrieval");
            return Ok(AugmentedPrompt::passthrough(utterance));
        };

        let matches = self
            .search
            .match_records(&embedding, MATCH_THRESHOLD, MATCH_COUNT)
            .await
            .map_err(RetrievalError::Search)?;
        tracing::info!("retrieved {} matching records", matches.len());

        Ok(AugmentedPrompt {
            text: render_prompt(&self.preamble, &matches, utterance),
            match_count: matches.len(),
            augmented: true,
        })
    }

    /// Like [`try_augment`](Self::try_augment), but degrades any failure to the plain utterance.
    pub async fn augment(&self, utterance: &str) -> AugmentedPrompt {
        match self.try_augment(utterance).await {
            Ok(prompt) => prompt,
            Err(e) => {
                tracing::warn!("retrieval failed, continuing without context: {:?}", e);
                AugmentedPrompt::passthrough(utterance)
            }
        }
    }
}
