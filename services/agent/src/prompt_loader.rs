use anyhow::{Context, Result};
use dialogue_core::retrieval::DEFAULT_PREAMBLE;
use dialogue_core::session::{DEFAULT_INTRO, DEFAULT_SIP_INTRO};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly voice assistant that connects the members of a \
builder community with each other. Keep the conversation personable and ask follow-up questions. End \
every question with a question mark. Never answer with more than a few sentences.";

pub fn load_prompts(dir_path: &Path) -> Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();

    for entry in fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read prompts directory: {}", dir_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem for prompt file")?
                .to_string();

            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;

            prompts.insert(prompt_key, content);
        }
    }

    Ok(prompts)
}

/// The texts the agent speaks or sends to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompts {
    pub system: String,
    pub intro: String,
    pub sip_intro: String,
    pub retrieval: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM_PROMPT.to_string(),
            intro: DEFAULT_INTRO.to_string(),
            sip_intro: DEFAULT_SIP_INTRO.to_string(),
            retrieval: DEFAULT_PREAMBLE.to_string(),
        }
    }
}

impl Prompts {
    /// Takes `system`, `intro`, `sip_intro` and `retrieval` from `loaded`; missing or blank keys keep their defaults.
    pub fn from_map(mut loaded: HashMap<String, String>) -> Self {
        let mut take = |key: &str, default: String| match loaded.remove(key) {
            Some(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => default,
        };
        let defaults = Self::default();
        Self {
            system: take("system", defaults.system),
            intro: take("intro", defaults.intro),
            sip_intro: take("sip_intro", defaults.sip_intro),
            retrieval: take("retrieval", defaults.retrieval),
        }
    }

    /// Loads prompts from `dir_path`, falling back to the built-in texts when the directory is absent.
    pub fn load(dir_path: &Path) -> Result<Self> {
        if !dir_path.exists() {
            tracing::warn!(
                "Prompts directory {} not found, using built-in prompts",
                dir_path.display()
            );
            return Ok(Self::default());
        }
        let loaded = load_prompts(dir_path)?;
        tracing::info!("Loaded {} prompts successfully.", loaded.len());
        Ok(Self::from_map(loaded))
    }
}
