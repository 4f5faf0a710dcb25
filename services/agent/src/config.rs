//! Application Configuration Module
//!
//! Loads settings for the agent service from environment variables (and a
//! `.env` file when present) into one struct passed to `main`.

use secrecy::SecretString;
use std::env;
use std::path::PathBuf;
use tracing::Level;

// --- Application Constants ---

/// The size of each audio chunk delivered by the microphone input stream.
pub const INPUT_CHUNK_SIZE: usize = 1024;
/// The size of each audio chunk for the audio output stream.
pub const OUTPUT_CHUNK_SIZE: usize = 1024;
/// The latency for the output audio buffer in milliseconds.
pub const OUTPUT_LATENCY_MS: usize = 250;

pub const DEFAULT_CHAT_MODEL: &str = "gpt-4-1106-preview";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
pub const DEFAULT_STT_MODEL: &str = "whisper-1";
pub const DEFAULT_TTS_MODEL: &str = "tts-1";
pub const DEFAULT_TTS_VOICE: &str = "alloy";
pub const DEFAULT_PROMPTS_DIR: &str = "prompts";

/// Credentials for the similarity store.
#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub service_key: SecretString,
}

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: SecretString,
    /// `None` runs the agent without retrieval.
    pub supabase: Option<SupabaseConfig>,
    pub chat_model: String,
    pub embedding_model: String,
    pub stt_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub message_capacity: usize,
    pub prompts_dir: PathBuf,
    pub log_level: Level,
}

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
    #[error("Invalid value for {var}: {value}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("SUPABASE_URL and SUPABASE_SERVICE_KEY must be set together")]
    IncompleteSupabase,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `OPENAI_API_KEY`: Secret key for the OpenAI API. Required.
    // *   `SUPABASE_URL`, `SUPABASE_SERVICE_KEY`: (Optional) The similarity store. Retrieval is off without them.
    // *   `CHAT_MODEL`, `EMBEDDING_MODEL`, `STT_MODEL`, `TTS_MODEL`, `TTS_VOICE`: (Optional) Model overrides.
    // *   `MESSAGE_CAPACITY`: (Optional) Conversation window size. Defaults to 20.
    // *   `PROMPTS_DIR`: (Optional) Directory of prompt files. Defaults to "prompts".
    // *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file. This is useful for local development and is ignored if not present.
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let or_default = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let openai_api_key = var("OPENAI_API_KEY")
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let supabase = match (var("SUPABASE_URL"), var("SUPABASE_SERVICE_KEY")) {
            (Some(url), Some(key)) => Some(SupabaseConfig {
                url,
                service_key: SecretString::from(key),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteSupabase),
        };

        let message_capacity = match var("MESSAGE_CAPACITY") {
            Some(value) => match value.trim().parse::<usize>() {
                Ok(capacity) if capacity > 0 => capacity,
                _ => {
                    return Err(ConfigError::InvalidNumber {
                        var: "MESSAGE_CAPACITY",
                        value,
                    });
                }
            },
            None => dialogue_core::history::DEFAULT_MESSAGE_CAPACITY,
        };

        // Configure logging level from RUST_LOG, with a sensible default.
        let log_level_str = or_default("RUST_LOG", "INFO");
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            openai_api_key,
            supabase,
            chat_model: or_default("CHAT_MODEL", DEFAULT_CHAT_MODEL),
            embedding_model: or_default("EMBEDDING_MODEL", DEFAULT_EMBEDDING_MODEL),
            stt_model: or_default("STT_MODEL", DEFAULT_STT_MODEL),
            tts_model: or_default("TTS_MODEL", DEFAULT_TTS_MODEL),
            tts_voice: or_default("TTS_VOICE", DEFAULT_TTS_VOICE),
            message_capacity,
            prompts_dir: PathBuf::from(or_default("PROMPTS_DIR", DEFAULT_PROMPTS_DIR)),
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_with_only_api_key() {
        // --- Act ---
        let config = Config::from_lookup(lookup(&[("OPENAI_API_KEY", "sk-test")])).unwrap();

        // --- Assert ---
        assert_eq!(config.openai_api_key.expose_secret(), "sk-test");
        assert!(config.supabase.is_none());
        assert_eq!(config.chat_model, DEFAULT_CHAT_MODEL);
        assert_eq!(config.embedding_model, DEFAULT_EMBEDDING_MODEL);
        assert_eq!(config.tts_voice, DEFAULT_TTS_VOICE);
        assert_eq!(config.message_capacity, 20);
        assert_eq!(config.prompts_dir, PathBuf::from("prompts"));
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    fn test_missing_api_key() {
        let result = Config::from_lookup(lookup(&[("OPENAI_API_KEY", "  ")]));

        assert!(matches!(result, Err(ConfigError::MissingVar(var)) if var == "OPENAI_API_KEY"));
    }

    #[test]
    fn test_supabase_requires_both_values() {
        let result = Config::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("SUPABASE_URL", "https://project.supabase.co"),
        ]));
        assert!(matches!(result, Err(ConfigError::IncompleteSupabase)));

        let config = Config::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("SUPABASE_URL", "https://project.supabase.co"),
            ("SUPABASE_SERVICE_KEY", "service"),
        ]))
        .unwrap();
        let supabase = config.supabase.unwrap();
        assert_eq!(supabase.url, "https://project.supabase.co");
        assert_eq!(supabase.service_key.expose_secret(), "service");
    }

    #[test]
    fn test_invalid_values() {
        let capacity = Config::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("MESSAGE_CAPACITY", "0"),
        ]));
        assert!(matches!(
            capacity,
            Err(ConfigError::InvalidNumber { var: "MESSAGE_CAPACITY", .. })
        ));

        let level = Config::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("RUST_LOG", "chatty"),
        ]));
        assert!(matches!(level, Err(ConfigError::InvalidLogLevel(_))));
    }
}
