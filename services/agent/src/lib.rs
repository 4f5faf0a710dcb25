pub mod config;
pub mod local_room;
pub mod openai_tts;
pub mod prompt_loader;
pub mod whisper;
