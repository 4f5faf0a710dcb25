use anyhow::{Context, Result};
use clap::Parser;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FrameCount, StreamConfig};
use dialogue_agent::config::{Config, INPUT_CHUNK_SIZE, OUTPUT_CHUNK_SIZE, OUTPUT_LATENCY_MS};
use dialogue_agent::local_room::{self, LOCAL_PARTICIPANT, LOCAL_TRACK_SID, LocalRoom, SpeakerSource};
use dialogue_agent::openai_tts::OpenAiSynthesizer;
use dialogue_agent::prompt_loader::Prompts;
use dialogue_agent::whisper::WhisperSpeechToText;
use dialogue_core::synthesis::SpeechSynthesizer;
use dialogue_core::{
    MessageHistory, OpenAiClient, RemoteAudioTrack, RetrievalAugmenter, Services, Session,
    SessionConfig, SupabaseSearch,
};
use dialogue_native_utils::{audio, device};
use ringbuf::traits::Split;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
#[command(version, about = "Voice agent for a local room")]
struct Cli {
    /// Room name. Names starting with "sip" get the phone greeting.
    #[arg(long, default_value = "local")]
    room: String,
    /// Microphone to use instead of the default input device.
    #[arg(long)]
    input_device: Option<String>,
    /// Speaker to use instead of the default output device.
    #[arg(long)]
    output_device: Option<String>,
    /// Print the available audio devices and exit.
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    // --- 3. Parse Command-Line Arguments ---
    let args = Cli::parse();
    if args.list_devices {
        println!("Input devices:\n{}", device::get_available_inputs()?);
        println!("Output devices:\n{}", device::get_available_outputs()?);
        return Ok(());
    }

    tracing::info!("Configuration loaded successfully. Starting agent in room {:?}...", args.room);

    // --- 4. Load Prompts ---
    let prompts = Prompts::load(&config.prompts_dir).context("Failed to load prompts")?;

    // --- 5. Initialize API Clients ---
    let openai = OpenAiClient::new(config.openai_api_key.clone())
        .with_chat_model(&config.chat_model)
        .with_embedding_model(&config.embedding_model);
    let synthesizer = Arc::new(OpenAiSynthesizer::new(
        openai.clone(),
        &config.tts_model,
        &config.tts_voice,
    ));
    let speech_to_text = Arc::new(WhisperSpeechToText::new(openai.clone(), &config.stt_model));
    let augmenter = match &config.supabase {
        Some(supabase) => {
            let search = SupabaseSearch::new(&supabase.url, supabase.service_key.clone());
            Some(
                RetrievalAugmenter::new(Arc::new(openai.clone()), Arc::new(search))
                    .with_preamble(prompts.retrieval.clone()),
            )
        }
        None => {
            tracing::warn!("SUPABASE_URL not set, retrieval is disabled");
            None
        }
    };

    // --- 6. Audio Input ---
    let input = device::get_or_default_input(args.input_device.clone())
        .context("Failed to get audio input device")?;
    tracing::info!("Using input device: {:?}", &input.name()?);
    for config in input.supported_input_configs()? {
        tracing::debug!("Supported input config: {:?}", config);
    }
    let input_config = input
        .default_input_config()
        .context("Failed to get default input config")?;
    let input_config = StreamConfig {
        channels: input_config.channels(),
        sample_rate: input_config.sample_rate(),
        buffer_size: cpal::BufferSize::Fixed(FrameCount::from(INPUT_CHUNK_SIZE as u32)),
    };
    let input_channel_count = input_config.channels as usize;
    let input_sample_rate = input_config.sample_rate.0;
    tracing::info!("Input stream config: {:?}", &input_config);

    let (mic_tx, mic_rx) = tokio::sync::mpsc::channel::<Vec<f32>>(1024);
    let input_data_fn = move |data: &[f32], _: &cpal::InputCallbackInfo| {
        let audio = audio::downmix_to_mono(data, input_channel_count);
        if let Err(e) = mic_tx.try_send(audio) {
            tracing::warn!("Failed to send audio data to buffer: {:?}", e);
        }
    };
    let input_stream = input.build_input_stream(
        &input_config,
        input_data_fn,
        move |err| tracing::error!("An error occurred on input stream: {}", err),
        None,
    )?;
    input_stream.play()?;

    // --- 7. Audio Output ---
    let output = device::get_or_default_output(args.output_device.clone())
        .context("Failed to get audio output device")?;
    tracing::info!("Using output device: {:?}", &output.name()?);
    let output_config = output
        .default_output_config()
        .context("Failed to get default output config")?;
    let output_config = StreamConfig {
        channels: output_config.channels(),
        sample_rate: output_config.sample_rate(),
        buffer_size: cpal::BufferSize::Fixed(FrameCount::from(OUTPUT_CHUNK_SIZE as u32)),
    };
    let output_channel_count = output_config.channels as usize;
    let output_sample_rate = output_config.sample_rate.0;
    tracing::info!("Output stream config: {:?}", &output_config);

    let audio_out_buffer =
        audio::shared_buffer(output_sample_rate as usize * OUTPUT_LATENCY_MS / 1000);
    let (audio_out_tx, mut audio_out_rx) = audio_out_buffer.split();
    let output_data_fn = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
        local_room::fill_output(data, output_channel_count, &mut audio_out_rx);
    };
    let output_stream = output.build_output_stream(
        &output_config,
        output_data_fn,
        move |err| tracing::error!("An error occurred on output stream: {}", err),
        None,
    )?;
    output_stream.play()?;

    // --- 8. Room ---
    let speaker = Arc::new(SpeakerSource::new(
        audio_out_tx,
        synthesizer.sample_rate(),
        output_sample_rate,
    )?);
    let (room, handles) = LocalRoom::new(&args.room, speaker);

    let (frames_tx, frames_rx) = tokio::sync::mpsc::channel(64);
    let microphone = tokio::spawn(local_room::pump_microphone(
        mic_rx,
        input_sample_rate,
        frames_tx,
    ));
    handles
        .track_tx
        .send(RemoteAudioTrack::new(LOCAL_TRACK_SID, LOCAL_PARTICIPANT, frames_rx))
        .await
        .context("Failed to announce microphone track")?;

    let chat_input = tokio::spawn(local_room::forward_chat_lines(
        tokio::io::BufReader::new(tokio::io::stdin()),
        handles.chat_tx.clone(),
    ));
    drop(handles);

    // --- 9. Session ---
    let session = Session::new(
        Services {
            transport: Arc::new(room),
            speech_to_text,
            synthesizer,
            completion: Arc::new(openai),
            augmenter,
        },
        MessageHistory::new(prompts.system, config.message_capacity),
        SessionConfig {
            intro: prompts.intro,
            sip_intro: prompts.sip_intro,
            ..SessionConfig::default()
        },
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
            tracing::info!("Received Ctrl-C, shutting down...");
            shutdown.cancel();
        }
    });

    let result = session.run(shutdown).await;

    tracing::info!("Shutting down...");
    microphone.abort();
    chat_input.abort();
    drop(input_stream);
    drop(output_stream);
    result
}
