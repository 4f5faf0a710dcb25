use ringbuf::HeapRb;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::io::Cursor;

/// Sample rate of the raw PCM16 audio produced by speech synthesis.
pub const SYNTHESIS_PCM16_SAMPLE_RATE: f64 = 24000.0;
/// Sample rate used for speech recognition uploads.
pub const RECOGNITION_SAMPLE_RATE: u32 = 16000;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Splits a slice of audio samples into fixed-size chunks, zero-padding the last one.
pub fn split_for_chunks(samples: &[f32], chunk_size: usize) -> Vec<Vec<f32>> {
    samples
        .chunks(chunk_size)
        .map(|chunk| {
            let mut chunk = chunk.to_vec();
            chunk.resize(chunk_size, 0.0);
            chunk
        })
        .collect()
}

/// Runs `samples` through a mono resampler chunk by chunk.
pub fn resample(resampler: &mut FastFixedIn<f32>, samples: &[f32]) -> Vec<f32> {
    let mut out = Vec::new();
    let chunk_size = resampler.input_frames_next();
    for chunk in split_for_chunks(samples, chunk_size) {
        match resampler.process(&[chunk.as_slice()], None) {
            Ok(resampled) => {
                if let Some(channel) = resampled.first() {
                    out.extend_from_slice(channel);
                }
            }
            Err(e) => tracing::warn!("Failed to resample audio chunk: {:?}", e),
        }
    }
    out
}

/// Creates a new ring buffer on the heap for shared audio data.
pub fn shared_buffer(size: usize) -> HeapRb<f32> {
    HeapRb::new(size)
}

/// Averages interleaved channels into one.
pub fn downmix_to_mono(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|c| c.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Root mean square of the samples, normalized to 0.0..=1.0.
pub fn rms(pcm16: &[i16]) -> f32 {
    if pcm16.is_empty() {
        return 0.0;
    }
    let sum: f64 = pcm16
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    (sum / pcm16.len() as f64).sqrt() as f32
}

/// Reassembles little-endian PCM16 samples from byte chunks that may split a sample.
#[derive(Debug, Default)]
pub struct Pcm16Decoder {
    carry: Option<u8>,
}

impl Pcm16Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<i16> {
        let mut samples = Vec::with_capacity(bytes.len() / 2 + 1);
        let mut rest = bytes;
        if let Some(low) = self.carry.take() {
            match rest.split_first() {
                Some((&high, tail)) => {
                    samples.push(i16::from_le_bytes([low, high]));
                    rest = tail;
                }
                None => {
                    self.carry = Some(low);
                    return samples;
                }
            }
        }
        let mut pairs = rest.chunks_exact(2);
        samples.extend(pairs.by_ref().map(|pair| i16::from_le_bytes([pair[0], pair[1]])));
        self.carry = pairs.remainder().first().copied();
        samples
    }
}

/// Encodes mono PCM16 samples as an in-memory WAV file.
pub fn encode_wav(pcm16: &[i16], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in pcm16 {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
