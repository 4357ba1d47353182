//! Local speech-to-text with whisper.cpp.
//!
//! Segments arrive as Ogg/Opus at Discord's 48kHz stereo.  Whisper wants
//! 16kHz mono f32, so we unwrap the container, decode the opus, downmix
//! and resample before handing it over.

use std::{io::Cursor, path::Path, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use rubato::{
    calculate_cutoff, Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use tracing::debug;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext};

use crate::{
    api::collaborators::SpeechToText,
    error::{Error, Result},
    model::types::{DISCORD_AUDIO_CHANNELS, DISCORD_SAMPLES_PER_SECOND},
};

pub const WHISPER_SAMPLES_PER_SECOND: u32 = 16000;

/// longest opus frame is 120ms
const MAX_OPUS_FRAME_SAMPLES: usize = 5760;

const RESAMPLER_CHUNK: usize = 1024;

pub struct WhisperTranscriber {
    whisper_context: Arc<WhisperContext>,
}

impl WhisperTranscriber {
    /// Load a model from the given path
    pub fn load(model_path: impl AsRef<Path>) -> Result<Self> {
        let path = model_path.as_ref();
        if !path.is_file() {
            return Err(Error::Transcription(format!(
                "model is not a file: {}",
                path.display()
            )));
        }
        let path_str = path
            .to_str()
            .ok_or_else(|| Error::Transcription("model path is not utf-8".to_string()))?;
        let whisper_context = WhisperContext::new(path_str)
            .map_err(|e| Error::Transcription(format!("failed to load model: {:?}", e)))?;
        Ok(Self {
            whisper_context: Arc::new(whisper_context),
        })
    }

    /// This will take a long time to run, don't call it
    /// on a tokio event thread.
    fn audio_to_text(whisper_context: &WhisperContext, audio: Bytes) -> Result<String> {
        let stereo = decode_ogg_opus(&audio)?;
        let mono = downmix(&stereo);
        let samples = resample(&mono, DISCORD_SAMPLES_PER_SECOND, WHISPER_SAMPLES_PER_SECOND)?;
        if samples.is_empty() {
            return Ok(String::new());
        }

        let whisper_error = |e| Error::Transcription(format!("{:?}", e));
        let mut state = whisper_context.create_state().map_err(whisper_error)?;

        // actually convert audio to text.  Takes a while.
        state.full(make_params(), &samples).map_err(whisper_error)?;

        let num_segments = state.full_n_segments().map_err(whisper_error)?;
        let mut text = String::new();
        for i in 0..num_segments {
            text.push_str(&state.full_get_segment_text(i).map_err(whisper_error)?);
        }
        debug!(segments = num_segments, "whisper finished");
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl SpeechToText for WhisperTranscriber {
    async fn transcribe(&self, audio: Bytes) -> Result<String> {
        let whisper_context = self.whisper_context.clone();
        tokio::task::spawn_blocking(move || Self::audio_to_text(&whisper_context, audio))
            .await
            .map_err(|e| Error::Transcription(format!("whisper task failed: {}", e)))?
    }
}

fn make_params() -> FullParams<'static, 'static> {
    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });

    params.set_print_special(false);
    params.set_print_progress(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);
    params.set_suppress_blank(true);

    params
}

/// The opus packets of an Ogg/Opus stream, without the two header packets.
fn opus_packets(audio: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut reader = ogg::PacketReader::new(Cursor::new(audio));
    let mut packets = Vec::new();
    let mut index = 0;
    while let Some(packet) = reader
        .read_packet()
        .map_err(|e| Error::Transcription(format!("bad ogg stream: {}", e)))?
    {
        // OpusHead, then OpusTags
        if index >= 2 {
            packets.push(packet.data);
        }
        index += 1;
    }
    Ok(packets)
}

/// Interleaved stereo f32 at 48kHz.
fn decode_ogg_opus(audio: &[u8]) -> Result<Vec<f32>> {
    let opus_error = |e: opus::Error| Error::Transcription(format!("opus: {}", e));
    let mut decoder =
        opus::Decoder::new(DISCORD_SAMPLES_PER_SECOND, opus::Channels::Stereo).map_err(opus_error)?;
    let channels = DISCORD_AUDIO_CHANNELS as usize;
    let mut frame = vec![0.0f32; MAX_OPUS_FRAME_SAMPLES * channels];
    let mut pcm = Vec::new();
    for packet in opus_packets(audio)? {
        let samples = decoder
            .decode_float(&packet, &mut frame, false)
            .map_err(opus_error)?;
        pcm.extend_from_slice(&frame[..samples * channels]);
    }
    Ok(pcm)
}

fn downmix(stereo: &[f32]) -> Vec<f32> {
    stereo
        .chunks_exact(DISCORD_AUDIO_CHANNELS as usize)
        .map(|pair| (pair[0] + pair[1]) / 2.0)
        .collect()
}

fn resample(data: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if data.is_empty() || from_rate == to_rate {
        return Ok(data.to_vec());
    }
    let resample_error = |e: rubato::ResampleError| Error::Transcription(format!("resample: {}", e));
    let ratio = to_rate as f64 / from_rate as f64;

    // increase this to increase f_cutoff through weird estimate math
    let sinc_len = 128;
    let window = WindowFunction::Blackman2;
    let mut resampler = SincFixedIn::<f32>::new(
        ratio,
        1.0,
        SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        },
        RESAMPLER_CHUNK,
        1,
    )
    .map_err(|e| Error::Transcription(format!("resampler: {}", e)))?;

    let expected = (data.len() as f64 * ratio).ceil() as usize;
    let mut out = Vec::with_capacity(expected + RESAMPLER_CHUNK);
    let mut chunks = data.chunks_exact(RESAMPLER_CHUNK);
    for chunk in &mut chunks {
        let mut waves = resampler.process(&[chunk], None).map_err(resample_error)?;
        out.append(&mut waves[0]);
    }
    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let mut waves = resampler
            .process_partial(Some(&[remainder]), None)
            .map_err(resample_error)?;
        out.append(&mut waves[0]);
    }
    // flush what the filter is still holding
    while out.len() < expected {
        let mut waves = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(resample_error)?;
        if waves[0].is_empty() {
            break;
        }
        out.append(&mut waves[0]);
    }

    // the filter delays its output, drop that lead-in
    let delay = resampler.output_delay().min(out.len());
    out.drain(..delay);
    out.truncate(expected);
    Ok(out)
}
