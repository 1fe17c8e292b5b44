use super::CaptureSource;
use crate::error::CaptureError;
use crate::frame::SampleFormat;
use crate::session::SessionConfig;
use hound::WavReader;
use std::collections::VecDeque;
use std::path::Path;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{info, warn};

/// Streams a WAV file as fixed-size frames in a session's PCM format.
///
/// The last partial frame is padded with silence. With pacing enabled,
/// frames are released at the session's hop interval like a live device.
pub struct WavFileSource {
    path: String,
    frames: VecDeque<Vec<u8>>,
    pacer: Option<Interval>,
}

impl WavFileSource {
    pub fn open(
        path: impl AsRef<Path>,
        config: &SessionConfig,
        paced: bool,
    ) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path)?;
        let spec = reader.spec();

        if spec.channels as u32 != config.channels {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{} has {} channels, session expects {}",
                path.display(),
                spec.channels,
                config.channels
            )));
        }
        if spec.sample_rate != config.sample_rate_hz {
            warn!(
                "{} is {}Hz but session runs at {}Hz; streaming without resampling",
                path.display(),
                spec.sample_rate,
                config.sample_rate_hz
            );
        }

        let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Int, 8) => reader
                .into_samples::<i8>()
                .map(|s| s.map(|v| (v as i16) << 8))
                .collect::<Result<_, _>>()?,
            (hound::SampleFormat::Int, 16) => {
                reader.into_samples::<i16>().collect::<Result<_, _>>()?
            }
            (hound::SampleFormat::Float, 32) => reader
                .into_samples::<f32>()
                .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
                .collect::<Result<_, _>>()?,
            (format, bits) => {
                return Err(CaptureError::ReadFailed(format!(
                    "unsupported WAV encoding: {bits}-bit {format:?}"
                )))
            }
        };

        let bytes = config.sample_format.encode_i16(&samples);
        let frames = split_frames(&bytes, config.frame_bytes(), config.sample_format);

        info!(
            "Audio file loaded: {} samples, {}Hz, {} channels -> {} frames",
            samples.len(),
            spec.sample_rate,
            spec.channels,
            frames.len()
        );

        let pacer = paced.then(|| {
            let mut pacer = interval(config.hop_duration());
            pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            pacer
        });

        Ok(Self {
            path: path.display().to_string(),
            frames,
            pacer,
        })
    }

    /// Frames not yet read
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

fn split_frames(bytes: &[u8], frame_bytes: usize, format: SampleFormat) -> VecDeque<Vec<u8>> {
    let silence = match format {
        SampleFormat::Pcm8 => 128u8,
        SampleFormat::Pcm16Le => 0u8,
    };
    bytes
        .chunks(frame_bytes.max(1))
        .map(|chunk| {
            let mut frame = chunk.to_vec();
            frame.resize(frame_bytes, silence);
            frame
        })
        .collect()
}

#[async_trait::async_trait]
impl CaptureSource for WavFileSource {
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        if self.frames.is_empty() {
            return Ok(None);
        }
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.tick().await;
        }
        Ok(self.frames.pop_front())
    }

    fn name(&self) -> &str {
        &self.path
    }
}
