//! PCM sample formats and amplitude normalization.

use serde::{Deserialize, Serialize};

/// Encoding of PCM samples inside a frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// Unsigned 8-bit, silence at 128
    #[default]
    Pcm8,
    /// Signed 16-bit little-endian
    Pcm16Le,
}

impl SampleFormat {
    /// Bytes per sample (the sample width)
    pub fn width(&self) -> usize {
        match self {
            Self::Pcm8 => 1,
            Self::Pcm16Le => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pcm8 => "pcm8",
            Self::Pcm16Le => "pcm16_le",
        }
    }

    /// Encode signed 16-bit samples into this format's byte layout.
    pub fn encode_i16(&self, samples: &[i16]) -> Vec<u8> {
        match self {
            Self::Pcm8 => samples
                .iter()
                .map(|&s| ((s as i32 >> 8) + 128) as u8)
                .collect(),
            Self::Pcm16Le => samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
        }
    }
}

/// Peak-normalize a PCM payload in place so its loudest sample reaches full scale.
///
/// Silent payloads are left untouched. The payload length never changes.
pub fn normalize_peak(pcm: &mut [u8], format: SampleFormat) {
    match format {
        SampleFormat::Pcm8 => {
            let peak = pcm
                .iter()
                .map(|&b| (b as i32 - 128).abs())
                .max()
                .unwrap_or(0);
            if peak == 0 || peak >= 127 {
                return;
            }
            let gain = 127.0 / peak as f32;
            for b in pcm.iter_mut() {
                let centered = (*b as i32 - 128) as f32 * gain;
                *b = (centered.round() as i32 + 128).clamp(0, 255) as u8;
            }
        }
        SampleFormat::Pcm16Le => {
            let peak = pcm
                .chunks_exact(2)
                .map(|c| (i16::from_le_bytes([c[0], c[1]]) as i32).abs())
                .max()
                .unwrap_or(0);
            if peak == 0 || peak >= i16::MAX as i32 {
                return;
            }
            let gain = i16::MAX as f32 / peak as f32;
            for c in pcm.chunks_exact_mut(2) {
                let sample = i16::from_le_bytes([c[0], c[1]]) as f32 * gain;
                let scaled = (sample.round() as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
                c.copy_from_slice(&scaled.to_le_bytes());
            }
        }
    }
}
