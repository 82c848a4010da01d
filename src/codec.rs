use thiserror::Error;

use crate::audio::AudioFormat;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("encoding failed: {0}")]
    Encode(String),
    #[error("unsupported format: {0}")]
    Unsupported(String),
}

/// Compression capability for fixed-size interleaved PCM frames.
///
/// One instance serves one direction; encoder and decoder state are never shared.
pub trait AudioCodec: Send {
    fn name(&self) -> &'static str;

    fn compress(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError>;

    fn decompress(&mut self, payload: &[u8]) -> Result<Vec<i16>, CodecError>;

    /// Produce a replacement frame for a lost packet
    fn conceal(&mut self) -> Result<Vec<i16>, CodecError>;
}

/// Uncompressed 16-bit little-endian PCM
pub struct PcmCodec {
    frame_len: usize,
}

impl PcmCodec {
    pub fn new(format: AudioFormat) -> Self {
        Self { frame_len: format.frame_len() }
    }
}

impl AudioCodec for PcmCodec {
    fn name(&self) -> &'static str {
        "pcm"
    }

    fn compress(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        if pcm.len() != self.frame_len {
            return Err(CodecError::Encode(format!(
                "frame has {} samples, expected {}", pcm.len(), self.frame_len
            )));
        }
        Ok(pcm.iter().flat_map(|s| s.to_le_bytes()).collect())
    }

    fn decompress(&mut self, payload: &[u8]) -> Result<Vec<i16>, CodecError> {
        if payload.len() != self.frame_len * 2 {
            return Err(CodecError::Malformed(format!(
                "payload has {} bytes, expected {}", payload.len(), self.frame_len * 2
            )));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    fn conceal(&mut self) -> Result<Vec<i16>, CodecError> {
        Ok(vec![0; self.frame_len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_codec_is_lossless() {
        let format = AudioFormat::new(8000, 1, 20);
        let mut codec = PcmCodec::new(format);
        let frame: Vec<i16> = (0..160).map(|i| (i * 97 - 4000) as i16).collect();

        let payload = codec.compress(&frame).unwrap();
        assert_eq!(payload.len(), 320);
        assert_eq!(codec.decompress(&payload).unwrap(), frame);
    }

    #[test]
    fn test_pcm_codec_rejects_wrong_sizes() {
        let mut codec = PcmCodec::new(AudioFormat::new(8000, 1, 20));
        assert!(matches!(codec.compress(&[0; 10]), Err(CodecError::Encode(_))));
        assert!(matches!(codec.decompress(&[0; 7]), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_pcm_concealment_is_silence() {
        let mut codec = PcmCodec::new(AudioFormat::new(16000, 2, 10));
        let frame = codec.conceal().unwrap();
        assert_eq!(frame.len(), 320);
        assert!(frame.iter().all(|&s| s == 0));
    }
}
