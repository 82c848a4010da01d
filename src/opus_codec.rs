use audiopus::{
    Application, Bitrate, Channels, MutSignals, SampleRate,
    coder::{Decoder, Encoder},
    packet::Packet,
};
use log::{debug, info};

use crate::audio::AudioFormat;
use crate::codec::{AudioCodec, CodecError};

/// Opus packets never exceed this size
const MAX_PACKET_LEN: usize = 4000;

/// Opus codec configuration for voice communication
#[derive(Debug, Clone, PartialEq)]
pub struct OpusConfig {
    pub format: AudioFormat,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Complexity (0-10, higher = better quality but more CPU)
    pub complexity: u8,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            bitrate: 32_000,
            complexity: 5,
        }
    }
}

impl OpusConfig {
    pub fn validate(&self) -> Result<(), CodecError> {
        opus_sample_rate(self.format.sample_rate)?;
        opus_channels(self.format.channels)?;
        if !(6_000..=510_000).contains(&self.bitrate) {
            return Err(CodecError::Unsupported(format!("bitrate {}", self.bitrate)));
        }
        if self.complexity > 10 {
            return Err(CodecError::Unsupported(format!("complexity {}", self.complexity)));
        }
        if ![10, 20, 40, 60].contains(&self.format.frame_duration_ms) {
            return Err(CodecError::Unsupported(format!(
                "frame duration {} ms", self.format.frame_duration_ms
            )));
        }
        Ok(())
    }
}

fn opus_sample_rate(rate: u32) -> Result<SampleRate, CodecError> {
    match rate {
        8000 => Ok(SampleRate::Hz8000),
        12000 => Ok(SampleRate::Hz12000),
        16000 => Ok(SampleRate::Hz16000),
        24000 => Ok(SampleRate::Hz24000),
        48000 => Ok(SampleRate::Hz48000),
        _ => Err(CodecError::Unsupported(format!("sample rate {}", rate))),
    }
}

fn opus_channels(channels: u16) -> Result<Channels, CodecError> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        _ => Err(CodecError::Unsupported(format!("{} channels", channels))),
    }
}

/// Opus encoder and decoder pair for one direction of a call
pub struct OpusCodec {
    config: OpusConfig,
    encoder: Encoder,
    decoder: Decoder,
    encoded_buffer: Vec<u8>,
    decoded_buffer: Vec<i16>,
}

impl OpusCodec {
    pub fn new(config: OpusConfig) -> Result<Self, CodecError> {
        config.validate()?;
        info!("Creating Opus codec: {}Hz, {} channels, {} kbps",
              config.format.sample_rate, config.format.channels, config.bitrate / 1000);

        let sample_rate = opus_sample_rate(config.format.sample_rate)?;
        let channels = opus_channels(config.format.channels)?;

        let mut encoder = Encoder::new(sample_rate, channels, Application::Voip)
            .map_err(|e| CodecError::Unsupported(format!("encoder: {}", e)))?;
        encoder.set_bitrate(Bitrate::BitsPerSecond(config.bitrate as i32))
            .map_err(|e| CodecError::Unsupported(format!("bitrate: {}", e)))?;
        encoder.set_complexity(config.complexity)
            .map_err(|e| CodecError::Unsupported(format!("complexity: {}", e)))?;

        let decoder = Decoder::new(sample_rate, channels)
            .map_err(|e| CodecError::Unsupported(format!("decoder: {}", e)))?;

        let frame_len = config.format.frame_len();
        Ok(Self {
            config,
            encoder,
            decoder,
            encoded_buffer: vec![0u8; MAX_PACKET_LEN],
            decoded_buffer: vec![0i16; frame_len],
        })
    }

    pub fn config(&self) -> &OpusConfig {
        &self.config
    }

    fn decoded_frame(&self, samples_per_channel: usize) -> Vec<i16> {
        let total = (samples_per_channel * self.config.format.channels as usize)
            .min(self.decoded_buffer.len());
        let mut frame = self.decoded_buffer[..total].to_vec();
        frame.resize(self.config.format.frame_len(), 0);
        frame
    }
}

impl AudioCodec for OpusCodec {
    fn name(&self) -> &'static str {
        "opus"
    }

    fn compress(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        let len = self.encoder.encode(pcm, &mut self.encoded_buffer)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(self.encoded_buffer[..len].to_vec())
    }

    fn decompress(&mut self, payload: &[u8]) -> Result<Vec<i16>, CodecError> {
        let packet = Packet::try_from(payload)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        let signals = MutSignals::try_from(&mut self.decoded_buffer[..])
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        let decoded = self.decoder.decode(Some(packet), signals, false)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        Ok(self.decoded_frame(decoded))
    }

    fn conceal(&mut self) -> Result<Vec<i16>, CodecError> {
        debug!("Opus packet loss concealment");
        let signals = MutSignals::try_from(&mut self.decoded_buffer[..])
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        let no_packet: Option<Packet<'_>> = None;
        match self.decoder.decode(no_packet, signals, false) {
            Ok(decoded) => Ok(self.decoded_frame(decoded)),
            Err(e) => {
                debug!("Opus concealment failed, using silence: {}", e);
                Ok(vec![0; self.config.format.frame_len()])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(format: AudioFormat) -> Vec<i16> {
        (0..format.frame_len())
            .map(|i| ((i as f32 * 0.05).sin() * 8000.0) as i16)
            .collect()
    }

    #[test]
    fn test_opus_config_validation() {
        assert!(OpusConfig::default().validate().is_ok());

        let mut config = OpusConfig::default();
        config.format.sample_rate = 44_100;
        assert!(config.validate().is_err());

        let mut config = OpusConfig::default();
        config.format.frame_duration_ms = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_opus_frame_survives_compression() {
        let config = OpusConfig::default();
        let format = config.format;
        let mut codec = OpusCodec::new(config).unwrap();

        let frame = tone(format);
        let payload = codec.compress(&frame).unwrap();
        assert!(!payload.is_empty());
        assert!(payload.len() < frame.len() * 2);

        let decoded = codec.decompress(&payload).unwrap();
        assert_eq!(decoded.len(), format.frame_len());
    }

    #[test]
    fn test_opus_concealment_has_frame_length() {
        let config = OpusConfig::default();
        let format = config.format;
        let mut codec = OpusCodec::new(config).unwrap();
        let payload = codec.compress(&tone(format)).unwrap();
        codec.decompress(&payload).unwrap();

        assert_eq!(codec.conceal().unwrap().len(), format.frame_len());
    }
}
