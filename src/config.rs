use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Result, Context, bail};
use log::{info, warn, error};

use crate::app::ControllerSettings;
use crate::audio::AudioFormat;
use crate::crypto::{IdentityKey, parse_verifying_key};
use crate::jitter_buffer::JitterBufferConfig;
use crate::opus_codec::OpusConfig;
use crate::session::{AcceptAll, AllowedCallers, IncomingCallPolicy, SessionConfig};

/// Persistent application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub identity: IdentitySettings,
    pub audio: AudioSettings,
    pub jitter: JitterSettings,
    pub network: NetworkSettings,
    pub security: SecuritySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    /// Identifier announced to peers and rendezvous servers
    pub local_id: String,
    pub display_name: Option<String>,
    /// Base64 Ed25519 signing key; generated on first use
    pub signing_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
    /// "pcm" or "opus"
    pub codec: String,
    pub opus_bitrate: u32,
    pub opus_complexity: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterSettings {
    pub base_delay_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_multiplier: f64,
    pub late_window: u32,
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// TCP port for direct incoming calls
    pub listen_port: u16,
    pub rendezvous_addr: String,
    /// Address media sockets bind to
    pub media_ip: String,
    pub setup_timeout_ms: u64,
    pub teardown_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Passphrase mixed into key derivation; both sides must agree
    pub pre_shared_secret: Option<String>,
    /// Base64 Ed25519 public keys; empty accepts any peer
    pub trusted_peers: Vec<String>,
    /// Caller identifiers answered when waiting for a call; empty answers anyone
    pub allowed_callers: Vec<String>,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        let local_id = std::env::var("USER")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| "parley".to_string());
        Self {
            local_id,
            display_name: None,
            signing_key: None,
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        let format = AudioFormat::default();
        let opus = OpusConfig::default();
        Self {
            sample_rate: format.sample_rate,
            channels: format.channels,
            frame_duration_ms: format.frame_duration_ms,
            codec: "pcm".to_string(),
            opus_bitrate: opus.bitrate,
            opus_complexity: opus.complexity,
        }
    }
}

impl Default for JitterSettings {
    fn default() -> Self {
        let jitter = JitterBufferConfig::default();
        Self {
            base_delay_ms: jitter.base_delay.as_millis() as u64,
            min_delay_ms: jitter.min_delay.as_millis() as u64,
            max_delay_ms: jitter.max_delay.as_millis() as u64,
            jitter_multiplier: jitter.jitter_multiplier,
            late_window: jitter.late_window,
            capacity: jitter.capacity,
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            listen_port: 7878,
            rendezvous_addr: "127.0.0.1:7879".to_string(),
            media_ip: "0.0.0.0".to_string(),
            setup_timeout_ms: 30_000,
            teardown_timeout_ms: 2_000,
        }
    }
}

pub struct ConfigManager {
    config_path: PathBuf,
    config: AppConfig,
}

impl ConfigManager {
    pub fn with_config(config: AppConfig) -> Self {
        Self {
            config_path: PathBuf::from("fallback_config.toml"),
            config,
        }
    }

    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        Self::with_path(config_path)
    }

    /// Load (or create) the configuration stored at `config_path`
    pub fn with_path(config_path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = config_path.into();
        let config = Self::load_or_create_config(&config_path)?;

        Ok(Self {
            config_path,
            config,
        })
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update_config(&mut self, config: AppConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.save_config()
    }

    pub fn save_config(&self) -> Result<()> {
        Self::save_config_to_path(&self.config, &self.config_path)?;
        info!("Configuration saved to: {:?}", self.config_path);
        Ok(())
    }

    /// Return the persisted identity, generating and saving one if missing
    pub fn ensure_identity(&mut self) -> Result<IdentityKey> {
        if let Some(ref encoded) = self.config.identity.signing_key {
            match IdentityKey::from_base64(encoded) {
                Ok(identity) => return Ok(identity),
                Err(e) => warn!("Stored identity key is unusable ({}), generating a new one", e),
            }
        }

        let identity = IdentityKey::generate();
        self.config.identity.signing_key = Some(identity.to_base64());
        self.save_config()
            .context("Failed to persist new identity key")?;
        info!("Generated new identity key {}", identity.public_base64());
        Ok(identity)
    }

    fn load_or_create_config(config_path: &Path) -> Result<AppConfig> {
        if config_path.exists() {
            info!("Loading configuration from: {:?}", config_path);
            let config_str = fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;

            match toml::from_str::<AppConfig>(&config_str) {
                Ok(config) => {
                    info!("Configuration loaded successfully");
                    Ok(config)
                }
                Err(e) => {
                    warn!("Failed to parse configuration file: {}. Using defaults.", e);
                    let default_config = AppConfig::default();
                    // Never overwrite an unreadable file: it may hold the only copy of the identity key
                    let aside = Self::unparseable_path(config_path);
                    match fs::rename(config_path, &aside) {
                        Ok(()) => {
                            warn!("Moved unparseable configuration to {:?}", aside);
                            if let Err(save_err) = Self::save_config_to_path(&default_config, config_path) {
                                error!("Failed to save default configuration: {}", save_err);
                            }
                        }
                        Err(rename_err) => {
                            error!("Could not move unparseable configuration aside ({}); leaving it untouched", rename_err);
                        }
                    }
                    Ok(default_config)
                }
            }
        } else {
            info!("No configuration file found. Creating default configuration.");
            let default_config = AppConfig::default();
            Self::save_config_to_path(&default_config, config_path)?;
            Ok(default_config)
        }
    }

    /// `config.toml` becomes `config.toml.bad`
    fn unparseable_path(config_path: &Path) -> PathBuf {
        let mut name = config_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".bad");
        config_path.with_file_name(name)
    }

    fn save_config_to_path(config: &AppConfig, path: &Path) -> Result<()> {
        let config_str = toml::to_string_pretty(config)
            .context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        fs::write(path, config_str)
            .context("Failed to write configuration file")?;
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("parley")
        } else {
            // Fallback to home directory
            let home_dir = dirs::home_dir()
                .context("Could not determine home directory")?;
            home_dir.join(".parley")
        };

        Ok(config_dir.join("config.toml"))
    }
}

// Conversions into the runtime configuration of each component
impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.identity.local_id.trim().is_empty() {
            bail!("identity.local_id must not be empty");
        }
        self.to_audio_format().validate()?;
        if !matches!(self.audio.codec.as_str(), "pcm" | "opus") {
            bail!("audio.codec must be \"pcm\" or \"opus\", got {:?}", self.audio.codec);
        }
        if self.audio.codec == "opus" {
            self.to_opus_config().validate()?;
        }
        self.to_jitter_config().validate()?;
        self.network.media_ip.parse::<IpAddr>()
            .with_context(|| format!("network.media_ip {:?} is not an IP address", self.network.media_ip))?;
        for peer in &self.security.trusted_peers {
            parse_verifying_key(peer)
                .with_context(|| format!("security.trusted_peers entry {:?} is invalid", peer))?;
        }
        Ok(())
    }

    pub fn to_audio_format(&self) -> AudioFormat {
        AudioFormat::new(self.audio.sample_rate, self.audio.channels, self.audio.frame_duration_ms)
    }

    pub fn to_opus_config(&self) -> OpusConfig {
        OpusConfig {
            format: self.to_audio_format(),
            bitrate: self.audio.opus_bitrate,
            complexity: self.audio.opus_complexity,
        }
    }

    pub fn to_jitter_config(&self) -> JitterBufferConfig {
        JitterBufferConfig {
            clock_rate: self.audio.sample_rate,
            base_delay: Duration::from_millis(self.jitter.base_delay_ms),
            min_delay: Duration::from_millis(self.jitter.min_delay_ms),
            max_delay: Duration::from_millis(self.jitter.max_delay_ms),
            jitter_multiplier: self.jitter.jitter_multiplier,
            late_window: self.jitter.late_window,
            capacity: self.jitter.capacity,
            ..JitterBufferConfig::default()
        }
    }

    pub fn to_session_config(&self, peer_id: Option<String>) -> Result<SessionConfig> {
        let trusted_peers = self.security.trusted_peers.iter()
            .map(|peer| parse_verifying_key(peer)
                .with_context(|| format!("Invalid trusted peer key {:?}", peer)))
            .collect::<Result<Vec<_>>>()?;

        Ok(SessionConfig {
            local_id: self.identity.local_id.clone(),
            peer_id,
            codec: self.audio.codec.clone(),
            format: self.to_audio_format(),
            pre_shared_secret: self.security.pre_shared_secret.clone(),
            trusted_peers,
        })
    }

    pub fn to_incoming_policy(&self) -> Arc<dyn IncomingCallPolicy> {
        if self.security.allowed_callers.is_empty() {
            Arc::new(AcceptAll)
        } else {
            Arc::new(AllowedCallers::new(self.security.allowed_callers.iter().cloned()))
        }
    }

    pub fn to_controller_settings(&self) -> Result<ControllerSettings> {
        let media_ip = self.network.media_ip.parse::<IpAddr>()
            .with_context(|| format!("Invalid media address {:?}", self.network.media_ip))?;
        Ok(ControllerSettings {
            media_ip,
            setup_timeout: Duration::from_millis(self.network.setup_timeout_ms),
            teardown_timeout: Duration::from_millis(self.network.teardown_timeout_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_creation() {
        let config = AppConfig::default();
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.audio.codec, "pcm");
        assert_eq!(config.network.listen_port, 7878);
        assert!(config.security.trusted_peers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_allowed_callers_become_incoming_policy() {
        use crate::session::{CallDecision, IncomingCall};
        use crate::signaling::MediaDescription;

        let call = |caller: &str| IncomingCall {
            session_id: uuid::Uuid::new_v4(),
            caller: caller.to_string(),
            media: MediaDescription {
                media_addr: "127.0.0.1:4000".parse().unwrap(),
                codec: "pcm".into(),
                sample_rate: 48000,
                channels: 1,
                frame_duration_ms: 20,
            },
        };

        let open = AppConfig::default().to_incoming_policy();
        assert_eq!(open.decide(&call("anyone")), CallDecision::Accept);

        let mut config = AppConfig::default();
        config.security.allowed_callers = vec!["alice".into()];
        let policy = config.to_incoming_policy();
        assert_eq!(policy.decide(&call("alice")), CallDecision::Accept);
        assert!(matches!(policy.decide(&call("mallory")), CallDecision::Decline { .. }));
    }

    #[test]
    fn test_config_serialization() {
        let config = AppConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: AppConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: AppConfig = toml::from_str("[audio]\ncodec = \"opus\"\n").unwrap();
        assert_eq!(config.audio.codec, "opus");
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.jitter, JitterSettings::default());
    }

    #[test]
    fn test_config_conversions() {
        let config = AppConfig::default();

        let jitter = config.to_jitter_config();
        assert_eq!(jitter.base_delay, Duration::from_millis(config.jitter.base_delay_ms));
        assert_eq!(jitter.clock_rate, config.audio.sample_rate);

        let opus = config.to_opus_config();
        assert_eq!(opus.bitrate, config.audio.opus_bitrate);

        let session = config.to_session_config(Some("bob".into())).unwrap();
        assert_eq!(session.local_id, config.identity.local_id);
        assert_eq!(session.peer_id.as_deref(), Some("bob"));

        let settings = config.to_controller_settings().unwrap();
        assert_eq!(settings.teardown_timeout, Duration::from_millis(2_000));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = AppConfig::default();
        config.audio.codec = "mp3".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.network.media_ip = "not-an-ip".into();
        assert!(config.validate().is_err());
        assert!(config.to_controller_settings().is_err());

        let mut config = AppConfig::default();
        config.security.trusted_peers.push("garbage".into());
        assert!(config.to_session_config(None).is_err());
    }

    #[test]
    fn test_config_manager_persists_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley").join("config.toml");

        let mut manager = ConfigManager::with_path(&path).unwrap();
        assert!(path.exists());
        let identity = manager.ensure_identity().unwrap();

        let mut reloaded = ConfigManager::with_path(&path).unwrap();
        let again = reloaded.ensure_identity().unwrap();
        assert_eq!(identity.public_base64(), again.public_base64());
    }

    #[test]
    fn test_corrupt_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "this is = = not toml").unwrap();

        let manager = ConfigManager::with_path(&path).unwrap();
        assert_eq!(*manager.get_config(), AppConfig::default());

        // The unreadable original is kept aside rather than overwritten
        let aside = dir.path().join("config.toml.bad");
        assert_eq!(fs::read_to_string(&aside).unwrap(), "this is = = not toml");
        let rewritten: AppConfig = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(rewritten, AppConfig::default());
    }

    #[test]
    fn test_unparseable_config_keeps_signing_key_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut manager = ConfigManager::with_path(&path).unwrap();
        let identity = manager.ensure_identity().unwrap();

        // A hand edit breaks the file
        let mut broken = fs::read_to_string(&path).unwrap();
        broken.push_str("\n[audio\n");
        fs::write(&path, &broken).unwrap();

        let mut reloaded = ConfigManager::with_path(&path).unwrap();
        let fresh = reloaded.ensure_identity().unwrap();
        assert_ne!(fresh.public_base64(), identity.public_base64());

        let kept = fs::read_to_string(dir.path().join("config.toml.bad")).unwrap();
        assert_eq!(kept, broken);
        assert!(kept.contains(&identity.to_base64()));
    }
}
