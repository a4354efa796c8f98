use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine configuration, loaded from a TOML file.
///
/// Every field has a default so a missing or partial file still yields a
/// usable local configuration. The channel URL and token are issued by the
/// platform when the interview session is created; this engine only
/// consumes them.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// WebSocket endpoint for the interview channel.
    pub channel_url: String,
    /// Optional bearer token presented on channel open.
    pub channel_token: Option<String>,

    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,

    /// Request echo cancellation on the capture path.
    pub echo_cancellation: bool,
    /// Request noise suppression on the capture path.
    pub noise_suppression: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_url: "ws://127.0.0.1:8080/interview".to_string(),
            channel_token: None,
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: EngineConfig =
            toml::from_str(r#"channel_url = "wss://example.test/iv/42""#).unwrap();
        assert_eq!(cfg.channel_url, "wss://example.test/iv/42");
        assert_eq!(cfg.capture_device, "default");
        assert!(cfg.channel_token.is_none());
        assert!(cfg.noise_suppression);
    }
}
