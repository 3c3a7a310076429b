use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Client-side E2E configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct CryptoConfig {
    /// Our Matrix user id.
    pub user_id: String,

    /// Our device id, as assigned by the homeserver at login.
    pub device_id: String,

    /// Rotate the outbound group session after this many messages.
    #[serde(default = "default_rotation_max_messages")]
    pub rotation_max_messages: u32,

    /// Rotate the outbound group session after this many milliseconds.
    #[serde(default = "default_rotation_max_lifetime_ms")]
    pub rotation_max_lifetime_ms: u64,

    /// Keep the server-side one-time key count at this fraction of the
    /// account's maximum.
    #[serde(default = "default_one_time_key_target_fraction")]
    pub one_time_key_target_fraction: f64,

    /// Mirror the key store to this encrypted file. In-memory only when unset.
    #[serde(default)]
    pub store_path: Option<String>,

    /// PBKDF2 iterations for the store passphrase.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

fn default_rotation_max_messages() -> u32 {
    100
}

fn default_rotation_max_lifetime_ms() -> u64 {
    7 * 24 * 60 * 60 * 1000
}

fn default_one_time_key_target_fraction() -> f64 {
    0.5
}

fn default_kdf_iterations() -> u32 {
    600_000
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            device_id: String::new(),
            rotation_max_messages: default_rotation_max_messages(),
            rotation_max_lifetime_ms: default_rotation_max_lifetime_ms(),
            one_time_key_target_fraction: default_one_time_key_target_fraction(),
            store_path: None,
            kdf_iterations: default_kdf_iterations(),
        }
    }
}

impl CryptoConfig {
    /// In-memory configuration for a single device.
    pub fn for_device(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            ..Self::default()
        }
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        anyhow::ensure!(!config.user_id.is_empty(), "user_id must not be empty");
        anyhow::ensure!(!config.device_id.is_empty(), "device_id must not be empty");
        anyhow::ensure!(
            (0.0..=1.0).contains(&config.one_time_key_target_fraction),
            "one_time_key_target_fraction must be within 0.0..=1.0"
        );
        Ok(config)
    }

    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy {
            max_messages: self.rotation_max_messages,
            max_lifetime: Duration::from_millis(self.rotation_max_lifetime_ms),
        }
    }
}

/// Thresholds after which an outbound group session must be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_messages: u32,
    pub max_lifetime: Duration,
}

impl RotationPolicy {
    /// Rotate on message count only.
    pub fn messages_only(max_messages: u32) -> Self {
        Self {
            max_messages,
            max_lifetime: Duration::MAX,
        }
    }
}

impl Default for RotationPolicy {
    fn default() -> Self {
        CryptoConfig::default().rotation_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = CryptoConfig::default();
        assert_eq!(config.rotation_max_messages, 100);
        assert_eq!(config.rotation_max_lifetime_ms, 604_800_000);
        assert_eq!(config.one_time_key_target_fraction, 0.5);
        assert_eq!(config.kdf_iterations, 600_000);
        assert!(config.store_path.is_none());
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            user_id = "@alice:example.org"
            device_id = "ALICEDEV"
            rotation_max_messages = 10
            store_path = "keys.bin"
        "#;
        let config: CryptoConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.user_id, "@alice:example.org");
        assert_eq!(config.device_id, "ALICEDEV");
        assert_eq!(config.rotation_max_messages, 10);
        assert_eq!(config.rotation_max_lifetime_ms, 604_800_000);
        assert_eq!(config.store_path.as_deref(), Some("keys.bin"));
    }

    #[test]
    fn load_rejects_empty_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crypto.toml");
        std::fs::write(&path, "user_id = \"@a:x\"\ndevice_id = \"\"\n").unwrap();
        assert!(CryptoConfig::load_from_file(&path).is_err());
    }

    #[test]
    fn load_from_file_ok() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crypto.toml");
        std::fs::write(&path, "user_id = \"@a:x\"\ndevice_id = \"D\"\n").unwrap();
        let config = CryptoConfig::load_from_file(&path).unwrap();
        assert_eq!(config.rotation_policy(), RotationPolicy::default());
    }

    #[test]
    fn messages_only_policy_never_expires() {
        let policy = RotationPolicy::messages_only(5);
        assert_eq!(policy.max_messages, 5);
        assert_eq!(policy.max_lifetime, Duration::MAX);
    }
}
