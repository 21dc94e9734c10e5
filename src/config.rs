use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::session::PollPolicy;

/// Environment variable naming a config file to load.
pub const CONFIG_ENV: &str = "INFER_BRIDGE_CONFIG";

/// Settings handed to the engine at initialisation.
#[derive(Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Platform API base URL, e.g. `https://api.example.com`.
    pub host: String,
    pub device_id: String,
    pub debug: bool,
    pub compatibility_tag: String,
    /// Generated at initialisation when left empty.
    pub session_id: String,
    #[serde(rename = "maxDBSizeKBs", skip_serializing_if = "Option::is_none")]
    pub max_db_size_kbs: Option<f32>,
    #[serde(rename = "maxEventsSizeKBs", skip_serializing_if = "Option::is_none")]
    pub max_events_size_kbs: Option<f32>,
    pub cohort_ids: Vec<String>,
    /// Download assets from the platform instead of using bundled ones.
    pub online: bool,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.online {
            for (name, value) in [
                ("clientId", &self.client_id),
                ("clientSecret", &self.client_secret),
                ("deviceId", &self.device_id),
            ] {
                if value.is_empty() {
                    return Err(BridgeError::Config(format!(
                        "{name} is required for online configs"
                    )));
                }
            }
            if !self.host.starts_with("https://") {
                return Err(BridgeError::Config(format!(
                    "host must be an https URL, got '{}'",
                    self.host
                )));
            }
        }

        for (name, limit) in [
            ("maxDBSizeKBs", self.max_db_size_kbs),
            ("maxEventsSizeKBs", self.max_events_size_kbs),
        ] {
            if let Some(limit) = limit {
                if !(limit > 0.0) {
                    return Err(BridgeError::Config(format!(
                        "{name} must be positive, got {limit}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Fill in a random session id if none was configured.
    pub fn ensure_session_id(&mut self) -> &str {
        if self.session_id.is_empty() {
            self.session_id = uuid::Uuid::new_v4().to_string();
        }
        &self.session_id
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("host", &self.host)
            .field("device_id", &self.device_id)
            .field("debug", &self.debug)
            .field("compatibility_tag", &self.compatibility_tag)
            .field("session_id", &self.session_id)
            .field("max_db_size_kbs", &self.max_db_size_kbs)
            .field("max_events_size_kbs", &self.max_events_size_kbs)
            .field("cohort_ids", &self.cohort_ids)
            .field("online", &self.online)
            .finish()
    }
}

/// Everything a client process needs: engine settings and polling behaviour.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub polling: PollPolicy,
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl AppConfig {
    /// Load from `path_override`, then `$INFER_BRIDGE_CONFIG`, then the default
    /// location. A missing default file yields the default config.
    pub fn load(path_override: Option<&Path>) -> Result<Self> {
        let explicit = path_override
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let path = match explicit {
            Some(path) => path,
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                other => {
                    return Ok(AppConfig {
                        path: other,
                        ..AppConfig::default()
                    })
                }
            },
        };

        let text = std::fs::read_to_string(&path)?;
        let mut config: AppConfig = serde_json::from_str(&text)?;
        config.engine.validate()?;
        config.path = Some(path);
        tracing::debug!("loaded config from {}", config.display_path());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| BridgeError::Config("no config path to save to".to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn display_path(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    }
}

fn default_config_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("infer-bridge")
            .join("config.json"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn online_config() -> EngineConfig {
        EngineConfig {
            client_id: "chatapp-test".to_string(),
            client_secret: "samplekey123".to_string(),
            host: "https://api.example.com".to_string(),
            device_id: "device-1".to_string(),
            online: true,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn wire_keys_are_camel_case() {
        let mut config = online_config();
        config.max_db_size_kbs = Some(2048.0);
        config.cohort_ids = vec!["beta".to_string()];
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["clientId"], "chatapp-test");
        assert_eq!(value["maxDBSizeKBs"], 2048.0);
        assert_eq!(value["cohortIds"][0], "beta");
        assert!(value.get("maxEventsSizeKBs").is_none());

        let back: EngineConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"deviceId": "d"}"#).unwrap();
        assert_eq!(config.device_id, "d");
        assert!(!config.online);
        assert!(config.cohort_ids.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn online_config_needs_credentials_and_https() {
        assert!(online_config().validate().is_ok());

        let mut config = online_config();
        config.client_secret.clear();
        assert!(config.validate().unwrap_err().to_string().contains("clientSecret"));

        let mut config = online_config();
        config.host = "http://api.example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn size_limits_must_be_positive() {
        let mut config = EngineConfig::default();
        config.max_events_size_kbs = Some(0.0);
        assert!(config.validate().is_err());
        config.max_events_size_kbs = Some(f32::NAN);
        assert!(config.validate().is_err());
    }

    #[test]
    fn session_id_is_generated_once() {
        let mut config = EngineConfig::default();
        let first = config.ensure_session_id().to_string();
        assert_eq!(first.len(), 36);
        assert_eq!(config.ensure_session_id(), first);
    }

    #[test]
    fn debug_redacts_secret() {
        let text = format!("{:?}", online_config());
        assert!(!text.contains("samplekey123"));
        assert!(text.contains("<redacted>"));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = AppConfig {
            engine: online_config(),
            path: Some(path.clone()),
            ..AppConfig::default()
        };
        config.polling.interval = Duration::from_millis(50);
        config.save().unwrap();

        let loaded = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"engine": {"online": true}}"#).unwrap();
        assert!(matches!(
            AppConfig::load(Some(&path)),
            Err(BridgeError::Config(_))
        ));
    }
}
