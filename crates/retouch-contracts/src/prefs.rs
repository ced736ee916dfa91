use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use crate::error::GenerateError;
use crate::models::ModelTier;

/// Quality preference persisted by the settings UI. Only the pro-class image
/// model honors the 4K hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityPreference {
    #[default]
    Standard,
    FourK,
}

impl QualityPreference {
    pub fn from_preference(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("4k") {
            Self::FourK
        } else {
            Self::Standard
        }
    }
}

/// Snapshot of the persisted preference file. Loaded fresh for every logical
/// call so a settings change takes effect on the next request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preferences {
    pub model_tier: ModelTier,
    pub quality: QualityPreference,
    pub custom_api_key: Option<String>,
}

/// Everything a generation call needs, resolved once at the boundary and
/// stable across that call's retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationConfig {
    pub model: String,
    pub api_key: String,
    pub four_k: bool,
}

impl Preferences {
    pub fn load(path: &Path) -> Self {
        let Some(payload) = read_json_object(path) else {
            return Self::default();
        };
        let text = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        Self {
            model_tier: text("model_preference")
                .map(|raw| ModelTier::from_preference(&raw))
                .unwrap_or_default(),
            quality: text("quality_preference")
                .map(|raw| QualityPreference::from_preference(&raw))
                .unwrap_or_default(),
            custom_api_key: text("custom_api_key"),
        }
    }

    /// Resolves the effective model and credential. `Custom` substitutes the
    /// user-supplied key when one is present, otherwise it behaves like `Pro`.
    pub fn resolve(&self, ambient_key: Option<&str>) -> Result<GenerationConfig> {
        let custom_key = if self.model_tier == ModelTier::Custom {
            self.custom_api_key.as_deref()
        } else {
            None
        };
        let api_key = custom_key
            .or(ambient_key)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(GenerateError::MissingCredential)?
            .to_string();

        Ok(GenerationConfig {
            model: self.model_tier.image_model().to_string(),
            api_key,
            four_k: self.quality == QualityPreference::FourK && self.model_tier.supports_four_k(),
        })
    }
}

fn read_json_object(path: &Path) -> Option<serde_json::Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::models::{FREE_IMAGE_MODEL, PRO_IMAGE_MODEL};

    use super::*;

    fn write_prefs(dir: &tempfile::TempDir, value: Value) -> std::path::PathBuf {
        let path = dir.path().join("settings.json");
        std::fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
        path
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let prefs = Preferences::load(Path::new("/nonexistent/settings.json"));
        assert_eq!(prefs, Preferences::default());
        assert_eq!(prefs.model_tier, ModelTier::Free);
        assert_eq!(prefs.quality, QualityPreference::Standard);
    }

    #[test]
    fn partial_file_fills_missing_keys_with_defaults() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = write_prefs(&temp, json!({ "model_preference": "pro" }));
        let prefs = Preferences::load(&path);
        assert_eq!(prefs.model_tier, ModelTier::Pro);
        assert_eq!(prefs.quality, QualityPreference::Standard);
        assert_eq!(prefs.custom_api_key, None);
        Ok(())
    }

    #[test]
    fn free_tier_resolves_flash_model_with_ambient_key() -> Result<()> {
        let prefs = Preferences::default();
        let config = prefs.resolve(Some("ambient-key"))?;
        assert_eq!(config.model, FREE_IMAGE_MODEL);
        assert_eq!(config.api_key, "ambient-key");
        assert!(!config.four_k);
        Ok(())
    }

    #[test]
    fn custom_tier_prefers_user_key() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = write_prefs(
            &temp,
            json!({
                "model_preference": "custom",
                "quality_preference": "4k",
                "custom_api_key": "user-key",
            }),
        );
        let config = Preferences::load(&path).resolve(Some("ambient-key"))?;
        assert_eq!(config.model, PRO_IMAGE_MODEL);
        assert_eq!(config.api_key, "user-key");
        assert!(config.four_k);
        Ok(())
    }

    #[test]
    fn custom_tier_without_user_key_uses_ambient() -> Result<()> {
        let prefs = Preferences {
            model_tier: ModelTier::Custom,
            quality: QualityPreference::Standard,
            custom_api_key: None,
        };
        let config = prefs.resolve(Some("ambient-key"))?;
        assert_eq!(config.api_key, "ambient-key");
        Ok(())
    }

    #[test]
    fn four_k_is_ignored_on_the_free_tier() -> Result<()> {
        let prefs = Preferences {
            model_tier: ModelTier::Free,
            quality: QualityPreference::FourK,
            custom_api_key: None,
        };
        let config = prefs.resolve(Some("key"))?;
        assert!(!config.four_k);
        Ok(())
    }

    #[test]
    fn missing_credential_is_a_classified_error() {
        let err = Preferences::default().resolve(None).unwrap_err();
        assert_eq!(
            crate::error::GenerateError::find_in(&err),
            Some(&crate::error::GenerateError::MissingCredential)
        );
    }
}
