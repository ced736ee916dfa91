use indexmap::IndexMap;

pub const FREE_IMAGE_MODEL: &str = "gemini-2.5-flash-image";
pub const PRO_IMAGE_MODEL: &str = "gemini-3-pro-image-preview";
pub const HELPER_TEXT_MODEL: &str = "gemini-2.5-flash";
pub const VIDEO_MODEL: &str = "veo-3.1-fast-generate-preview";

/// User-facing model policy. `Custom` is the pro-class model paired with a
/// user-supplied credential instead of the ambient one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelTier {
    #[default]
    Free,
    Pro,
    Custom,
}

impl ModelTier {
    pub fn from_preference(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pro" => Self::Pro,
            "custom" => Self::Custom,
            _ => Self::Free,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Custom => "custom",
        }
    }

    pub fn image_model(&self) -> &'static str {
        match self {
            Self::Free => FREE_IMAGE_MODEL,
            Self::Pro | Self::Custom => PRO_IMAGE_MODEL,
        }
    }

    /// The 4K hint is only honored by the pro-class image model.
    pub fn supports_four_k(&self) -> bool {
        matches!(self, Self::Pro | Self::Custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    /// The registry's preferred model for a capability: first match in
    /// insertion order.
    pub fn first_for(&self, capability: &str) -> Option<&ModelSpec> {
        self.models.values().find(|model| model.supports(capability))
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, capabilities: &[&str]| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
            },
        );
    };

    insert(FREE_IMAGE_MODEL, &["image"]);
    insert(PRO_IMAGE_MODEL, &["image"]);
    insert(HELPER_TEXT_MODEL, &["text", "vision"]);
    insert(VIDEO_MODEL, &["video"]);

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parsing_defaults_to_free() {
        assert_eq!(ModelTier::from_preference("free"), ModelTier::Free);
        assert_eq!(ModelTier::from_preference("PRO"), ModelTier::Pro);
        assert_eq!(ModelTier::from_preference(" custom "), ModelTier::Custom);
        assert_eq!(ModelTier::from_preference("unknown"), ModelTier::Free);
        assert_eq!(ModelTier::from_preference(""), ModelTier::Free);
    }

    #[test]
    fn tiers_map_to_image_models() {
        assert_eq!(ModelTier::Free.image_model(), FREE_IMAGE_MODEL);
        assert_eq!(ModelTier::Pro.image_model(), PRO_IMAGE_MODEL);
        assert_eq!(ModelTier::Custom.image_model(), PRO_IMAGE_MODEL);
    }

    #[test]
    fn four_k_is_pro_only() {
        assert!(!ModelTier::Free.supports_four_k());
        assert!(ModelTier::Pro.supports_four_k());
        assert!(ModelTier::Custom.supports_four_k());
    }

    #[test]
    fn default_registry_covers_all_capabilities() {
        let registry = ModelRegistry::new(None);
        assert!(registry.get(FREE_IMAGE_MODEL).is_some());
        assert_eq!(registry.by_capability("image").len(), 2);
        assert_eq!(registry.by_capability("video").len(), 1);
        assert_eq!(
            registry
                .by_capability("text")
                .first()
                .map(|model| model.name.clone()),
            Some(HELPER_TEXT_MODEL.to_string())
        );
        assert_eq!(registry.list().count(), 4);
    }

    #[test]
    fn first_for_respects_insertion_order() {
        let registry = ModelRegistry::new(None);
        assert_eq!(
            registry.first_for("image").map(|model| model.name.as_str()),
            Some(FREE_IMAGE_MODEL)
        );
        assert_eq!(
            registry.first_for("video").map(|model| model.name.as_str()),
            Some(VIDEO_MODEL)
        );
        assert_eq!(registry.first_for("audio"), None);
    }
}
