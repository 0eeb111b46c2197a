use indexmap::IndexMap;

pub const CAP_IMAGE: &str = "image";
pub const CAP_EDIT: &str = "edit";
pub const CAP_VIDEO: &str = "video";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub label: String,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Models whose name mentions imagen go through the `:predict` endpoint,
/// even when they are not in the catalog.
pub fn is_imagen_model(name: &str) -> bool {
    name.to_ascii_lowercase().contains("imagen")
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

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: &str, label: &str, capabilities: &[&str]| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                label: label.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
            },
        );
    };

    insert(
        "gemini-2.5-flash-image-preview",
        "gemini",
        "Gemini 2.5 Flash Image",
        &[CAP_IMAGE, CAP_EDIT],
    );
    insert(
        "imagen-4.0-generate-001",
        "imagen",
        "Imagen 4",
        &[CAP_IMAGE],
    );
    insert(
        "imagen-4.0-fast-generate-001",
        "imagen",
        "Imagen 4 Fast",
        &[CAP_IMAGE],
    );
    insert(
        "veo-3.0-generate-001",
        "veo",
        "Veo 3",
        &[CAP_VIDEO],
    );
    insert(
        "veo-3.0-fast-generate-001",
        "veo",
        "Veo 3 Fast",
        &[CAP_VIDEO],
    );
    insert(
        "veo-2.0-generate-001",
        "veo",
        "Veo 2",
        &[CAP_VIDEO],
    );

    map
}
