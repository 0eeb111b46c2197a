use super::registry::{ModelRegistry, ModelSpec};

/// How a requested model name turned into the model that gets called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelChoice {
    /// Nothing was requested; the caller's configured default applies.
    Default(String),
    /// A catalog model that serves the capability.
    Catalog(ModelSpec),
    /// Unknown to the catalog. Forwarded unchanged so newly released
    /// models work without a catalog update.
    PassThrough(String),
    /// A catalog model that cannot serve `capability`, swapped for one that can.
    Substituted {
        requested: String,
        capability: String,
        substitute: ModelSpec,
    },
}

impl ModelChoice {
    pub fn name(&self) -> &str {
        match self {
            Self::Default(name) | Self::PassThrough(name) => name,
            Self::Catalog(model) => &model.name,
            Self::Substituted { substitute, .. } => &substitute.name,
        }
    }

    pub fn into_name(self) -> String {
        match self {
            Self::Default(name) | Self::PassThrough(name) => name,
            Self::Catalog(model) => model.name,
            Self::Substituted { substitute, .. } => substitute.name,
        }
    }

    pub fn fallback_reason(&self) -> Option<String> {
        match self {
            Self::Substituted {
                requested,
                capability,
                substitute,
            } => Some(format!(
                "'{requested}' cannot serve {capability} requests; using '{}'",
                substitute.name
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    registry: ModelRegistry,
}

impl Default for ModelSelector {
    fn default() -> Self {
        Self::new(ModelRegistry::new(None))
    }
}

impl ModelSelector {
    pub fn new(registry: ModelRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Resolves `requested` for `capability`. A substitute prefers
    /// `default` when the catalog lists it for the capability, else the
    /// first catalog model that has it. With no capable model at all the
    /// default name is used as is.
    pub fn choose(&self, requested: Option<&str>, capability: &str, default: &str) -> ModelChoice {
        let Some(requested) = requested.map(str::trim).filter(|name| !name.is_empty()) else {
            return ModelChoice::Default(default.to_string());
        };
        let Some(model) = self.registry.get(requested) else {
            return ModelChoice::PassThrough(requested.to_string());
        };
        if model.supports(capability) {
            return ModelChoice::Catalog(model.clone());
        }
        let substitute = self
            .registry
            .get(default)
            .filter(|candidate| candidate.supports(capability))
            .cloned()
            .or_else(|| self.registry.by_capability(capability).into_iter().next());
        match substitute {
            Some(substitute) => ModelChoice::Substituted {
                requested: requested.to_string(),
                capability: capability.to_string(),
                substitute,
            },
            None => ModelChoice::Default(default.to_string()),
        }
    }
}
