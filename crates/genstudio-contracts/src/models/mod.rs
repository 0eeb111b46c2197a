mod registry;
mod selectors;

pub use registry::{is_imagen_model, ModelRegistry, ModelSpec, CAP_EDIT, CAP_IMAGE, CAP_VIDEO};
pub use selectors::{ModelChoice, ModelSelector};
