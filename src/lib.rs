//! Furniture placement suggestions from a single room photo.
//!
//! A [`Designer`] validates the photo, asks a vision-language model to
//! describe the room's fixed features, then asks it again for a placement
//! sentence that follows the room rules and the chosen style. The model is
//! loaded once by a [`ModelLifecycle`] and shared by every request through a
//! serialized [`InferenceEngine`].

pub mod config;
pub mod engine;
pub mod error;
pub mod image_input;
pub mod inference;
pub mod lifecycle;
pub mod message;
pub mod model;
pub mod pipeline;
pub mod prompt;
pub mod rules;

#[cfg(feature = "candle")]
pub mod backend;

pub use config::{DesignCatalog, DesignerSettings};
pub use engine::{EngineState, InferenceEngine, TextGenerator};
pub use error::{
    ConfigError, DesignError, FailurePayload, InferenceError, LoadError, ValidationError,
};
pub use image_input::{ImageResolver, ImageSource, ValidatedImage};
pub use lifecycle::{LoadPlan, ModelLifecycle, ModelLoader};
pub use model::{Processor, VisionLanguageModel};
pub use pipeline::{DesignRequest, Designer, Suggestion};
pub use rules::RuleSet;
