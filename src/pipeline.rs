use serde::Serialize;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use crate::{
    config::{DesignCatalog, DesignerSettings, GenerationSettings},
    engine::{TextGenerator, panic_message},
    error::{DesignError, InferenceError},
    image_input::{ImageResolver, ImageSource},
    message::ImageRef,
    prompt::{DesignBrief, build_analysis_prompt, build_placement_prompt},
    rules::RuleSet,
};

pub const DEFAULT_ROOM_TYPE: &str = "living room";
pub const DEFAULT_STYLE: &str = "industrial";

/// Steps a design request moves through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DesignStage {
    ValidatingImage,
    AnalyzingRoom,
    BuildingPlacementPrompt,
    GeneratingPlacement,
    Done,
}

impl DesignStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesignStage::ValidatingImage => "validating_image",
            DesignStage::AnalyzingRoom => "analyzing_room",
            DesignStage::BuildingPlacementPrompt => "building_placement_prompt",
            DesignStage::GeneratingPlacement => "generating_placement",
            DesignStage::Done => "done",
        }
    }
}

#[derive(Clone, Debug)]
pub struct DesignRequest {
    pub source: ImageSource,
    pub room_type: String,
    pub style: String,
    /// Token budget of the placement stage only.
    pub max_tokens: usize,
    pub important_prompt: Option<String>,
}

impl DesignRequest {
    pub fn new(source: ImageSource) -> Self {
        Self {
            source,
            room_type: DEFAULT_ROOM_TYPE.to_string(),
            style: DEFAULT_STYLE.to_string(),
            max_tokens: GenerationSettings::default().default_max_tokens,
            important_prompt: None,
        }
    }

    pub fn room_type(mut self, room_type: impl Into<String>) -> Self {
        self.room_type = room_type.into();
        self
    }

    pub fn style(mut self, style: impl Into<String>) -> Self {
        self.style = style.into();
        self
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn important_prompt(mut self, note: impl Into<String>) -> Self {
        self.important_prompt = Some(note.into());
        self
    }
}

/// The furniture placement sentence returned to the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Suggestion {
    pub suggestion: String,
}

/// Runs the two-stage design pipeline against a shared text generator.
pub struct Designer<G: TextGenerator> {
    resolver: ImageResolver,
    generator: G,
    catalog: Arc<DesignCatalog>,
    rules: Arc<RuleSet>,
    analysis_max_tokens: usize,
}

impl<G: TextGenerator> Designer<G> {
    pub fn new(generator: G, catalog: DesignCatalog, settings: &DesignerSettings) -> Self {
        let rules = catalog.rule_set();
        Self {
            resolver: ImageResolver::new(settings.image.clone()),
            generator,
            catalog: Arc::new(catalog),
            rules: Arc::new(rules),
            analysis_max_tokens: settings.generation.analysis_max_tokens,
        }
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    /// Produces one placement suggestion, or the reason there is none.
    ///
    /// Never panics: unexpected failures inside the pipeline come back as
    /// [`DesignError::Internal`].
    pub fn design(&self, request: &DesignRequest) -> Result<Suggestion, DesignError> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run(request)))
            .unwrap_or_else(|payload| Err(DesignError::Internal(panic_message(payload))));
        if let Err(e) = &result {
            log::warn!("Design request failed ({}): {e}", e.reason());
        }
        result
    }

    fn run(&self, request: &DesignRequest) -> Result<Suggestion, DesignError> {
        enter(DesignStage::ValidatingImage);
        let image = ImageRef::new(self.resolver.resolve(&request.source)?);

        enter(DesignStage::AnalyzingRoom);
        let analysis = non_empty(
            self.generator
                .generate(&build_analysis_prompt(&image), self.analysis_max_tokens),
        )
        .map_err(|detail| DesignError::AnalysisFailed { detail })?;
        log::info!("Room analysis: {analysis}");

        enter(DesignStage::BuildingPlacementPrompt);
        let brief = DesignBrief {
            room_type: &request.room_type,
            style: &request.style,
        };
        let messages = build_placement_prompt(brief, &image, &analysis, &self.catalog, &self.rules)
            .with_note(request.important_prompt.as_deref());

        enter(DesignStage::GeneratingPlacement);
        let suggestion = non_empty(self.generator.generate(&messages, request.max_tokens))
            .map_err(|detail| DesignError::PlacementFailed { detail })?;

        enter(DesignStage::Done);
        Ok(Suggestion { suggestion })
    }
}

fn enter(stage: DesignStage) {
    log::debug!("Design stage: {}", stage.as_str());
}

fn non_empty(result: Result<String, InferenceError>) -> Result<String, String> {
    match result {
        Ok(text) if !text.trim().is_empty() => Ok(text),
        Ok(_) => Err("model returned no text".to_string()),
        Err(e) => Err(e.to_string()),
    }
}
