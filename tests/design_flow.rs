use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use furnish_infernum::{
    DesignCatalog, DesignError, DesignRequest, Designer, DesignerSettings, ImageSource, LoadError,
    LoadPlan, ModelLifecycle, ModelLoader,
    config::{MemoryBudget, ModelSettings},
    engine::ProcessorHandle,
    lifecycle::LayerFootprint,
    message::MessageSequence,
    model::{
        EncodedInputs, GenerationParams, ModelError, Placement, Precision, Processor,
        VisionLanguageModel,
    },
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::{
    io::Cursor,
    sync::{
        Arc, Barrier, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

const EOS: u32 = 1;
const PROMPT_TOKEN: u32 = 1000;

const ANALYSIS_REPLY: &[u32] = &[10, 11, 12, 13, 14, 15, EOS];
const PLACEMENT_REPLY: &[u32] = &[20, 21, 22, 23, 24, 25, 26, 27, EOS];

fn word(id: u32) -> &'static str {
    match id {
        10 => "White",
        11 => "walls,",
        12 => "oak",
        13 => "floor,",
        14 => "window",
        15 => "left.",
        20 => "Place",
        21 => "a",
        22 => "steel",
        23 => "bed",
        24 => "against",
        25 => "the",
        26 => "right",
        27 => "wall.",
        _ => "<unknown>",
    }
}

/// Everything the fake backend observed.
#[derive(Default)]
struct Observed {
    loads: AtomicUsize,
    materialized: Mutex<Vec<LoadPlan>>,
    prompts: Mutex<Vec<String>>,
    images: Mutex<Vec<(usize, u32, u32)>>,
    budgets: Mutex<Vec<usize>>,
}

impl Observed {
    fn generations(&self) -> usize {
        self.budgets.lock().unwrap().len()
    }
}

struct FakeProcessor(Arc<Observed>);

impl Processor for FakeProcessor {
    fn apply_chat_template(&self, messages: &MessageSequence) -> String {
        let prompt = messages
            .messages()
            .iter()
            .map(|m| format!("<{}> {}", m.role().as_str(), m.text()))
            .collect::<Vec<_>>()
            .join("\n");
        self.0.prompts.lock().unwrap().push(prompt.clone());
        prompt
    }

    fn encode(&self, prompt: &str, images: &[&RgbImage]) -> Result<EncodedInputs, ModelError> {
        let (width, height) = images.first().map_or((0, 0), |image| image.dimensions());
        self.0.images.lock().unwrap().push((images.len(), width, height));
        Ok(EncodedInputs {
            input_ids: prompt.split_whitespace().map(|_| PROMPT_TOKEN).collect(),
            pixel_values: Vec::new(),
        })
    }

    fn decode(&self, token_ids: &[u32]) -> Result<String, ModelError> {
        Ok(token_ids
            .iter()
            .filter(|id| **id != EOS)
            .map(|id| word(*id))
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn eos_token_id(&self) -> u32 {
        EOS
    }
}

struct FakeModel {
    observed: Arc<Observed>,
    calls: usize,
}

impl VisionLanguageModel for FakeModel {
    fn generate(
        &mut self,
        inputs: &EncodedInputs,
        params: &GenerationParams,
    ) -> Result<Vec<u32>, ModelError> {
        self.observed.budgets.lock().unwrap().push(params.max_new_tokens);
        let reply = if self.calls % 2 == 0 {
            ANALYSIS_REPLY
        } else {
            PLACEMENT_REPLY
        };
        self.calls += 1;

        let mut sequence = inputs.input_ids.clone();
        sequence.extend_from_slice(reply);
        Ok(sequence)
    }
}

struct FakeLoader {
    observed: Arc<Observed>,
    accelerator: bool,
    splits: bool,
    fail_materialize: bool,
}

impl FakeLoader {
    fn new(observed: Arc<Observed>) -> Self {
        Self {
            observed,
            accelerator: false,
            splits: false,
            fail_materialize: false,
        }
    }
}

impl ModelLoader for FakeLoader {
    fn accelerator_available(&self) -> bool {
        self.accelerator
    }

    fn inspect(
        &self,
        _model_id: &str,
        precision: Precision,
    ) -> Result<Vec<LayerFootprint>, LoadError> {
        Ok((0..4)
            .map(|i| LayerFootprint {
                name: format!("language_model.layers.{i}"),
                bytes: 100 * precision.bytes_per_element(),
            })
            .collect())
    }

    fn splits_layers(&self) -> bool {
        self.splits
    }

    fn materialize(&self, plan: &LoadPlan) -> Result<Box<dyn VisionLanguageModel>, LoadError> {
        self.observed.loads.fetch_add(1, Ordering::SeqCst);
        self.observed.materialized.lock().unwrap().push(plan.clone());
        // Widens the window in which concurrent callers race.
        thread::sleep(Duration::from_millis(50));
        if self.fail_materialize {
            return Err(LoadError::Materialize("weights are corrupt".to_string()));
        }
        Ok(Box::new(FakeModel {
            observed: self.observed.clone(),
            calls: 0,
        }))
    }

    fn load_processor(&self, _model_id: &str) -> Result<ProcessorHandle, LoadError> {
        Ok(Arc::new(FakeProcessor(self.observed.clone())))
    }
}

fn lifecycle(loader: FakeLoader, settings: ModelSettings) -> ModelLifecycle<FakeLoader> {
    ModelLifecycle::new(loader, settings, Duration::from_secs(30))
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([180, 170, 160])))
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn catalog() -> DesignCatalog {
    serde_json::from_str(
        r#"{
            "FURNITURE_CONFIG": { "bedroom": { "essential": ["bed", "nightstand", "dresser"] } },
            "STYLE_MATERIALS": { "industrial": { "materials": "steel and reclaimed wood", "colors": ["charcoal", "rust"] } }
        }"#,
    )
    .unwrap()
}

#[test]
fn test_bedroom_design_end_to_end() {
    let observed = Arc::new(Observed::default());
    let engine = lifecycle(FakeLoader::new(observed.clone()), ModelSettings::default())
        .ensure_loaded()
        .unwrap();
    let designer = Designer::new(engine, catalog(), &DesignerSettings::default());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("room.png");
    std::fs::write(&path, png(800, 600)).unwrap();

    let request = DesignRequest::new(ImageSource::FilePath(path))
        .room_type("bedroom")
        .style("industrial");
    let suggestion = designer.design(&request).unwrap();

    assert_eq!(suggestion.suggestion, "Place a steel bed against the right wall.");
    assert_eq!(observed.loads.load(Ordering::SeqCst), 1);

    // One analysis call and one placement call, each with the same image.
    assert_eq!(*observed.images.lock().unwrap(), [(1, 800, 600), (1, 800, 600)]);
    assert_eq!(*observed.budgets.lock().unwrap(), [100, 180]);

    let prompts = observed.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("White walls"));
    assert!(prompts[1].contains("White walls, oak floor, window left."));
    assert!(prompts[1].contains("bedroom"));
    assert!(prompts[1].contains("steel and reclaimed wood"));
    assert!(prompts[1].contains("bed, nightstand, dresser"));
}

#[test]
fn test_small_image_never_reaches_the_model() {
    let observed = Arc::new(Observed::default());
    let engine = lifecycle(FakeLoader::new(observed.clone()), ModelSettings::default())
        .ensure_loaded()
        .unwrap();
    let designer = Designer::new(engine, catalog(), &DesignerSettings::default());

    let request = DesignRequest::new(ImageSource::EncodedPayload(BASE64.encode(png(200, 150))))
        .room_type("bedroom");
    let err = designer.design(&request).unwrap_err();

    assert_eq!(err.reason(), "too_small");
    assert!(err.is_caller_error());
    assert_eq!(observed.generations(), 0);
    assert!(observed.prompts.lock().unwrap().is_empty());
}

#[test]
fn test_unknown_room_and_style_still_produce_a_suggestion() {
    let observed = Arc::new(Observed::default());
    let engine = lifecycle(FakeLoader::new(observed.clone()), ModelSettings::default())
        .ensure_loaded()
        .unwrap();
    let designer = Designer::new(engine, DesignCatalog::default(), &DesignerSettings::default());

    let request = DesignRequest::new(ImageSource::EncodedPayload(BASE64.encode(png(640, 480))))
        .room_type("sunroom")
        .style("brutalist")
        .important_prompt("Keep the window seat clear.");
    let suggestion = designer.design(&request).unwrap();

    assert!(!suggestion.suggestion.is_empty());
    let prompts = observed.prompts.lock().unwrap();
    assert!(prompts[1].ends_with("**Very Important Note:** Keep the window seat clear."));
}

#[test]
fn test_requests_share_one_engine() {
    let observed = Arc::new(Observed::default());
    let engine = lifecycle(FakeLoader::new(observed.clone()), ModelSettings::default())
        .ensure_loaded()
        .unwrap();
    let designer = Arc::new(Designer::new(engine, catalog(), &DesignerSettings::default()));
    let payload = BASE64.encode(png(800, 600));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let designer = designer.clone();
            let payload = payload.clone();
            thread::spawn(move || {
                designer.design(&DesignRequest::new(ImageSource::EncodedPayload(payload)))
            })
        })
        .collect();

    for handle in handles {
        // Calls are serialized, but requests interleave, so either reply may
        // land in either stage; both are non-empty.
        let outcome = handle.join().unwrap();
        assert!(!matches!(outcome, Err(DesignError::Internal(_))));
    }
    assert_eq!(observed.generations(), 8);
    assert_eq!(observed.loads.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_first_callers_trigger_one_load() {
    let observed = Arc::new(Observed::default());
    let loader = FakeLoader::new(observed.clone());
    let lifecycle = Arc::new(lifecycle(loader, ModelSettings::default()));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let lifecycle = lifecycle.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                lifecycle.ensure_loaded().unwrap()
            })
        })
        .collect();
    let engines: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(observed.loads.load(Ordering::SeqCst), 1);
    assert!(engines.iter().all(|engine| Arc::ptr_eq(engine, &engines[0])));
    assert!(Arc::ptr_eq(&lifecycle.ensure_loaded().unwrap(), &engines[0]));
    assert!(lifecycle.is_loaded());
}

#[test]
fn test_failed_load_is_remembered() {
    let observed = Arc::new(Observed::default());
    let loader = FakeLoader {
        fail_materialize: true,
        ..FakeLoader::new(observed.clone())
    };
    let lifecycle = lifecycle(loader, ModelSettings::default());

    assert!(matches!(lifecycle.ensure_loaded(), Err(LoadError::Materialize(_))));
    assert!(matches!(lifecycle.ensure_loaded(), Err(LoadError::Materialize(_))));
    assert_eq!(observed.loads.load(Ordering::SeqCst), 1);
    assert!(!lifecycle.is_loaded());
}

#[test]
fn test_host_only_plan() {
    let observed = Arc::new(Observed::default());
    let engine = lifecycle(FakeLoader::new(observed), ModelSettings::default())
        .ensure_loaded()
        .unwrap();

    let plan = engine.plan();
    assert_eq!(plan.placement, Placement::Host);
    assert_eq!(plan.precision, Precision::Float32);
    assert!(plan.device_map.is_none());
}

#[test]
fn test_accelerator_plan_offloads_what_does_not_fit() {
    let observed = Arc::new(Observed::default());
    let loader = FakeLoader {
        accelerator: true,
        splits: true,
        ..FakeLoader::new(observed)
    };
    // Four bf16 layers of 200 bytes each; room for two on the accelerator.
    let settings = ModelSettings {
        memory_budget: MemoryBudget {
            accelerator_bytes: 450,
            host_bytes: 1_000,
        },
        ..ModelSettings::default()
    };
    let engine = lifecycle(loader, settings).ensure_loaded().unwrap();

    let plan = engine.plan();
    assert_eq!(plan.placement, Placement::Accelerator);
    assert_eq!(plan.precision, Precision::BFloat16);
    let map = plan.device_map.as_ref().unwrap();
    assert_eq!(map.offloaded_layers(), 2);
    assert_eq!(map.placement_of("language_model.layers.1"), Some(Placement::Accelerator));
    assert_eq!(map.placement_of("language_model.layers.2"), Some(Placement::Host));
}

#[test]
fn test_accelerator_plan_over_host_budget_fails_to_load() {
    let observed = Arc::new(Observed::default());
    let loader = FakeLoader {
        accelerator: true,
        ..FakeLoader::new(observed.clone())
    };
    let settings = ModelSettings {
        memory_budget: MemoryBudget {
            accelerator_bytes: 200,
            host_bytes: 300,
        },
        ..ModelSettings::default()
    };

    let Err(err) = lifecycle(loader, settings).ensure_loaded() else {
        panic!("a plan over the host budget must not load");
    };
    assert!(matches!(err, LoadError::InsufficientMemory { .. }));
    assert_eq!(observed.loads.load(Ordering::SeqCst), 0);
}

#[test]
fn test_unsplittable_model_is_planned_on_host_when_layers_spill() {
    let observed = Arc::new(Observed::default());
    let loader = FakeLoader {
        accelerator: true,
        ..FakeLoader::new(observed.clone())
    };
    // Two of four bf16 layers spill; the whole model at f32 is 1600 bytes.
    let settings = ModelSettings {
        memory_budget: MemoryBudget {
            accelerator_bytes: 450,
            host_bytes: 2_000,
        },
        ..ModelSettings::default()
    };
    let engine = lifecycle(loader, settings).ensure_loaded().unwrap();

    let plan = engine.plan();
    assert_eq!(plan.placement, Placement::Host);
    assert_eq!(plan.precision, Precision::Float32);
    assert!(plan.device_map.is_none());
    assert_eq!(*observed.materialized.lock().unwrap(), [plan.clone()]);
}

#[test]
fn test_host_fallback_checks_full_precision_footprint() {
    let observed = Arc::new(Observed::default());
    let loader = FakeLoader {
        accelerator: true,
        ..FakeLoader::new(observed.clone())
    };
    // The 400 spilled bf16 bytes fit the host, the 1600 byte f32 model does not.
    let settings = ModelSettings {
        memory_budget: MemoryBudget {
            accelerator_bytes: 450,
            host_bytes: 1_000,
        },
        ..ModelSettings::default()
    };

    let Err(err) = lifecycle(loader, settings).ensure_loaded() else {
        panic!("the f32 model exceeds the host budget");
    };
    assert!(matches!(
        err,
        LoadError::InsufficientMemory {
            required: 1_600,
            available: 1_000
        }
    ));
    assert_eq!(observed.loads.load(Ordering::SeqCst), 0);
}

#[test]
fn test_host_only_plan_respects_host_budget() {
    let observed = Arc::new(Observed::default());
    let settings = ModelSettings {
        memory_budget: MemoryBudget {
            accelerator_bytes: 0,
            host_bytes: 1_000,
        },
        ..ModelSettings::default()
    };

    let Err(err) = lifecycle(FakeLoader::new(observed.clone()), settings).ensure_loaded() else {
        panic!("the f32 model exceeds the host budget");
    };
    assert!(matches!(err, LoadError::InsufficientMemory { required: 1_600, .. }));
    assert_eq!(observed.loads.load(Ordering::SeqCst), 0);
}
