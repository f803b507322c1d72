use argh::FromArgs;
use furnish_infernum::{
    DesignCatalog, DesignRequest, Designer, DesignerSettings, ImageSource, ModelLifecycle,
    backend::PaligemmaLoader,
    pipeline::{DEFAULT_ROOM_TYPE, DEFAULT_STYLE},
};
use std::path::PathBuf;

const DEFAULT_CONFIG: &str = "config.json";

#[derive(FromArgs)]
/// Suggests a furniture layout for one empty room photo. Provide exactly one
/// image source.
struct DesignerArgs {
    /// URL of the empty room image
    #[argh(option)]
    image_url: Option<String>,

    /// local file path of the empty room image
    #[argh(option)]
    image_file: Option<PathBuf>,

    /// base64 encoded image, optionally as a data URI
    #[argh(option)]
    image_base64: Option<String>,

    /// type of the room to design
    #[argh(option, short = 'r', default = "DEFAULT_ROOM_TYPE.to_string()")]
    room_type: String,

    /// desired interior design style
    #[argh(option, short = 's', default = "DEFAULT_STYLE.to_string()")]
    style: String,

    /// token budget of the placement stage
    #[argh(option)]
    max_tokens: Option<usize>,

    /// extra instruction appended to the placement request
    #[argh(option, short = 'n')]
    note: Option<String>,

    /// the design catalog with FURNITURE_CONFIG and STYLE_MATERIALS
    #[argh(option, short = 'c', default = "PathBuf::from(DEFAULT_CONFIG)")]
    config: PathBuf,

    /// optional runtime settings (image limits, model, generation)
    #[argh(option)]
    settings: Option<PathBuf>,
}

fn title_case(text: &str) -> String {
    text.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: DesignerArgs = argh::from_env();

    println!("\n=== Intelligent Furniture Placement AI ===");
    println!(
        "Goal: Designing a {} {}.",
        title_case(&args.style),
        title_case(&args.room_type)
    );
    println!("-----------------------------------------");

    let settings = match &args.settings {
        Some(path) => DesignerSettings::from_path(path)?,
        None => DesignerSettings::default(),
    };
    let catalog = DesignCatalog::from_path(&args.config)?;

    let source = ImageSource::from_parts(args.image_url, args.image_file, args.image_base64)?;
    let mut request = DesignRequest::new(source)
        .room_type(args.room_type)
        .style(args.style)
        .max_tokens(
            args.max_tokens
                .unwrap_or(settings.generation.default_max_tokens),
        );
    if let Some(note) = args.note {
        request = request.important_prompt(note);
    }

    let lifecycle = ModelLifecycle::new(
        PaligemmaLoader::new(&settings.model),
        settings.model.clone(),
        settings.generation.generation_timeout(),
    );
    let engine = lifecycle.ensure_loaded()?;
    let designer = Designer::new(engine, catalog, &settings);

    match designer.design(&request) {
        Ok(suggestion) => {
            println!("\n======================================");
            println!("AI Interior Designer Suggestion:");
            println!("======================================");
            println!("{}", suggestion.suggestion);
            println!("======================================\n");
        }
        Err(e) => println!("\n[{}] {e}", e.reason()),
    }

    Ok(())
}
