use argh::FromArgs;
use axum::{
    Json, Router,
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use furnish_infernum::{
    DesignCatalog, DesignError, DesignRequest, Designer, DesignerSettings, ImageSource,
    InferenceEngine, ModelLifecycle, backend::PaligemmaLoader,
};
use reqwest::StatusCode;
use serde_json::json;
use std::{path::PathBuf, sync::Arc};

mod messages;

// defaults for the server
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_CONFIG: &str = "config.json";

#[derive(FromArgs)]
/// Serves furniture placement suggestions for empty room photos.
struct ServerArgs {
    /// the host to run the server on
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to run the server on
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// the design catalog with FURNITURE_CONFIG and STYLE_MATERIALS
    #[argh(option, short = 'c', default = "PathBuf::from(DEFAULT_CONFIG)")]
    config: PathBuf,

    /// optional runtime settings (image limits, model, generation)
    #[argh(option, short = 's')]
    settings: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    designer: Arc<Designer<Arc<InferenceEngine>>>,
    default_max_tokens: usize,
}

async fn post_generate(
    State(state): State<AppState>,
    Json(payload): Json<messages::GenerateRequest>,
) -> Response {
    let source = match ImageSource::from_parts(
        payload.image_url,
        payload.image_path,
        payload.image_base64,
    ) {
        Ok(source) => source,
        Err(e) => return failure(DesignError::from(e)),
    };

    let mut request = DesignRequest::new(source)
        .room_type(payload.room_type)
        .style(payload.style)
        .max_tokens(payload.max_tokens.unwrap_or(state.default_max_tokens));
    if let Some(note) = payload.important_prompt {
        request = request.important_prompt(note);
    }
    log::info!(
        "Design request: {} {} from {}",
        request.style,
        request.room_type,
        request.source.kind()
    );

    let designer = state.designer;
    let outcome = tokio::task::spawn_blocking(move || designer.design(&request)).await;
    match outcome {
        Ok(Ok(suggestion)) => (StatusCode::OK, Json(suggestion)).into_response(),
        Ok(Err(e)) => failure(e),
        Err(e) => {
            log::error!("Design task aborted: {e}");
            failure(DesignError::Internal(e.to_string()))
        }
    }
}

fn failure(e: DesignError) -> Response {
    let status = if e.is_caller_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(e.payload())).into_response()
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.designer.generator();
    let plan = engine.plan();
    Json(json!({
        "status": engine.state().as_str(),
        "model_id": plan.model_id,
        "placement": plan.placement.as_str(),
        "precision": plan.precision.as_str(),
        "offloaded_layers": plan.device_map.as_ref().map_or(0, |map| map.offloaded_layers()),
        "load_seconds": engine.load_time().as_secs_f64(),
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: ServerArgs = argh::from_env();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    let settings = match &args.settings {
        Some(path) => DesignerSettings::from_path(path)?,
        None => DesignerSettings::default(),
    };
    let catalog = DesignCatalog::from_path(&args.config)?;
    log::info!(
        "Catalog loaded: {} room types, {} styles",
        catalog.room_types().count(),
        catalog.style_names().count()
    );

    let lifecycle = ModelLifecycle::new(
        PaligemmaLoader::new(&settings.model),
        settings.model.clone(),
        settings.generation.generation_timeout(),
    );
    let engine = tokio::task::spawn_blocking(move || lifecycle.ensure_loaded()).await??;

    let state = AppState {
        designer: Arc::new(Designer::new(engine, catalog, &settings)),
        default_max_tokens: settings.generation.default_max_tokens,
    };

    let app = Router::new()
        .route("/", get(|| async { "Welcome to the furniture placement designer!" }))
        .route("/generate", post(post_generate))
        .route("/status", get(get_status))
        .with_state(state);

    log::info!("🚀 Starting the server");
    log::info!("🔥 Listening on: {}", addr);
    log::info!("🔧 Press Ctrl+C to stop the server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
