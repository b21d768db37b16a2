//! Sighting Sidecar Binary
//!
//! Runs as a separate process that owns the record store and the pose model.
//! Front ends talk to it with line-delimited JSON-RPC 2.0 over stdin/stdout.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use dogtrack::{
    report, AppConfig, AppState, InputError, SightingError, SightingOutcome, SightingRequest,
};

const INVALID_PARAMS: i32 = -32602;
const SERVER_ERROR: i32 = -32000;
const PARSE_ERROR: i32 = -32700;

// ============================================================================
// JSON-RPC Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    id: u64,
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: u64, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError { code, message }),
        }
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct InitializeParams {
    /// Optional JSON config file; defaults and WMD_* overrides apply either way
    #[serde(default)]
    config_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitSightingParams {
    /// Local path of the photo to process
    image_path: String,
    /// Name to record the upload under; defaults to the image's file name
    #[serde(default)]
    file_name: Option<String>,
    label: String,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetDogParams {
    id: String,
}

// ============================================================================
// State
// ============================================================================

struct SidecarState {
    app: Option<Arc<AppState>>,
}

type SharedState = Arc<RwLock<SidecarState>>;

async fn app(state: &SharedState) -> Result<Arc<AppState>> {
    state
        .read()
        .await
        .app
        .clone()
        .ok_or_else(|| anyhow!("Sidecar not initialized"))
}

fn open_app(config_path: Option<&Path>) -> Result<AppState> {
    let config = AppConfig::load(config_path)?;
    AppState::open(config)
}

// ============================================================================
// Handlers
// ============================================================================

async fn handle_initialize(state: SharedState, params: InitializeParams) -> Result<serde_json::Value> {
    let config_path = params.config_path.map(PathBuf::from);
    let app = tokio::task::spawn_blocking(move || open_app(config_path.as_deref()))
        .await
        .context("Initialization task failed")??;

    let mut guard = state.write().await;
    guard.app = Some(Arc::new(app));

    Ok(serde_json::json!({ "success": true }))
}

async fn handle_submit_sighting(
    state: SharedState,
    params: SubmitSightingParams,
) -> Result<serde_json::Value> {
    let pipeline = app(&state).await?.pipeline();

    let image = match std::fs::read(&params.image_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("Failed to read image {}: {}", params.image_path, e);
            return Err(SightingError::from(InputError::MissingImage).into());
        }
    };
    let file_name = params.file_name.unwrap_or_else(|| {
        Path::new(&params.image_path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    let request = SightingRequest {
        label: params.label,
        file_name,
        image,
        note: params.note,
    };

    let outcome = tokio::task::spawn_blocking(move || pipeline.submit(&request))
        .await
        .context("Sighting task failed")??;

    let mut value = serde_json::to_value(&outcome)?;
    if let SightingOutcome::NoKeypoints = outcome {
        value["message"] = SightingOutcome::NO_KEYPOINTS_MESSAGE.into();
    }
    value["html"] = report::render_sighting(&outcome)?.into();
    Ok(value)
}

/// Run a store read on the blocking pool
async fn read_store<T, F>(state: &SharedState, f: F) -> Result<T>
where
    F: FnOnce(&AppState) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let app = app(state).await?;
    tokio::task::spawn_blocking(move || f(&app))
        .await
        .context("Store task failed")?
}

async fn handle_get_dog(state: SharedState, params: GetDogParams) -> Result<serde_json::Value> {
    let record = read_store(&state, move |app| app.db().get_dog(&params.id)).await?;
    Ok(serde_json::to_value(record)?)
}

async fn handle_list_dogs(state: SharedState) -> Result<serde_json::Value> {
    let records = read_store(&state, |app| app.db().list_dogs()).await?;
    Ok(serde_json::to_value(records)?)
}

async fn handle_render_records(state: SharedState) -> Result<serde_json::Value> {
    let html = read_store(&state, |app| report::render_records(&app.db().list_dogs()?)).await?;
    Ok(serde_json::json!({ "html": html }))
}

async fn handle_is_ready(state: SharedState) -> Result<serde_json::Value> {
    let guard = state.read().await;
    Ok(serde_json::json!({
        "ready": guard.app.is_some()
    }))
}

async fn handle_shutdown(state: SharedState) -> Result<serde_json::Value> {
    log::info!("Shutting down...");
    let mut guard = state.write().await;
    guard.app = None;

    Ok(serde_json::json!({
        "success": true
    }))
}

// ============================================================================
// Main Loop
// ============================================================================

/// Input problems are the caller's to fix; anything else gets a generic message
fn rpc_error(err: &anyhow::Error) -> (i32, String) {
    match err.downcast_ref::<SightingError>() {
        Some(sighting) if sighting.is_input() => (INVALID_PARAMS, sighting.user_message()),
        Some(sighting) => {
            log::error!("Sighting failed: {}", sighting);
            (SERVER_ERROR, sighting.user_message())
        }
        None => (SERVER_ERROR, format!("{:#}", err)),
    }
}

fn params<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, JsonRpcError> {
    // Omitted params count as an empty object
    let value = if value.is_null() { serde_json::json!({}) } else { value };
    serde_json::from_value(value).map_err(|e| JsonRpcError {
        code: INVALID_PARAMS,
        message: format!("Invalid params: {}", e),
    })
}

async fn process_request(state: SharedState, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id;
    let result = match request.method.as_str() {
        "initialize" => match params::<InitializeParams>(request.params) {
            Ok(p) => handle_initialize(state, p).await,
            Err(e) => return JsonRpcResponse::error(id, e.code, e.message),
        },
        "submit_sighting" => match params::<SubmitSightingParams>(request.params) {
            Ok(p) => handle_submit_sighting(state, p).await,
            Err(e) => return JsonRpcResponse::error(id, e.code, e.message),
        },
        "get_dog" => match params::<GetDogParams>(request.params) {
            Ok(p) => handle_get_dog(state, p).await,
            Err(e) => return JsonRpcResponse::error(id, e.code, e.message),
        },
        "list_dogs" => handle_list_dogs(state).await,
        "render_records" => handle_render_records(state).await,
        "is_ready" => handle_is_ready(state).await,
        "shutdown" => handle_shutdown(state).await,
        _ => Err(anyhow!("Unknown method: {}", request.method)),
    };

    match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => {
            let (code, message) = rpc_error(&e);
            JsonRpcResponse::error(id, code, message)
        }
    }
}

fn write_response(response: &JsonRpcResponse) {
    let line = match serde_json::to_string(response) {
        Ok(line) => line,
        Err(e) => {
            log::error!("Failed to serialize response: {}", e);
            return;
        }
    };

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    if let Err(e) = writeln!(handle, "{}", line) {
        log::error!("Failed to write response: {}", e);
    }
    let _ = handle.flush();
}

#[tokio::main]
async fn main() {
    // Set up panic hook to log panics to stderr before exiting
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Sighting Sidecar PANIC: {}", panic_info);
        if let Some(location) = panic_info.location() {
            eprintln!("  at {}:{}:{}", location.file(), location.line(), location.column());
        }
    }));

    // Initialize logging to stderr (stdout is for JSON-RPC)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,ort=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    log::info!("Sighting Sidecar starting...");

    // First argument, if any, is a config file
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let app = match open_app(config_path.as_deref()) {
        Ok(app) => Some(Arc::new(app)),
        Err(e) => {
            log::error!("Failed to open app state, waiting for initialize: {:#}", e);
            None
        }
    };
    let state: SharedState = Arc::new(RwLock::new(SidecarState { app }));

    let stdin = io::stdin();

    // Read JSON-RPC requests line by line from stdin
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                log::error!("Failed to read line: {}", e);
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                log::error!("Failed to parse request: {}", e);
                write_response(&JsonRpcResponse::error(0, PARSE_ERROR, format!("Parse error: {}", e)));
                continue;
            }
        };

        log::debug!("Received request: {} (id={})", request.method, request.id);

        let shutdown = request.method == "shutdown";
        let response = process_request(state.clone(), request).await;
        write_response(&response);

        if shutdown {
            break;
        }
    }

    log::info!("Sighting Sidecar shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use dogtrack::keypoints::{Detection, Keypoint};
    use dogtrack::pose::PoseEstimator;
    use image::{DynamicImage, RgbImage};
    use tempfile::tempdir;

    struct OneDog;

    impl PoseEstimator for OneDog {
        fn predict(&self, _image: &DynamicImage) -> Result<Vec<Detection>> {
            Ok(vec![Detection::new(vec![Keypoint::new(3.0, 4.0)], 0.8)])
        }

        fn keypoint_count(&self) -> usize {
            1
        }
    }

    fn call(method: &str, params: serde_json::Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: 1,
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn test_input_errors_are_invalid_params() {
        let err: anyhow::Error = SightingError::from(InputError::MissingLabel).into();
        assert_eq!(rpc_error(&err), (INVALID_PARAMS, "No dog name provided".to_string()));
    }

    #[test]
    fn test_internal_errors_are_generic() {
        let err: anyhow::Error = SightingError::Store(anyhow!("disk I/O error")).into();
        let (code, message) = rpc_error(&err);

        assert_eq!(code, SERVER_ERROR);
        assert!(!message.contains("disk"));
    }

    #[test]
    fn test_params_rejects_missing_fields() {
        let err = params::<SubmitSightingParams>(serde_json::json!({ "label": "Rex" })).unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_uninitialized_sidecar() {
        let state: SharedState = Arc::new(RwLock::new(SidecarState { app: None }));

        let ready = process_request(
            state.clone(),
            JsonRpcRequest {
                jsonrpc: "2.0".to_string(),
                id: 1,
                method: "is_ready".to_string(),
                params: serde_json::Value::Null,
            },
        )
        .await;
        assert_eq!(ready.result, Some(serde_json::json!({ "ready": false })));

        let listed = process_request(
            state,
            JsonRpcRequest {
                jsonrpc: "2.0".to_string(),
                id: 2,
                method: "list_dogs".to_string(),
                params: serde_json::Value::Null,
            },
        )
        .await;
        assert_eq!(listed.error.map(|e| e.code), Some(SERVER_ERROR));
    }

    #[tokio::test]
    async fn test_store_reads() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        let app = AppState::with_estimator(config, Arc::new(OneDog)).unwrap();

        let image = dogtrack::overlay::encode_png(&RgbImage::new(8, 8)).unwrap();
        app.pipeline()
            .submit(&SightingRequest {
                label: "Rex".to_string(),
                file_name: "rex.png".to_string(),
                image,
                note: Some("park".to_string()),
            })
            .unwrap();

        let state: SharedState = Arc::new(RwLock::new(SidecarState { app: Some(Arc::new(app)) }));
        let id = dogtrack::derive_id("Rex").into_string();

        let dog = process_request(state.clone(), call("get_dog", serde_json::json!({ "id": id })))
            .await
            .result
            .unwrap();
        assert_eq!(dog["label"], "Rex");
        assert_eq!(dog["note"], "park");

        let missing = process_request(state.clone(), call("get_dog", serde_json::json!({ "id": "nope" })))
            .await;
        assert_eq!(missing.result, Some(serde_json::Value::Null));

        let listed = process_request(state.clone(), call("list_dogs", serde_json::Value::Null))
            .await
            .result
            .unwrap();
        assert_eq!(listed.as_array().map(Vec::len), Some(1));

        let page = process_request(state, call("render_records", serde_json::Value::Null))
            .await
            .result
            .unwrap();
        assert!(page["html"].as_str().unwrap().contains("Rex"));
    }
}
