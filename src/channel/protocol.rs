//! Wire types exchanged with the OCR worker.
//!
//! Commands travel controller → worker as [`CommandEnvelope`]s; everything the
//! worker emits arrives as one of the closed [`WorkerMessage`] variants.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::correlation::CorrelationId;
use super::events::Listener;

// ============================================================================
// Commands
// ============================================================================

/// Commands understood by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    Init,
    LoadModels,
    ProcessImage,
    ProcessRegion,
    GetStatus,
    Dispose,
}

impl CommandKind {
    /// All command kinds, in lifecycle order.
    pub const ALL: [CommandKind; 6] = [
        CommandKind::Init,
        CommandKind::LoadModels,
        CommandKind::ProcessImage,
        CommandKind::ProcessRegion,
        CommandKind::GetStatus,
        CommandKind::Dispose,
    ];

    /// Wire name of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Init => "INIT",
            CommandKind::LoadModels => "LOAD_MODELS",
            CommandKind::ProcessImage => "PROCESS_IMAGE",
            CommandKind::ProcessRegion => "PROCESS_REGION",
            CommandKind::GetStatus => "GET_STATUS",
            CommandKind::Dispose => "DISPOSE",
        }
    }

    /// Key used for this command in configuration files (`load_models`, ...).
    pub fn config_key(&self) -> &'static str {
        match self {
            CommandKind::Init => "init",
            CommandKind::LoadModels => "load_models",
            CommandKind::ProcessImage => "process_image",
            CommandKind::ProcessRegion => "process_region",
            CommandKind::GetStatus => "get_status",
            CommandKind::Dispose => "dispose",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = String;

    /// Accepts both the wire name (`LOAD_MODELS`) and the config key (`load_models`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s || kind.config_key() == s)
            .ok_or_else(|| format!("unknown command: {s}"))
    }
}

/// Envelope sent to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Command discriminant.
    #[serde(rename = "type")]
    pub kind: CommandKind,
    /// Command-specific payload.
    pub data: Value,
    /// Correlation id echoed back by the worker.
    pub id: CorrelationId,
}

impl CommandEnvelope {
    /// Encode as a single NDJSON line (including the trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self).map(|mut line| {
            line.push('\n');
            line
        })
    }
}

// ============================================================================
// Worker messages
// ============================================================================

/// Everything the worker can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Terminal success for a command.
    Success {
        id: CorrelationId,
        #[serde(default)]
        data: Value,
    },
    /// Terminal failure for a command.
    Error {
        id: CorrelationId,
        #[serde(default = "unknown_error", deserialize_with = "error_text")]
        error: String,
    },
    /// Out-of-band progress. The id, when present, names the command that
    /// produced it but is never used for correlation.
    Progress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<CorrelationId>,
        data: ProgressUpdate,
    },
    /// Worker-side log record.
    Log { data: LogRecord },
    /// The worker context itself failed.
    WorkerError {
        #[serde(default = "unknown_error", deserialize_with = "error_text")]
        error: String,
    },
}

impl WorkerMessage {
    /// Parse one NDJSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim_end())
    }

    /// Correlation id carried by the message, if any.
    pub fn id(&self) -> Option<CorrelationId> {
        match self {
            WorkerMessage::Success { id, .. } | WorkerMessage::Error { id, .. } => Some(*id),
            WorkerMessage::Progress { id, .. } => *id,
            WorkerMessage::Log { .. } | WorkerMessage::WorkerError { .. } => None,
        }
    }

    /// Whether this message settles a pending command.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerMessage::Success { .. } | WorkerMessage::Error { .. }
        )
    }
}

fn unknown_error() -> String {
    "unknown worker error".to_string()
}

/// Workers report errors either as a bare string or as `{ "message": ... }`.
fn error_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(text) => text,
        Value::Null => unknown_error(),
        Value::Object(ref map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    })
}

/// Progress notification payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressUpdate {
    /// Human-readable stage description.
    pub message: String,
    /// Completion fraction as reported by the worker.
    pub progress: f64,
}

impl ProgressUpdate {
    pub fn new(message: impl Into<String>, progress: f64) -> Self {
        Self {
            message: message.into(),
            progress,
        }
    }
}

/// Severity of a worker log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<String> for LogLevel {
    fn from(level: String) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Log record emitted by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    #[serde(default)]
    pub message: String,
    /// Worker-side timestamp (milliseconds since the epoch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

// ============================================================================
// Status
// ============================================================================

/// Snapshot of the worker's state as seen by the controller.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelStatus {
    pub initialized: bool,
    pub backend: Option<String>,
    pub using_fallback: bool,
    pub models_loaded: bool,
    /// Set only when the status could not be obtained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChannelStatus {
    /// Status reported when the worker could not be queried.
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub(crate) fn from_init(report: InitReport) -> Self {
        Self {
            initialized: true,
            backend: report.backend,
            using_fallback: report.using_fallback,
            models_loaded: false,
            error: None,
        }
    }
}

/// Data returned by the worker for a successful INIT.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct InitReport {
    pub backend: Option<String>,
    pub using_fallback: bool,
}

// ============================================================================
// Command payloads
// ============================================================================

/// Parameters for INIT.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitOptions {
    /// Preferred inference backend (e.g. `webgpu`, `wasm`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_backend: Option<String>,
    /// Where the worker should look for model files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_root: Option<String>,
    /// Anything else the worker understands.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InitOptions {
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.preferred_backend = Some(backend.into());
        self
    }

    pub fn with_resource_root(mut self, root: impl Into<String>) -> Self {
        self.resource_root = Some(root.into());
        self
    }
}

/// Image handed to the worker. `data` is base64 encoded on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl ImagePayload {
    /// An encoded image file (PNG, JPEG, ...).
    pub fn encoded(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            width: None,
            height: None,
            mime_type: Some(mime_type.into()),
            data,
        }
    }

    /// Raw RGBA pixels.
    pub fn rgba(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            mime_type: None,
            data,
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}

/// Rectangle within an image, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Options for PROCESS_IMAGE / PROCESS_REGION.
///
/// The progress listener is local to the controller and never serialized;
/// only `params` reach the worker.
#[derive(Clone, Default, Serialize)]
pub struct ProcessOptions {
    #[serde(skip)]
    pub on_progress: Option<Listener>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl ProcessOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe progress for the duration of the call.
    pub fn with_progress(mut self, listener: Listener) -> Self {
        self.on_progress = Some(listener);
        self
    }

    /// Set a worker-side option.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Payload of PROCESS_IMAGE.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessImageParams {
    pub image: ImagePayload,
    pub options: ProcessOptions,
}

/// Payload of PROCESS_REGION.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRegionParams {
    pub image: ImagePayload,
    pub region: Region,
    pub options: ProcessOptions,
}

impl fmt::Debug for ProcessOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessOptions")
            .field("on_progress", &self.on_progress.is_some())
            .field("params", &self.params)
            .finish()
    }
}
