//! Wire-level request and response types.
//!
//! The chat shapes follow the OpenAI chat-completion contract so existing
//! clients can point at the gateway unchanged. Unknown body fields are
//! ignored rather than rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

fn default_model() -> String {
    "auto".to_string()
}

/// Inbound chat request. Used by `/chat/completions`, `/chat/multimodal` and
/// `/analyze-complexity`; the multimodal route additionally populates
/// `file_ids`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub file_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChoiceMessage,
    pub finish_reason: Option<String>,
}

/// Buffered (non-streaming) chat completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_processed: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// One streamed chunk, mirroring the OpenAI `chat.completion.chunk` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl StreamChunk {
    pub fn content(id: &str, model: &str, created: i64, content: String) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: Some(content),
                },
                finish_reason: None,
            }],
        }
    }

    pub fn finish(id: &str, model: &str, created: i64, reason: &str) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta::default(),
                finish_reason: Some(reason.to_string()),
            }],
        }
    }
}

/// Metadata view of an uploaded file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecordView {
    pub id: String,
    pub original_filename: String,
    pub filename: String,
    pub size: u64,
    pub declared_mime: String,
    pub detected_mime: String,
    pub sha256: String,
    pub uploaded_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub extraction_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileListView {
    pub files: Vec<FileRecordView>,
    pub count: usize,
}

/// Extraction result view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionView {
    pub file_id: String,
    pub kind: String,
    pub text: String,
    pub truncated: bool,
    pub metadata: Value,
    pub extractor_id: String,
    pub extractor_version: String,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub context_window: u64,
    pub max_output_tokens: u64,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
    pub speed_tier: String,
    pub pricing_tier: String,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelListView {
    pub object: String,
    pub data: Vec<ModelCard>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityView {
    pub score: u8,
    pub required_capabilities: Vec<String>,
    pub estimated_input_tokens: u64,
    pub estimated_output_ceiling: u64,
    pub rationale: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteView {
    pub model: String,
    pub provider: String,
    pub reasons: Vec<String>,
    pub fallbacks: Vec<String>,
}

/// Response of `/analyze-complexity`: score plus route preview, no upstream
/// call is made.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisView {
    pub complexity: ComplexityView,
    pub route: RouteView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealthView {
    pub provider: String,
    pub reachable: bool,
    pub last_probe_age_secs: Option<u64>,
}

/// System health snapshot for `/monitoring/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshotView {
    pub uptime_secs: u64,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub providers: Vec<ProviderHealthView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Error body shape shared by every failure response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
    pub status_code: u16,
}
