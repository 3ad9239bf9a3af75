use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 60030;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Cache TTL applied to every per-user working-set key.
pub const CACHE_TTL_SECS: u64 = 3600;
/// Per-operation deadline for the hot cache.
pub const CACHE_OP_TIMEOUT_MS: u64 = 1000;
/// Deadline for a single language-model or speech-synthesis call.
pub const UPSTREAM_TIMEOUT_SECS: u64 = 60;
/// Maximum size of one base64 audio chunk in a sing frame.
pub const SING_CHUNK_BYTES: usize = 640 * 1024;

/// Top-level config (tianyi.toml + TIANYI_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TianyiConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub music: MusicConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for TianyiConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            vector: VectorConfig::default(),
            llm: LlmConfig::default(),
            memory: MemoryConfig::default(),
            music: MusicConfig::default(),
            speech: SpeechConfig::default(),
            vision: VisionConfig::default(),
            agent: AgentConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the durable log (SQLite, WAL mode).
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Directory that receives user-uploaded images.
    #[serde(default = "default_image_dir")]
    pub image_dir: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            image_dir: default_image_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// redis:// connection URL of the shared hot cache.
    #[serde(default = "default_cache_url")]
    pub url: String,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: default_cache_url(),
            ttl_secs: CACHE_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Base URL of the similarity-index service (Chroma-compatible REST API).
    #[serde(default = "default_vector_url")]
    pub base_url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            base_url: default_vector_url(),
            collection: default_collection(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_embedding_url(),
            api_key: String::new(),
            model: default_embedding_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions endpoint, without trailing slash.
    #[serde(default = "default_llm_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_url(),
            api_key: String::new(),
            model: default_llm_model(),
            max_retries: default_max_retries(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Number of unsummarized entries carried verbatim before the
    /// summarizer kicks in.
    #[serde(default = "default_raw_context_limit")]
    pub raw_context_limit: u32,
    /// Entries kept verbatim after a summarization pass.
    #[serde(default = "default_not_zip_count")]
    pub not_zip_count: u32,
    /// Vector hits below this score are discarded.
    #[serde(default = "default_similarity_cutoff")]
    pub similarity_cutoff: f64,
    /// Maximum hits requested per vector search.
    #[serde(default = "default_max_k")]
    pub max_k: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            raw_context_limit: default_raw_context_limit(),
            not_zip_count: default_not_zip_count(),
            similarity_cutoff: default_similarity_cutoff(),
            max_k: default_max_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicConfig {
    /// Root of the song resources; songs live under `<resource_path>/songs`.
    #[serde(default = "default_music_path")]
    pub resource_path: String,
}

impl Default for MusicConfig {
    fn default() -> Self {
        Self {
            resource_path: default_music_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Base URL of the speech synthesizer.
    #[serde(default = "default_speech_url")]
    pub base_url: String,
    #[serde(default = "default_speech_timeout")]
    pub timeout_secs: u64,
    /// Voice tones the synthesizer can render. The first entry is the
    /// fallback when the generator picks an unknown tone.
    #[serde(default = "default_tones")]
    pub tones: Vec<String>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            base_url: default_speech_url(),
            timeout_secs: default_speech_timeout(),
            tones: default_tones(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    /// OpenAI-compatible vision endpoint used to describe uploaded images.
    #[serde(default = "default_llm_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_vision_model")]
    pub model: String,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_url(),
            api_key: String::new(),
            model: default_vision_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Live2D expressions the generator may pick from.
    #[serde(default = "default_expressions")]
    pub expressions: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            expressions: default_expressions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Secret that signs message tokens. Override in production.
    #[serde(default = "default_token_secret")]
    pub token_secret: String,
    /// When false, registration accepts any invite code string.
    #[serde(default = "bool_true")]
    pub invite_required: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: default_token_secret(),
            invite_required: true,
        }
    }
}

fn bool_true() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    "data/database/tianyi.db".to_string()
}
fn default_image_dir() -> String {
    "data/images".to_string()
}
fn default_cache_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_cache_ttl() -> u64 {
    CACHE_TTL_SECS
}
fn default_vector_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_collection() -> String {
    "tianyi_memory".to_string()
}
fn default_embedding_url() -> String {
    "https://api.siliconflow.cn/v1".to_string()
}
fn default_embedding_model() -> String {
    "BAAI/bge-large-zh-v1.5".to_string()
}
fn default_llm_url() -> String {
    "https://api.siliconflow.cn/v1".to_string()
}
fn default_llm_model() -> String {
    "deepseek-ai/DeepSeek-V3".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_llm_timeout() -> u64 {
    UPSTREAM_TIMEOUT_SECS
}
fn default_raw_context_limit() -> u32 {
    100
}
fn default_not_zip_count() -> u32 {
    20
}
fn default_similarity_cutoff() -> f64 {
    0.50
}
fn default_max_k() -> usize {
    3
}
fn default_music_path() -> String {
    "res/music".to_string()
}
fn default_speech_url() -> String {
    "http://127.0.0.1:9880".to_string()
}
fn default_speech_timeout() -> u64 {
    UPSTREAM_TIMEOUT_SECS
}
fn default_tones() -> Vec<String> {
    ["normal", "happy", "sad", "angry", "whisper"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_vision_model() -> String {
    "Qwen/Qwen2.5-VL-32B-Instruct".to_string()
}
fn default_expressions() -> Vec<String> {
    ["普通", "开心", "难过", "生气", "害羞", "惊讶", "唱歌"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_token_secret() -> String {
    "change-me".to_string()
}

impl TianyiConfig {
    /// Load config from a TOML file with TIANYI_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("config/tianyi.toml");

        let config: TianyiConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("TIANYI_").split("_"))
            .extract()
            .map_err(|e| crate::error::TianyiError::Config(e.to_string()))?;

        Ok(config)
    }
}
