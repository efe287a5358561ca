//! 程序配置
//!
//! 所有配置都是显式的结构体，必填项和可选项一目了然。
//! 只有 [`EvaluationParams`] 参与指纹计算：它决定了推理结果，改动后旧的检查点立即作废。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult, ConfigError};
use crate::orchestrator::set_optimizer::OptimizerConfig;
use crate::services::concurrency_governor::GovernorConfig;
use crate::services::retry::RetryPolicy;

/// 程序配置文件
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 项目标识，检查点和缓存都按项目隔离
    pub project_id: String,
    /// 待评估照片所在目录
    pub photo_folder: String,
    /// 状态目录（检查点 + 缓存）
    pub state_dir: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    /// 评估参数（参与指纹）
    pub evaluation: EvaluationParams,
    /// 外部调用统一的重试策略
    pub retry: RetryPolicy,
    /// 并发控制
    pub concurrency: GovernorConfig,
    pub checkpoint: CheckpointConfig,
    pub cache: CacheConfig,
    /// 组合优化
    pub optimizer: OptimizerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_id: "default".to_string(),
            photo_folder: "photos".to_string(),
            state_dir: ".photo_batch".to_string(),
            verbose_logging: false,
            output_log_file: "output.txt".to_string(),
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            evaluation: EvaluationParams::default(),
            retry: RetryPolicy::default(),
            concurrency: GovernorConfig::default(),
            checkpoint: CheckpointConfig::default(),
            cache: CacheConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

/// 评估参数
///
/// 这些字段共同决定一次评估的输出，任何语义变化都会改变配置指纹。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationParams {
    /// 模型标识（必填）
    pub model_id: String,
    /// 提示词版本（必填），提示词内容变更时递增
    pub prompt_version: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// 评估维度，例如 "composition"、"sharpness"
    #[serde(default)]
    pub criteria: Vec<String>,
    /// 图片细节级别：auto / low / high
    #[serde(default = "default_image_detail")]
    pub image_detail: String,
    /// 可选的风格提示
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style_hint: Option<String>,
    /// 额外参数，按键排序保存
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_image_detail() -> String {
    "auto".to_string()
}

impl Default for EvaluationParams {
    fn default() -> Self {
        Self {
            model_id: "gpt-4o-mini".to_string(),
            prompt_version: "v1".to_string(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            criteria: vec![
                "composition".to_string(),
                "sharpness".to_string(),
                "exposure".to_string(),
            ],
            image_detail: default_image_detail(),
            style_hint: None,
            extra: BTreeMap::new(),
        }
    }
}

/// 检查点配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// 每完成多少个条目保存一次
    pub interval: usize,
    /// 检查点过期天数
    pub staleness_days: i64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: 1,
            staleness_days: 7,
        }
    }
}

/// 缓存配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// 条目数超过该值时提示手动清理（缓存不会自动淘汰）
    pub warn_entry_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warn_entry_count: 50_000,
        }
    }
}

impl Config {
    /// 加载配置：`PHOTO_BATCH_CONFIG` 指向的 TOML 文件（可选） + 环境变量覆盖
    pub fn load() -> AppResult<Self> {
        let base = match std::env::var("PHOTO_BATCH_CONFIG") {
            Ok(path) => Self::from_toml_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        let config = base.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// 默认配置 + 环境变量
    pub fn from_env() -> AppResult<Self> {
        Self::default().with_env_overrides()
    }

    /// 从 TOML 文件加载配置，缺省字段使用默认值
    pub fn from_toml_file(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::file_read_failed(path.display().to_string(), e))?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    pub fn from_toml_str(content: &str, origin: &str) -> AppResult<Self> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::TomlParseFailed {
            path: origin.to_string(),
            source: e,
        })?;
        Ok(config)
    }

    /// 用环境变量覆盖当前配置
    pub fn with_env_overrides(mut self) -> AppResult<Self> {
        if let Ok(v) = std::env::var("PROJECT_ID") {
            self.project_id = v;
        }
        if let Ok(v) = std::env::var("PHOTO_FOLDER") {
            self.photo_folder = v;
        }
        if let Ok(v) = std::env::var("STATE_DIR") {
            self.state_dir = v;
        }
        if let Some(v) = env_parse("VERBOSE_LOGGING", "bool")? {
            self.verbose_logging = v;
        }
        if let Ok(v) = std::env::var("OUTPUT_LOG_FILE") {
            self.output_log_file = v;
        }
        if let Ok(v) = std::env::var("LLM_API_KEY") {
            self.llm_api_key = v;
        }
        if let Ok(v) = std::env::var("LLM_API_BASE_URL") {
            self.llm_api_base_url = v;
        }
        if let Ok(v) = std::env::var("LLM_MODEL_NAME") {
            self.evaluation.model_id = v;
        }
        if let Some(v) = env_parse("MAX_CONCURRENT_REQUESTS", "usize")? {
            self.concurrency.max_slots = v;
        }
        if let Some(v) = env_parse("FIXED_CONCURRENCY", "usize")? {
            self.concurrency.fixed_slots = Some(v);
        }
        if let Some(v) = env_parse("RETRY_MAX_ATTEMPTS", "u32")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = env_parse("CHECKPOINT_INTERVAL", "usize")? {
            self.checkpoint.interval = v;
        }
        if let Some(v) = env_parse("MAX_COMBINATIONS", "u64")? {
            self.optimizer.max_combinations = v;
        }
        Ok(self)
    }

    /// 校验配置取值
    pub fn validate(&self) -> AppResult<()> {
        if self.project_id.trim().is_empty() {
            return Err(AppError::invalid_config("project_id", "不能为空"));
        }
        // 项目标识直接作为状态目录名，不能跳出 state_dir
        if self.project_id.contains(['/', '\\'])
            || self.project_id == "."
            || self.project_id.contains("..")
        {
            return Err(AppError::invalid_config(
                "project_id",
                "不能包含路径分隔符或 ..",
            ));
        }
        if self.evaluation.model_id.trim().is_empty() {
            return Err(AppError::invalid_config("evaluation.model_id", "不能为空"));
        }
        if self.evaluation.prompt_version.trim().is_empty() {
            return Err(AppError::invalid_config(
                "evaluation.prompt_version",
                "不能为空",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::invalid_config("retry.max_attempts", "至少为 1"));
        }
        if self.checkpoint.interval == 0 {
            return Err(AppError::invalid_config("checkpoint.interval", "至少为 1"));
        }
        self.concurrency.validate()?;
        self.optimizer.validate()?;
        Ok(())
    }

    /// 项目状态目录
    pub fn project_dir(&self) -> PathBuf {
        Path::new(&self.state_dir).join(&self.project_id)
    }

    /// 检查点文件路径
    pub fn checkpoint_path(&self) -> PathBuf {
        self.project_dir().join("checkpoint.json")
    }

    /// 缓存目录
    pub fn cache_dir(&self) -> PathBuf {
        self.project_dir().join("cache")
    }
}

fn env_parse<T: FromStr>(var_name: &str, expected_type: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var_name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: var_name.to_string(),
                value,
                expected_type: expected_type.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
