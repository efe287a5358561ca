use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 检查点相关错误
    #[error("检查点错误: {0}")]
    Checkpoint(#[from] CheckpointError),
    /// 内容缓存错误
    #[error("缓存错误: {0}")]
    Cache(#[from] CacheError),
    /// 外部推理服务错误
    #[error("推理错误: {0}")]
    Inference(#[from] InferenceError),
    /// 组合优化错误
    #[error("组合优化错误: {0}")]
    Optimizer(#[from] OptimizerError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 文件操作错误
    #[error("文件错误: {0}")]
    File(#[from] FileError),
}

/// 检查点错误
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// 序列化失败
    #[error("检查点序列化失败: {source}")]
    SerializeFailed {
        #[source]
        source: serde_json::Error,
    },
    /// 写入失败
    #[error("检查点写入失败 ({path}): {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 删除失败
    #[error("检查点删除失败 ({path}): {source}")]
    DeleteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// 内容缓存错误
#[derive(Debug, Error)]
pub enum CacheError {
    /// 缓存目录不可用
    #[error("缓存目录不可用 ({path}): {source}")]
    DirectoryUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 序列化失败
    #[error("缓存条目序列化失败 (key: {key}): {source}")]
    SerializeFailed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    /// 写入失败（例如磁盘空间耗尽）
    #[error("缓存条目写入失败 (key: {key}): {source}")]
    WriteFailed {
        key: String,
        #[source]
        source: std::io::Error,
    },
    /// 清理失败
    #[error("清理缓存失败 ({path}): {source}")]
    ClearFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// 外部推理服务错误
#[derive(Debug, Error)]
pub enum InferenceError {
    /// API 调用失败
    #[error("推理 API 调用失败 (模型: {model}): {message}")]
    ApiCallFailed { model: String, message: String },
    /// 请求频率限制
    #[error("推理 API 请求频率限制 (模型: {model})")]
    RateLimited { model: String },
    /// 返回内容为空
    #[error("推理服务返回内容为空 (模型: {model})")]
    EmptyContent { model: String },
    /// 返回内容无法解析
    #[error("无法解析推理服务响应 (响应: {response}): {reason}")]
    ResponseParseFailed { response: String, reason: String },
    /// 请求构建失败
    #[error("推理请求构建失败: {0}")]
    RequestBuildFailed(String),
    /// 读取照片失败
    #[error("读取照片失败 ({path}): {source}")]
    PayloadReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl InferenceError {
    /// 是否值得重试
    ///
    /// 读取本地文件失败、请求构建失败属于确定性错误，重试没有意义
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            InferenceError::PayloadReadFailed { .. } | InferenceError::RequestBuildFailed(_)
        )
    }
}

/// 组合优化错误
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// 组合数超过安全上限
    #[error(
        "组合数 C({pool}, {k}) = {combinations} 超过配置上限 {ceiling}，请减少候选数量或 K，或显式提高上限"
    )]
    CombinationCeilingExceeded {
        pool: usize,
        k: usize,
        combinations: u128,
        ceiling: u128,
    },
    /// 选择参数无效
    #[error("无效的选择参数: 需要从 {available} 个候选中选出 {k} 个")]
    InvalidSelection { available: usize, k: usize },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置值无效
    #[error("配置项 {field} 无效: {reason}")]
    InvalidValue { field: String, reason: String },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// 文件操作错误
#[derive(Debug, Error)]
pub enum FileError {
    /// 读取文件失败
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 目录不存在
    #[error("目录不存在: {path}")]
    DirectoryNotFound { path: String },
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建配置值无效错误
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Config(ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        })
    }

    /// 创建文件读取错误
    pub fn file_read_failed(path: impl Into<String>, source: std::io::Error) -> Self {
        AppError::File(FileError::ReadFailed {
            path: path.into(),
            source,
        })
    }
}

impl InferenceError {
    /// 创建 API 调用失败错误
    pub fn api_failed(model: impl Into<String>, message: impl std::fmt::Display) -> Self {
        InferenceError::ApiCallFailed {
            model: model.into(),
            message: message.to_string(),
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
