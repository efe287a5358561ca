//! LLM 服务 - 业务能力层
//!
//! 只负责"看图打分"能力，不关心流程
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 照片以 base64 data URL 的形式走 Vision 接口
//! - 兼容 OpenAI API 的服务（如 Azure, Gemini, Doubao 等）

use std::sync::LazyLock;

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageDetail,
        ImageUrl,
    },
    Client,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex::Regex;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::{Config, EvaluationParams};
use crate::error::InferenceError;
use crate::models::{EvaluationResult, GroupResult, ItemPayload};
use crate::services::inference::{GroupEvaluator, ItemEvaluator};
use crate::utils::truncate_text;

const ITEM_SYSTEM_PROMPT: &str = "你是一名专业的摄影评审，擅长从构图、清晰度、曝光和情绪表达等角度评价照片。\
                                  你只输出 JSON，不输出任何其他内容。";

const GROUP_SYSTEM_PROMPT: &str = "你是一名专业的图片编辑，负责评价一组照片放在一起时的整体效果，\
                                   包括叙事连贯性、互补性和重复程度。你只输出 JSON，不输出任何其他内容。";

/// LLM 服务
///
/// 职责：
/// - 调用 Vision API 评估单张照片
/// - 调用 Vision API 评估一组照片的整体效果
/// - 不关心批次、检查点、缓存
pub struct LlmService {
    client: Client<OpenAIConfig>,
}

impl LlmService {
    /// 创建新的 LLM 服务
    pub fn new(config: &Config) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        Self {
            client: Client::with_config(openai_config),
        }
    }

    /// 通用的 LLM 调用函数
    ///
    /// 其余评估能力都基于此函数；`images` 中的照片按顺序追加到用户消息。
    pub async fn send_to_llm(
        &self,
        user_message: &str,
        system_message: Option<&str>,
        images: &[ItemPayload],
        params: &EvaluationParams,
    ) -> Result<String, InferenceError> {
        let model = params.model_id.as_str();
        debug!("调用 LLM API，模型: {}", model);
        debug!(
            "用户消息长度: {} 字符，图片 {} 张",
            user_message.len(),
            images.len()
        );

        let mut messages = Vec::new();

        if let Some(sys_msg) = system_message {
            let system_msg = ChatCompletionRequestSystemMessageArgs::default()
                .content(sys_msg)
                .build()
                .map_err(build_err)?;
            messages.push(ChatCompletionRequestMessage::System(system_msg));
        }

        let user_msg = if images.is_empty() {
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_message)
                .build()
                .map_err(build_err)?
        } else {
            let detail = image_detail(&params.image_detail);
            let mut content_parts: Vec<ChatCompletionRequestUserMessageContentPart> =
                Vec::with_capacity(images.len() + 1);

            content_parts.push(ChatCompletionRequestUserMessageContentPart::Text(
                ChatCompletionRequestMessageContentPartText {
                    text: user_message.to_string(),
                },
            ));

            for payload in images {
                content_parts.push(ChatCompletionRequestUserMessageContentPart::ImageUrl(
                    ChatCompletionRequestMessageContentPartImage {
                        image_url: ImageUrl {
                            url: data_url(payload),
                            detail: Some(detail.clone()),
                        },
                    },
                ));
            }

            ChatCompletionRequestUserMessageArgs::default()
                .content(ChatCompletionRequestUserMessageContent::Array(
                    content_parts,
                ))
                .build()
                .map_err(build_err)?
        };

        messages.push(ChatCompletionRequestMessage::User(user_msg));

        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(messages)
            .temperature(params.temperature)
            .max_tokens(params.max_tokens)
            .build()
            .map_err(build_err)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| classify_api_error(model, e))?;

        debug!("LLM API 调用成功");

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| InferenceError::EmptyContent {
                model: model.to_string(),
            })?;

        Ok(content.trim().to_string())
    }
}

#[async_trait]
impl ItemEvaluator for LlmService {
    async fn evaluate(
        &self,
        payload: &ItemPayload,
        params: &EvaluationParams,
    ) -> Result<EvaluationResult, InferenceError> {
        let user_message = build_item_message(params);
        let response = self
            .send_to_llm(
                &user_message,
                Some(ITEM_SYSTEM_PROMPT),
                std::slice::from_ref(payload),
                params,
            )
            .await?;
        let result = parse_item_response(&response)?;
        debug!("照片 {} 得分 {:.1}", payload.item_id, result.score);
        Ok(result)
    }
}

#[async_trait]
impl GroupEvaluator for LlmService {
    async fn evaluate_group(
        &self,
        payloads: &[ItemPayload],
        params: &EvaluationParams,
    ) -> Result<GroupResult, InferenceError> {
        let user_message = build_group_message(payloads, params);
        let response = self
            .send_to_llm(&user_message, Some(GROUP_SYSTEM_PROMPT), payloads, params)
            .await?;
        parse_group_response(&response)
    }
}

/// 构建单张照片的评估提示词
fn build_item_message(params: &EvaluationParams) -> String {
    let criteria = if params.criteria.is_empty() {
        "整体观感".to_string()
    } else {
        params.criteria.join("、")
    };
    let style = params
        .style_hint
        .as_deref()
        .map(|hint| format!("\n风格偏好：{}", hint))
        .unwrap_or_default();

    format!(
        r#"请评估这张照片（提示词版本 {}）。

评估维度：{}{}

按以下 JSON 格式返回，score 为 0 到 10 的数字：
{{"score": 7.5, "tags": {{"subject": "主体", "tone": "色调", "style": "风格"}}, "summary": "一句话评价"}}

tags 中每一项只用一个简短的英文单词。"#,
        params.prompt_version, criteria, style
    )
}

/// 构建照片组的评估提示词
fn build_group_message(payloads: &[ItemPayload], params: &EvaluationParams) -> String {
    let ids: Vec<&str> = payloads.iter().map(|p| p.item_id.as_str()).collect();
    format!(
        r#"下面是同一组的 {} 张照片（按顺序: {}，提示词版本 {}）。

请评价它们放在一起的整体效果，按以下 JSON 格式返回，score 为 0 到 10 的数字：
{{"score": 8.0, "rationale": "一句话理由"}}"#,
        payloads.len(),
        ids.join(", "),
        params.prompt_version
    )
}

/// 贪婪匹配第一个 { 到最后一个 }，兼容 ```json 代码块和前后多余文字
static JSON_BLOCK: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}"));

fn extract_json<T: DeserializeOwned>(response: &str) -> Result<T, InferenceError> {
    let parse_err = |reason: String| InferenceError::ResponseParseFailed {
        response: truncate_text(response, 200),
        reason,
    };

    let re = JSON_BLOCK
        .as_ref()
        .map_err(|e| parse_err(e.to_string()))?;
    let block = re
        .find(response)
        .ok_or_else(|| parse_err("响应中没有 JSON 对象".to_string()))?;

    serde_json::from_str(block.as_str()).map_err(|e| parse_err(e.to_string()))
}

fn check_score(score: f64, response: &str) -> Result<(), InferenceError> {
    if score.is_finite() && (0.0..=10.0).contains(&score) {
        Ok(())
    } else {
        Err(InferenceError::ResponseParseFailed {
            response: truncate_text(response, 200),
            reason: format!("分数 {} 不在 0-10 范围内", score),
        })
    }
}

/// 解析单张照片的评估响应
fn parse_item_response(response: &str) -> Result<EvaluationResult, InferenceError> {
    let result: EvaluationResult = extract_json(response)?;
    check_score(result.score, response)?;
    Ok(result)
}

/// 解析照片组的评估响应
fn parse_group_response(response: &str) -> Result<GroupResult, InferenceError> {
    let result: GroupResult = extract_json(response)?;
    check_score(result.score, response)?;
    Ok(result)
}

fn data_url(payload: &ItemPayload) -> String {
    format!(
        "data:{};base64,{}",
        payload.media_type,
        STANDARD.encode(&payload.bytes)
    )
}

fn image_detail(value: &str) -> ImageDetail {
    match value.to_ascii_lowercase().as_str() {
        "low" => ImageDetail::Low,
        "high" => ImageDetail::High,
        _ => ImageDetail::Auto,
    }
}

fn build_err(e: OpenAIError) -> InferenceError {
    InferenceError::RequestBuildFailed(e.to_string())
}

/// 区分限流和其他 API 错误，两者都可重试
fn classify_api_error(model: &str, e: OpenAIError) -> InferenceError {
    let message = e.to_string();
    warn!("LLM API 调用失败: {}", message);
    let lower = message.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
        InferenceError::RateLimited {
            model: model.to_string(),
        }
    } else {
        InferenceError::api_failed(model, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(id: &str) -> ItemPayload {
        ItemPayload {
            item_id: id.to_string(),
            media_type: "image/png".to_string(),
            bytes: vec![0x89, b'P', b'N', b'G'],
        }
    }

    #[test]
    fn test_parse_item_response_plain_json() {
        let result = parse_item_response(
            r#"{"score": 7.5, "tags": {"subject": "beach", "tone": "warm", "style": "candid"}, "summary": "nice"}"#,
        )
        .unwrap();
        assert_eq!(result.score, 7.5);
        assert_eq!(result.tags.subject, "beach");
    }

    #[test]
    fn test_parse_item_response_with_code_fence() {
        let response = "好的，评估如下：\n```json\n{\"score\": 6, \"summary\": \"ok\"}\n```";
        let result = parse_item_response(response).unwrap();
        assert_eq!(result.score, 6.0);
        assert_eq!(result.tags.tone, "");
    }

    #[test]
    fn test_parse_rejects_out_of_range_and_garbage() {
        assert!(matches!(
            parse_item_response(r#"{"score": 42}"#),
            Err(InferenceError::ResponseParseFailed { .. })
        ));
        assert!(matches!(
            parse_item_response("我觉得不错"),
            Err(InferenceError::ResponseParseFailed { .. })
        ));
        assert!(parse_group_response(r#"{"score": 8.5, "rationale": "连贯"}"#).is_ok());
    }

    #[test]
    fn test_json_block_shared_across_calls() {
        assert!(JSON_BLOCK.is_ok());
        for score in [3, 5, 9] {
            let response = format!("前缀 {{\"score\": {}}} 后缀", score);
            assert_eq!(parse_item_response(&response).unwrap().score, score as f64);
        }
    }

    #[test]
    fn test_data_url_and_detail() {
        assert_eq!(data_url(&payload("a")), "data:image/png;base64,iVBORw==");
        assert!(matches!(image_detail("HIGH"), ImageDetail::High));
        assert!(matches!(image_detail("whatever"), ImageDetail::Auto));
    }

    #[test]
    fn test_prompts_carry_params() {
        let params = EvaluationParams {
            style_hint: Some("film".to_string()),
            ..Default::default()
        };
        let item = build_item_message(&params);
        assert!(item.contains("composition"));
        assert!(item.contains("film"));

        let group = build_group_message(&[payload("a.jpg"), payload("b.jpg")], &params);
        assert!(group.contains("a.jpg, b.jpg"));
    }

    fn live_service() -> Option<LlmService> {
        let config = Config::from_env().ok()?;
        if config.llm_api_key.is_empty() {
            return None;
        }
        Some(LlmService::new(&config))
    }

    /// 测试通用 LLM 调用
    ///
    /// 运行方式：
    /// ```bash
    /// LLM_API_KEY=... cargo test test_send_to_llm_simple -- --ignored --nocapture
    /// ```
    #[tokio::test]
    #[ignore]
    async fn test_send_to_llm_simple() {
        let _ = tracing_subscriber::fmt::try_init();
        let Some(service) = live_service() else {
            println!("未设置 LLM_API_KEY，跳过");
            return;
        };

        let response = service
            .send_to_llm(
                "用一句话介绍你自己",
                Some("你是一个简洁的助手，回答要简短。"),
                &[],
                &EvaluationParams::default(),
            )
            .await;

        match response {
            Ok(text) => {
                println!("✅ 通用 LLM 调用成功: {}", text);
                assert!(!text.is_empty());
            }
            Err(e) => panic!("测试失败: {}", e),
        }
    }

    /// 测试 Vision API 单张照片评估
    #[tokio::test]
    #[ignore]
    async fn test_vision_item_evaluation() {
        let _ = tracing_subscriber::fmt::try_init();
        let Some(service) = live_service() else {
            println!("未设置 LLM_API_KEY，跳过");
            return;
        };
        let Ok(path) = std::env::var("TEST_PHOTO") else {
            println!("未设置 TEST_PHOTO，跳过");
            return;
        };

        let item = crate::models::PhotoItem::new("test", path);
        let payload = item.load_payload().await.unwrap();
        let result = service
            .evaluate(&payload, &EvaluationParams::default())
            .await;

        match result {
            Ok(result) => {
                println!("✅ Vision API 调用成功: {:?}", result);
                assert!((0.0..=10.0).contains(&result.score));
            }
            Err(e) => panic!("Vision API 测试失败: {}", e),
        }
    }
}
