use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::InferenceError;
use crate::infrastructure::sha256_hex;

/// 待评估的照片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoItem {
    /// 条目 ID（默认为文件名）
    pub id: String,
    pub path: PathBuf,
}

impl PhotoItem {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    /// 读取照片内容，构造发送给推理服务的载荷
    pub async fn load_payload(&self) -> Result<ItemPayload, InferenceError> {
        let bytes =
            tokio::fs::read(&self.path)
                .await
                .map_err(|e| InferenceError::PayloadReadFailed {
                    path: self.path.display().to_string(),
                    source: e,
                })?;
        Ok(ItemPayload {
            item_id: self.id.clone(),
            media_type: media_type_for(&self.path).to_string(),
            bytes,
        })
    }
}

/// 推理服务的输入载荷
#[derive(Debug, Clone)]
pub struct ItemPayload {
    pub item_id: String,
    /// MIME 类型，例如 `image/jpeg`
    pub media_type: String,
    pub bytes: Vec<u8>,
}

impl ItemPayload {
    /// 内容指纹：只取决于照片字节，与文件名无关
    pub fn fingerprint(&self) -> String {
        sha256_hex(&self.bytes)
    }
}

/// 根据扩展名推断 MIME 类型
pub fn media_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" => "image/heic",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type_for() {
        assert_eq!(media_type_for(Path::new("a/IMG_001.JPG")), "image/jpeg");
        assert_eq!(media_type_for(Path::new("b.png")), "image/png");
        assert_eq!(media_type_for(Path::new("noext")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_fingerprint_ignores_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jpg");
        let b = dir.path().join("b.jpg");
        tokio::fs::write(&a, b"same bytes").await.unwrap();
        tokio::fs::write(&b, b"same bytes").await.unwrap();

        let pa = PhotoItem::new("a", &a).load_payload().await.unwrap();
        let pb = PhotoItem::new("b", &b).load_payload().await.unwrap();
        assert_eq!(pa.fingerprint(), pb.fingerprint());
    }

    #[tokio::test]
    async fn test_missing_file_is_payload_error() {
        let err = PhotoItem::new("x", "/definitely/not/here.jpg")
            .load_payload()
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::PayloadReadFailed { .. }));
    }
}
