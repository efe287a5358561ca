use crate::error::{AppResult, FileError};
use crate::infrastructure::atomic_file::is_temp_file;
use crate::models::photo::PhotoItem;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 支持的照片扩展名
const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "heic", "gif"];

fn is_photo(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| PHOTO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// 从文件夹中加载所有照片
///
/// 条目 ID 为文件名，结果按文件名排序，保证多次运行顺序一致。
pub async fn load_photo_items(folder_path: &str) -> AppResult<Vec<PhotoItem>> {
    let folder = PathBuf::from(folder_path);

    if !folder.is_dir() {
        return Err(FileError::DirectoryNotFound {
            path: folder_path.to_string(),
        }
        .into());
    }

    let mut items = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .map_err(|e| FileError::ReadFailed {
            path: folder_path.to_string(),
            source: e,
        })?;

    while let Some(entry) = entries.next_entry().await.map_err(|e| FileError::ReadFailed {
        path: folder_path.to_string(),
        source: e,
    })? {
        let path = entry.path();
        if !path.is_file() || is_temp_file(&path) || !is_photo(&path) {
            continue;
        }

        let id = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        tracing::debug!("发现照片: {}", id);
        items.push(PhotoItem::new(id, path));
    }

    items.sort_by(|a, b| a.id.cmp(&b.id));
    tracing::info!("共加载 {} 张照片", items.len());

    Ok(items)
}
