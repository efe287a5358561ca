//! 条目处理上下文
//!
//! 封装"我正在处理这一批里的第几张照片"这一信息

use std::fmt::Display;

/// 条目处理上下文
#[derive(Debug, Clone)]
pub struct ItemCtx {
    pub project_id: String,

    pub item_id: String,

    /// 条目在本批次中的序号（从1开始，仅用于日志显示）
    pub index: usize,

    /// 本批次待处理的条目总数
    pub total: usize,
}

impl ItemCtx {
    pub fn new(project_id: &str, item_id: &str, index: usize, total: usize) -> Self {
        Self {
            project_id: project_id.to_string(),
            item_id: item_id.to_string(),
            index,
            total,
        }
    }
}

impl Display for ItemCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[项目 {} 照片 {}/{} {}]",
            self.project_id, self.index, self.total, self.item_id
        )
    }
}
