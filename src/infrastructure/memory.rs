//! 进程内存采样

/// 内存采样能力
///
/// 返回 `None` 表示当前平台无法采样，调用方应视为"无内存压力"。
pub trait MemoryProbe: Send + Sync {
    fn resident_bytes(&self) -> Option<u64>;
}

/// 基于 `/proc/self/statm` 的常驻内存采样（仅 Linux 有效）
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemoryProbe;

const PAGE_SIZE: u64 = 4096;

impl MemoryProbe for ProcessMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        parse_statm_resident(&statm)
    }
}

fn parse_statm_resident(statm: &str) -> Option<u64> {
    // 第二列是常驻页数
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_statm() {
        assert_eq!(parse_statm_resident("1000 250 30 1 0 100 0"), Some(250 * 4096));
        assert_eq!(parse_statm_resident(""), None);
        assert_eq!(parse_statm_resident("12 abc"), None);
    }
}
