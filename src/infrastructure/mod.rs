//! 基础设施层（Infrastructure）
//!
//! 只暴露能力，不认识照片、批次或组合：
//! - `fingerprint` - 规范化序列化 + SHA-256 指纹
//! - `atomic_file` - 先写临时文件再重命名的原子写入
//! - `memory` - 进程内存采样

pub mod atomic_file;
pub mod fingerprint;
pub mod memory;

pub use atomic_file::write_atomic;
pub use fingerprint::{canonical_json, fingerprint, sha256_hex};
pub use memory::{MemoryProbe, ProcessMemoryProbe};
