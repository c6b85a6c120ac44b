//! SDK 版本信息

/// SDK 版本号（取自 Cargo.toml）
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 返回带前缀的完整版本字符串（用于日志与状态上报）
pub fn full_version() -> String {
    format!("arena-sync/{}", SDK_VERSION)
}
