//! 分配器配置。
//!
//! # 模块定位（Why）
//! - 桶阈值、安全帧数、环形区容量都是与平台 GPU 延迟相关的调优常量，
//!   集中在一个可序列化结构中，便于从 TOML 配置文件装载并在启动时一次性校验。
//!
//! # 契约说明（What）
//! - 所有字段均有默认值，配置文件只需覆盖关心的键；
//! - 未知键会被拒绝，避免拼写错误静默退化为默认值；
//! - [`AllocatorConfig::validate`] 在分配器构造时调用，失败返回 [`SpireError::InvalidConfig`]。

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpireError};
use crate::types::StorageMode;

/// 默认桶阈值：256 B 到 1 MiB 的二次幂。
pub const DEFAULT_BUCKET_THRESHOLDS: [u32; 13] = [
    256,
    512,
    1024,
    2048,
    4096,
    8192,
    16 * 1024,
    32 * 1024,
    64 * 1024,
    128 * 1024,
    256 * 1024,
    512 * 1024,
    1024 * 1024,
];

/// 默认环形区容量（8 MiB）。
pub const DEFAULT_RING_CAPACITY: u32 = 8 * 1024 * 1024;

/// 缓冲偏移的默认对齐（字节）。
pub const DEFAULT_BUFFER_OFFSET_ALIGNMENT: u32 = 256;

/// 分配器配置。
///
/// # 字段说明
/// - `safe_frame_count`：GPU 可能落后 CPU 的帧数 N。过小会让 CPU 覆写 GPU 仍在读取的内存，
///   过大只浪费内存，因此宁大勿小；
/// - `ring_capacity` / `ring_alignment`：单次绘制临时数据所用环形区的容量与默认对齐；
/// - `query_ring_capacity` / `query_slot_size`：查询结果环形区，每次分配固定大小的槽位；
/// - `sync_timeout_ms`：`lock_for_read` 在 Managed 内存上等待 GPU 的上限。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorConfig {
    pub bucket_thresholds: Vec<u32>,
    pub bucket_alignment: u32,
    pub safe_frame_count: u32,
    pub ring_capacity: u32,
    pub ring_alignment: u32,
    pub query_ring_capacity: u32,
    pub query_slot_size: u32,
    pub default_storage: StorageMode,
    pub sync_timeout_ms: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            bucket_thresholds: DEFAULT_BUCKET_THRESHOLDS.to_vec(),
            bucket_alignment: DEFAULT_BUFFER_OFFSET_ALIGNMENT,
            safe_frame_count: 3,
            ring_capacity: DEFAULT_RING_CAPACITY,
            ring_alignment: DEFAULT_BUFFER_OFFSET_ALIGNMENT,
            query_ring_capacity: 64 * 1024,
            query_slot_size: 8,
            default_storage: StorageMode::Shared,
            sync_timeout_ms: 1_000,
        }
    }
}

impl AllocatorConfig {
    /// 从 TOML 文本装载配置并立即校验。
    ///
    /// ```rust
    /// use spire_core::AllocatorConfig;
    ///
    /// let config = AllocatorConfig::from_toml_str("safe_frame_count = 2\nring_capacity = 4096")
    ///     .expect("合法配置");
    /// assert_eq!(config.safe_frame_count, 2);
    /// assert_eq!(config.bucket_alignment, 256, "未覆盖的键保持默认值");
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: AllocatorConfig = toml::from_str(text)
            .map_err(|err| SpireError::invalid_config(format!("malformed TOML: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验字段之间的约束。
    pub fn validate(&self) -> Result<()> {
        if self.bucket_alignment == 0 {
            return Err(SpireError::invalid_config("bucket_alignment must be non-zero"));
        }
        if self.safe_frame_count == 0 {
            return Err(SpireError::invalid_config(
                "safe_frame_count must be at least 1",
            ));
        }
        if self.ring_capacity == 0 {
            return Err(SpireError::invalid_config("ring_capacity must be non-zero"));
        }
        if self.ring_alignment == 0 || self.ring_alignment > self.ring_capacity {
            return Err(SpireError::invalid_config(format!(
                "ring_alignment {} must be in 1..={}",
                self.ring_alignment, self.ring_capacity
            )));
        }
        if self.query_slot_size == 0 || self.query_slot_size > self.query_ring_capacity {
            return Err(SpireError::invalid_config(format!(
                "query_slot_size {} must be in 1..={}",
                self.query_slot_size, self.query_ring_capacity
            )));
        }
        if !self.default_storage.is_cpu_accessible() {
            return Err(SpireError::invalid_config(
                "default_storage must be CPU accessible",
            ));
        }
        Ok(())
    }

    /// 以 `usize` 形式返回安全帧数，供槽位环分配长度。
    pub fn safe_frames(&self) -> usize {
        self.safe_frame_count as usize
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}
