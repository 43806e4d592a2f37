//! 分配器统计快照。
//!
//! 字段均为快照时刻的计数，调用方可按帧采样后自行计算差值或速率。

use crate::types::FrameIndex;

/// 分配器运行状态快照。
///
/// # 字段分组
/// - 容量：`allocated_bytes` 为分配器持有的全部原生字节（含池、隔离区、活跃句柄与环形区），
///   `pooled_bytes` / `quarantined_bytes` 为其中处于空闲池与帧隔离区的部分；
/// - 命中：`pool_hits` / `pool_misses` 统计空闲池的复用情况，未命中会触发一次原生分配；
/// - 环形区：`ring_wraps` 为回绕次数，`ring_overrun_warnings` 统计距本圈起点不足 N 帧即发生的回绕次数
///   （包括构建后的第一次回绕）。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub frame: FrameIndex,
    pub live_handles: usize,
    pub allocated_bytes: u64,
    pub peak_allocated_bytes: u64,
    pub pooled_bytes: u64,
    pub pooled_blocks: usize,
    pub quarantined_bytes: u64,
    pub quarantined_blocks: usize,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub renames: u64,
    pub oversized_live: usize,
    pub reclaimed_blocks: u64,
    pub native_buffers_destroyed: u64,
    pub ring_cursor: u32,
    pub ring_wraps: u64,
    pub ring_overrun_warnings: u64,
}
