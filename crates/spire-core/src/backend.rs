//! GPU 执行后端契约。
//!
//! # 模块定位（Why）
//! - 分配器只负责内存生命周期，真正创建原生缓冲、提交命令并等待完成的是平台后端
//!   （Metal、Vulkan 或测试用的主机内存实现）；
//! - 通过 trait 把“分配策略”与“平台资源创建”切开，分配器可以在无 GPU 的环境中完整测试。
//!
//! # 契约说明（What）
//! - 后端创建的每个 [`NativeBuffer`] 都由分配器独占，最终恰好一次交还给
//!   [`GpuBackend::destroy_buffer`]；
//! - 后端不得在 `destroy_buffer` 之外自行回收缓冲。

use core::ops::Range;
use core::time::Duration;

use crate::error::Result;
use crate::types::{FrameIndex, StorageMode};

/// 一块原生 GPU 内存。
///
/// 分配器把原生缓冲视为独占资源：它只会被 `PooledBlock`、帧隔离区或活跃句柄中的一方持有，
/// 所有权通过显式移交转移，从不依赖引用计数。
pub trait NativeBuffer {
    /// 原生句柄的身份标识，在后端生命周期内唯一。
    fn id(&self) -> u64;

    /// 原生分配的字节长度。
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn storage(&self) -> StorageMode;

    /// CPU 可见内容；`Private` 存储可以返回空切片，分配器不会对其加锁。
    fn contents(&self) -> &[u8];

    fn contents_mut(&mut self) -> &mut [u8];

    /// 通知后端 `range` 内的字节已被 CPU 改写。
    ///
    /// 仅 `Managed` 存储需要据此同步到 GPU 副本，其余存储模式实现为空操作即可。
    fn did_modify_range(&mut self, range: Range<usize>);
}

/// GPU 执行后端（下游接口）。
///
/// # 教案式说明
/// - **意图 (Why)**：分配器需要三类能力：按尺寸与存储模式创建原生缓冲、阻塞等待 GPU 空闲、
///   查询当前帧序号以驱动帧隔离区老化；
/// - **契约 (What)**：
///   - `new_buffer` 返回的缓冲长度至少为 `len`；失败时返回
///     [`SpireError::NativeAllocation`](crate::SpireError::NativeAllocation)；
///   - `submit_and_wait` 提交当前命令缓冲并阻塞到 GPU 完成，超过 `timeout` 返回
///     [`SpireError::SynchronizationTimeout`](crate::SpireError::SynchronizationTimeout)；
///   - `current_frame_index` 单调不减，每提交一帧推进一次。
pub trait GpuBackend {
    type Buffer: NativeBuffer;

    fn new_buffer(&mut self, len: usize, storage: StorageMode) -> Result<Self::Buffer>;

    fn destroy_buffer(&mut self, buffer: Self::Buffer);

    fn submit_and_wait(&mut self, timeout: Duration) -> Result<()>;

    fn current_frame_index(&self) -> FrameIndex;
}
