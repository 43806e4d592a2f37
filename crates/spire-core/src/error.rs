//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为分配器对外暴露的失败语义提供集中定义：环形区超限、GPU 同步超时、原生分配失败、
//!   以及调用方违反句柄状态机的契约错误；
//! - 池未命中（`PoolExhaustedFallbackAllocation`）不属于错误，仅体现在统计与 `debug` 日志中。
//!
//! ## 设计要求（What）
//! - 所有错误派生 `thiserror::Error`，与 `std::error::Error` 生态兼容；
//! - 每个变体都映射到 [`codes`] 中的稳定错误码，便于日志检索与告警聚合；
//! - [`SpireError::is_fatal`] 区分“帧内不可恢复”的资源错误与“调用方用错 API”的契约错误。

use thiserror::Error;

use crate::types::{BufferHandle, FrameIndex, LockMode, StorageMode};

/// 稳定错误码，命名遵循 `<域>.<语义>`。
pub mod codes {
    pub const ALLOCATION_TOO_LARGE: &str = "buffer.allocation_too_large";
    pub const SYNCHRONIZATION_TIMEOUT: &str = "buffer.synchronization_timeout";
    pub const NATIVE_ALLOCATION: &str = "buffer.native_allocation_failed";
    pub const INVALID_CONFIG: &str = "buffer.invalid_config";
    pub const UNKNOWN_HANDLE: &str = "buffer.unknown_handle";
    pub const INVALID_STATE: &str = "buffer.invalid_state";
    pub const RANGE_OUT_OF_BOUNDS: &str = "buffer.range_out_of_bounds";
    pub const NOT_CPU_ACCESSIBLE: &str = "buffer.not_cpu_accessible";
}

/// 句柄状态机中的状态，用于错误上下文与诊断输出。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleState {
    /// 已创建但尚未完成过写入。
    Unwritten,
    /// 可读且未被锁定。
    Readable,
    /// 持有指定模式的锁。
    Locked(LockMode),
}

/// 分配器错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把资源类故障与契约类故障放进同一个枚举，调用方可以统一 `?` 传播，
///   再依据 [`is_fatal`](Self::is_fatal) 决定终止当前帧还是修正调用逻辑；
/// - **契约 (What)**：所有变体均为 `Send + Sync + 'static`，携带的上下文足够定位到具体句柄或请求尺寸；
/// - **执行 (How)**：`code()` 通过穷举匹配返回稳定字符串，新增变体时编译器会强制补齐映射。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SpireError {
    /// 环形分配请求超过环形区总容量，环形区不支持运行时扩容。
    #[error("ring allocation of {requested} bytes exceeds ring capacity of {capacity} bytes")]
    AllocationTooLarge { requested: u64, capacity: u64 },

    /// GPU 执行后端的阻塞等待未能在期限内返回。
    #[error("GPU synchronization timed out at {frame} after {waited_ms} ms")]
    SynchronizationTimeout { frame: FrameIndex, waited_ms: u64 },

    /// 原生内存分配失败。
    #[error("native allocation of {size} bytes ({storage}) failed: {detail}")]
    NativeAllocation {
        size: u64,
        storage: StorageMode,
        detail: String,
    },

    /// 配置非法。
    #[error("invalid allocator configuration: {detail}")]
    InvalidConfig { detail: String },

    /// 句柄已销毁或从未签发。
    #[error("unknown buffer handle {handle}")]
    UnknownHandle { handle: BufferHandle },

    /// 在非法状态下调用了锁定 / 解锁操作。
    #[error("operation `{operation}` is not permitted on {handle} in state {state:?}")]
    InvalidState {
        handle: BufferHandle,
        state: HandleState,
        operation: &'static str,
    },

    /// 锁定区间越过了缓冲的逻辑尺寸。
    #[error(
        "range [{offset}, {offset}+{size}) is outside {handle} with logical size {logical_size}"
    )]
    RangeOutOfBounds {
        handle: BufferHandle,
        offset: u32,
        size: u32,
        logical_size: u32,
    },

    /// 尝试锁定 CPU 不可映射的内存。
    #[error("{handle} lives in {storage} memory which the CPU cannot map")]
    NotCpuAccessible {
        handle: BufferHandle,
        storage: StorageMode,
    },
}

impl SpireError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SpireError::AllocationTooLarge { .. } => codes::ALLOCATION_TOO_LARGE,
            SpireError::SynchronizationTimeout { .. } => codes::SYNCHRONIZATION_TIMEOUT,
            SpireError::NativeAllocation { .. } => codes::NATIVE_ALLOCATION,
            SpireError::InvalidConfig { .. } => codes::INVALID_CONFIG,
            SpireError::UnknownHandle { .. } => codes::UNKNOWN_HANDLE,
            SpireError::InvalidState { .. } => codes::INVALID_STATE,
            SpireError::RangeOutOfBounds { .. } => codes::RANGE_OUT_OF_BOUNDS,
            SpireError::NotCpuAccessible { .. } => codes::NOT_CPU_ACCESSIBLE,
        }
    }

    /// 是否为帧内不可恢复的资源错误。
    ///
    /// - 资源错误（超限、超时、原生分配失败、配置错误）应当终止当前帧；
    /// - 契约错误（未知句柄、非法状态、越界、不可映射）由调用方修正调用顺序后即可继续。
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SpireError::UnknownHandle { .. }
                | SpireError::InvalidState { .. }
                | SpireError::RangeOutOfBounds { .. }
                | SpireError::NotCpuAccessible { .. }
        )
    }

    pub(crate) fn invalid_config(detail: impl Into<String>) -> Self {
        SpireError::InvalidConfig {
            detail: detail.into(),
        }
    }
}

/// 分配器统一的结果类型。
pub type Result<T, E = SpireError> = core::result::Result<T, E>;
