//! 分配器上下游共享的基础类型。
//!
//! # 模块定位（Why）
//! - 帧序号、存储模式、缓冲用途等概念同时出现在配置、后端契约与分配器实现中，
//!   集中定义可以避免各层各自维护一份语义略有差异的枚举。
//!
//! # 命名约定（Consistency）
//! - 类型名沿用渲染管线的通用术语（Vertex/Index/Uniform、Shared/Managed/Private），
//!   不携带具体图形 API 的前缀。

use core::fmt;

use serde::{Deserialize, Serialize};

/// 单调递增的帧序号，由 GPU 执行后端在每次提交帧时推进。
///
/// # 契约说明（What）
/// - 帧序号只增不减；分配器依赖 `index mod N` 计算帧隔离槽位；
/// - `FrameIndex::ZERO` 为分配器初始化时所在的帧。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameIndex(pub u64);

impl FrameIndex {
    pub const ZERO: FrameIndex = FrameIndex(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// 返回下一帧。
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// 计算该帧在长度为 `ring_len` 的槽位环中的下标。
    ///
    /// - **前置条件**：`ring_len > 0`，配置校验保证安全帧数至少为 1；
    /// - **返回值**：`self mod ring_len`。
    pub fn slot(self, ring_len: usize) -> usize {
        debug_assert!(ring_len > 0, "槽位环长度必须大于 0");
        (self.0 % ring_len as u64) as usize
    }

    /// 自 `earlier` 起经过的帧边界数量；若 `earlier` 晚于自身则为 0。
    pub const fn frames_since(self, earlier: FrameIndex) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub const fn saturating_add(self, frames: u64) -> Self {
        Self(self.0.saturating_add(frames))
    }

    pub const fn saturating_sub(self, frames: u64) -> Self {
        Self(self.0.saturating_sub(frames))
    }
}

impl fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

/// 原生内存的存储类别。
///
/// - `Shared`：CPU/GPU 共享内存，CPU 写入对 GPU 立即可见；
/// - `Managed`：CPU 与 GPU 各持副本，CPU 写入后需通知脏区间，CPU 读取前需等待 GPU 完成；
/// - `WriteCombined`：CPU 只写的合并写内存，适合流式上传；
/// - `Private`：GPU 私有内存，CPU 不可映射。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Shared,
    Managed,
    WriteCombined,
    Private,
}

impl StorageMode {
    /// CPU 是否可以直接映射该内存。
    pub const fn is_cpu_accessible(self) -> bool {
        !matches!(self, StorageMode::Private)
    }

    /// CPU 读取前是否必须阻塞等待 GPU 完成在途写入。
    pub const fn requires_explicit_sync(self) -> bool {
        matches!(self, StorageMode::Managed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            StorageMode::Shared => "shared",
            StorageMode::Managed => "managed",
            StorageMode::WriteCombined => "write_combined",
            StorageMode::Private => "private",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 缓冲在渲染管线中的角色，仅用于诊断与统计维度，不改变分配策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
    Structured,
    Uniform,
}

impl BufferKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            BufferKind::Vertex => "vertex",
            BufferKind::Index => "index",
            BufferKind::Structured => "structured",
            BufferKind::Uniform => "uniform",
        }
    }
}

/// 缓冲用途标记。
///
/// # 契约说明（What）
/// - `dynamic`：每次写锁都执行“丢弃式写入”，换入新块并将旧块送入帧隔离区；
/// - `volatile`：单次绘制 / 零步长数据，直接由环形分配器承载，不参与池化；
/// - 两者同时置位时以 `volatile` 为准，环形区本身即是每次写入都换新的存储。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferUsage {
    pub dynamic: bool,
    pub volatile: bool,
}

impl BufferUsage {
    pub const STATIC: BufferUsage = BufferUsage {
        dynamic: false,
        volatile: false,
    };
    pub const DYNAMIC: BufferUsage = BufferUsage {
        dynamic: true,
        volatile: false,
    };
    pub const VOLATILE: BufferUsage = BufferUsage {
        dynamic: false,
        volatile: true,
    };

    /// 写锁是否需要换入新存储。
    pub const fn renames_on_write(self) -> bool {
        self.dynamic || self.volatile
    }
}

/// 锁定模式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockMode {
    ReadOnly,
    WriteOnly,
}

/// 分配器签发的不透明缓冲句柄。
///
/// 句柄只是编号，不持有任何资源；销毁后继续使用会得到
/// [`SpireError::UnknownHandle`](crate::error::SpireError::UnknownHandle)。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferHandle(pub u64);

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_slot_wraps_modulo_ring_length() {
        assert_eq!(FrameIndex(0).slot(3), 0);
        assert_eq!(FrameIndex(4).slot(3), 1);
        assert_eq!(FrameIndex(5).slot(1), 0);
    }

    #[test]
    fn frames_since_saturates() {
        assert_eq!(FrameIndex(7).frames_since(FrameIndex(4)), 3);
        assert_eq!(FrameIndex(2).frames_since(FrameIndex(4)), 0);
    }

    #[test]
    fn private_storage_is_not_mappable() {
        assert!(!StorageMode::Private.is_cpu_accessible());
        assert!(StorageMode::Managed.requires_explicit_sync());
        assert!(!StorageMode::Shared.requires_explicit_sync());
    }

    #[test]
    fn volatile_and_dynamic_both_rename() {
        assert!(BufferUsage::DYNAMIC.renames_on_write());
        assert!(BufferUsage::VOLATILE.renames_on_write());
        assert!(!BufferUsage::STATIC.renames_on_write());
    }
}
