use spire_core::{FrameIndex, Result, SpireError, logging::TARGET};
use tracing::warn;

/// 环形分配器交出的一段区域。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RingAllocation {
    pub offset: u32,
    pub size: u32,
    /// 本次分配是否触发了回绕（尾部剩余空间被放弃）。
    pub wrapped: bool,
}

impl RingAllocation {
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.size)
    }
}

/// `RingAllocator` 在一块固定容量的连续内存上做回绕式的指针碰撞分配。
///
/// # 模块角色（Why）
/// - 单次绘制的顶点流、一次性常量等数据生命周期极短，逐块登记隔离的开销不值得；
/// - 环形区只移动写游标，不记录任何单次分配，由“N 个安全帧内不会绕满一圈”的纪律保证安全。
///
/// # 核心机制（How）
/// - 先把游标按对齐要求上调，放得下就原地分配；放不下则从 0 重新开始，尾部剩余空间作废；
/// - 游标到达容量时归零，始终满足 `0 <= cursor < capacity`；
/// - 每次回绕记录所在帧，若距上一圈起点不足 N 帧，说明本圈可能覆盖 GPU 仍在读取的区域，
///   记一次 `overrun_warnings` 并输出 `warn`。
///
/// # 契约说明（What）
/// - `size > capacity` 返回 [`SpireError::AllocationTooLarge`]，环形区不支持运行时扩容；
/// - 任何分配都不会跨越容量边界。
#[derive(Debug)]
pub struct RingAllocator {
    capacity: u32,
    cursor: u32,
    default_alignment: u32,
    safe_frames: u64,
    frame: FrameIndex,
    lap_started: FrameIndex,
    wraps: u64,
    overrun_warnings: u64,
}

impl RingAllocator {
    pub fn new(capacity: u32, default_alignment: u32, safe_frames: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SpireError::InvalidConfig {
                detail: "ring capacity must be non-zero".to_owned(),
            });
        }
        if default_alignment == 0 || default_alignment > capacity {
            return Err(SpireError::InvalidConfig {
                detail: format!(
                    "ring alignment {default_alignment} must be within 1..={capacity}"
                ),
            });
        }
        Ok(Self {
            capacity,
            cursor: 0,
            default_alignment,
            safe_frames: safe_frames.max(1) as u64,
            frame: FrameIndex::ZERO,
            lap_started: FrameIndex::ZERO,
            wraps: 0,
            overrun_warnings: 0,
        })
    }

    /// 以 `frame` 作为首圈起点，用于在非零帧上构建的分配器。
    pub fn starting_at(mut self, frame: FrameIndex) -> Self {
        self.frame = frame;
        self.lap_started = frame;
        self
    }

    /// 按默认对齐分配 `size` 字节。
    pub fn allocate(&mut self, size: u32) -> Result<RingAllocation> {
        self.allocate_aligned(size, self.default_alignment)
    }

    /// 按 `alignment` 对齐分配 `size` 字节；`alignment == 0` 时使用默认对齐。
    pub fn allocate_aligned(&mut self, size: u32, alignment: u32) -> Result<RingAllocation> {
        if size > self.capacity {
            return Err(SpireError::AllocationTooLarge {
                requested: u64::from(size),
                capacity: u64::from(self.capacity),
            });
        }
        let alignment = if alignment == 0 {
            self.default_alignment
        } else {
            alignment
        };
        let capacity = u64::from(self.capacity);
        let aligned = u64::from(self.cursor).div_ceil(u64::from(alignment)) * u64::from(alignment);

        if size == 0 {
            // 零字节请求不占空间，也不开启新的一圈。
            return Ok(RingAllocation {
                offset: aligned.min(capacity - 1) as u32,
                size: 0,
                wrapped: false,
            });
        }

        let (offset, wrapped) = if aligned < capacity && aligned + u64::from(size) <= capacity {
            (aligned as u32, false)
        } else {
            self.note_wrap();
            (0, true)
        };

        let end = offset + size;
        self.cursor = if end >= self.capacity {
            // 恰好用满：下一次分配从 0 开始，本圈在此结束。
            self.note_wrap();
            0
        } else {
            end
        };
        Ok(RingAllocation {
            offset,
            size,
            wrapped,
        })
    }

    /// 通知环形区进入新的一帧，用于回绕告警的帧距离判断。
    pub fn set_frame(&mut self, frame: FrameIndex) {
        self.frame = self.frame.max(frame);
    }

    fn note_wrap(&mut self) {
        self.wraps += 1;
        if self.frame.frames_since(self.lap_started) < self.safe_frames {
            self.overrun_warnings += 1;
            warn!(
                target: TARGET,
                frame = self.frame.get(),
                lap_started = self.lap_started.get(),
                safe_frames = self.safe_frames,
                capacity = self.capacity,
                "ring wrapped within the safe-frame window; in-flight GPU reads may be overwritten"
            );
        }
        self.lap_started = self.frame;
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn default_alignment(&self) -> u32 {
        self.default_alignment
    }

    pub fn wraps(&self) -> u64 {
        self.wraps
    }

    pub fn overrun_warnings(&self) -> u64 {
        self.overrun_warnings
    }
}
