use core::ops::Range;

use spire_core::{
    BufferHandle, BufferKind, BufferUsage, HandleState, LockMode, NativeBuffer, Result, SpireError,
    StorageMode,
};

use crate::{block::PooledBlock, ring::RingAllocation};

/// 句柄当前的后备存储。
#[derive(Debug)]
pub(crate) enum Backing<B> {
    Block(PooledBlock<B>),
    /// `volatile` 缓冲位于环形区，只记偏移，不持有原生资源。
    Ring(RingAllocation),
}

/// 分配器为每个活跃句柄保存的记录。
///
/// 状态机：`Unwritten --lock(W)--> Locked(W) --unlock--> Readable`；
/// 读锁记为 `Locked(ReadOnly)`，解锁后回到进入前的状态。`Unwritten` 在加锁规则上等同 `Readable`。
#[derive(Debug)]
pub(crate) struct HandleRecord<B> {
    pub(crate) kind: BufferKind,
    pub(crate) usage: BufferUsage,
    pub(crate) storage: StorageMode,
    pub(crate) logical_size: u32,
    pub(crate) backing: Backing<B>,
    state: HandleState,
    written: bool,
    locked_range: Range<usize>,
}

impl<B: NativeBuffer> HandleRecord<B> {
    pub(crate) fn new(
        kind: BufferKind,
        usage: BufferUsage,
        storage: StorageMode,
        logical_size: u32,
        backing: Backing<B>,
    ) -> Self {
        Self {
            kind,
            usage,
            storage,
            logical_size,
            backing,
            state: HandleState::Unwritten,
            written: false,
            locked_range: 0..0,
        }
    }

    pub(crate) fn state(&self) -> HandleState {
        self.state
    }

    pub(crate) fn is_locked(&self) -> bool {
        matches!(self.state, HandleState::Locked(_))
    }

    /// 校验能否以 `mode` 加锁，并把 `(offset, size)` 解析为句柄内的字节区间。
    ///
    /// `size == 0` 表示一直到逻辑尺寸末尾。
    pub(crate) fn check_lock(
        &self,
        handle: BufferHandle,
        mode: LockMode,
        offset: u32,
        size: u32,
    ) -> Result<Range<usize>> {
        if self.is_locked() {
            return Err(SpireError::InvalidState {
                handle,
                state: self.state,
                operation: match mode {
                    LockMode::ReadOnly => "lock_for_read",
                    LockMode::WriteOnly => "lock_for_write",
                },
            });
        }
        if matches!(self.backing, Backing::Block(_)) && !self.storage.is_cpu_accessible() {
            return Err(SpireError::NotCpuAccessible {
                handle,
                storage: self.storage,
            });
        }
        let size = if size == 0 {
            self.logical_size.saturating_sub(offset)
        } else {
            size
        };
        let end = u64::from(offset) + u64::from(size);
        if offset > self.logical_size || end > u64::from(self.logical_size) {
            return Err(SpireError::RangeOutOfBounds {
                handle,
                offset,
                size,
                logical_size: self.logical_size,
            });
        }
        Ok(offset as usize..end as usize)
    }

    pub(crate) fn enter_lock(&mut self, mode: LockMode, range: Range<usize>) {
        self.state = HandleState::Locked(mode);
        self.locked_range = range;
    }

    /// 结束当前锁定，返回锁模式与锁定区间。
    pub(crate) fn leave_lock(&mut self, handle: BufferHandle) -> Result<(LockMode, Range<usize>)> {
        let HandleState::Locked(mode) = self.state else {
            return Err(SpireError::InvalidState {
                handle,
                state: self.state,
                operation: "unlock",
            });
        };
        if mode == LockMode::WriteOnly {
            self.written = true;
        }
        self.state = if self.written {
            HandleState::Readable
        } else {
            HandleState::Unwritten
        };
        Ok((mode, core::mem::replace(&mut self.locked_range, 0..0)))
    }

    /// 当前后备块；环形区缓冲返回 `None`。
    pub(crate) fn block(&self) -> Option<&PooledBlock<B>> {
        match &self.backing {
            Backing::Block(block) => Some(block),
            Backing::Ring(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketSlot;
    use crate::host::{HostBackend, HostBuffer};
    use spire_core::GpuBackend;

    fn record(storage: StorageMode, logical_size: u32) -> HandleRecord<HostBuffer> {
        let mut backend = HostBackend::new();
        let native = backend.new_buffer(512, storage).expect("分配");
        HandleRecord::new(
            BufferKind::Vertex,
            BufferUsage::STATIC,
            storage,
            logical_size,
            Backing::Block(PooledBlock::new(native, BucketSlot::Pooled(0), 512)),
        )
    }

    #[test]
    fn zero_size_means_to_the_end() {
        let record = record(StorageMode::Shared, 300);
        let range = record
            .check_lock(BufferHandle(1), LockMode::WriteOnly, 100, 0)
            .expect("合法区间");
        assert_eq!(range, 100..300);
    }

    #[test]
    fn out_of_bounds_range_is_rejected() {
        let record = record(StorageMode::Shared, 300);
        let err = record
            .check_lock(BufferHandle(1), LockMode::ReadOnly, 200, 200)
            .expect_err("越界");
        assert_eq!(err.code(), spire_core::codes::RANGE_OUT_OF_BOUNDS);
        assert!(record.check_lock(BufferHandle(1), LockMode::ReadOnly, 301, 0).is_err());
    }

    #[test]
    fn state_machine_follows_lock_cycle() {
        let mut record = record(StorageMode::Shared, 64);
        assert_eq!(record.state(), HandleState::Unwritten);

        record.enter_lock(LockMode::ReadOnly, 0..64);
        assert!(record.check_lock(BufferHandle(1), LockMode::WriteOnly, 0, 0).is_err());
        record.leave_lock(BufferHandle(1)).expect("解锁");
        assert_eq!(record.state(), HandleState::Unwritten, "读锁不改变写入状态");

        record.enter_lock(LockMode::WriteOnly, 0..16);
        let (mode, range) = record.leave_lock(BufferHandle(1)).expect("解锁");
        assert_eq!((mode, range), (LockMode::WriteOnly, 0..16));
        assert_eq!(record.state(), HandleState::Readable);

        assert!(record.leave_lock(BufferHandle(1)).is_err(), "未加锁时解锁应失败");
    }

    #[test]
    fn private_storage_cannot_be_locked() {
        let record = record(StorageMode::Private, 64);
        let err = record
            .check_lock(BufferHandle(3), LockMode::WriteOnly, 0, 0)
            .expect_err("私有存储不可映射");
        assert_eq!(err.code(), spire_core::codes::NOT_CPU_ACCESSIBLE);
    }
}
