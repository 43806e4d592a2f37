//! 主机内存后端：在没有 GPU 的环境中完整驱动分配器。
//!
//! # 模块定位（Why）
//! - 分配器的正确性（帧隔离、丢弃式写入、环形回绕）与具体图形 API 无关，
//!   用 `BytesMut` 模拟原生缓冲即可在 CI 中覆盖全部契约；
//! - 后端把创建、销毁、脏区间与等待次数写入共享台账 [`HostProbe`]，
//!   测试在后端被分配器接管后仍可观察这些副作用。
//!
//! # 契约说明（What）
//! - `current_frame_index` 只在 [`HostBackend::submit_frame`] 时推进；
//! - `fail_next_allocation` 与 `fail_waits` 用于注入原生分配失败与同步超时。

use alloc::{sync::Arc, vec::Vec};
use core::{ops::Range, time::Duration};

use bytes::BytesMut;
use spin::Mutex;

use spire_core::{FrameIndex, GpuBackend, NativeBuffer, Result, SpireError, StorageMode};

#[derive(Debug, Default)]
struct HostLedger {
    created: u64,
    destroyed: Vec<u64>,
    dirty: Vec<(u64, Range<usize>)>,
    waits: u64,
}

/// 主机内存模拟的原生缓冲。
#[derive(Debug)]
pub struct HostBuffer {
    id: u64,
    storage: StorageMode,
    bytes: BytesMut,
    ledger: Arc<Mutex<HostLedger>>,
}

impl NativeBuffer for HostBuffer {
    fn id(&self) -> u64 {
        self.id
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn storage(&self) -> StorageMode {
        self.storage
    }

    fn contents(&self) -> &[u8] {
        &self.bytes
    }

    fn contents_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn did_modify_range(&mut self, range: Range<usize>) {
        if self.storage.requires_explicit_sync() {
            self.ledger.lock().dirty.push((self.id, range));
        }
    }
}

/// 基于主机内存的 [`GpuBackend`] 实现。
#[derive(Debug)]
pub struct HostBackend {
    next_id: u64,
    frame: FrameIndex,
    fail_next_allocation: bool,
    fail_waits: bool,
    ledger: Arc<Mutex<HostLedger>>,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            frame: FrameIndex::ZERO,
            fail_next_allocation: false,
            fail_waits: false,
            ledger: Arc::new(Mutex::new(HostLedger::default())),
        }
    }

    /// 模拟提交一帧：帧序号加一并返回新帧。
    pub fn submit_frame(&mut self) -> FrameIndex {
        self.frame = self.frame.next();
        self.frame
    }

    /// 下一次 `new_buffer` 返回 [`SpireError::NativeAllocation`]。
    pub fn fail_next_allocation(&mut self) {
        self.fail_next_allocation = true;
    }

    /// 此后所有 `submit_and_wait` 返回 [`SpireError::SynchronizationTimeout`]。
    pub fn fail_waits(&mut self, fail: bool) {
        self.fail_waits = fail;
    }

    /// 共享台账的只读观察口。
    pub fn probe(&self) -> HostProbe {
        HostProbe {
            ledger: Arc::clone(&self.ledger),
        }
    }
}

impl GpuBackend for HostBackend {
    type Buffer = HostBuffer;

    fn new_buffer(&mut self, len: usize, storage: StorageMode) -> Result<HostBuffer> {
        if core::mem::take(&mut self.fail_next_allocation) {
            return Err(SpireError::NativeAllocation {
                size: len as u64,
                storage,
                detail: "injected host allocation failure".to_owned(),
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ledger.lock().created += 1;
        Ok(HostBuffer {
            id,
            storage,
            bytes: BytesMut::zeroed(len),
            ledger: Arc::clone(&self.ledger),
        })
    }

    fn destroy_buffer(&mut self, buffer: HostBuffer) {
        self.ledger.lock().destroyed.push(buffer.id);
    }

    fn submit_and_wait(&mut self, timeout: Duration) -> Result<()> {
        self.ledger.lock().waits += 1;
        if self.fail_waits {
            return Err(SpireError::SynchronizationTimeout {
                frame: self.frame,
                waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }
        Ok(())
    }

    fn current_frame_index(&self) -> FrameIndex {
        self.frame
    }
}

/// [`HostBackend`] 台账的克隆句柄。
#[derive(Clone, Debug)]
pub struct HostProbe {
    ledger: Arc<Mutex<HostLedger>>,
}

impl HostProbe {
    pub fn created(&self) -> u64 {
        self.ledger.lock().created
    }

    pub fn destroyed_ids(&self) -> Vec<u64> {
        self.ledger.lock().destroyed.clone()
    }

    /// 尚未交还给后端的原生缓冲数量。
    pub fn live_buffers(&self) -> u64 {
        let ledger = self.ledger.lock();
        ledger.created - ledger.destroyed.len() as u64
    }

    pub fn waits(&self) -> u64 {
        self.ledger.lock().waits
    }

    /// 指定缓冲上报过的脏区间，仅 `Managed` 存储会记录。
    pub fn dirty_ranges(&self, id: u64) -> Vec<Range<usize>> {
        self.ledger
            .lock()
            .dirty
            .iter()
            .filter(|(owner, _)| *owner == id)
            .map(|(_, range)| range.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_ledger_tracks_lifecycle() {
        let mut backend = HostBackend::new();
        let probe = backend.probe();
        let a = backend.new_buffer(64, StorageMode::Shared).expect("分配");
        let b = backend.new_buffer(64, StorageMode::Shared).expect("分配");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.len(), 64);
        let a_id = a.id();
        backend.destroy_buffer(a);
        assert_eq!(probe.destroyed_ids(), vec![a_id]);
        assert_eq!(probe.live_buffers(), 1);
    }

    #[test]
    fn injected_failures_surface_as_errors() {
        let mut backend = HostBackend::new();
        backend.fail_next_allocation();
        assert!(backend.new_buffer(16, StorageMode::Shared).is_err());
        assert!(backend.new_buffer(16, StorageMode::Shared).is_ok(), "注入只生效一次");

        backend.fail_waits(true);
        let err = backend
            .submit_and_wait(Duration::from_millis(5))
            .expect_err("等待应超时");
        assert_eq!(err.code(), spire_core::codes::SYNCHRONIZATION_TIMEOUT);
    }

    #[test]
    fn only_managed_storage_records_dirty_ranges() {
        let mut backend = HostBackend::new();
        let probe = backend.probe();
        let mut managed = backend.new_buffer(32, StorageMode::Managed).expect("分配");
        let mut shared = backend.new_buffer(32, StorageMode::Shared).expect("分配");
        managed.did_modify_range(4..8);
        shared.did_modify_range(0..32);
        assert_eq!(probe.dirty_ranges(managed.id()), vec![4..8]);
        assert!(probe.dirty_ranges(shared.id()).is_empty());
    }

    #[test]
    fn submit_frame_advances_index() {
        let mut backend = HostBackend::new();
        assert_eq!(backend.current_frame_index(), FrameIndex::ZERO);
        assert_eq!(backend.submit_frame(), FrameIndex::new(1));
    }
}
