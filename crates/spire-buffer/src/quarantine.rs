use alloc::vec::Vec;
use core::mem;

use spire_core::{FrameIndex, logging::TARGET};
use tracing::trace;

/// 隔离条目：记录退役帧，供老化时复核安全距离。
#[derive(Debug)]
struct Quarantined<T> {
    retired_at: FrameIndex,
    item: T,
}

/// `FrameQuarantine` 是长度为 N 的“待释放”槽位环，N 为 GPU 可能落后 CPU 的帧数。
///
/// # 教案式说明
/// - **意图 (Why)**：CPU 在帧 F 释放的内存，可能仍被帧 F 及之前提交、尚未执行完的命令缓冲读取；
///   在 N 个帧边界过去之前把它交给下一个写者，就是一次静默的数据竞争；
/// - **契约 (What)**：
///   - 帧 F 登记的条目进入槽位 `F mod N`，最早在 `reclaim(F + N)` 时交出；
///   - 对同一帧或更早的帧重复调用 `reclaim` 为空操作；
///   - 两次调用之间跳过的帧按顺序逐帧处理，跳过帧数超过 N 时每个槽位只处理一次；
/// - **执行 (How)**：`horizon` 记录最近一次处理到的帧。登记帧早于 `horizon` 时按 `horizon`
///   计，因为条目至少被使用到了当前帧；老化时逐条复核 `retired_at + N <= frame`，
///   晚于 `horizon` 登记的条目即便落在当前槽位也不会被提前交出；
/// - **权衡 (Trade-offs)**：逐条复核让槽位在极少数情况下需要保留部分条目，
///   换来的是不依赖调用方精确对齐帧序号的安全保证。
#[derive(Debug)]
pub struct FrameQuarantine<T> {
    slots: Vec<Vec<Quarantined<T>>>,
    horizon: FrameIndex,
    len: usize,
}

impl<T> FrameQuarantine<T> {
    /// 创建 `safe_frames` 个槽位的隔离区；传入 0 时按 1 处理。
    pub fn new(safe_frames: usize) -> Self {
        let safe_frames = safe_frames.max(1);
        let mut slots = Vec::with_capacity(safe_frames);
        slots.resize_with(safe_frames, Vec::new);
        Self {
            slots,
            horizon: FrameIndex::ZERO,
            len: 0,
        }
    }

    pub fn safe_frames(&self) -> usize {
        self.slots.len()
    }

    /// 最近一次 `reclaim` 处理到的帧。
    pub fn horizon(&self) -> FrameIndex {
        self.horizon
    }

    /// 登记一个在 `frame` 退役的条目。
    pub fn register(&mut self, item: T, frame: FrameIndex) {
        let retired_at = frame.max(self.horizon);
        let slot = retired_at.slot(self.slots.len());
        self.slots[slot].push(Quarantined { retired_at, item });
        self.len += 1;
    }

    /// 推进到 `new_frame`，把期满条目依登记顺序交给 `sink`，返回交出的条目数。
    pub fn reclaim(&mut self, new_frame: FrameIndex, mut sink: impl FnMut(T)) -> usize {
        if new_frame <= self.horizon {
            return 0;
        }
        let safe_frames = self.slots.len() as u64;
        let elapsed = new_frame.frames_since(self.horizon);

        let mut reclaimed = 0;
        // 槽位按老化顺序访问；跳帧时每个槽位只访问一次，以它在 new_frame 之前最后一次对应的帧复核。
        for step in 1..=elapsed.min(safe_frames) {
            let frame = self.horizon.saturating_add(step);
            let latest = frame.saturating_add((new_frame.get() - frame.get()) / safe_frames * safe_frames);
            let slot = frame.slot(self.slots.len());
            let entries = mem::take(&mut self.slots[slot]);
            for entry in entries {
                if entry.retired_at.saturating_add(safe_frames) <= latest {
                    sink(entry.item);
                    reclaimed += 1;
                } else {
                    self.slots[slot].push(entry);
                }
            }
        }
        self.len -= reclaimed;
        self.horizon = new_frame;
        trace!(
            target: TARGET,
            frame = new_frame.get(),
            reclaimed,
            remaining = self.len,
            "frame quarantine advanced"
        );
        reclaimed
    }

    /// 无视帧距离交出全部条目，仅供关闭流程在 GPU 空闲后使用。
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len);
        for slot in &mut self.slots {
            drained.extend(slot.drain(..).map(|entry| entry.item));
        }
        self.len = 0;
        drained
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().flatten().map(|entry| &entry.item)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
