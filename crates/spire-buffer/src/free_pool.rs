use alloc::vec::Vec;

use spire_core::NativeBuffer;

use crate::{block::PooledBlock, bucket::BucketSlot};

/// `FreeBufferPool` 按桶维护可立即复用的块。
///
/// # 核心机制（How）
/// - 每个桶一条 `Vec` 栈，后进先出：最近归还的块最先被取走，缓存与驱动侧的驻留状态都更友好；
/// - 字节与块数随进出增量维护，`stats()` 快照无需遍历。
///
/// # 契约说明（What）
/// - **入口唯一**：只有帧隔离区的老化步骤会调用 [`release`](Self::release)，资源持有者从不直接归还；
/// - **超大块**：`release` 把没有池化桶的块原样退回，由调用方负责销毁；
/// - **线程模型**：本结构不含锁，由外层分配器决定独占或经互斥锁共享。
#[derive(Debug)]
pub struct FreeBufferPool<B> {
    buckets: Vec<Vec<PooledBlock<B>>>,
    pooled_bytes: u64,
    pooled_blocks: usize,
}

impl<B: NativeBuffer> FreeBufferPool<B> {
    pub fn new(bucket_count: usize) -> Self {
        let mut buckets = Vec::with_capacity(bucket_count);
        buckets.resize_with(bucket_count, Vec::new);
        Self {
            buckets,
            pooled_bytes: 0,
            pooled_blocks: 0,
        }
    }

    /// 弹出该桶最近归还的块；桶为空或下标越界时返回 `None`，调用方随后自行分配新块。
    pub fn acquire(&mut self, bucket: usize) -> Option<PooledBlock<B>> {
        let block = self.buckets.get_mut(bucket)?.pop()?;
        self.pooled_bytes -= block.bytes();
        self.pooled_blocks -= 1;
        Some(block)
    }

    /// 将块压回其所属桶。
    ///
    /// 返回 `Some(block)` 表示该块不属于任何池化桶（超大块或桶下标越界），所有权交还调用方。
    pub fn release(&mut self, block: PooledBlock<B>) -> Option<PooledBlock<B>> {
        let BucketSlot::Pooled(index) = block.bucket() else {
            return Some(block);
        };
        let Some(stack) = self.buckets.get_mut(index) else {
            return Some(block);
        };
        self.pooled_bytes += block.bytes();
        self.pooled_blocks += 1;
        stack.push(block);
        None
    }

    /// 清空所有桶并交出全部块，用于 `trim` 与关闭流程。
    pub fn drain(&mut self) -> Vec<PooledBlock<B>> {
        let mut drained = Vec::with_capacity(self.pooled_blocks);
        for stack in &mut self.buckets {
            drained.append(stack);
        }
        self.pooled_bytes = 0;
        self.pooled_blocks = 0;
        drained
    }

    /// 指定桶当前可复用的块数。
    pub fn available(&self, bucket: usize) -> usize {
        self.buckets.get(bucket).map_or(0, Vec::len)
    }

    pub fn pooled_bytes(&self) -> u64 {
        self.pooled_bytes
    }

    pub fn pooled_blocks(&self) -> usize {
        self.pooled_blocks
    }

    pub fn is_empty(&self) -> bool {
        self.pooled_blocks == 0
    }
}
