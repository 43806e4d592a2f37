use spire_core::{NativeBuffer, StorageMode};

use crate::bucket::BucketSlot;

/// 一次物理内存分配的逻辑记录。
///
/// # 契约说明（What）
/// - 原生缓冲 `native` 被独占持有；记录在空闲池、帧隔离区与活跃句柄之间以值移动的方式交接，
///   任一时刻只存在一个所有者；
/// - `bucket` 为 [`BucketSlot::Oversized`] 时该块永不入池，隔离期满后直接销毁；
/// - `created_size` 是创建时请求的字节数（池化块即桶的规范尺寸），原生长度可能更大。
#[derive(Debug)]
pub struct PooledBlock<B> {
    native: B,
    bucket: BucketSlot,
    created_size: u32,
}

impl<B: NativeBuffer> PooledBlock<B> {
    pub fn new(native: B, bucket: BucketSlot, created_size: u32) -> Self {
        Self {
            native,
            bucket,
            created_size,
        }
    }

    /// 原生句柄身份，用于判定“是否拿回了同一块内存”。
    pub fn id(&self) -> u64 {
        self.native.id()
    }

    pub fn bucket(&self) -> BucketSlot {
        self.bucket
    }

    pub fn created_size(&self) -> u32 {
        self.created_size
    }

    pub fn is_oversized(&self) -> bool {
        matches!(self.bucket, BucketSlot::Oversized)
    }

    pub fn storage(&self) -> StorageMode {
        self.native.storage()
    }

    /// 原生分配实际占用的字节数，统计口径以此为准。
    pub fn bytes(&self) -> u64 {
        self.native.len() as u64
    }

    pub fn native(&self) -> &B {
        &self.native
    }

    pub fn native_mut(&mut self) -> &mut B {
        &mut self.native
    }

    pub fn into_native(self) -> B {
        self.native
    }
}

/// 进入帧隔离区的条目。
///
/// - `Block`：分配器自己创建的块，期满后池化块回到空闲池，超大块被销毁；
/// - `Deferred`：通过 `defer_release` 交给分配器的任意原生缓冲，期满后销毁。
#[derive(Debug)]
pub enum Retired<B> {
    Block(PooledBlock<B>),
    Deferred(B),
}

impl<B: NativeBuffer> Retired<B> {
    pub fn bytes(&self) -> u64 {
        match self {
            Retired::Block(block) => block.bytes(),
            Retired::Deferred(native) => native.len() as u64,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Retired::Block(block) => block.id(),
            Retired::Deferred(native) => native.id(),
        }
    }
}
