//! `spire-buffer` 实现 `spire-core` 定义的帧流水线 GPU 缓冲分配器。
//!
//! # 模块定位（Why）
//! - 渲染管线在每帧的热路径上创建和改写大量缓冲，需要在“减少原生分配”与
//!   “绝不覆盖 GPU 仍在读取的内存”之间同时成立；
//! - 本 crate 把这一约束拆成可以单独验证的几层，由 [`BufferAllocator`] 组合。
//!
//! # 设计概要（How）
//! - [`bucket`]：把请求尺寸映射到规范桶尺寸；
//! - [`free_pool`]：按桶维护可立即复用的块（后进先出）；
//! - [`quarantine`]：N 槽位的帧隔离区，释放的块 N 个帧边界后才回到空闲池；
//! - [`ring`]：单次绘制数据使用的回绕式指针碰撞分配器；
//! - [`host`]：基于主机内存的后端，用于无 GPU 环境与测试。
//!
//! # 线程模型（Consistency）
//! - [`BufferAllocator`] 以 `&mut self` 独占使用；跨线程共享统一经由 [`SharedBufferAllocator`]。

extern crate alloc;

mod allocator;
pub mod block;
pub mod bucket;
pub mod free_pool;
mod handle;
pub mod host;
pub mod quarantine;
pub mod ring;
mod shared;

pub use allocator::{BufferAllocator, DrawStaging};
pub use block::{PooledBlock, Retired};
pub use bucket::{BucketSlot, BucketTable};
pub use free_pool::FreeBufferPool;
pub use host::{HostBackend, HostBuffer, HostProbe};
pub use quarantine::FrameQuarantine;
pub use ring::{RingAllocation, RingAllocator};
pub use shared::SharedBufferAllocator;
