#![deny(unsafe_code)]
#![doc = "spire-core: 帧流水线 GPU 缓冲分配器的核心契约。"]
#![doc = ""]
#![doc = "== 模块定位 =="]
#![doc = "本 crate 只定义契约：错误分类、配置、帧序号与缓冲用途等共享类型、GPU 执行后端 trait 与统计快照。"]
#![doc = "具体的桶表、空闲池、帧隔离区与环形分配器位于 `spire-buffer`，二者通过 [`backend::GpuBackend`] 解耦。"]
#![doc = ""]
#![doc = "== 线程模型 =="]
#![doc = "所有契约类型均为 `Send + Sync` 的纯数据；分配器本身由调用方决定单线程独占或经互斥锁共享。"]

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod stats;
pub mod types;

pub use backend::{GpuBackend, NativeBuffer};
pub use config::AllocatorConfig;
pub use error::{HandleState, Result, SpireError, codes};
pub use stats::AllocatorStats;
pub use types::{BufferHandle, BufferKind, BufferUsage, FrameIndex, LockMode, StorageMode};
