//! 日志初始化。
//!
//! # 模块定位（Why）
//! - 分配器内部统一通过 `tracing` 宏输出诊断（目标 `spire::buffer`），自身不决定输出去向；
//! - 宿主进程或测试在启动时调用 [`install`] 装配 `fmt + EnvFilter` 订阅者。
//!
//! # 契约说明（What）
//! - [`install`] 设置全局订阅者，重复调用返回错误；
//! - [`try_install_for_tests`] 幂等，适合在多个测试用例中反复调用。

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 分配器日志使用的 target。
pub const TARGET: &str = "spire::buffer";

/// 安装全局 `tracing` 订阅者。
///
/// `filter` 采用 `EnvFilter` 语法；环境变量 `RUST_LOG` 存在时优先使用环境变量。
pub fn install(filter: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .try_init()
}

/// 测试专用：以 `test writer` 安装订阅者，已安装时静默返回。
pub fn try_install_for_tests() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("spire=debug"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
