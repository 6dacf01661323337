//! 可观测性

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认只输出本 crate 的 info 日志；RUST_LOG 可覆盖
const DEFAULT_FILTER: &str = "convoy=info";

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
