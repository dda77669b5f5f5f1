use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// 从字符串解析日志级别
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// verbose 模式下至少输出 debug 日志
    pub fn with_verbose(self, verbose: bool) -> Self {
        match self {
            LogLevel::Info | LogLevel::Warn | LogLevel::Error if verbose => LogLevel::Debug,
            level => level,
        }
    }
}

/// 构造过滤规则，只作用于本 crate
pub fn filter_directive(log_mode: &str, verbose: bool) -> String {
    let level = LogLevel::parse(log_mode)
        .unwrap_or_default()
        .with_verbose(verbose);
    format!("terracotta={}", level.as_str())
}

pub fn init_logger(log_mode: &str, verbose: bool) {
    let filter = EnvFilter::new(filter_directive(log_mode, verbose));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .init();
}

pub mod log {
    pub use tracing::{debug, error, info, trace, warn};

    /// 记录连接事件
    pub fn connection(addr: &str, event: &str) {
        debug!(peer = addr, event = event, "Connection");
    }

    /// 记录单向转发结束
    pub fn leg_finished(peer: &str, direction: &str, bytes: u64) {
        debug!(peer = peer, direction = direction, bytes = bytes, "Relay leg finished");
    }
}
