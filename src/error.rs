use std::io;
use thiserror::Error;

/// Terracotta 统一的错误类型
#[derive(Error, Debug)]
pub enum TerracottaError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 监听端口绑定失败
    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 连接远端失败
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 连接远端超时
    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    /// 隧道服务端连接已断开
    #[error("Tunnel connection to {0} closed")]
    TunnelClosed(String),
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, TerracottaError>;
