use std::{fmt, io};

use quinn::ConnectionError;
use spark_listener::{EngineError, EngineErrorKind};

/// quinn / rustls 原生错误到 [`EngineError`] 的映射。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 核心只认识带标签的 [`EngineError`]；引擎在自身边界完成一次翻译，
///   保留原生错误码（如 `EADDRINUSE`）供排障；
/// - 以 `OperationKind` 记录“哪个操作失败”，日志中的错误码与文案保持稳定。
///
/// ## 契约（What）
/// - 所有错误码遵循 `spark.listener.quinn.*` 命名；
/// - 本地关闭映射为 [`EngineErrorKind::Aborted`]，其余连接错误归入握手失败。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.listener.quinn.bind_failed",
    message: "quic bind",
};

pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.listener.quinn.handshake_failed",
    message: "quic handshake",
};

pub(crate) const TLS_CONFIG: OperationKind = OperationKind {
    code: "spark.listener.quinn.tls_config_failed",
    message: "quic tls config",
};

pub(crate) fn map_io_error(kind: OperationKind, error: &io::Error) -> EngineError {
    EngineError::from_io(kind.message, error)
}

pub(crate) fn map_connection_error(kind: OperationKind, error: ConnectionError) -> EngineError {
    let category = match error {
        ConnectionError::LocallyClosed => EngineErrorKind::Aborted,
        ConnectionError::TimedOut
        | ConnectionError::Reset
        | ConnectionError::ConnectionClosed(_)
        | ConnectionError::ApplicationClosed(_)
        | ConnectionError::TransportError(_)
        | ConnectionError::VersionMismatch => EngineErrorKind::Handshake,
        ConnectionError::CidsExhausted => EngineErrorKind::Other,
    };
    EngineError::new(category, format!("{}: {}", kind.message, error))
}

pub(crate) fn config_error(kind: OperationKind, detail: impl fmt::Display) -> EngineError {
    EngineError::new(
        EngineErrorKind::InvalidConfiguration,
        format!("{}: {}", kind.message, detail),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_in_use_keeps_kind_and_native_code() {
        let error = map_io_error(BIND, &io::Error::from(io::ErrorKind::AddrInUse));
        assert_eq!(error.kind(), EngineErrorKind::AddressInUse);
        assert!(error.message().starts_with("quic bind"));
    }

    #[test]
    fn local_close_is_a_graceful_abort() {
        let error = map_connection_error(HANDSHAKE, ConnectionError::LocallyClosed);
        assert!(error.is_aborted());
        let timeout = map_connection_error(HANDSHAKE, ConnectionError::TimedOut);
        assert_eq!(timeout.kind(), EngineErrorKind::Handshake);
    }
}
