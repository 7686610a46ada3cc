//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义监听适配层对外暴露的错误语义：配置错误、绑定错误、协商错误、不变量破坏；
//! - 把引擎的原生错误建模为带标签的 [`EngineError`]（种类 + 原生错误码 + 文案），
//!   并在绑定、接受两个边界各做一次显式翻译，避免模式匹配散落在调用路径中。
//!
//! ## 设计要求（What）
//! - [`ListenerError`] 的每个变体都有稳定错误码（`spark.listener.*`），供日志与告警引用；
//! - 优雅关闭不是错误：引擎报告的 [`EngineErrorKind::Aborted`] 在接受边界被翻译为流结束；
//! - 单次协商的失败以 [`NegotiationError`] 表达，只在回调边界内流动，永远不会穿透 `accept`。

use std::{borrow::Cow, error::Error as StdError, fmt, io, net::SocketAddr, time::Duration};

use thiserror::Error;

use crate::engine::HandleId;

/// 引擎错误种类。
///
/// 核心只关心少数几类需要区别对待的失败，其余一律归入 `Io`/`Other` 原样透传。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EngineErrorKind {
    /// 绑定地址已被占用。
    AddressInUse,
    /// 监听已被关闭，挂起的接受操作被中止。
    Aborted,
    /// 引擎拒绝了给定的配置（证书、ALPN、传输参数等）。
    InvalidConfiguration,
    /// 操作系统层面的 IO 失败。
    Io,
    /// 握手阶段失败。
    Handshake,
    /// 其他未分类失败。
    Other,
}

impl EngineErrorKind {
    /// 稳定的字符串表示，用于日志字段。
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddressInUse => "address_in_use",
            Self::Aborted => "aborted",
            Self::InvalidConfiguration => "invalid_configuration",
            Self::Io => "io",
            Self::Handshake => "handshake",
            Self::Other => "other",
        }
    }

    /// 由标准库 IO 错误种类推导引擎错误种类。
    pub fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::AddrInUse => Self::AddressInUse,
            _ => Self::Io,
        }
    }
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 引擎上报的带标签错误。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 不同引擎的原生错误类型千差万别（`io::Error`、`quinn::ConnectionError`、模拟错误），
///   核心只需要“种类 + 原生错误码 + 文案”三元组即可完成翻译与排障；
///
/// ## 契约（What）
/// - `kind` 决定核心如何翻译；`native_code` 保留原始错误码（如 `EADDRINUSE`）；
/// - 值类型、可克隆，便于在日志与错误链中多处引用。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineError {
    kind: EngineErrorKind,
    native_code: Option<i32>,
    message: Cow<'static, str>,
}

impl EngineError {
    /// 以种类与文案构造错误。
    pub fn new(kind: EngineErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            native_code: None,
            message: message.into(),
        }
    }

    /// 附加原生错误码。
    pub fn with_native_code(mut self, code: Option<i32>) -> Self {
        self.native_code = code;
        self
    }

    /// 监听关闭导致的中止。
    pub fn aborted(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(EngineErrorKind::Aborted, message)
    }

    /// 将 `io::Error` 转换为引擎错误，保留原生错误码。
    pub fn from_io(operation: &str, error: &io::Error) -> Self {
        Self::new(
            EngineErrorKind::from_io_kind(error.kind()),
            format!("{operation}: {error}"),
        )
        .with_native_code(error.raw_os_error())
    }

    pub fn kind(&self) -> EngineErrorKind {
        self.kind
    }

    pub fn native_code(&self) -> Option<i32> {
        self.native_code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_aborted(&self) -> bool {
        self.kind == EngineErrorKind::Aborted
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.native_code {
            Some(code) => write!(f, "{} (native code {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl StdError for EngineError {}

/// 监听适配层对宿主暴露的错误。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 让宿主能按类别决定处置：配置错误不重试、地址占用可换地址重试、不变量破坏直接告警；
///
/// ## 契约（What）
/// - 配置类：`UnsupportedPlatform`、`InvalidEndpointType`、`NoProtocolsConfigured`，只在 `configure` 产生；
/// - 绑定类：`AddressInUse` 由 `start` 产生，其余引擎失败以 `Engine` 原样透传；
/// - 使用类：`ListenerNotInitialized`、`AlreadyStarted`、`ListenerClosed`、`EndpointLocked`；
/// - 不变量类：`MissingPendingContext`、`DuplicateRegistration`、`DuplicateAcceptance`；
/// - `Cancelled` 表示调用方取消了本次 `accept`，不消耗任何注册表条目。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ListenerError {
    #[error("transport engine `{engine}` is not supported on this platform")]
    UnsupportedPlatform { engine: &'static str },

    #[error("endpoint `{endpoint}` is not an IP address and port the transport can bind")]
    InvalidEndpointType { endpoint: String },

    #[error("no application protocols configured for the listener")]
    NoProtocolsConfigured,

    #[error("address {address} is already in use")]
    AddressInUse {
        address: SocketAddr,
        #[source]
        source: EngineError,
    },

    #[error("listener has not been started")]
    ListenerNotInitialized,

    #[error("listener has already been started")]
    AlreadyStarted,

    #[error("listener has been closed")]
    ListenerClosed,

    #[error("endpoint cannot be changed after the listener has started")]
    EndpointLocked,

    #[error("no pending connection context registered for handle {handle}")]
    MissingPendingContext { handle: HandleId },

    #[error("handle {handle} is already registered in the pending registry")]
    DuplicateRegistration { handle: HandleId },

    #[error("connection for handle {handle} has already been accepted")]
    DuplicateAcceptance { handle: HandleId },

    #[error("accept was cancelled by the caller")]
    Cancelled,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ListenerError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedPlatform { .. } => "spark.listener.unsupported_platform",
            Self::InvalidEndpointType { .. } => "spark.listener.invalid_endpoint_type",
            Self::NoProtocolsConfigured => "spark.listener.no_protocols_configured",
            Self::AddressInUse { .. } => "spark.listener.address_in_use",
            Self::ListenerNotInitialized => "spark.listener.not_initialized",
            Self::AlreadyStarted => "spark.listener.already_started",
            Self::ListenerClosed => "spark.listener.closed",
            Self::EndpointLocked => "spark.listener.endpoint_locked",
            Self::MissingPendingContext { .. } => "spark.listener.missing_pending_context",
            Self::DuplicateRegistration { .. } => "spark.listener.duplicate_registration",
            Self::DuplicateAcceptance { .. } => "spark.listener.duplicate_acceptance",
            Self::Cancelled => "spark.listener.cancelled",
            Self::Engine(_) => "spark.listener.engine_failed",
        }
    }

    /// 调用方换个时机或地址重试是否可能成功。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AddressInUse { .. } | Self::Cancelled)
    }

    /// 是否代表核心与引擎之间的契约被破坏。
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::MissingPendingContext { .. }
                | Self::DuplicateRegistration { .. }
                | Self::DuplicateAcceptance { .. }
        )
    }
}

/// 单次协商的失败原因。
///
/// 只在协商回调与引擎之间流动；引擎据此拒绝该次尝试，宿主的 `accept` 不会观察到它。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NegotiationError {
    #[error("negotiation rejected: {0}")]
    Rejected(Cow<'static, str>),

    #[error("negotiation cancelled")]
    Cancelled,

    #[error("negotiation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("negotiation failed: {0}")]
    Failed(#[source] Box<dyn StdError + Send + Sync>),

    #[error("pending registry refused the attempt: {0}")]
    Registry(#[source] ListenerError),
}

impl NegotiationError {
    /// 以拒绝原因构造错误。
    pub fn rejected(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Rejected(reason.into())
    }

    /// 包装宿主回调内部的任意错误。
    pub fn failed(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Failed(error.into())
    }
}

/// 监听配置解析失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listener configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// 绑定边界的唯一翻译点：地址占用被提升为可捕获的独立错误，其余原样透传。
pub(crate) fn translate_bind(address: SocketAddr, error: EngineError) -> ListenerError {
    match error.kind() {
        EngineErrorKind::AddressInUse => ListenerError::AddressInUse {
            address,
            source: error,
        },
        _ => ListenerError::Engine(error),
    }
}

/// 接受边界的唯一翻译点：`None` 代表优雅关闭（流结束）。
pub(crate) fn translate_accept(error: EngineError) -> Option<ListenerError> {
    if error.is_aborted() {
        None
    } else {
        Some(ListenerError::Engine(error))
    }
}
