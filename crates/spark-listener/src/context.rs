use std::{
    fmt,
    net::SocketAddr,
    sync::OnceLock,
    time::{Duration, Instant},
};

use crate::{config::ApplicationProtocol, engine::HandleId};

/// 每个连接继承自监听配置的传输参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportSettings {
    pub idle_timeout: Duration,
    pub max_inbound_bidirectional_streams: u32,
    pub max_inbound_unidirectional_streams: u32,
    pub default_close_error_code: u64,
    pub default_stream_error_code: u64,
}

/// 宿主消费的高层连接上下文。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 协商回调需要在握手完成之前就拿到一个稳定的连接对象（用于记录日志、挂载宿主状态），
///   因此上下文在协商开始时即被创建，早于引擎连接本身；
/// - 握手完成后由接受循环把引擎连接写入上下文，宿主从 `accept` 拿到的正是协商时的同一对象。
///
/// ## 逻辑（How）
/// - 身份即 `Arc` 分配本身：注册表、协商输入、`accept` 返回值共享同一个 `Arc`；
/// - 上下文只记录句柄的数值标识而不持有句柄，避免“句柄 → 注册表 → 上下文 → 句柄”的环；
/// - `connection` 与 `negotiated_protocols` 均为一次写入（`OnceLock`），重复写入视为不变量破坏。
///
/// ## 契约（What）
/// - `connection()` 在 `accept` 返回之前为 `None`，之后恒为 `Some`；
/// - `settings()` 在整个生命周期内不变。
pub struct ConnectionContext<C> {
    handle: HandleId,
    remote_address: SocketAddr,
    settings: TransportSettings,
    created_at: Instant,
    negotiated_protocols: OnceLock<Vec<ApplicationProtocol>>,
    connection: OnceLock<C>,
}

impl<C> ConnectionContext<C> {
    pub(crate) fn new(
        handle: HandleId,
        remote_address: SocketAddr,
        settings: TransportSettings,
    ) -> Self {
        Self {
            handle,
            remote_address,
            settings,
            created_at: Instant::now(),
            negotiated_protocols: OnceLock::new(),
            connection: OnceLock::new(),
        }
    }

    /// 触发本上下文创建的原生句柄标识。
    pub fn handle_id(&self) -> HandleId {
        self.handle
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// 自协商开始以来经过的时间。
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// 协商确定的 ALPN 列表；协商尚未完成时为空。
    pub fn negotiated_protocols(&self) -> &[ApplicationProtocol] {
        self.negotiated_protocols
            .get()
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// 已被接受的引擎连接。
    pub fn connection(&self) -> Option<&C> {
        self.connection.get()
    }

    pub fn is_accepted(&self) -> bool {
        self.connection.get().is_some()
    }

    pub(crate) fn record_negotiated(&self, protocols: Vec<ApplicationProtocol>) {
        // 同一上下文只经历一次协商，重复写入直接忽略。
        let _ = self.negotiated_protocols.set(protocols);
    }

    pub(crate) fn attach(&self, connection: C) -> Result<(), C> {
        self.connection.set(connection)
    }
}

impl<C> fmt::Debug for ConnectionContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("handle", &self.handle)
            .field("remote_address", &self.remote_address)
            .field("settings", &self.settings)
            .field("negotiated_protocols", &self.negotiated_protocols())
            .field("accepted", &self.is_accepted())
            .finish()
    }
}
