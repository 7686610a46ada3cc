//! 底层传输引擎契约。
//!
//! # 教案式注释
//!
//! ## 意图（Why）
//! - 监听适配层不实现握手、拥塞控制与流分帧，这些由引擎负责；本模块只约定核心与引擎之间的接口：
//!   绑定、逐次协商钩子、取出已完成连接、关闭；
//! - 原生句柄由引擎铸造并在尝试存续期间持有，核心只借用其身份与弱租约。
//!
//! ## 契约（What）
//! - [`TransportEngine::bind`] 成功后引擎开始为每次入站尝试调用 [`NegotiationHook::negotiate`]，
//!   无论此刻是否有人在 `accept`；
//! - [`TransportEngine::accept_next`] 必须是取消安全的：调用方丢弃 Future 不得丢失已完成的连接；
//! - [`TransportEngine::close`] 之后，挂起与后续的 `accept_next` 返回
//!   [`EngineErrorKind::Aborted`](crate::EngineErrorKind::Aborted)；
//! - 引擎必须持有 [`NativeHandle`] 直到对应的 [`CompletedConnection`] 被取走，或尝试失败后立即释放。

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;

use crate::{
    cancel::Cancellation,
    config::ApplicationProtocol,
    error::{EngineError, NegotiationError},
    negotiation::ConnectionOptions,
};

/// 原生句柄的数值身份。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 引擎为一次入站尝试铸造的不透明句柄。
///
/// 克隆共享同一身份；最后一个克隆被释放即代表该尝试在引擎侧已经结束。
#[derive(Clone, Debug)]
pub struct NativeHandle {
    cell: Arc<HandleCell>,
}

#[derive(Debug)]
struct HandleCell {
    id: HandleId,
}

impl NativeHandle {
    pub fn new(id: HandleId) -> Self {
        Self {
            cell: Arc::new(HandleCell { id }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.cell.id
    }

    /// 生成不延长句柄寿命的弱租约。
    pub fn downgrade(&self) -> WeakHandle {
        WeakHandle {
            id: self.cell.id,
            cell: Arc::downgrade(&self.cell),
        }
    }
}

/// 句柄的弱租约，挂起注册表据此判断条目是否过期。
#[derive(Clone, Debug)]
pub struct WeakHandle {
    id: HandleId,
    cell: Weak<HandleCell>,
}

impl WeakHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// 引擎是否仍持有该句柄。
    pub fn is_alive(&self) -> bool {
        self.cell.strong_count() > 0
    }
}

/// 单调递增的句柄分配器，供引擎实现复用。
#[derive(Debug)]
pub struct HandleAllocator {
    next: AtomicU64,
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> NativeHandle {
        NativeHandle::new(HandleId(self.next.fetch_add(1, Ordering::Relaxed)))
    }
}

/// 客户端在握手前提供的提示信息（SNI、ALPN 候选、地址）。
///
/// 引擎能拿到多少信息取决于实现：内存引擎可提供全部字段，
/// quinn 引擎在握手前只能提供地址，SNI 需交由证书解析器在握手中读取。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientHello {
    server_name: Option<String>,
    offered_protocols: Vec<ApplicationProtocol>,
    remote_address: SocketAddr,
    local_address: Option<SocketAddr>,
}

impl ClientHello {
    pub fn new(remote_address: SocketAddr) -> Self {
        Self {
            server_name: None,
            offered_protocols: Vec::new(),
            remote_address,
            local_address: None,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_offered_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ApplicationProtocol>,
    {
        self.offered_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_local_address(mut self, address: SocketAddr) -> Self {
        self.local_address = Some(address);
        self
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn offered_protocols(&self) -> &[ApplicationProtocol] {
        &self.offered_protocols
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.local_address
    }
}

/// 引擎交给协商钩子的一次入站尝试。
#[derive(Debug)]
pub struct Attempt {
    handle: NativeHandle,
    hello: ClientHello,
}

impl Attempt {
    pub fn new(handle: NativeHandle, hello: ClientHello) -> Self {
        Self { handle, hello }
    }

    pub fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    pub fn hello(&self) -> &ClientHello {
        &self.hello
    }

    pub fn into_parts(self) -> (NativeHandle, ClientHello) {
        (self.handle, self.hello)
    }
}

/// 绑定阶段交给引擎的不可变配置。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindConfig {
    address: SocketAddr,
    backlog: u32,
    application_protocols: Vec<ApplicationProtocol>,
}

impl BindConfig {
    pub fn new(
        address: SocketAddr,
        backlog: u32,
        application_protocols: Vec<ApplicationProtocol>,
    ) -> Self {
        Self {
            address,
            backlog,
            application_protocols,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// 已完成但尚未被 `accept` 取走的连接上限。
    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    pub fn application_protocols(&self) -> &[ApplicationProtocol] {
        &self.application_protocols
    }
}

/// 引擎完成握手的连接，连同触发协商的句柄一起交还核心。
#[derive(Debug)]
pub struct CompletedConnection<C> {
    pub handle: NativeHandle,
    pub connection: C,
}

impl<C> CompletedConnection<C> {
    pub fn new(handle: NativeHandle, connection: C) -> Self {
        Self { handle, connection }
    }
}

/// 引擎在握手前为每次尝试调用的协商钩子。
///
/// 由核心实现（见 `negotiation` 模块），引擎只负责在合适的时机调用，并依据返回值完成或拒绝握手。
#[async_trait]
pub trait NegotiationHook: Send + Sync + 'static {
    async fn negotiate(
        &self,
        attempt: Attempt,
        cancel: Cancellation,
    ) -> Result<ConnectionOptions, NegotiationError>;
}

/// 底层传输引擎。
#[async_trait]
pub trait TransportEngine: Send + Sync + 'static {
    /// 引擎交付的连接类型。
    type Connection: Send + Sync + 'static;

    /// 引擎名称，用于日志与错误信息。
    fn name(&self) -> &'static str;

    /// 当前平台是否可用。
    fn is_supported(&self) -> bool {
        true
    }

    /// 绑定并开始监听，返回实际绑定地址。
    async fn bind(
        &self,
        config: BindConfig,
        hook: Arc<dyn NegotiationHook>,
    ) -> Result<SocketAddr, EngineError>;

    /// 等待下一条完成握手的连接。
    async fn accept_next(&self) -> Result<CompletedConnection<Self::Connection>, EngineError>;

    /// 释放监听资源；必须幂等。
    fn close(&self);
}
