//! 内存传输引擎：供宿主与本 crate 的测试在无网络环境下驱动完整的协商与接受流程。
//!
//! # 教案式注释
//!
//! ## 意图（Why）
//! - 真实引擎的握手依赖证书与 UDP，难以精确构造“协商失败”“积压已满”“句柄未登记”等边界；
//! - 内存引擎保留与生产引擎一致的契约（句柄持有、取消安全的 `accept_next`、关闭即 `Aborted`），
//!   并开放注入接口模拟契约破坏。
//!
//! ## 逻辑（How）
//! - [`MemoryNetwork`] 维护“地址 → 引擎”端口表，临时端口从 49152 起分配；
//! - [`MemoryClient::connect`] 在调用方任务中运行协商钩子，随后模拟握手：
//!   无证书或 ALPN 无交集即握手失败，服务端按自身偏好选择第一个客户端也提供的协议；
//! - 完成的连接进入容量为 `backlog` 的有界队列，队列满时连接被拒绝。

use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicU16, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::debug;

use crate::{
    cancel::Cancellation,
    config::ApplicationProtocol,
    context::TransportSettings,
    engine::{
        Attempt, BindConfig, ClientHello, CompletedConnection, HandleAllocator, HandleId,
        NegotiationHook, TransportEngine,
    },
    error::{EngineError, EngineErrorKind, NegotiationError},
    negotiation::CertificateSource,
};

/// Linux 上 `EADDRINUSE` 的取值，模拟引擎以此作为原生错误码。
pub const ADDRESS_IN_USE_CODE: i32 = 98;

const EPHEMERAL_START: u16 = 49152;

type Delivery = Result<CompletedConnection<MemoryConnection>, EngineError>;

/// 进程内的虚拟网络。
#[derive(Clone, Debug, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkState>,
}

#[derive(Debug)]
struct NetworkState {
    ports: Mutex<HashMap<SocketAddr, Weak<EngineShared>>>,
    next_ephemeral: AtomicU16,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            ports: Mutex::new(HashMap::new()),
            next_ephemeral: AtomicU16::new(EPHEMERAL_START),
        }
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在本网络上创建一个可用的引擎。
    pub fn engine(&self) -> MemoryEngine {
        MemoryEngine::new(self)
    }

    /// 创建一个客户端，源地址为 `127.0.0.1` 上的临时端口。
    pub fn client(&self) -> MemoryClient {
        let port = self.next_port();
        MemoryClient {
            network: self.clone(),
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        }
    }

    /// 当前处于监听状态的地址数。
    pub fn bound_ports(&self) -> usize {
        let mut ports = self.inner.ports.lock();
        ports.retain(|_, engine| is_open(engine));
        ports.len()
    }

    fn next_port(&self) -> u16 {
        let raw = self.inner.next_ephemeral.fetch_add(1, Ordering::Relaxed);
        EPHEMERAL_START + raw.wrapping_sub(EPHEMERAL_START) % (u16::MAX - EPHEMERAL_START)
    }

    fn reserve(
        &self,
        requested: SocketAddr,
        engine: &Arc<EngineShared>,
    ) -> Result<SocketAddr, EngineError> {
        let mut ports = self.inner.ports.lock();
        ports.retain(|_, engine| is_open(engine));

        let address = if requested.port() == 0 {
            (0..u16::MAX - EPHEMERAL_START)
                .map(|_| SocketAddr::new(requested.ip(), self.next_port()))
                .find(|candidate| !ports.contains_key(candidate))
                .ok_or_else(|| EngineError::new(EngineErrorKind::Io, "no ephemeral ports left"))?
        } else if ports.contains_key(&requested) {
            return Err(EngineError::new(
                EngineErrorKind::AddressInUse,
                format!("memory bind {requested}: address already in use"),
            )
            .with_native_code(Some(ADDRESS_IN_USE_CODE)));
        } else {
            requested
        };

        ports.insert(address, Arc::downgrade(engine));
        Ok(address)
    }

    /// 只归还 `owner` 自己占用的地址，重复调用无副作用。
    fn release(&self, address: SocketAddr, owner: &Arc<EngineShared>) {
        let mut ports = self.inner.ports.lock();
        if ports
            .get(&address)
            .is_some_and(|held| Weak::as_ptr(held) == Arc::as_ptr(owner))
        {
            ports.remove(&address);
        }
    }

    fn lookup(&self, address: SocketAddr) -> Option<Arc<EngineShared>> {
        let ports = self.inner.ports.lock();
        let wildcard = match address.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        ports
            .get(&address)
            .or_else(|| ports.get(&SocketAddr::new(wildcard, address.port())))
            .and_then(Weak::upgrade)
            .filter(|engine| !engine.closed.is_cancelled())
    }
}

fn is_open(engine: &Weak<EngineShared>) -> bool {
    engine
        .upgrade()
        .is_some_and(|engine| !engine.closed.is_cancelled())
}

/// 内存引擎；克隆共享同一份状态。
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<EngineShared>,
}

struct EngineShared {
    network: MemoryNetwork,
    supported: bool,
    handles: HandleAllocator,
    bound: OnceLock<Bound>,
    closed: Cancellation,
}

struct Bound {
    address: SocketAddr,
    config: BindConfig,
    hook: Arc<dyn NegotiationHook>,
    sender: mpsc::Sender<Delivery>,
    receiver: AsyncMutex<mpsc::Receiver<Delivery>>,
}

impl fmt::Debug for EngineShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("supported", &self.supported)
            .field("bound", &self.bound.get().map(|bound| bound.address))
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.shared, f)
    }
}

impl MemoryEngine {
    pub fn new(network: &MemoryNetwork) -> Self {
        Self::with_support(network, true)
    }

    /// 报告当前平台不可用的引擎。
    pub fn unsupported(network: &MemoryNetwork) -> Self {
        Self::with_support(network, false)
    }

    fn with_support(network: &MemoryNetwork, supported: bool) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                network: network.clone(),
                supported,
                handles: HandleAllocator::new(),
                bound: OnceLock::new(),
                closed: Cancellation::new(),
            }),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.bound.get().map(|bound| bound.address)
    }

    /// 绑定时收到的配置。
    pub fn bind_config(&self) -> Option<&BindConfig> {
        self.shared.bound.get().map(|bound| &bound.config)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// 投递一条从未经过协商的连接，用于模拟引擎违反句柄登记契约。
    pub fn inject_unregistered(&self) -> Result<HandleId, EngineError> {
        let bound = self.bound()?;
        let handle = self.shared.handles.allocate();
        let id = handle.id();
        let connection = MemoryConnection::new(MemoryConnectionInfo {
            handle: id,
            client_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            server_address: bound.address,
            protocol: bound
                .config
                .application_protocols()
                .first()
                .cloned()
                .unwrap_or_else(|| ApplicationProtocol::from("")),
            server_name: None,
            certificate_kind: "none",
            transport: None,
        });
        self.enqueue(bound, Ok(CompletedConnection::new(handle, connection)))?;
        Ok(id)
    }

    /// 让下一次 `accept_next` 返回给定错误。
    pub fn inject_failure(&self, error: EngineError) -> Result<(), EngineError> {
        let bound = self.bound()?;
        self.enqueue(bound, Err(error))
    }

    fn bound(&self) -> Result<&Bound, EngineError> {
        self.shared
            .bound
            .get()
            .ok_or_else(|| EngineError::new(EngineErrorKind::Other, "memory engine is not bound"))
    }

    fn enqueue(&self, bound: &Bound, delivery: Delivery) -> Result<(), EngineError> {
        bound.sender.try_send(delivery).map_err(|_| {
            EngineError::new(EngineErrorKind::Other, "memory engine backlog is full")
        })
    }
}

#[async_trait]
impl TransportEngine for MemoryEngine {
    type Connection = MemoryConnection;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_supported(&self) -> bool {
        self.shared.supported
    }

    async fn bind(
        &self,
        config: BindConfig,
        hook: Arc<dyn NegotiationHook>,
    ) -> Result<SocketAddr, EngineError> {
        if self.shared.closed.is_cancelled() {
            return Err(EngineError::aborted("memory engine closed"));
        }
        if self.shared.bound.get().is_some() {
            return Err(EngineError::new(
                EngineErrorKind::InvalidConfiguration,
                "memory engine is already bound",
            ));
        }

        let address = self.shared.network.reserve(config.address(), &self.shared)?;
        let capacity = usize::try_from(config.backlog()).unwrap_or(usize::MAX).max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let bound = Bound {
            address,
            config,
            hook,
            sender,
            receiver: AsyncMutex::new(receiver),
        };
        if self.shared.bound.set(bound).is_err() {
            self.shared.network.release(address, &self.shared);
            return Err(EngineError::new(
                EngineErrorKind::InvalidConfiguration,
                "memory engine is already bound",
            ));
        }
        if self.shared.closed.is_cancelled() {
            // `close` 可能在 `set` 之前读到了空的绑定，端口由这里归还。
            self.shared.network.release(address, &self.shared);
            return Err(EngineError::aborted("memory engine closed"));
        }
        debug!(%address, "memory engine bound");
        Ok(address)
    }

    async fn accept_next(&self) -> Result<CompletedConnection<MemoryConnection>, EngineError> {
        let closed = &self.shared.closed;
        if closed.is_cancelled() {
            return Err(EngineError::aborted("memory engine closed"));
        }
        let bound = self.bound()?;

        let mut receiver = tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(EngineError::aborted("memory engine closed")),
            receiver = bound.receiver.lock() => receiver,
        };
        tokio::select! {
            biased;
            _ = closed.cancelled() => Err(EngineError::aborted("memory engine closed")),
            delivery = receiver.recv() => {
                delivery.unwrap_or_else(|| Err(EngineError::aborted("memory engine closed")))
            }
        }
    }

    fn close(&self) {
        let first = self.shared.closed.cancel();
        if let Some(bound) = self.shared.bound.get() {
            self.shared.network.release(bound.address, &self.shared);
            if first {
                debug!(address = %bound.address, "memory engine closed");
            }
        }
    }
}

/// 内存客户端的连接失败原因。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectError {
    #[error("connection to {address} refused")]
    Refused { address: SocketAddr },

    #[error("server negotiation failed: {0}")]
    Negotiation(#[source] NegotiationError),

    #[error("handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    #[error("server backlog is full")]
    BacklogFull,
}

/// 虚拟网络上的客户端。
#[derive(Clone, Debug)]
pub struct MemoryClient {
    network: MemoryNetwork,
    address: SocketAddr,
}

impl MemoryClient {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// 向 `server` 发起一次连接尝试，协商在当前任务中执行。
    pub async fn connect<I, P>(
        &self,
        server: SocketAddr,
        server_name: Option<&str>,
        protocols: I,
    ) -> Result<MemoryConnection, ConnectError>
    where
        I: IntoIterator<Item = P>,
        P: Into<ApplicationProtocol>,
    {
        let refused = || ConnectError::Refused { address: server };
        let engine = self.network.lookup(server).ok_or_else(refused)?;
        let bound = engine.bound.get().ok_or_else(refused)?;

        let offered: Vec<ApplicationProtocol> = protocols.into_iter().map(Into::into).collect();
        let mut hello = ClientHello::new(self.address)
            .with_offered_protocols(offered.clone())
            .with_local_address(bound.address);
        if let Some(name) = server_name {
            hello = hello.with_server_name(name);
        }

        let handle = engine.handles.allocate();
        let options = bound
            .hook
            .negotiate(Attempt::new(handle.clone(), hello), engine.closed.child())
            .await
            .map_err(ConnectError::Negotiation)?;

        let certificate_kind = match &options.certificate {
            None => return Err(ConnectError::Handshake("server presented no certificate".into())),
            Some(CertificateSource::Resolver(resolver)) => {
                if resolver.resolve(server_name).is_none() {
                    return Err(ConnectError::Handshake(
                        "certificate resolver returned no certificate".into(),
                    ));
                }
                "resolver"
            }
            Some(source) => source.kind(),
        };
        let protocol = options
            .application_protocols
            .iter()
            .find(|candidate| offered.contains(candidate))
            .cloned()
            .ok_or_else(|| ConnectError::Handshake("no application protocol in common".into()))?;

        let connection = MemoryConnection::new(MemoryConnectionInfo {
            handle: handle.id(),
            client_address: self.address,
            server_address: bound.address,
            protocol,
            server_name: server_name.map(str::to_owned),
            certificate_kind,
            transport: Some(options.transport),
        });
        if engine.closed.is_cancelled() {
            return Err(refused());
        }
        bound
            .sender
            .try_send(Ok(CompletedConnection::new(handle, connection.clone())))
            .map_err(|failure| match failure {
                mpsc::error::TrySendError::Full(_) => ConnectError::BacklogFull,
                mpsc::error::TrySendError::Closed(_) => refused(),
            })?;
        Ok(connection)
    }
}

/// 内存引擎交付的连接；客户端与服务端看到的是同一份连接信息。
#[derive(Clone)]
pub struct MemoryConnection {
    info: Arc<MemoryConnectionInfo>,
}

struct MemoryConnectionInfo {
    handle: HandleId,
    client_address: SocketAddr,
    server_address: SocketAddr,
    protocol: ApplicationProtocol,
    server_name: Option<String>,
    certificate_kind: &'static str,
    transport: Option<TransportSettings>,
}

impl MemoryConnection {
    fn new(info: MemoryConnectionInfo) -> Self {
        Self {
            info: Arc::new(info),
        }
    }

    /// 触发协商的原生句柄。
    pub fn handle_id(&self) -> HandleId {
        self.info.handle
    }

    pub fn client_address(&self) -> SocketAddr {
        self.info.client_address
    }

    pub fn server_address(&self) -> SocketAddr {
        self.info.server_address
    }

    /// 握手选定的 ALPN。
    pub fn protocol(&self) -> &ApplicationProtocol {
        &self.info.protocol
    }

    pub fn server_name(&self) -> Option<&str> {
        self.info.server_name.as_deref()
    }

    /// 握手所用证书来源的种类。
    pub fn certificate_kind(&self) -> &'static str {
        self.info.certificate_kind
    }

    /// 握手生效的传输参数；注入的连接没有经过协商，因此为 `None`。
    pub fn transport(&self) -> Option<&TransportSettings> {
        self.info.transport.as_ref()
    }
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("handle", &self.info.handle)
            .field("client", &self.info.client_address)
            .field("server", &self.info.server_address)
            .field("protocol", &self.info.protocol)
            .finish()
    }
}
