use std::{
    fmt,
    net::{SocketAddr, UdpSocket},
    sync::{Arc, OnceLock},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use quinn::{Endpoint, EndpointConfig, Incoming, TokioRuntime, VarInt};
use rustls::crypto::CryptoProvider;
use spark_listener::{
    Attempt, BindConfig, Cancellation, ClientHello, CompletedConnection, EngineError,
    EngineErrorKind, HandleAllocator, NegotiationHook, TransportEngine,
};
use tokio::sync::{
    Mutex as AsyncMutex,
    mpsc::{self, error::TrySendError},
};
use tracing::{debug, warn};

use crate::{
    error::{BIND, HANDSHAKE, map_connection_error, map_io_error},
    tls,
};

type Delivery = Result<CompletedConnection<quinn::Connection>, EngineError>;

/// 基于 `quinn` 的传输引擎。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - quinn 的 `Endpoint::accept` 只交出 `Incoming`，证书与 ALPN 必须在 `accept_with` 时确定，
///   正好对应“握手前逐连接协商”的模型；
///
/// ## 逻辑（How）
/// - `bind` 以标准库 UDP 套接字绑定（保留 `EADDRINUSE` 原生错误码），再交给 quinn 托管；
/// - 驱动任务循环 `Endpoint::accept`，每个 `Incoming` 派生独立任务：
///   协商 → 构造 TLS 配置 → `accept_with` → 等待握手 → 投递到有界队列；
/// - 协商失败调用 `Incoming::refuse`，握手失败只记录日志，均不进入接受队列；
/// - 队列满时以 `default_close_error_code` 关闭新连接。
///
/// ## 契约（What）
/// - `accept_next` 基于 `mpsc::Receiver::recv`，取消安全；
/// - `close` 之后挂起与后续的 `accept_next` 返回 `Aborted`，并交出引擎持有的端点句柄，
///   驱动任务退出后 UDP 套接字随之释放；
/// - 与 `close` 竞争的 `bind` 要么被 `close` 看到并关闭，要么自行发现已关闭并返回 `Aborted`；
/// - 句柄在连接投递前由尝试任务持有，失败时随任务结束释放。
#[derive(Clone)]
pub struct QuinnEngine {
    inner: Arc<EngineState>,
}

struct EngineState {
    provider: Arc<CryptoProvider>,
    handles: Arc<HandleAllocator>,
    bound: OnceLock<Bound>,
    /// `close` 取走后端点句柄只剩驱动任务持有的那一份。
    endpoint: Mutex<Option<Endpoint>>,
    closed: Cancellation,
}

struct Bound {
    address: SocketAddr,
    receiver: AsyncMutex<mpsc::Receiver<Delivery>>,
}

/// 单个尝试任务所需的共享状态。
struct AttemptDriver {
    provider: Arc<CryptoProvider>,
    handles: Arc<HandleAllocator>,
    hook: Arc<dyn NegotiationHook>,
    sender: mpsc::Sender<Delivery>,
    closed: Cancellation,
    local_address: SocketAddr,
}

impl Default for QuinnEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl QuinnEngine {
    /// 使用 ring 加密后端。
    pub fn new() -> Self {
        Self::with_provider(Arc::new(rustls::crypto::ring::default_provider()))
    }

    pub fn with_provider(provider: Arc<CryptoProvider>) -> Self {
        Self {
            inner: Arc::new(EngineState {
                provider,
                handles: Arc::new(HandleAllocator::new()),
                bound: OnceLock::new(),
                endpoint: Mutex::new(None),
                closed: Cancellation::new(),
            }),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.bound.get().map(|bound| bound.address)
    }

    /// 底层 quinn 端点，便于宿主读取统计；关闭后为 `None`。
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.endpoint.lock().clone()
    }
}

impl fmt::Debug for QuinnEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuinnEngine")
            .field("bound", &self.local_addr())
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl TransportEngine for QuinnEngine {
    type Connection = quinn::Connection;

    fn name(&self) -> &'static str {
        "quinn"
    }

    async fn bind(
        &self,
        config: BindConfig,
        hook: Arc<dyn NegotiationHook>,
    ) -> Result<SocketAddr, EngineError> {
        let state = &self.inner;
        if state.closed.is_cancelled() {
            return Err(EngineError::aborted("quinn engine closed"));
        }
        if state.bound.get().is_some() {
            return Err(EngineError::new(
                EngineErrorKind::InvalidConfiguration,
                "quinn engine is already bound",
            ));
        }

        let socket = UdpSocket::bind(config.address()).map_err(|err| map_io_error(BIND, &err))?;
        let endpoint = Endpoint::new(
            EndpointConfig::default(),
            Some(tls::listening_config(&state.provider, config.backlog())?),
            socket,
            Arc::new(TokioRuntime),
        )
        .map_err(|err| map_io_error(BIND, &err))?;
        let address = endpoint
            .local_addr()
            .map_err(|err| map_io_error(BIND, &err))?;

        let capacity = usize::try_from(config.backlog()).unwrap_or(usize::MAX).max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        {
            // `close` 先取消再取锁，持锁检查即可保证端点不会在关闭后被存入。
            let mut slot = state.endpoint.lock();
            if state.closed.is_cancelled() {
                drop(slot);
                endpoint.close(VarInt::from_u32(0), b"listener closed");
                debug!(%address, "quinn engine closed while binding; releasing socket");
                return Err(EngineError::aborted("quinn engine closed"));
            }
            let bound = Bound {
                address,
                receiver: AsyncMutex::new(receiver),
            };
            if state.bound.set(bound).is_err() {
                drop(slot);
                endpoint.close(VarInt::from_u32(0), b"duplicate bind");
                return Err(EngineError::new(
                    EngineErrorKind::InvalidConfiguration,
                    "quinn engine is already bound",
                ));
            }
            *slot = Some(endpoint.clone());
        }

        let driver = Arc::new(AttemptDriver {
            provider: Arc::clone(&state.provider),
            handles: Arc::clone(&state.handles),
            hook,
            sender,
            closed: state.closed.clone(),
            local_address: address,
        });
        tokio::spawn(drive_endpoint(endpoint, driver));
        debug!(%address, "quinn endpoint bound");
        Ok(address)
    }

    async fn accept_next(&self) -> Result<CompletedConnection<quinn::Connection>, EngineError> {
        let closed = &self.inner.closed;
        if closed.is_cancelled() {
            return Err(EngineError::aborted("quinn engine closed"));
        }
        let bound = self.inner.bound.get().ok_or_else(|| {
            EngineError::new(EngineErrorKind::Other, "quinn engine is not bound")
        })?;

        let mut receiver = tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(EngineError::aborted("quinn engine closed")),
            receiver = bound.receiver.lock() => receiver,
        };
        tokio::select! {
            biased;
            _ = closed.cancelled() => Err(EngineError::aborted("quinn engine closed")),
            delivery = receiver.recv() => {
                delivery.unwrap_or_else(|| Err(EngineError::aborted("quinn endpoint stopped")))
            }
        }
    }

    fn close(&self) {
        self.inner.closed.cancel();
        let Some(endpoint) = self.inner.endpoint.lock().take() else {
            return;
        };
        endpoint.close(VarInt::from_u32(0), b"listener closed");
        debug!(address = ?self.local_addr(), "quinn endpoint closed");
    }
}

impl Drop for EngineState {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn drive_endpoint(endpoint: Endpoint, driver: Arc<AttemptDriver>) {
    loop {
        let incoming = tokio::select! {
            biased;
            _ = driver.closed.cancelled() => break,
            incoming = endpoint.accept() => incoming,
        };
        let Some(incoming) = incoming else {
            break;
        };
        tokio::spawn(drive_attempt(incoming, Arc::clone(&driver)));
    }
    debug!(address = %driver.local_address, "quinn accept driver finished");
}

async fn drive_attempt(incoming: Incoming, driver: Arc<AttemptDriver>) {
    let handle = driver.handles.allocate();
    let remote = incoming.remote_address();
    let hello = ClientHello::new(remote).with_local_address(driver.local_address);

    let options = match driver
        .hook
        .negotiate(Attempt::new(handle.clone(), hello), driver.closed.child())
        .await
    {
        Ok(options) => options,
        Err(failure) => {
            debug!(handle = %handle.id(), %remote, error = %failure, "refusing attempt");
            incoming.refuse();
            return;
        }
    };

    let config = match tls::connection_config(&driver.provider, &options) {
        Ok(config) => config,
        Err(failure) => {
            warn!(handle = %handle.id(), %remote, error = %failure, "cannot build tls config");
            incoming.refuse();
            return;
        }
    };
    let connecting = match incoming.accept_with(Arc::new(config)) {
        Ok(connecting) => connecting,
        Err(failure) => {
            let failure = map_connection_error(HANDSHAKE, failure);
            debug!(handle = %handle.id(), %remote, error = %failure, code = HANDSHAKE.code, "attempt dropped");
            return;
        }
    };
    let connection = tokio::select! {
        biased;
        _ = driver.closed.cancelled() => return,
        outcome = connecting => match outcome {
            Ok(connection) => connection,
            Err(failure) => {
                let failure = map_connection_error(HANDSHAKE, failure);
                debug!(handle = %handle.id(), %remote, error = %failure, code = HANDSHAKE.code, "handshake failed");
                return;
            }
        },
    };

    let delivery = Ok(CompletedConnection::new(handle, connection));
    let (rejected, reason) = match driver.sender.try_send(delivery) {
        Ok(()) => return,
        Err(TrySendError::Full(rejected)) => (rejected, "accept backlog full"),
        Err(TrySendError::Closed(rejected)) => (rejected, "listener closed"),
    };
    if let Ok(completed) = rejected {
        let code = VarInt::from_u64(options.transport.default_close_error_code)
            .unwrap_or(VarInt::MAX);
        completed.connection.close(code, reason.as_bytes());
        warn!(handle = %completed.handle.id(), %remote, reason, "completed connection dropped");
    }
}
