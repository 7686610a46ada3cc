//! 监听器：端点绑定、生命周期状态机与接受循环。
//!
//! # 教案式注释
//!
//! ## 意图（Why）
//! - 把“配置校验 → 绑定 → 循环接受 → 关闭”收敛到一个对象上，宿主只需持有 [`ConnectionListener`]；
//! - 关闭必须能与阻塞中的 `accept` 安全竞争，且对调用方表现为流结束而非错误。
//!
//! ## 逻辑（How）
//! - 生命周期 `Unbound → Binding → Listening → Closed` 由 `parking_lot::Mutex` 保护，锁从不跨越 `.await`；
//! - `stop` 通过 [`TransportEngine::close`] 唤醒阻塞的 `accept_next`，
//!   引擎报告的 `Aborted` 在接受边界被翻译为 `Ok(None)`，不引入第二个关闭标志；
//! - `accept` 以 `biased` 的 `select!` 优先响应调用方取消，被取消时不消耗任何注册表条目。
//!
//! ## 契约（What）
//! - `configure` 只做同步校验，不触碰网络；
//! - `start` 成功后配置只读，协商回调并发读取无需加锁；
//! - `stop` 幂等，`Drop` 时自动调用。

use std::{any::Any, fmt, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::{
    cancel::Cancellation,
    config::{ListenerConfig, ListenerOptions},
    context::ConnectionContext,
    endpoint::Endpoint,
    engine::{BindConfig, CompletedConnection, NegotiationHook, TransportEngine},
    error::{ListenerError, translate_accept, translate_bind},
    negotiation::{NegotiationCallback, Negotiator},
    registry::PendingRegistry,
};

/// 监听器生命周期阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerState {
    /// 已配置，尚未绑定。
    Unbound,
    /// `start` 正在等待引擎完成绑定。
    Binding,
    Listening,
    /// 终态。
    Closed,
}

struct Lifecycle {
    state: ListenerState,
    endpoint: SocketAddr,
}

/// 多路复用传输的连接监听器。
pub struct ConnectionListener<E: TransportEngine> {
    engine: E,
    config: Arc<ListenerConfig>,
    negotiator: Arc<dyn Negotiator<E::Connection>>,
    negotiation_state: Option<Arc<dyn Any + Send + Sync>>,
    registry: Arc<PendingRegistry<E::Connection>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<E: TransportEngine> ConnectionListener<E> {
    /// 校验引擎可用性、端点类型与 ALPN 列表，构造处于 `Unbound` 的监听器。
    ///
    /// # 错误
    /// - [`ListenerError::UnsupportedPlatform`]：引擎在当前平台不可用；
    /// - [`ListenerError::InvalidEndpointType`]：端点不是 IP 地址与端口；
    /// - [`ListenerError::NoProtocolsConfigured`]：ALPN 列表为空。
    pub fn configure(
        engine: E,
        options: ListenerOptions<E::Connection>,
        endpoint: impl Into<Endpoint>,
    ) -> Result<Self, ListenerError> {
        if !engine.is_supported() {
            return Err(ListenerError::UnsupportedPlatform {
                engine: engine.name(),
            });
        }
        let endpoint = endpoint.into().bindable()?;
        let (config, negotiator, negotiation_state) = options.into_parts();
        if config.application_protocols().is_empty() {
            return Err(ListenerError::NoProtocolsConfigured);
        }

        Ok(Self {
            engine,
            config: Arc::new(config),
            negotiator,
            negotiation_state,
            registry: Arc::new(PendingRegistry::new()),
            lifecycle: Mutex::new(Lifecycle {
                state: ListenerState::Unbound,
                endpoint,
            }),
        })
    }

    /// 绑定并开始监听，返回实际绑定地址（临时端口已被解析）。
    ///
    /// 绑定失败后监听器回到 `Unbound`，宿主可以 [`set_endpoint`](Self::set_endpoint) 换地址重试。
    pub async fn start(&self) -> Result<SocketAddr, ListenerError> {
        let address = {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                ListenerState::Unbound => {}
                ListenerState::Binding | ListenerState::Listening => {
                    return Err(ListenerError::AlreadyStarted);
                }
                ListenerState::Closed => return Err(ListenerError::ListenerClosed),
            }
            lifecycle.state = ListenerState::Binding;
            lifecycle.endpoint
        };
        let guard = BindingGuard {
            lifecycle: &self.lifecycle,
            armed: true,
        };

        info!(engine = self.engine.name(), %address, "listener starting");
        let hook: Arc<dyn NegotiationHook> = Arc::new(NegotiationCallback::new(
            Arc::clone(&self.negotiator),
            Arc::clone(&self.registry),
            Arc::clone(&self.config),
            self.negotiation_state.clone(),
        ));
        let bind = BindConfig::new(
            address,
            self.config.backlog(),
            self.config.application_protocols().to_vec(),
        );
        let outcome = self.engine.bind(bind, hook).await;
        guard.disarm();

        let mut lifecycle = self.lifecycle.lock();
        match outcome {
            Ok(bound) if lifecycle.state == ListenerState::Closed => {
                drop(lifecycle);
                debug!(%bound, "listener stopped while binding; releasing socket");
                // 引擎的 `close` 幂等：若 `stop` 已把绑定结果交还，这里是空操作。
                self.engine.close();
                Err(ListenerError::ListenerClosed)
            }
            Ok(bound) => {
                lifecycle.state = ListenerState::Listening;
                lifecycle.endpoint = bound;
                drop(lifecycle);
                info!(engine = self.engine.name(), address = %bound, "listener started");
                Ok(bound)
            }
            Err(failure) if lifecycle.state == ListenerState::Closed => {
                drop(lifecycle);
                debug!(%address, error = %failure, "listener stopped while binding");
                Err(ListenerError::ListenerClosed)
            }
            Err(failure) => {
                if lifecycle.state == ListenerState::Binding {
                    lifecycle.state = ListenerState::Unbound;
                }
                Err(translate_bind(address, failure))
            }
        }
    }

    /// 等待下一条完成协商与握手的连接。
    ///
    /// - `Ok(Some(ctx))`：与协商阶段交给回调的是同一个上下文；
    /// - `Ok(None)`：监听器已关闭（优雅关闭），不再有新连接；
    /// - `Err(Cancelled)`：`cancel` 先于连接到达，注册表未被消耗。
    pub async fn accept(
        &self,
        cancel: &Cancellation,
    ) -> Result<Option<Arc<ConnectionContext<E::Connection>>>, ListenerError> {
        match self.lifecycle.lock().state {
            ListenerState::Unbound | ListenerState::Binding => {
                return Err(ListenerError::ListenerNotInitialized);
            }
            ListenerState::Closed => return Ok(None),
            ListenerState::Listening => {}
        }

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ListenerError::Cancelled),
            next = self.engine.accept_next() => next,
        };

        let CompletedConnection { handle, connection } = match next {
            Ok(completed) => completed,
            Err(failure) => {
                return match translate_accept(failure) {
                    None => {
                        info!(engine = self.engine.name(), "listener aborted");
                        Ok(None)
                    }
                    Some(failure) => Err(failure),
                };
            }
        };

        let handle = handle.id();
        let Some(context) = self.registry.resolve(handle) else {
            error!(%handle, "missing pending context for completed connection");
            return Err(ListenerError::MissingPendingContext { handle });
        };
        // 注册表按句柄取出即删除，只有引擎交付了已被接受的上下文才会走到这里。
        if context.attach(connection).is_err() {
            error!(%handle, "connection delivered twice");
            return Err(ListenerError::DuplicateAcceptance { handle });
        }

        debug!(
            %handle,
            remote = %context.remote_address(),
            protocols = ?context.negotiated_protocols(),
            "connection accepted"
        );
        Ok(Some(context))
    }

    /// 关闭监听器；重复调用为空操作。
    ///
    /// 阻塞中的 `accept` 会以 `Ok(None)` 返回，尚未被接受的挂起条目全部丢弃。
    pub fn stop(&self) {
        let previous = {
            let mut lifecycle = self.lifecycle.lock();
            std::mem::replace(&mut lifecycle.state, ListenerState::Closed)
        };
        if previous == ListenerState::Closed {
            return;
        }

        self.engine.close();
        let dropped = self.registry.len();
        self.registry.clear();
        info!(
            engine = self.engine.name(),
            pending = dropped,
            "listener stopped"
        );
    }

    /// 当前端点：`start` 之前为配置值，之后为实际绑定地址。
    pub fn local_endpoint(&self) -> Endpoint {
        Endpoint::Ip(self.lifecycle.lock().endpoint)
    }

    /// 正在监听时的实际绑定地址。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let lifecycle = self.lifecycle.lock();
        (lifecycle.state == ListenerState::Listening).then_some(lifecycle.endpoint)
    }

    /// 仅在 `Unbound` 阶段可改写端点。
    pub fn set_endpoint(&self, endpoint: impl Into<Endpoint>) -> Result<(), ListenerError> {
        let address = endpoint.into().bindable()?;
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            ListenerState::Unbound => {
                lifecycle.endpoint = address;
                Ok(())
            }
            ListenerState::Closed => Err(ListenerError::ListenerClosed),
            ListenerState::Binding | ListenerState::Listening => Err(ListenerError::EndpointLocked),
        }
    }

    pub fn state(&self) -> ListenerState {
        self.lifecycle.lock().state
    }

    pub fn is_listening(&self) -> bool {
        self.state() == ListenerState::Listening
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// 已登记但尚未被接受的尝试数（含待回收的过期条目）。
    pub fn pending_connections(&self) -> usize {
        self.registry.len()
    }

    /// 立即回收租约已失效的挂起条目。
    pub fn reap_pending(&self) -> usize {
        self.registry.reap_expired()
    }
}

impl<E: TransportEngine> Drop for ConnectionListener<E> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<E: TransportEngine> fmt::Debug for ConnectionListener<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = self.lifecycle.lock();
        f.debug_struct("ConnectionListener")
            .field("engine", &self.engine.name())
            .field("state", &lifecycle.state)
            .field("endpoint", &lifecycle.endpoint)
            .field("config", &self.config)
            .field("pending", &self.registry.len())
            .finish()
    }
}

/// `start` 的 Future 在绑定途中被丢弃时，把 `Binding` 退回 `Unbound`。
struct BindingGuard<'a> {
    lifecycle: &'a Mutex<Lifecycle>,
    armed: bool,
}

impl BindingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for BindingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == ListenerState::Binding {
            lifecycle.state = ListenerState::Unbound;
        }
    }
}
