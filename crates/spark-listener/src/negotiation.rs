//! 逐连接协商：用户协商函数的契约，以及核心交给引擎的协商钩子实现。
//!
//! # 教案式注释
//!
//! ## 意图（Why）
//! - 引擎在握手完成前需要知道“这一次尝试用哪张证书、宣告哪些 ALPN”，而这些决策属于宿主；
//! - 宿主希望在协商阶段就拿到稳定的 [`ConnectionContext`]，以便挂载日志字段或业务状态。
//!
//! ## 逻辑（How）
//! 1. 为尝试创建上下文，并在任何可能失败的步骤之前登记到 [`PendingRegistry`]；
//! 2. 调用宿主的 [`Negotiator`]，同时监听尝试级取消信号与可选的协商超时；
//! 3. 结果未指定 ALPN 时继承监听配置；缺证书或 ALPN 为空时仅告警；
//! 4. 把结果与监听配置中的传输参数合并为 [`ConnectionOptions`] 交还引擎。
//!
//! ## 风险与注意（Trade-offs）
//! - 协商失败时不主动删除注册表条目：句柄可能永远不会再出现，条目依靠弱租约被动回收。

use std::{any::Any, fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::{
    cancel::Cancellation,
    config::{ApplicationProtocol, ListenerConfig},
    context::{ConnectionContext, TransportSettings},
    engine::{Attempt, ClientHello, NegotiationHook},
    error::NegotiationError,
    registry::PendingRegistry,
};

/// DER 编码的证书链与 PKCS#8 私钥。
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    chain: Vec<Vec<u8>>,
    private_key: Vec<u8>,
}

impl CertificateMaterial {
    /// `chain` 以叶子证书开头。
    pub fn new(chain: Vec<Vec<u8>>, private_key_pkcs8: Vec<u8>) -> Self {
        Self {
            chain,
            private_key: private_key_pkcs8,
        }
    }

    pub fn chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key
    }
}

impl fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("chain_len", &self.chain.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// 按 SNI 为单个连接挑选证书。
///
/// 在握手过程中同步调用，实现不应阻塞；返回 `None` 会使该次握手失败。
pub trait CertificateResolver: Send + Sync + 'static {
    fn resolve(&self, server_name: Option<&str>) -> Option<Arc<CertificateMaterial>>;
}

impl<F> CertificateResolver for F
where
    F: Fn(Option<&str>) -> Option<Arc<CertificateMaterial>> + Send + Sync + 'static,
{
    fn resolve(&self, server_name: Option<&str>) -> Option<Arc<CertificateMaterial>> {
        self(server_name)
    }
}

/// 单次连接的证书来源。
#[derive(Clone)]
pub enum CertificateSource {
    /// 预先加载的证书。
    Static(Arc<CertificateMaterial>),
    /// 握手时按 SNI 选择。
    Resolver(Arc<dyn CertificateResolver>),
    /// 由引擎现场生成一次性自签名证书。
    SelfSigned { subject_alt_names: Vec<String> },
}

impl CertificateSource {
    pub fn from_material(material: CertificateMaterial) -> Self {
        Self::Static(Arc::new(material))
    }

    pub fn from_resolver(resolver: impl CertificateResolver) -> Self {
        Self::Resolver(Arc::new(resolver))
    }

    pub fn self_signed<I, S>(subject_alt_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::SelfSigned {
            subject_alt_names: subject_alt_names.into_iter().map(Into::into).collect(),
        }
    }

    /// 来源种类，用于日志字段。
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Static(_) => "static",
            Self::Resolver(_) => "resolver",
            Self::SelfSigned { .. } => "self_signed",
        }
    }
}

impl fmt::Debug for CertificateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(material) => f.debug_tuple("Static").field(material).finish(),
            Self::Resolver(_) => f.write_str("Resolver(..)"),
            Self::SelfSigned { subject_alt_names } => f
                .debug_struct("SelfSigned")
                .field("subject_alt_names", subject_alt_names)
                .finish(),
        }
    }
}

/// 宿主协商函数的返回值。
///
/// 未设置的 ALPN 列表会继承监听配置；证书缺失只会产生告警。
#[derive(Clone, Debug, Default)]
pub struct NegotiationResult {
    application_protocols: Option<Vec<ApplicationProtocol>>,
    certificate: Option<CertificateSource>,
}

impl NegotiationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_application_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ApplicationProtocol>,
    {
        self.application_protocols = Some(protocols.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_certificate(mut self, certificate: CertificateSource) -> Self {
        self.certificate = Some(certificate);
        self
    }

    pub fn application_protocols(&self) -> Option<&[ApplicationProtocol]> {
        self.application_protocols.as_deref()
    }

    pub fn certificate(&self) -> Option<&CertificateSource> {
        self.certificate.as_ref()
    }
}

/// 协商钩子交还引擎的连接选项。
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// 已解析的 ALPN 列表，按服务端偏好排序。
    pub application_protocols: Vec<ApplicationProtocol>,
    pub certificate: Option<CertificateSource>,
    pub transport: TransportSettings,
}

/// 传给宿主协商函数的只读快照。
pub struct NegotiationInput<C> {
    hello: ClientHello,
    context: Arc<ConnectionContext<C>>,
    state: Option<Arc<dyn Any + Send + Sync>>,
}

impl<C> NegotiationInput<C> {
    pub fn new(
        hello: ClientHello,
        context: Arc<ConnectionContext<C>>,
        state: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            hello,
            context,
            state,
        }
    }

    pub fn hello(&self) -> &ClientHello {
        &self.hello
    }

    /// 本次尝试的上下文；`accept` 最终返回的是同一个 `Arc`。
    pub fn context(&self) -> &Arc<ConnectionContext<C>> {
        &self.context
    }

    /// 按类型取回进程级协商状态。
    pub fn state<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.state.as_deref()?.downcast_ref::<T>()
    }
}

impl<C> fmt::Debug for NegotiationInput<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationInput")
            .field("hello", &self.hello)
            .field("context", &self.context)
            .field("has_state", &self.state.is_some())
            .finish()
    }
}

/// 宿主提供的逐连接协商函数。
///
/// 可能与其他尝试、与 `accept` 并发执行；`cancel` 在尝试被放弃或协商超时时触发。
#[async_trait]
pub trait Negotiator<C>: Send + Sync + 'static {
    async fn negotiate(
        &self,
        input: NegotiationInput<C>,
        cancel: Cancellation,
    ) -> Result<NegotiationResult, NegotiationError>;
}

/// 固定结果：每次尝试都返回同一份协商结果。
#[async_trait]
impl<C: Send + Sync + 'static> Negotiator<C> for NegotiationResult {
    async fn negotiate(
        &self,
        _input: NegotiationInput<C>,
        _cancel: Cancellation,
    ) -> Result<NegotiationResult, NegotiationError> {
        Ok(self.clone())
    }
}

/// 把异步闭包适配为 [`Negotiator`]。
pub struct FnNegotiator<F> {
    f: F,
}

/// 以闭包构造协商函数。
///
/// ```ignore
/// let negotiator = negotiator_fn(|input: NegotiationInput<Conn>, _cancel| async move {
///     Ok(NegotiationResult::new().with_certificate(lookup(input.hello().server_name()).await?))
/// });
/// ```
pub fn negotiator_fn<C, F, Fut>(f: F) -> FnNegotiator<F>
where
    F: Fn(NegotiationInput<C>, Cancellation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<NegotiationResult, NegotiationError>> + Send + 'static,
{
    FnNegotiator { f }
}

#[async_trait]
impl<C, F, Fut> Negotiator<C> for FnNegotiator<F>
where
    C: Send + Sync + 'static,
    F: Fn(NegotiationInput<C>, Cancellation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<NegotiationResult, NegotiationError>> + Send + 'static,
{
    async fn negotiate(
        &self,
        input: NegotiationInput<C>,
        cancel: Cancellation,
    ) -> Result<NegotiationResult, NegotiationError> {
        (self.f)(input, cancel).await
    }
}

impl<F> fmt::Debug for FnNegotiator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnNegotiator").finish_non_exhaustive()
    }
}

/// 核心实现的协商钩子，由监听器在 `start` 时交给引擎。
pub(crate) struct NegotiationCallback<C> {
    negotiator: Arc<dyn Negotiator<C>>,
    registry: Arc<PendingRegistry<C>>,
    config: Arc<ListenerConfig>,
    state: Option<Arc<dyn Any + Send + Sync>>,
}

impl<C: Send + Sync + 'static> NegotiationCallback<C> {
    pub(crate) fn new(
        negotiator: Arc<dyn Negotiator<C>>,
        registry: Arc<PendingRegistry<C>>,
        config: Arc<ListenerConfig>,
        state: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            negotiator,
            registry,
            config,
            state,
        }
    }

    async fn run_negotiator(
        &self,
        input: NegotiationInput<C>,
        cancel: &Cancellation,
    ) -> Result<NegotiationResult, NegotiationError> {
        let negotiation = async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(NegotiationError::Cancelled),
                result = self.negotiator.negotiate(input, cancel.clone()) => result,
            }
        };
        match self.config.negotiation_timeout() {
            Some(limit) => match tokio::time::timeout(limit, negotiation).await {
                Ok(result) => result,
                Err(_) => {
                    cancel.cancel();
                    Err(NegotiationError::TimedOut(limit))
                }
            },
            None => negotiation.await,
        }
    }

    fn resolve_options(
        &self,
        context: &ConnectionContext<C>,
        result: NegotiationResult,
    ) -> ConnectionOptions {
        let NegotiationResult {
            application_protocols,
            certificate,
        } = result;
        let application_protocols =
            application_protocols.unwrap_or_else(|| self.config.application_protocols().to_vec());

        if certificate.is_none() {
            warn!(
                handle = %context.handle_id(),
                remote = %context.remote_address(),
                "certificate not specified; the handshake will fail"
            );
        }
        if application_protocols.is_empty() {
            warn!(
                handle = %context.handle_id(),
                remote = %context.remote_address(),
                "application protocols not specified; the handshake will fail"
            );
        }

        context.record_negotiated(application_protocols.clone());
        ConnectionOptions {
            application_protocols,
            certificate,
            transport: *context.settings(),
        }
    }
}

#[async_trait]
impl<C: Send + Sync + 'static> NegotiationHook for NegotiationCallback<C> {
    async fn negotiate(
        &self,
        attempt: Attempt,
        cancel: Cancellation,
    ) -> Result<ConnectionOptions, NegotiationError> {
        let (handle, hello) = attempt.into_parts();
        let context = Arc::new(ConnectionContext::new(
            handle.id(),
            hello.remote_address(),
            self.config.transport_settings(),
        ));

        if let Err(violation) = self.registry.register(&handle, Arc::clone(&context)) {
            error!(
                handle = %handle.id(),
                code = violation.code(),
                "pending registry refused the attempt"
            );
            return Err(NegotiationError::Registry(violation));
        }

        let input = NegotiationInput::new(hello, Arc::clone(&context), self.state.clone());
        let attempt_cancel = cancel.child();
        match self.run_negotiator(input, &attempt_cancel).await {
            Ok(result) => Ok(self.resolve_options(&context, result)),
            Err(failure) => {
                debug!(
                    handle = %handle.id(),
                    remote = %context.remote_address(),
                    error = %failure,
                    "negotiation failed"
                );
                Err(failure)
            }
        }
    }
}
