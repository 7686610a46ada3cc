#![deny(unsafe_code)]
#![doc = r#"
# spark-listener

## 设计动机（Why）
- **身份桥接**：底层传输引擎在握手完成前只认识不透明的原生句柄，而宿主需要在协商阶段就拿到
  高层的 [`ConnectionContext`]。本 crate 负责在两者之间建立短暂且可回收的关联。
- **逐连接协商**：允许宿主在握手完成前为每一次入站尝试选择证书、ALPN 列表等安全选项，
  而传输层参数（空闲超时、流上限、默认错误码）统一来自监听配置。
- **引擎中立**：核心逻辑只依赖 [`TransportEngine`] 契约；`spark-listener-quinn` 提供生产实现，
  [`sim`] 模块提供内存实现供宿主测试。

## 核心契约（What）
- [`ConnectionListener::configure`]：校验引擎可用性、端点类型与 ALPN 列表；
- [`ConnectionListener::start`]：绑定并把临时端口回写为实际端口；
- [`ConnectionListener::accept`]：取出引擎完成的连接，经 [`PendingRegistry`] 还原上下文；
- [`ConnectionListener::stop`]：幂等关闭，阻塞中的 `accept` 以 `Ok(None)` 结束。

## 实现策略（How）
- 挂起注册表基于 `DashMap`，条目只持有句柄的弱租约，句柄失效即可被周期性回收；
- 监听状态机 `Unbound → Listening → Closed` 由 `parking_lot::Mutex` 保护，不跨越 `.await`；
- 引擎以 [`EngineError`] 报告失败，绑定与接受两个边界各做一次集中翻译。

## 风险与注意（Trade-offs）
- 回收是“被动 + 周期性”的：失败尝试的条目最多滞留一个回收周期；
- 协商结果缺少证书或 ALPN 时仅记录告警，由引擎在握手阶段给出失败。
"#]

pub mod cancel;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod listener;
pub mod negotiation;
pub mod registry;
pub mod sim;

pub use cancel::Cancellation;
pub use config::{ApplicationProtocol, ListenerConfig, ListenerConfigBuilder, ListenerOptions};
pub use context::{ConnectionContext, TransportSettings};
pub use endpoint::Endpoint;
pub use engine::{
    Attempt, BindConfig, ClientHello, CompletedConnection, HandleAllocator, HandleId,
    NativeHandle, NegotiationHook, TransportEngine, WeakHandle,
};
pub use error::{ConfigError, EngineError, EngineErrorKind, ListenerError, NegotiationError};
pub use listener::{ConnectionListener, ListenerState};
pub use negotiation::{
    CertificateMaterial, CertificateResolver, CertificateSource, ConnectionOptions, FnNegotiator,
    NegotiationInput, NegotiationResult, Negotiator, negotiator_fn,
};
pub use registry::PendingRegistry;
