//! 监听配置：ALPN 列表、积压队列、传输参数与协商超时。
//!
//! # 教案式注释
//!
//! ## 意图（Why）
//! - `start` 之后配置只读，协商回调可以并发读取而无需额外加锁；
//! - 宿主既可以用 [`ListenerConfig::builder`] 编程式构造，也可以从 TOML 片段反序列化。
//!
//! ## 契约（What）
//! - 时长字段在 TOML 中以毫秒表示（`idle_timeout_ms`、`negotiation_timeout_ms`）；
//! - ALPN 列表非空由 [`ConnectionListener::configure`](crate::ConnectionListener::configure)
//!   校验，配置对象本身允许暂时为空，方便分层覆盖。

use std::{any::Any, fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{context::TransportSettings, error::ConfigError, negotiation::Negotiator};

/// ALPN 协议标识。
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ApplicationProtocol(Vec<u8>);

impl ApplicationProtocol {
    pub fn new(id: impl Into<Vec<u8>>) -> Self {
        Self(id.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for ApplicationProtocol {
    fn from(id: &str) -> Self {
        Self(id.as_bytes().to_vec())
    }
}

impl From<String> for ApplicationProtocol {
    fn from(id: String) -> Self {
        Self(id.into_bytes())
    }
}

impl From<&[u8]> for ApplicationProtocol {
    fn from(id: &[u8]) -> Self {
        Self(id.to_vec())
    }
}

impl From<ApplicationProtocol> for String {
    fn from(protocol: ApplicationProtocol) -> Self {
        String::from_utf8_lossy(&protocol.0).into_owned()
    }
}

impl fmt::Display for ApplicationProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for ApplicationProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApplicationProtocol({self})")
    }
}

const DEFAULT_BACKLOG: u32 = 512;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_BIDI_STREAMS: u32 = 100;
const DEFAULT_MAX_UNI_STREAMS: u32 = 10;
const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// 监听器的不可变配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenerConfig {
    application_protocols: Vec<ApplicationProtocol>,
    backlog: u32,
    #[serde(rename = "idle_timeout_ms", with = "millis")]
    idle_timeout: Duration,
    max_inbound_bidirectional_streams: u32,
    max_inbound_unidirectional_streams: u32,
    default_close_error_code: u64,
    default_stream_error_code: u64,
    #[serde(rename = "negotiation_timeout_ms", with = "optional_millis")]
    negotiation_timeout: Option<Duration>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            application_protocols: Vec::new(),
            backlog: DEFAULT_BACKLOG,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_inbound_bidirectional_streams: DEFAULT_MAX_BIDI_STREAMS,
            max_inbound_unidirectional_streams: DEFAULT_MAX_UNI_STREAMS,
            default_close_error_code: 0,
            default_stream_error_code: 0,
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
        }
    }
}

impl ListenerConfig {
    /// 以 ALPN 列表与默认参数构造配置。
    pub fn new<I, P>(protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ApplicationProtocol>,
    {
        Self::builder().application_protocols(protocols).build()
    }

    pub fn builder() -> ListenerConfigBuilder {
        ListenerConfigBuilder::default()
    }

    /// 从 TOML 片段解析配置，缺省字段使用默认值。
    ///
    /// ```toml
    /// application_protocols = ["h3"]
    /// backlog = 1024
    /// idle_timeout_ms = 60000
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn application_protocols(&self) -> &[ApplicationProtocol] {
        &self.application_protocols
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn max_inbound_bidirectional_streams(&self) -> u32 {
        self.max_inbound_bidirectional_streams
    }

    pub fn max_inbound_unidirectional_streams(&self) -> u32 {
        self.max_inbound_unidirectional_streams
    }

    pub fn default_close_error_code(&self) -> u64 {
        self.default_close_error_code
    }

    pub fn default_stream_error_code(&self) -> u64 {
        self.default_stream_error_code
    }

    /// 单次协商允许的最长耗时，`None` 表示不设上限。
    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout
    }

    /// 每个连接继承的传输参数快照。
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            idle_timeout: self.idle_timeout,
            max_inbound_bidirectional_streams: self.max_inbound_bidirectional_streams,
            max_inbound_unidirectional_streams: self.max_inbound_unidirectional_streams,
            default_close_error_code: self.default_close_error_code,
            default_stream_error_code: self.default_stream_error_code,
        }
    }
}

/// [`ListenerConfig`] 的建造器。
#[derive(Clone, Debug, Default)]
pub struct ListenerConfigBuilder {
    config: ListenerConfig,
}

impl ListenerConfigBuilder {
    pub fn application_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ApplicationProtocol>,
    {
        self.config.application_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.config.backlog = backlog;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn max_inbound_bidirectional_streams(mut self, limit: u32) -> Self {
        self.config.max_inbound_bidirectional_streams = limit;
        self
    }

    pub fn max_inbound_unidirectional_streams(mut self, limit: u32) -> Self {
        self.config.max_inbound_unidirectional_streams = limit;
        self
    }

    pub fn default_close_error_code(mut self, code: u64) -> Self {
        self.config.default_close_error_code = code;
        self
    }

    pub fn default_stream_error_code(mut self, code: u64) -> Self {
        self.config.default_stream_error_code = code;
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.negotiation_timeout = timeout;
        self
    }

    pub fn build(self) -> ListenerConfig {
        self.config
    }
}

/// 宿主交给 [`ConnectionListener::configure`](crate::ConnectionListener::configure) 的完整选项。
///
/// # 契约（What）
/// - `negotiator`：每次入站尝试都会调用的协商函数；
/// - `negotiation_state`：进程级共享状态，原样透传给每一次协商，
///   回调内可通过 [`NegotiationInput::state`](crate::NegotiationInput::state) 按类型取回。
pub struct ListenerOptions<C> {
    config: ListenerConfig,
    negotiator: Arc<dyn Negotiator<C>>,
    negotiation_state: Option<Arc<dyn Any + Send + Sync>>,
}

impl<C: Send + Sync + 'static> ListenerOptions<C> {
    pub fn new(config: ListenerConfig, negotiator: impl Negotiator<C>) -> Self {
        Self {
            config,
            negotiator: Arc::new(negotiator),
            negotiation_state: None,
        }
    }

    pub fn with_negotiation_state(mut self, state: impl Any + Send + Sync) -> Self {
        self.negotiation_state = Some(Arc::new(state));
        self
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        ListenerConfig,
        Arc<dyn Negotiator<C>>,
        Option<Arc<dyn Any + Send + Sync>>,
    ) {
        (self.config, self.negotiator, self.negotiation_state)
    }
}

impl<C> fmt::Debug for ListenerOptions<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerOptions")
            .field("config", &self.config)
            .field("has_negotiation_state", &self.negotiation_state.is_some())
            .finish_non_exhaustive()
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                serializer.serialize_some(&u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            }
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
