use std::{
    fmt,
    net::{SocketAddr, ToSocketAddrs as _},
    path::PathBuf,
    str::FromStr,
};

use thiserror::Error;

use crate::error::ListenerError;

/// 监听端点。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 宿主配置里出现的端点形态不止 `ip:port` 一种（主机名、Unix 套接字路径），
///   统一建模后由绑定器在 `configure` 时判定哪些可被当前传输绑定；
///
/// ## 契约（What）
/// - 仅 [`Endpoint::Ip`] 可被 UDP 类传输绑定，其余形态在配置阶段被拒绝；
/// - 端口 `0` 代表临时端口，`start` 成功后监听器会把端点改写为实际绑定地址。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Endpoint {
    /// IP 地址与端口。
    Ip(SocketAddr),
    /// 尚未解析的主机名与端口。
    Dns { host: String, port: u16 },
    /// Unix 域套接字路径。
    Unix(PathBuf),
}

impl Endpoint {
    /// 端点是否为可直接绑定的地址。
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Ip(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Ip(addr) => Some(addr.port()),
            Self::Dns { port, .. } => Some(*port),
            Self::Unix(_) => None,
        }
    }

    /// 是否请求由系统分配临时端口。
    pub fn is_ephemeral(&self) -> bool {
        self.port() == Some(0)
    }

    /// 绑定器的端点校验：只接受 IP 地址与端口。
    pub(crate) fn bindable(&self) -> Result<SocketAddr, ListenerError> {
        self.socket_addr()
            .ok_or_else(|| ListenerError::InvalidEndpointType {
                endpoint: self.to_string(),
            })
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Dns { host, port } => write!(f, "{host}:{port}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// 端点文本无法解析。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("cannot parse endpoint `{0}`")]
pub struct EndpointParseError(String);

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    /// 解析 `ip:port`、`[v6]:port`、`host:port` 与 `unix:/path` 四种写法，不做 DNS 查询。
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if let Some(path) = text.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(EndpointParseError(text.to_owned()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Ok(addr) = text.parse::<SocketAddr>() {
            return Ok(Self::Ip(addr));
        }
        let (host, port) = text
            .rsplit_once(':')
            .ok_or_else(|| EndpointParseError(text.to_owned()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointParseError(text.to_owned()))?;
        if host.is_empty() || host.contains(':') {
            return Err(EndpointParseError(text.to_owned()));
        }
        Ok(Self::Dns {
            host: host.to_owned(),
            port,
        })
    }
}

impl Endpoint {
    /// 把主机名端点解析为第一个 IP 地址；其余形态原样返回。
    ///
    /// 会触发阻塞式 DNS 查询，宿主应在进入异步运行时之前调用。
    pub fn resolve(self) -> Result<Self, ListenerError> {
        match self {
            Self::Dns { ref host, port } => (host.as_str(), port)
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
                .map(Self::Ip)
                .ok_or_else(|| ListenerError::InvalidEndpointType {
                    endpoint: self.to_string(),
                }),
            other => Ok(other),
        }
    }
}
