#![deny(unsafe_code)]
#![doc = r#"
# spark-listener-quinn

## 设计动机（Why）
- 为 `spark-listener` 提供基于 `quinn` 的生产引擎：真实 UDP 套接字、真实 TLS 1.3 握手；
- 证书与 ALPN 在每次入站尝试协商完成后才下发，对应 quinn 的 `Incoming::accept_with`。

## 核心契约（What）
- [`QuinnEngine`]：实现 `TransportEngine`，连接类型为 `quinn::Connection`；
- [`self_signed`]：生成一次性自签名证书材料，便于测试与开发环境。

## 实现策略（How）
- `error` 模块集中把 `io::Error`、`quinn::ConnectionError`、rustls 配置错误翻译为 `EngineError`；
- `tls` 模块把 `CertificateSource` 落到 rustls 的证书解析器，并把监听配置的传输参数写入
  `quinn::TransportConfig`。

## 风险与注意（Trade-offs）
- quinn 在握手前不暴露 SNI，协商阶段的 `ClientHello` 只携带地址信息；按 SNI 选证书需使用
  解析器来源，在 TLS 握手内部完成；
- 默认使用 ring 加密后端，可通过 [`QuinnEngine::with_provider`] 替换。
"#]

mod engine;
mod error;
mod tls;

pub use engine::QuinnEngine;
pub use tls::self_signed;
