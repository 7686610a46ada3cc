//! 由协商结果构造逐连接的 quinn 服务端配置。
//!
//! # 教案式注释
//!
//! ## 意图（Why）
//! - 每次入站尝试的证书与 ALPN 由宿主协商决定，因此 TLS 配置不能在绑定时一次性确定；
//! - 传输参数（空闲超时、流上限）来自监听配置，随协商结果一起下发。
//!
//! ## 逻辑（How）
//! - 三种证书来源统一落到 rustls 的 `ResolvesServerCert`：静态证书与自签名证书预先转换为
//!   `CertifiedKey`，按 SNI 选择的来源在握手时调用宿主解析器；
//! - 未指定证书时安装一个永远返回 `None` 的解析器，握手由 rustls 报告失败；
//! - 只启用 TLS 1.3，并显式使用 ring 加密后端，避免依赖进程级默认 provider。

use std::{fmt, sync::Arc};

use quinn::{IdleTimeout, TransportConfig, VarInt, crypto::rustls::QuicServerConfig};
use rustls::{
    crypto::CryptoProvider,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use spark_listener::{
    CertificateMaterial, CertificateResolver, CertificateSource, ConnectionOptions, EngineError,
    TransportSettings,
};
use tracing::warn;

use crate::error::{TLS_CONFIG, config_error};

/// 绑定阶段安装的占位配置：真正的配置在每次尝试协商完成后经 `accept_with` 下发。
pub(crate) fn listening_config(
    provider: &Arc<CryptoProvider>,
    backlog: u32,
) -> Result<quinn::ServerConfig, EngineError> {
    let tls = tls_config(provider, Arc::new(NoCertificate), &[])?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(tls));
    config.max_incoming(usize::try_from(backlog).unwrap_or(usize::MAX).max(1));
    Ok(config)
}

/// 协商结果对应的服务端配置。
pub(crate) fn connection_config(
    provider: &Arc<CryptoProvider>,
    options: &ConnectionOptions,
) -> Result<quinn::ServerConfig, EngineError> {
    let resolver: Arc<dyn ResolvesServerCert> = match &options.certificate {
        None => Arc::new(NoCertificate),
        Some(CertificateSource::Static(material)) => {
            Arc::new(FixedCertificate(certified_key(provider, material)?))
        }
        Some(CertificateSource::Resolver(resolver)) => Arc::new(SniCertificate {
            resolver: Arc::clone(resolver),
            provider: Arc::clone(provider),
        }),
        Some(CertificateSource::SelfSigned { subject_alt_names }) => {
            let material = self_signed(subject_alt_names)?;
            Arc::new(FixedCertificate(certified_key(provider, &material)?))
        }
    };
    let protocols: Vec<Vec<u8>> = options
        .application_protocols
        .iter()
        .map(|protocol| protocol.as_bytes().to_vec())
        .collect();

    let tls = tls_config(provider, resolver, &protocols)?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(tls));
    config.transport_config(Arc::new(transport_config(&options.transport)?));
    Ok(config)
}

/// 生成一次性自签名证书。
pub fn self_signed(subject_alt_names: &[String]) -> Result<CertificateMaterial, EngineError> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(subject_alt_names.to_vec())
            .map_err(|err| config_error(TLS_CONFIG, err))?;
    Ok(CertificateMaterial::new(
        vec![cert.der().to_vec()],
        key_pair.serialize_der(),
    ))
}

fn tls_config(
    provider: &Arc<CryptoProvider>,
    resolver: Arc<dyn ResolvesServerCert>,
    protocols: &[Vec<u8>],
) -> Result<QuicServerConfig, EngineError> {
    let mut tls = rustls::ServerConfig::builder_with_provider(Arc::clone(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|err| config_error(TLS_CONFIG, err))?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    tls.alpn_protocols = protocols.to_vec();
    QuicServerConfig::try_from(tls).map_err(|err| config_error(TLS_CONFIG, err))
}

fn transport_config(settings: &TransportSettings) -> Result<TransportConfig, EngineError> {
    let idle_timeout = if settings.idle_timeout.is_zero() {
        None
    } else {
        Some(
            IdleTimeout::try_from(settings.idle_timeout)
                .map_err(|err| config_error(TLS_CONFIG, err))?,
        )
    };
    let mut transport = TransportConfig::default();
    transport
        .max_idle_timeout(idle_timeout)
        .max_concurrent_bidi_streams(VarInt::from_u32(settings.max_inbound_bidirectional_streams))
        .max_concurrent_uni_streams(VarInt::from_u32(settings.max_inbound_unidirectional_streams));
    Ok(transport)
}

fn certified_key(
    provider: &CryptoProvider,
    material: &CertificateMaterial,
) -> Result<Arc<CertifiedKey>, EngineError> {
    let chain: Vec<CertificateDer<'static>> = material
        .chain()
        .iter()
        .map(|der| CertificateDer::from(der.clone()))
        .collect();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        material.private_key_der().to_vec(),
    ));
    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|err| config_error(TLS_CONFIG, err))?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

#[derive(Debug)]
struct NoCertificate;

impl ResolvesServerCert for NoCertificate {
    fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        None
    }
}

#[derive(Debug)]
struct FixedCertificate(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertificate {
    fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

struct SniCertificate {
    resolver: Arc<dyn CertificateResolver>,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for SniCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniCertificate").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniCertificate {
    fn resolve(&self, hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = hello.server_name();
        let material = self.resolver.resolve(server_name)?;
        match certified_key(&self.provider, &material) {
            Ok(key) => Some(key),
            Err(failure) => {
                warn!(server_name, error = %failure, "resolved certificate is unusable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use spark_listener::ListenerConfig;

    use super::*;

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    #[test]
    fn self_signed_material_loads_into_rustls() {
        let material = self_signed(&["localhost".to_owned()]).expect("generate");
        assert_eq!(material.chain().len(), 1);
        certified_key(&provider(), &material).expect("pkcs8 key accepted");
    }

    #[test]
    fn garbage_key_is_a_configuration_error() {
        let material = CertificateMaterial::new(vec![vec![0x30]], vec![0x01, 0x02]);
        let err = certified_key(&provider(), &material).expect_err("invalid key");
        assert_eq!(err.kind(), spark_listener::EngineErrorKind::InvalidConfiguration);
    }

    #[test]
    fn zero_idle_timeout_disables_the_timer() {
        let mut settings = ListenerConfig::new(["h3"]).transport_settings();
        settings.idle_timeout = Duration::ZERO;
        transport_config(&settings).expect("zero disables idle timeout");

        settings.idle_timeout = Duration::from_secs(u64::MAX);
        assert!(transport_config(&settings).is_err());
    }

    #[test]
    fn every_certificate_source_builds_a_config() {
        let provider = provider();
        let material = Arc::new(self_signed(&["localhost".to_owned()]).expect("generate"));
        let fallback = Arc::clone(&material);
        let sources = [
            None,
            Some(CertificateSource::Static(material)),
            Some(CertificateSource::Resolver(Arc::new(
                move |_name: Option<&str>| -> Option<Arc<CertificateMaterial>> {
                    Some(Arc::clone(&fallback))
                },
            ))),
            Some(CertificateSource::self_signed(["localhost"])),
        ];
        for certificate in sources {
            let options = ConnectionOptions {
                application_protocols: vec!["h3".into()],
                certificate,
                transport: ListenerConfig::new(["h3"]).transport_settings(),
            };
            connection_config(&provider, &options).expect("config builds");
        }
    }
}
