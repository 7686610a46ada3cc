//! quinn 引擎回环测试：真实 UDP 绑定、逐连接 TLS 配置与协商拒绝。

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::anyhow;
use quinn::crypto::rustls::{HandshakeData, QuicClientConfig};
use rustls::RootCertStore;
use rustls_pki_types::CertificateDer;
use spark_listener::{
    Cancellation, CertificateMaterial, CertificateSource, ConnectionListener, ListenerConfig,
    ListenerError, ListenerOptions, NegotiationError, NegotiationInput, NegotiationResult,
    negotiator_fn,
};
use spark_listener_quinn::{QuinnEngine, self_signed};

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn client_endpoint(
    material: &CertificateMaterial,
    protocols: &[&str],
) -> anyhow::Result<quinn::Endpoint> {
    let mut roots = RootCertStore::empty();
    for der in material.chain() {
        roots.add(CertificateDer::from(der.clone()))?;
    }
    let mut tls = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])?
    .with_root_certificates(roots)
    .with_no_client_auth();
    tls.alpn_protocols = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
    let quic = QuicClientConfig::try_from(tls).map_err(|err| anyhow!(err))?;

    let mut endpoint = quinn::Endpoint::client(loopback())?;
    endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(quic)));
    Ok(endpoint)
}

#[tokio::test(flavor = "multi_thread")]
async fn ephemeral_bind_and_address_in_use() -> anyhow::Result<()> {
    let material = self_signed(&["localhost".to_owned()])?;
    let options = || {
        ListenerOptions::new(
            ListenerConfig::new(["h3"]),
            NegotiationResult::new()
                .with_certificate(CertificateSource::from_material(material.clone())),
        )
    };

    let first = ConnectionListener::configure(QuinnEngine::new(), options(), loopback())?;
    let bound = first.start().await?;
    assert_ne!(bound.port(), 0);
    assert_eq!(first.engine().local_addr(), Some(bound));

    let second = ConnectionListener::configure(QuinnEngine::new(), options(), bound)?;
    let err = second.start().await.expect_err("port already taken");
    match err {
        ListenerError::AddressInUse { address, source } => {
            assert_eq!(address, bound);
            assert!(source.native_code().is_some());
        }
        other => panic!("unexpected error: {other}"),
    }

    first.stop();
    assert!(first.accept(&Cancellation::new()).await?.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn negotiated_certificate_and_alpn_reach_the_client() -> anyhow::Result<()> {
    let material = self_signed(&["localhost".to_owned()])?;
    let negotiator = NegotiationResult::new()
        .with_application_protocols(["spark/2", "h3"])
        .with_certificate(CertificateSource::from_material(material.clone()));
    let listener = ConnectionListener::configure(
        QuinnEngine::new(),
        ListenerOptions::new(ListenerConfig::new(["h3"]), negotiator),
        loopback(),
    )?;
    let bound = listener.start().await?;

    let client = client_endpoint(&material, &["h3"])?;
    let client_addr = client.local_addr()?;
    let connection = client.connect(bound, "localhost")?.await?;

    let context = tokio::time::timeout(Duration::from_secs(5), listener.accept(&Cancellation::new()))
        .await??
        .expect("connection accepted");
    let accepted = context.connection().expect("connection attached");
    assert_eq!(accepted.remote_address(), client_addr);
    assert_eq!(context.remote_address(), client_addr);

    let handshake = connection
        .handshake_data()
        .and_then(|data| data.downcast::<HandshakeData>().ok())
        .expect("rustls handshake data");
    assert_eq!(handshake.protocol.as_deref(), Some(b"h3".as_slice()));
    assert_eq!(listener.pending_connections(), 0);

    connection.close(0u32.into(), b"done");
    listener.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_negotiation_refuses_the_client() -> anyhow::Result<()> {
    let material = self_signed(&["localhost".to_owned()])?;
    let negotiator = negotiator_fn(|_input: NegotiationInput<quinn::Connection>, _cancel| async {
        Err::<NegotiationResult, _>(NegotiationError::rejected("maintenance"))
    });
    let listener = ConnectionListener::configure(
        QuinnEngine::new(),
        ListenerOptions::new(ListenerConfig::new(["h3"]), negotiator),
        loopback(),
    )?;
    let bound = listener.start().await?;

    let client = client_endpoint(&material, &["h3"])?;
    let outcome = tokio::time::timeout(Duration::from_secs(5), client.connect(bound, "localhost")?)
        .await?;
    assert!(outcome.is_err());

    let cancel = Cancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    assert!(matches!(
        listener.accept(&cancel).await,
        Err(ListenerError::Cancelled)
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_ends_a_blocked_accept() -> anyhow::Result<()> {
    let listener = Arc::new(ConnectionListener::configure(
        QuinnEngine::new(),
        ListenerOptions::new(
            ListenerConfig::new(["h3"]),
            NegotiationResult::new().with_certificate(CertificateSource::self_signed(["localhost"])),
        ),
        loopback(),
    )?);
    listener.start().await?;

    let blocked = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.accept(&Cancellation::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    listener.stop();

    let outcome = tokio::time::timeout(Duration::from_secs(5), blocked).await??;
    assert!(outcome?.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_listener_releases_its_port() -> anyhow::Result<()> {
    let options = || {
        ListenerOptions::new(
            ListenerConfig::new(["h3"]),
            NegotiationResult::new().with_certificate(CertificateSource::self_signed(["localhost"])),
        )
    };
    let first = ConnectionListener::configure(QuinnEngine::new(), options(), loopback())?;
    let bound = first.start().await?;
    first.stop();
    assert!(first.engine().endpoint().is_none());

    // quinn 的端点驱动在后台任务中退出，套接字的释放是异步的。
    let second = ConnectionListener::configure(QuinnEngine::new(), options(), bound)?;
    let mut attempts = 0;
    let rebound = loop {
        match second.start().await {
            Ok(address) => break address,
            Err(ListenerError::AddressInUse { .. }) if attempts < 100 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(other) => return Err(other.into()),
        }
    };
    assert_eq!(rebound, bound);
    assert!(second.is_listening());

    // 第一个监听器仍然存活，端口却已可复用。
    assert!(first.accept(&Cancellation::new()).await?.is_none());
    Ok(())
}
