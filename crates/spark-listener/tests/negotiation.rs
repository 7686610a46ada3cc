//! 协商回调：ALPN 继承、进程级状态、诊断告警与失败尝试的回收。

use std::{net::SocketAddr, sync::Arc};

use spark_listener::{
    ApplicationProtocol, Cancellation, CertificateMaterial, CertificateResolver,
    CertificateSource, ConnectionListener, ListenerConfig, ListenerError, ListenerOptions,
    NegotiationError, NegotiationInput, NegotiationResult, PendingRegistry, negotiator_fn,
    sim::{ConnectError, MemoryConnection, MemoryEngine, MemoryNetwork},
};
use tracing_test::traced_test;

fn self_signed() -> CertificateSource {
    CertificateSource::self_signed(["spark.test"])
}

async fn started(
    network: &MemoryNetwork,
    options: ListenerOptions<MemoryConnection>,
) -> anyhow::Result<(ConnectionListener<MemoryEngine>, SocketAddr)> {
    let listener = ConnectionListener::configure(
        network.engine(),
        options,
        "127.0.0.1:0".parse::<SocketAddr>()?,
    )?;
    let bound = listener.start().await?;
    Ok((listener, bound))
}

#[tokio::test(flavor = "multi_thread")]
async fn unset_protocol_list_inherits_listener_configuration() -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let config = ListenerConfig::new(["spark/1", "h3"]);
    let settings = config.transport_settings();
    let (listener, bound) = started(
        &network,
        ListenerOptions::new(config, NegotiationResult::new().with_certificate(self_signed())),
    )
    .await?;

    let client = network
        .client()
        .connect(bound, Some("spark.test"), ["h3"])
        .await?;
    assert_eq!(client.protocol(), &ApplicationProtocol::from("h3"));

    let context = listener
        .accept(&Cancellation::new())
        .await?
        .expect("connection accepted");
    assert_eq!(
        context.negotiated_protocols(),
        [ApplicationProtocol::from("spark/1"), ApplicationProtocol::from("h3")]
    );
    assert_eq!(context.settings(), &settings);
    let accepted = context.connection().expect("connection attached");
    assert_eq!(accepted.transport(), Some(&settings));
    assert_eq!(accepted.certificate_kind(), "self_signed");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_protocols_replace_the_listener_list() -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let negotiator = NegotiationResult::new()
        .with_application_protocols(["spark/2"])
        .with_certificate(self_signed());
    let (listener, bound) =
        started(&network, ListenerOptions::new(ListenerConfig::new(["h3"]), negotiator)).await?;

    let refused = network.client().connect(bound, None, ["h3"]).await;
    assert!(matches!(refused, Err(ConnectError::Handshake(_))));

    let client = network.client().connect(bound, None, ["h3", "spark/2"]).await?;
    assert_eq!(client.protocol(), &ApplicationProtocol::from("spark/2"));
    let context = listener
        .accept(&Cancellation::new())
        .await?
        .expect("connection accepted");
    assert_eq!(context.handle_id(), client.handle_id());
    Ok(())
}

struct TenantTable {
    premium: &'static str,
}

#[tokio::test(flavor = "multi_thread")]
async fn negotiator_reads_process_wide_state_and_hello() -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let negotiator = negotiator_fn(|input: NegotiationInput<MemoryConnection>, _cancel| async move {
        let Some(tenants) = input.state::<TenantTable>() else {
            return Err(NegotiationError::rejected("tenant table missing"));
        };
        let protocols = if input.hello().server_name() == Some(tenants.premium) {
            vec!["spark/2", "h3"]
        } else {
            vec!["h3"]
        };
        assert_eq!(input.context().remote_address(), input.hello().remote_address());
        Ok(NegotiationResult::new()
            .with_application_protocols(protocols)
            .with_certificate(CertificateSource::self_signed([tenants.premium])))
    });
    let options = ListenerOptions::new(ListenerConfig::new(["h3"]), negotiator)
        .with_negotiation_state(TenantTable {
            premium: "premium.spark.test",
        });
    let (listener, bound) = started(&network, options).await?;

    let premium = network
        .client()
        .connect(bound, Some("premium.spark.test"), ["spark/2", "h3"])
        .await?;
    assert_eq!(premium.protocol(), &ApplicationProtocol::from("spark/2"));
    let basic = network
        .client()
        .connect(bound, Some("basic.spark.test"), ["spark/2", "h3"])
        .await?;
    assert_eq!(basic.protocol(), &ApplicationProtocol::from("h3"));

    for expected in [&premium, &basic] {
        let context = listener
            .accept(&Cancellation::new())
            .await?
            .expect("connection accepted");
        assert_eq!(context.handle_id(), expected.handle_id());
        assert_eq!(context.remote_address(), expected.client_address());
    }
    Ok(())
}

struct SniResolver {
    material: Arc<CertificateMaterial>,
}

impl CertificateResolver for SniResolver {
    fn resolve(&self, server_name: Option<&str>) -> Option<Arc<CertificateMaterial>> {
        server_name
            .filter(|name| name.ends_with(".spark.test"))
            .map(|_| Arc::clone(&self.material))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn resolver_certificates_are_selected_per_connection() -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let resolver = SniResolver {
        material: Arc::new(CertificateMaterial::new(vec![vec![0x30, 0x82]], vec![0x30, 0x81])),
    };
    let negotiator = NegotiationResult::new().with_certificate(CertificateSource::from_resolver(resolver));
    let (listener, bound) =
        started(&network, ListenerOptions::new(ListenerConfig::new(["h3"]), negotiator)).await?;

    let unknown = network.client().connect(bound, Some("other.test"), ["h3"]).await;
    assert!(matches!(unknown, Err(ConnectError::Handshake(_))));

    let known = network
        .client()
        .connect(bound, Some("edge.spark.test"), ["h3"])
        .await?;
    assert_eq!(known.certificate_kind(), "resolver");
    assert_eq!(known.server_name(), Some("edge.spark.test"));
    let context = listener
        .accept(&Cancellation::new())
        .await?
        .expect("connection accepted");
    assert_eq!(context.handle_id(), known.handle_id());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn missing_certificate_and_protocols_only_log_diagnostics() -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let negotiator = NegotiationResult::new().with_application_protocols(Vec::<&str>::new());
    let (listener, bound) =
        started(&network, ListenerOptions::new(ListenerConfig::new(["h3"]), negotiator)).await?;

    // 协商本身成功，失败只发生在握手阶段。
    let outcome = network.client().connect(bound, Some("spark.test"), ["h3"]).await;
    assert!(matches!(outcome, Err(ConnectError::Handshake(_))));
    assert!(logs_contain("certificate not specified"));
    assert!(logs_contain("application protocols not specified"));

    assert_eq!(listener.pending_connections(), 1);
    assert_eq!(listener.reap_pending(), 1);
    assert_eq!(listener.pending_connections(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_negotiations_are_never_accepted_and_do_not_leak() -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let negotiator = negotiator_fn(|input: NegotiationInput<MemoryConnection>, _cancel| async move {
        if input.hello().server_name() == Some("blocked.test") {
            return Err(NegotiationError::rejected("tenant is blocked"));
        }
        Ok(NegotiationResult::new().with_certificate(self_signed()))
    });
    let (listener, bound) =
        started(&network, ListenerOptions::new(ListenerConfig::new(["h3"]), negotiator)).await?;

    let client = network.client();
    for _ in 0..1_000 {
        let outcome = client.connect(bound, Some("blocked.test"), ["h3"]).await;
        assert!(matches!(
            outcome,
            Err(ConnectError::Negotiation(NegotiationError::Rejected(_)))
        ));
    }
    let bound_on_growth = PendingRegistry::<MemoryConnection>::REAP_INTERVAL as usize;
    assert!(listener.pending_connections() < bound_on_growth);

    let allowed = client.connect(bound, Some("allowed.test"), ["h3"]).await?;
    let context = listener
        .accept(&Cancellation::new())
        .await?
        .expect("connection accepted");
    assert_eq!(context.handle_id(), allowed.handle_id());

    // 再无可接受的连接：取消信号先于任何连接到达。
    let cancel = Cancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();
    });
    assert!(matches!(
        listener.accept(&cancel).await,
        Err(ListenerError::Cancelled)
    ));
    Ok(())
}
