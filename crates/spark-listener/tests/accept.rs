//! 接受循环：并发尝试的身份还原、取消安全、契约破坏与引擎错误的传播。

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::future::join_all;
use spark_listener::{
    Cancellation, CertificateSource, ConnectionContext, ConnectionListener, EngineError,
    EngineErrorKind, HandleId, ListenerConfig, ListenerError, ListenerOptions, NegotiationInput,
    NegotiationResult, negotiator_fn,
    sim::{ConnectError, MemoryConnection, MemoryEngine, MemoryNetwork},
};

type Seen = Arc<Mutex<HashMap<HandleId, Arc<ConnectionContext<MemoryConnection>>>>>;

async fn started(
    network: &MemoryNetwork,
    config: ListenerConfig,
) -> anyhow::Result<(ConnectionListener<MemoryEngine>, SocketAddr)> {
    let options = ListenerOptions::new(
        config,
        NegotiationResult::new().with_certificate(CertificateSource::self_signed(["spark.test"])),
    );
    let listener = ConnectionListener::configure(
        network.engine(),
        options,
        "127.0.0.1:0".parse::<SocketAddr>()?,
    )?;
    let bound = listener.start().await?;
    Ok((listener, bound))
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_attempts_round_trip_their_contexts() -> anyhow::Result<()> {
    const ATTEMPTS: usize = 32;
    let network = MemoryNetwork::new();
    let seen: Seen = Arc::default();
    let recorder = Arc::clone(&seen);
    let negotiator = negotiator_fn(move |input: NegotiationInput<MemoryConnection>, _cancel| {
        recorder
            .lock()
            .expect("recorder lock")
            .insert(input.context().handle_id(), Arc::clone(input.context()));
        async move {
            tokio::task::yield_now().await;
            Ok(NegotiationResult::new().with_certificate(CertificateSource::self_signed(["spark.test"])))
        }
    });
    let listener = Arc::new(ConnectionListener::configure(
        network.engine(),
        ListenerOptions::new(ListenerConfig::new(["h3"]), negotiator),
        "127.0.0.1:0".parse::<SocketAddr>()?,
    )?);
    let bound = listener.start().await?;

    let acceptor = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move {
            let cancel = Cancellation::new();
            let mut accepted = Vec::with_capacity(ATTEMPTS);
            while accepted.len() < ATTEMPTS {
                match listener.accept(&cancel).await? {
                    Some(context) => accepted.push(context),
                    None => break,
                }
            }
            Ok::<_, ListenerError>(accepted)
        })
    };

    let clients: Vec<_> = (0..ATTEMPTS).map(|_| network.client()).collect();
    let connections = join_all(
        clients
            .iter()
            .map(|client| client.connect(bound, Some("spark.test"), ["h3"])),
    )
    .await
    .into_iter()
    .collect::<Result<Vec<_>, ConnectError>>()?;

    let accepted = tokio::time::timeout(Duration::from_secs(5), acceptor).await???;
    assert_eq!(accepted.len(), ATTEMPTS);

    let seen = seen.lock().expect("recorder lock");
    let mut handles = HashSet::new();
    for context in &accepted {
        let negotiated = seen.get(&context.handle_id()).expect("negotiated context");
        assert!(Arc::ptr_eq(negotiated, context));
        let connection = context.connection().expect("connection attached");
        assert_eq!(connection.handle_id(), context.handle_id());
        assert_eq!(connection.client_address(), context.remote_address());
        assert!(handles.insert(context.handle_id()));
    }
    let client_handles: HashSet<_> = connections.iter().map(MemoryConnection::handle_id).collect();
    assert_eq!(handles, client_handles);
    assert_eq!(listener.pending_connections(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_accept_leaves_the_entry_for_the_next_call() -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let (listener, bound) = started(&network, ListenerConfig::new(["h3"])).await?;
    let client = network.client().connect(bound, None, ["h3"]).await?;
    assert_eq!(listener.pending_connections(), 1);

    let cancelled = Cancellation::new();
    cancelled.cancel();
    assert!(matches!(
        listener.accept(&cancelled).await,
        Err(ListenerError::Cancelled)
    ));
    assert_eq!(listener.pending_connections(), 1);

    let context = listener
        .accept(&Cancellation::new())
        .await?
        .expect("connection still available");
    assert_eq!(context.handle_id(), client.handle_id());
    assert!(context.is_accepted());
    assert_eq!(listener.pending_connections(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unregistered_handle_is_an_invariant_violation() -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let (listener, _bound) = started(&network, ListenerConfig::new(["h3"])).await?;
    let injected = listener.engine().inject_unregistered()?;

    let err = listener
        .accept(&Cancellation::new())
        .await
        .expect_err("handle was never negotiated");
    assert!(err.is_invariant_violation());
    assert!(!err.is_retryable());
    assert!(matches!(err, ListenerError::MissingPendingContext { handle } if handle == injected));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_failures_propagate_and_abort_ends_the_stream() -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let (listener, bound) = started(&network, ListenerConfig::new(["h3"])).await?;

    let reset = EngineError::new(EngineErrorKind::Io, "socket reset").with_native_code(Some(104));
    listener.engine().inject_failure(reset.clone())?;
    let err = listener
        .accept(&Cancellation::new())
        .await
        .expect_err("engine failure");
    assert!(matches!(&err, ListenerError::Engine(inner) if *inner == reset));
    assert_eq!(err.code(), "spark.listener.engine_failed");

    // 错误不终止监听，宿主可继续接受。
    let client = network.client().connect(bound, None, ["h3"]).await?;
    let context = listener
        .accept(&Cancellation::new())
        .await?
        .expect("listener keeps working");
    assert_eq!(context.handle_id(), client.handle_id());

    listener.engine().inject_failure(EngineError::aborted("socket closed"))?;
    assert!(listener.accept(&Cancellation::new()).await?.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn full_backlog_refuses_attempts_until_accepted() -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let config = ListenerConfig::builder()
        .application_protocols(["h3"])
        .backlog(1)
        .build();
    let (listener, bound) = started(&network, config).await?;
    let client = network.client();

    let first = client.connect(bound, None, ["h3"]).await?;
    let overflow = client.connect(bound, None, ["h3"]).await;
    assert!(matches!(overflow, Err(ConnectError::BacklogFull)));

    let context = listener
        .accept(&Cancellation::new())
        .await?
        .expect("first connection");
    assert_eq!(context.handle_id(), first.handle_id());
    assert_eq!(listener.reap_pending(), 1);

    client.connect(bound, None, ["h3"]).await?;
    assert!(listener.accept(&Cancellation::new()).await?.is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_discards_pending_entries() -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let (listener, bound) = started(&network, ListenerConfig::new(["h3"])).await?;
    network.client().connect(bound, None, ["h3"]).await?;
    assert_eq!(listener.pending_connections(), 1);

    listener.stop();
    assert_eq!(listener.pending_connections(), 0);
    assert!(listener.accept(&Cancellation::new()).await?.is_none());

    let refused = network.client().connect(bound, None, ["h3"]).await;
    assert!(matches!(refused, Err(ConnectError::Refused { .. })));
    Ok(())
}
