//! Integration Tests
//!
//! Cross-module scenarios: the computed graph, RPC compute calls over an
//! in-process link, and flow workers.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use ripple_core::computed::{capture, ComputeContext, ComputedInput, ComputedOptions, Engine, MutableState};
use ripple_core::flow::{FlowHost, FlowId, FlowOptions, FlowRegistry, FlowType, Flows, InMemoryFlowStore, Transition};
use ripple_core::rpc::{
    CallStage, ConnectionKind, PeerOptions, PeerRef, PeerState, RemoteComputeClient, RpcPeer, RpcServer,
    SerializationFormat, ServiceRegistry, TestConnector,
};
use ripple_core::{Error, Outcome, Result};

const WAIT: Duration = Duration::from_secs(5);

fn value<T>(outcome: Outcome<T>) -> Result<T> {
    match outcome {
        Outcome::Ok(value) => Ok(value),
        Outcome::Err(error) => Err(error),
        Outcome::Cancelled => Err(Error::Internal("cancelled".to_string())),
    }
}

// ============================================================================
// Computed graph
// ============================================================================

async fn read_b(engine: &Engine, d: &MutableState<i64>, ctx: &ComputeContext, cancel: &CancellationToken) -> Result<i64> {
    let outcome = engine
        .call(ComputedInput::unit("b"), ctx, cancel, |ctx| {
            let d = d.clone();
            async move { Ok(d.get(&ctx)? + 1) }
        })
        .await;
    value(outcome)
}

async fn read_c(engine: &Engine, d: &MutableState<i64>, ctx: &ComputeContext, cancel: &CancellationToken) -> Result<i64> {
    let outcome = engine
        .call(ComputedInput::unit("c"), ctx, cancel, |ctx| {
            let d = d.clone();
            async move { Ok(d.get(&ctx)? * 10) }
        })
        .await;
    value(outcome)
}

async fn read_a(engine: &Engine, d: &MutableState<i64>, ctx: &ComputeContext, cancel: &CancellationToken) -> Result<i64> {
    let outcome = engine
        .call(ComputedInput::unit("a"), ctx, cancel, |ctx| async move {
            let b = read_b(engine, d, &ctx, cancel).await?;
            let c = read_c(engine, d, &ctx, cancel).await?;
            Ok(b + c)
        })
        .await;
    value(outcome)
}

#[tokio::test]
async fn diamond_invalidation_reaches_every_dependant_once() {
    let engine = Engine::new(ComputedOptions::no_reprocessing());
    let d = engine.state(1i64);
    let cancel = CancellationToken::new();
    let (e, s, c) = (&engine, &d, &cancel);

    let a = capture::<i64, _, _>(|ctx| async move { read_a(e, s, &ctx, c).await })
        .await
        .unwrap();
    let b = capture::<i64, _, _>(|ctx| async move { read_b(e, s, &ctx, c).await })
        .await
        .unwrap();
    let c_node = capture::<i64, _, _>(|ctx| async move { read_c(e, s, &ctx, c).await })
        .await
        .unwrap();
    assert_eq!(a.output().unwrap(), 12);

    let fired = Arc::new(AtomicUsize::new(0));
    for handle in [a.handle(), b.handle(), c_node.handle()] {
        let fired = fired.clone();
        handle.on_invalidated(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }

    d.set(2);
    assert!(!a.is_consistent());
    assert!(!b.is_consistent());
    assert!(!c_node.is_consistent());
    assert_eq!(fired.load(Ordering::SeqCst), 3);

    // Invalidating again changes nothing.
    a.invalidate();
    d.set(3);
    assert_eq!(fired.load(Ordering::SeqCst), 3);

    assert_eq!(read_a(&engine, &d, &ComputeContext::new(), &cancel).await.unwrap(), 34);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_readers_share_one_computation() {
    let engine = Engine::new(ComputedOptions::no_reprocessing());
    let runs = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();

    let readers = (0..16).map(|_| {
        let engine = engine.clone();
        let runs = runs.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            engine
                .call(ComputedInput::unit("slow"), &ComputeContext::new(), &cancel, |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7u32)
                    }
                })
                .await
        })
    });
    for outcome in join_all(readers).await {
        assert_eq!(outcome.unwrap().ok(), Some(7));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalidating_a_leaf_reaches_its_reader() {
    let engine = Engine::new(ComputedOptions::no_reprocessing());
    let raw = Arc::new(AtomicI64::new(5));
    let cancel = CancellationToken::new();
    let input_b = ComputedInput::unit("B");

    let get_b = |ctx: ComputeContext| {
        let raw = raw.clone();
        let engine = engine.clone();
        let cancel = cancel.clone();
        let input_b = input_b.clone();
        async move {
            value(
                engine
                    .call(input_b, &ctx, &cancel, |_| {
                        let raw = raw.clone();
                        async move { Ok(raw.load(Ordering::SeqCst)) }
                    })
                    .await,
            )
        }
    };
    let get_a = || {
        capture::<i64, _, _>(|ctx| {
            let engine = engine.clone();
            let cancel = cancel.clone();
            async move {
                engine
                    .call(ComputedInput::unit("A"), &ctx, &cancel, |ctx| get_b(ctx))
                    .await
            }
        })
    };

    let a = get_a().await.unwrap();
    assert_eq!(a.output().unwrap(), 5);
    let b = engine.get_existing::<i64>(&input_b).unwrap();

    raw.store(7, Ordering::SeqCst);
    engine.invalidate(&input_b);
    assert!(!a.is_consistent());
    assert!(!b.is_consistent());

    let a2 = get_a().await.unwrap();
    assert_eq!(a2.output().unwrap(), 7);
    assert!(a2.is_consistent());
    assert_ne!(a2.version(), a.version());
    let b2 = engine.get_existing::<i64>(&input_b).unwrap();
    assert!(b2.is_consistent());
    assert_ne!(b2.version(), b.version());
}

// ============================================================================
// RPC compute calls
// ============================================================================

struct Backend {
    server: RpcServer,
    counter: MutableState<i64>,
}

fn backend(host: &str, start: i64) -> Backend {
    let engine = Engine::default();
    let counter = engine.state(start);
    let services = ServiceRegistry::builder()
        .compute("counter", "get", {
            let engine = engine.clone();
            let counter = counter.clone();
            move |_: (), cancel: CancellationToken| {
                let engine = engine.clone();
                let counter = counter.clone();
                async move {
                    engine
                        .get_or_produce(ComputedInput::unit("counter.get"), &ComputeContext::new(), &cancel, |ctx| {
                            let counter = counter.clone();
                            async move { counter.get(&ctx) }
                        })
                        .await
                }
            }
        })
        .build();
    Backend {
        server: RpcServer::new(host, services, PeerOptions::default()),
        counter,
    }
}

fn client_peer(connector: Arc<TestConnector>) -> RpcPeer {
    let options = PeerOptions {
        reconnect_delays: ripple_core::retry::RetryDelaySeq::fixed(Duration::from_millis(20)),
        ..PeerOptions::default()
    };
    RpcPeer::client(PeerRef::remote("backend"), connector, ServiceRegistry::empty(), options)
}

async fn wait_for_state(peer: &RpcPeer, predicate: impl Fn(&PeerState) -> bool) {
    let mut states = peer.subscribe();
    timeout(WAIT, states.wait_for(|state| predicate(state)))
        .await
        .expect("peer state change timed out")
        .expect("peer state channel closed");
}

#[tokio::test]
async fn compute_call_survives_disconnect_and_dies_on_reconnect() {
    let a = backend("a", 1);
    let connector = TestConnector::new(vec![a.server.clone()]);
    let peer = client_peer(connector.clone());
    let cancel = CancellationToken::new();

    let call = peer
        .call_compute::<_, i64>("counter", "get", &(), &cancel)
        .await
        .ok()
        .unwrap();
    assert_eq!(call.result().unwrap(), 1);
    assert_eq!(call.stage(), CallStage::ResultReceived);

    connector.disconnect();
    wait_for_state(&peer, |state| !state.is_connected()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!call.is_invalidated());

    connector.connect();
    timeout(WAIT, call.when_invalidated()).await.unwrap();
    assert!(call.is_invalidated());
    // The value survives invalidation; only its freshness is gone.
    assert_eq!(call.result().unwrap(), 1);

    peer.stop().await;
    a.server.stop().await;
}

#[tokio::test]
async fn compute_call_is_invalidated_by_the_server() {
    let a = backend("a", 1);
    let connector = TestConnector::new(vec![a.server.clone()]);
    let peer = client_peer(connector.clone());
    let cancel = CancellationToken::new();

    let call = peer
        .call_compute::<_, i64>("counter", "get", &(), &cancel)
        .await
        .ok()
        .unwrap();
    a.counter.set(2);
    timeout(WAIT, call.when_invalidated()).await.unwrap();

    let fresh = peer
        .call_compute::<_, i64>("counter", "get", &(), &cancel)
        .await
        .ok()
        .unwrap();
    assert_eq!(fresh.result().unwrap(), 2);
    assert!(!fresh.is_invalidated());

    peer.stop().await;
    assert!(fresh.is_invalidated());
    a.server.stop().await;
}

#[tokio::test]
async fn host_switch_invalidates_and_reroutes() {
    let a = backend("a", 1);
    let b = backend("b", 100);
    let connector = TestConnector::new(vec![a.server.clone(), b.server.clone()]);
    let peer = client_peer(connector.clone());
    let cancel = CancellationToken::new();

    let call = peer
        .call_compute::<_, i64>("counter", "get", &(), &cancel)
        .await
        .ok()
        .unwrap();
    assert_eq!(call.result().unwrap(), 1);

    connector.switch_host(1);
    timeout(WAIT, call.when_invalidated()).await.unwrap();

    let rerouted = peer
        .call_compute::<_, i64>("counter", "get", &(), &cancel)
        .await
        .ok()
        .unwrap();
    assert_eq!(rerouted.result().unwrap(), 100);

    peer.stop().await;
    a.server.stop().await;
    b.server.stop().await;
}

#[tokio::test]
async fn remote_invalidation_reaches_local_dependants() {
    let a = backend("a", 3);
    let connector = TestConnector::new(vec![a.server.clone()]);
    let peer = client_peer(connector.clone());
    let client = RemoteComputeClient::new(peer.clone(), Engine::new(ComputedOptions::no_reprocessing()));
    let cancel = CancellationToken::new();

    let doubled = || {
        let client = client.clone();
        let cancel = cancel.clone();
        capture::<i64, _, _>(move |ctx| async move {
            client
                .engine()
                .call(ComputedInput::unit("doubled"), &ctx, &cancel, |ctx| {
                    let client = client.clone();
                    let cancel = cancel.clone();
                    async move {
                        let remote = client.call::<_, i64>(&ctx, "counter", "get", &(), &cancel).await;
                        Ok(value(remote)? * 2)
                    }
                })
                .await
        })
    };

    let first = doubled().await.unwrap();
    assert_eq!(first.output().unwrap(), 6);

    a.counter.set(4);
    timeout(WAIT, first.when_invalidated()).await.unwrap();

    let second = doubled().await.unwrap();
    assert_eq!(second.output().unwrap(), 8);

    peer.stop().await;
    a.server.stop().await;
}

#[test]
fn peer_refs_round_trip_through_text() {
    let kinds = [ConnectionKind::Remote, ConnectionKind::Local, ConnectionKind::Loopback, ConnectionKind::None];
    let formats = [SerializationFormat::MsgPack, SerializationFormat::Json];
    for kind in kinds {
        for backend in [false, true] {
            for server in [false, true] {
                for format in formats {
                    let peer_ref = PeerRef {
                        kind,
                        is_backend: backend,
                        is_server: server,
                        format,
                        host: "host-1:8080/rpc?x=1".to_string(),
                    };
                    let parsed: PeerRef = peer_ref.to_string().parse().unwrap();
                    assert_eq!(parsed, peer_ref);
                }
            }
        }
    }
    assert!("remote.msgpack:host".parse::<PeerRef>().is_err());
}

// ============================================================================
// Flows
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Counter {
    value: i64,
    seen: Vec<u32>,
}

struct Inc(u32);
struct Fail;

fn counter_host() -> FlowHost {
    let counter = FlowType::<Counter>::new("counter")
        .start(|flow, _| async move { Ok((flow, Transition::to("Count"))) })
        .on_any("Count", |mut flow, event, _| async move {
            let Some(event) = event else {
                return Ok((flow, Transition::stay()));
            };
            if let Some(inc) = event.downcast_ref::<Inc>() {
                flow.value += 1;
                flow.seen.push(inc.0);
                return Ok((flow, Transition::stay()));
            }
            if event.is::<Fail>() {
                flow.value += 1000;
                return Err(Error::message("fail"));
            }
            Ok((flow, Transition::stay()))
        });
    let registry = FlowRegistry::builder().add(counter).build();
    FlowHost::new(
        Flows::new(registry, Arc::new(InMemoryFlowStore::new())),
        FlowOptions::default(),
    )
}

async fn counter_state(host: &FlowHost, id: &FlowId) -> (i64, Counter) {
    let snapshot = host
        .get::<Counter>(&ComputeContext::new(), id, &CancellationToken::new())
        .await
        .ok()
        .flatten()
        .unwrap();
    (snapshot.version, snapshot.state)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flow_events_apply_in_queue_order() {
    let host = counter_host();
    let id = FlowId::new("counter", "ordered");
    let cancel = CancellationToken::new();
    let base = host.notify(&id, Inc(0), &cancel).await.ok().unwrap();

    let senders = (1..=40u32).map(|n| {
        let host = host.clone();
        let id = id.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { (n, host.notify(&id, Inc(n), &cancel).await.ok().unwrap()) })
    });
    let mut applied: Vec<(u32, i64)> = join_all(senders)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();
    applied.sort_by_key(|(_, version)| *version);

    let (version, state) = counter_state(&host, &id).await;
    assert_eq!(version, base + 40);
    assert_eq!(state.value, 41);
    // Each event's version is its position in the flow's history.
    for (n, version) in applied {
        let position = (version - base) as usize;
        assert_eq!(state.seen[position], n);
    }
    host.stop().await;
}

#[tokio::test]
async fn failed_event_rolls_back_and_the_worker_continues() {
    let host = counter_host();
    let id = FlowId::new("counter", "scenario");
    let cancel = CancellationToken::new();

    host.notify(&id, Inc(1), &cancel).await.ok().unwrap();
    let before = host.notify(&id, Inc(2), &cancel).await.ok().unwrap();

    let failed = host.notify(&id, Fail, &cancel).await;
    assert!(matches!(failed.err(), Some(Error::Business(ref error)) if error.to_string() == "fail"));
    let (version, state) = counter_state(&host, &id).await;
    assert_eq!(version, before);
    assert_eq!(state.value, 2);

    let after = host.notify(&id, Inc(3), &cancel).await.ok().unwrap();
    assert_eq!(after, before + 1);
    let (_, state) = counter_state(&host, &id).await;
    assert_eq!(state.value, 3);
    assert_eq!(state.seen, vec![1, 2, 3]);
    host.stop().await;
}
