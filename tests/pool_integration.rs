//! Integration tests for the connection pool and observer bus.
//!
//! These exercise the pool through the public client facade against the
//! in-process transport: exactly-once dialing under contention, create/close
//! lifecycle, and event fan-out.

use std::sync::Arc;
use std::time::Duration;

use rpcpool::pool::ConnectionEvent;
use rpcpool::transport::mem::MemTransport;
use rpcpool::transport::ChannelHealth;
use rpcpool::{Endpoint, RpcClient, RpcConfig};

fn client_with(transport: &MemTransport) -> RpcClient {
    init_logs();
    RpcClient::new(RpcConfig::default(), Arc::new(transport.clone()))
}

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_concurrent_creates_share_one_dial() {
    // 8 concurrent callers, a 50ms dial: exactly one dial attempt, all 8
    // calls report not-ready immediately, and exactly one ready event follows.
    let transport = MemTransport::new();
    transport.set_dial_delay(Duration::from_millis(50));
    let client = client_with(&transport);
    let ep = Endpoint::new("db1", 8831);
    let mut events = client.subscribe();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        let ep = ep.clone();
        handles.push(tokio::spawn(async move {
            client.check_connection_or_create(&ep)
        }));
    }
    for handle in handles {
        assert!(!handle.await.unwrap(), "pre-dial readiness must be false");
    }

    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Ready(ep.clone()));
    assert_eq!(transport.dial_count(&ep), 1);

    // No duplicate ready event shows up afterwards.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(events.try_recv().is_err());
    assert!(client.check_connection(&ep));
}

#[tokio::test]
async fn test_check_without_create_leaves_no_trace() {
    let transport = MemTransport::new();
    let client = client_with(&transport);
    let ep = Endpoint::new("db1", 8831);

    assert!(!client.check_connection(&ep));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(transport.dial_count(&ep), 0);
    assert!(!client.check_connection(&ep));
}

#[tokio::test]
async fn test_double_close_emits_single_shutdown() {
    let transport = MemTransport::new();
    let client = client_with(&transport);
    let ep = Endpoint::new("db1", 8831);
    let mut events = client.subscribe();

    client.check_connection_or_create(&ep);
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Ready(ep.clone()));

    client.close_connection(&ep);
    client.close_connection(&ep);

    assert_eq!(
        events.recv().await.unwrap(),
        ConnectionEvent::Shutdown(ep.clone())
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_reconnect_after_close_dials_again() {
    let transport = MemTransport::new();
    let client = client_with(&transport);
    let ep = Endpoint::new("db1", 8831);
    let mut events = client.subscribe();

    client.check_connection_or_create(&ep);
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Ready(ep.clone()));
    client.close_connection(&ep);
    assert_eq!(
        events.recv().await.unwrap(),
        ConnectionEvent::Shutdown(ep.clone())
    );

    client.check_connection_or_create(&ep);
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Ready(ep.clone()));
    assert_eq!(transport.dial_count(&ep), 2);
}

#[tokio::test]
async fn test_flap_sequence_reaches_every_subscriber() {
    let transport = MemTransport::new();
    let client = client_with(&transport);
    let ep = Endpoint::new("db1", 8831);
    let mut first = client.subscribe();
    let mut second = client.subscribe();

    client.check_connection_or_create(&ep);
    for events in [&mut first, &mut second] {
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Ready(ep.clone()));
    }

    transport.set_health(&ep, ChannelHealth::TransientFailure);
    transport.set_health(&ep, ChannelHealth::Ready);

    // Flapping is forwarded, not filtered, in occurrence order.
    for events in [&mut first, &mut second] {
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Failure(ep.clone())
        );
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Ready(ep.clone()));
    }
}

#[tokio::test]
async fn test_shutdown_is_final_event_under_churn() {
    // Health flaps racing a close must never surface an event after the
    // shutdown event: a transition and its publication are one step.
    let transport = MemTransport::new();
    let client = client_with(&transport);

    for i in 0..20 {
        let ep = Endpoint::new(format!("db{}", i), 8831);
        let mut events = client.subscribe();
        client.check_connection_or_create(&ep);
        loop {
            if events.recv().await.unwrap() == ConnectionEvent::Ready(ep.clone()) {
                break;
            }
        }

        let flapper = {
            let transport = transport.clone();
            let ep = ep.clone();
            tokio::spawn(async move {
                transport.set_health(&ep, ChannelHealth::TransientFailure);
                transport.set_health(&ep, ChannelHealth::Ready);
            })
        };
        let closer = {
            let client = client.clone();
            let ep = ep.clone();
            tokio::spawn(async move { client.close_connection(&ep) })
        };
        flapper.await.unwrap();
        closer.await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut closed = false;
        while let Ok(event) = events.try_recv() {
            if event.endpoint() != &ep {
                continue;
            }
            assert!(!closed, "event after shutdown: {:?}", event);
            if matches!(event, ConnectionEvent::Shutdown(_)) {
                closed = true;
            }
        }
        assert!(closed, "missing shutdown event for {}", ep);
    }
}

#[tokio::test]
async fn test_late_subscriber_sees_no_history() {
    let transport = MemTransport::new();
    let client = client_with(&transport);
    let ep = Endpoint::new("db1", 8831);
    let mut early = client.subscribe();

    client.check_connection_or_create(&ep);
    assert_eq!(early.recv().await.unwrap(), ConnectionEvent::Ready(ep.clone()));

    let mut late = client.subscribe();
    client.close_connection(&ep);
    assert_eq!(
        late.recv().await.unwrap(),
        ConnectionEvent::Shutdown(ep.clone())
    );
    assert!(late.try_recv().is_err());
}
