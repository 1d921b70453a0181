//! Gateway request/reply and load distribution.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};

use switchyard_services::{
    Discovery, Error, Frame, Gateway, LbStrategy, ServiceType, Wait,
};

use crate::{echo_receiver, eventually, inproc, start_registry, SETTLE};

async fn gateway_for(bcast: &str) -> Result<(Arc<Discovery>, Arc<Gateway>)> {
    let discovery = Arc::new(Discovery::new(ServiceType::Gateway));
    discovery.connect_registry(bcast)?;
    let gateway = Arc::new(Gateway::new(discovery.clone()));
    Ok((discovery, gateway))
}

async fn await_pool(gateway: &Arc<Gateway>, service: &'static str, n: usize) -> Result<()> {
    eventually("gateway pool", || {
        let g = gateway.clone();
        async move { g.connection_count(service).unwrap_or(0) == n }
    })
    .await
}

/// Send `n` requests, collect `n` replies, count replies per receiver tag.
async fn tally(gateway: &Gateway, service: &str, n: usize) -> Result<HashMap<String, usize>> {
    for i in 0..n {
        gateway
            .send(service, vec![Frame::from(i.to_string())], Wait::Block)
            .await?;
    }
    let mut counts = HashMap::new();
    for _ in 0..n {
        let (tagged, reply) = gateway.recv(Wait::Timeout(SETTLE)).await?;
        assert_eq!(tagged, service);
        let tag = reply[0].as_str().context("reply tag")?.to_string();
        *counts.entry(tag).or_insert(0) += 1;
    }
    Ok(counts)
}

#[tokio::test]
async fn request_reply_over_tcp() -> Result<()> {
    let (registry, bcast, req) = start_registry(None).await?;
    let _rx = echo_receiver(&req, "tcp://127.0.0.1:0", "echo", 1, "only").await?;
    let (_discovery, gateway) = gateway_for(&bcast).await?;
    await_pool(&gateway, "echo", 1).await?;

    gateway
        .send("echo", vec![Frame::from("a"), Frame::from("b")], Wait::Block)
        .await?;
    let (service, reply) = gateway.recv(Wait::Timeout(SETTLE)).await?;
    assert_eq!(service, "echo");
    assert_eq!(reply, vec![Frame::from("only"), Frame::from("a"), Frame::from("b")]);

    gateway.close();
    registry.close();
    Ok(())
}

#[tokio::test]
async fn round_robin_is_exact() -> Result<()> {
    let (registry, bcast, req) = start_registry(None).await?;
    let _a = echo_receiver(&req, &inproc("rx"), "rr", 1, "a").await?;
    let _b = echo_receiver(&req, &inproc("rx"), "rr", 1, "b").await?;
    let _c = echo_receiver(&req, &inproc("rx"), "rr", 5, "c").await?;
    let (_discovery, gateway) = gateway_for(&bcast).await?;
    await_pool(&gateway, "rr", 3).await?;

    let counts = tally(&gateway, "rr", 30).await?;
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&n| n == 10), "uneven: {counts:?}");

    gateway.close();
    registry.close();
    Ok(())
}

#[tokio::test]
async fn weighted_follows_weights() -> Result<()> {
    let (registry, bcast, req) = start_registry(None).await?;
    let _light = echo_receiver(&req, &inproc("rx"), "wt", 1, "light").await?;
    let _heavy = echo_receiver(&req, &inproc("rx"), "wt", 3, "heavy").await?;
    let _off = echo_receiver(&req, &inproc("rx"), "wt", 0, "off").await?;
    let (_discovery, gateway) = gateway_for(&bcast).await?;
    gateway.set_lb_strategy("wt", LbStrategy::Weighted)?;
    await_pool(&gateway, "wt", 3).await?;

    let counts = tally(&gateway, "wt", 400).await?;
    assert_eq!(counts.get("light"), Some(&100));
    assert_eq!(counts.get("heavy"), Some(&300));
    assert_eq!(counts.get("off"), None);

    gateway.close();
    registry.close();
    Ok(())
}

#[tokio::test]
async fn weight_updates_reach_the_pool() -> Result<()> {
    let (registry, bcast, req) = start_registry(None).await?;
    let first = echo_receiver(&req, &inproc("rx"), "shift", 1, "first").await?;
    let _second = echo_receiver(&req, &inproc("rx"), "shift", 1, "second").await?;
    let (discovery, gateway) = gateway_for(&bcast).await?;
    gateway.set_lb_strategy("shift", LbStrategy::Weighted)?;
    await_pool(&gateway, "shift", 2).await?;

    first.update_weight("shift", 0).await?;
    eventually("weight 0 to propagate", || {
        let d = discovery.clone();
        async move { d.get_receivers("shift").iter().any(|r| r.weight == 0) }
    })
    .await?;
    // The pool applies the change on its next reconciliation.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let counts = tally(&gateway, "shift", 20).await?;
    assert_eq!(counts.get("second"), Some(&20));

    gateway.close();
    registry.close();
    Ok(())
}

#[tokio::test]
async fn no_receivers_is_an_error() -> Result<()> {
    let (registry, bcast, _) = start_registry(None).await?;
    let (_discovery, gateway) = gateway_for(&bcast).await?;

    let err = gateway
        .send("nobody", vec![Frame::from("x")], Wait::DontWait)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoReceiversAvailable(ref s) if s == "nobody"));
    assert!(matches!(
        gateway.recv(Wait::DontWait).await,
        Err(Error::WouldBlock)
    ));

    gateway.close();
    registry.close();
    Ok(())
}

#[tokio::test]
async fn targeted_send_reaches_one_receiver() -> Result<()> {
    let (registry, bcast, req) = start_registry(None).await?;
    let _a = echo_receiver(&req, &inproc("rx"), "pick", 1, "a").await?;
    let b = echo_receiver(&req, &inproc("rx"), "pick", 1, "b").await?;
    let (_discovery, gateway) = gateway_for(&bcast).await?;
    await_pool(&gateway, "pick", 2).await?;

    for _ in 0..4 {
        gateway
            .send_to("pick", b.routing_id(), vec![Frame::from("hi")], Wait::Block)
            .await?;
        let (_, reply) = gateway.recv(Wait::Timeout(SETTLE)).await?;
        assert_eq!(reply[0], Frame::from("b"));
    }
    assert!(matches!(
        gateway
            .send_to("pick", b"nope", vec![Frame::from("hi")], Wait::DontWait)
            .await,
        Err(Error::NoReceiversAvailable(_))
    ));

    gateway.close();
    registry.close();
    Ok(())
}

#[tokio::test]
async fn closed_receiver_leaves_the_pool() -> Result<()> {
    let (registry, bcast, req) = start_registry(None).await?;
    let _stay = echo_receiver(&req, &inproc("rx"), "churn", 1, "stay").await?;
    let leave = echo_receiver(&req, &inproc("rx"), "churn", 1, "leave").await?;
    let (_discovery, gateway) = gateway_for(&bcast).await?;
    await_pool(&gateway, "churn", 2).await?;

    leave.unregister("churn").await?;
    leave.close();
    await_pool(&gateway, "churn", 1).await?;

    let counts = tally(&gateway, "churn", 6).await?;
    assert_eq!(counts.get("stay"), Some(&6));

    gateway.close();
    registry.close();
    Ok(())
}
