//! Registry, Discovery and federation behavior.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use switchyard_services::{Discovery, Error, Receiver, RegisterStatus, ServiceType};

use crate::{echo_receiver, eventually, inproc, start_registry, SETTLE};

#[tokio::test]
async fn discovery_tracks_register_update_unregister() -> Result<()> {
    let (registry, bcast, req) = start_registry(None).await?;
    let discovery = Arc::new(Discovery::new(ServiceType::Gateway));
    discovery.connect_registry(&bcast)?;
    discovery.subscribe("echo")?;

    let receiver = Receiver::new();
    let bound = receiver.bind(&inproc("rx")).await?;
    receiver.connect_registry(&req)?;
    let accepted = receiver.register("echo", "", 2).await?.wait(SETTLE).await?;
    assert_eq!(accepted.status, RegisterStatus::Accepted);

    eventually("record to appear", || {
        let d = discovery.clone();
        async move { d.receiver_count("echo") == 1 }
    })
    .await?;
    let records = discovery.get_receivers("echo");
    assert_eq!(records[0].endpoint, bound);
    assert_eq!(records[0].weight, 2);
    assert_eq!(&records[0].routing_id[..], &receiver.routing_id()[..]);

    receiver.update_weight("echo", 7).await?;
    eventually("weight update", || {
        let d = discovery.clone();
        async move { d.get_receivers("echo").first().map(|r| r.weight) == Some(7) }
    })
    .await?;
    assert_eq!(discovery.receiver_count("echo"), 1);

    receiver.unregister("echo").await?;
    eventually("record to go", || {
        let d = discovery.clone();
        async move { !d.service_available("echo") }
    })
    .await?;

    receiver.close();
    registry.close();
    Ok(())
}

#[tokio::test]
async fn expired_records_never_reach_a_broadcast() -> Result<()> {
    let (registry, bcast, req) = start_registry(Some((100, 300))).await?;
    // Only changes and joins trigger broadcasts during this test.
    registry.set_broadcast_interval(3_000)?;

    let silent = Receiver::new();
    silent.set_heartbeat_interval(60_000)?;
    silent.bind(&inproc("rx")).await?;
    silent.connect_registry(&req)?;
    silent.register("svc", "", 1).await?.wait(SETTLE).await?;
    tokio::time::sleep(Duration::from_millis(800)).await;

    let live = Receiver::new();
    let live_ep = live.bind(&inproc("rx")).await?;
    live.connect_registry(&req)?;
    live.register("svc", "", 1).await?.wait(SETTLE).await?;

    let discovery = Arc::new(Discovery::new(ServiceType::Gateway));
    discovery.connect_registry(&bcast)?;
    discovery.subscribe("svc")?;
    eventually("live record to appear", || {
        let d = discovery.clone();
        let ep = live_ep.clone();
        async move { d.get_receivers("svc").iter().any(|r| r.endpoint == ep) }
    })
    .await?;
    let endpoints: Vec<String> = discovery
        .get_receivers("svc")
        .into_iter()
        .map(|r| r.endpoint)
        .collect();
    assert_eq!(endpoints, vec![live_ep]);

    silent.close();
    live.close();
    discovery.close();
    registry.close();
    Ok(())
}

#[tokio::test]
async fn silent_records_expire() -> Result<()> {
    let (registry, bcast, req) = start_registry(Some((50, 150))).await?;
    let discovery = Arc::new(Discovery::new(ServiceType::Gateway));
    discovery.connect_registry(&bcast)?;
    discovery.subscribe("quiet")?;

    let receiver = Receiver::new();
    receiver.set_heartbeat_interval(60_000)?;
    receiver.bind(&inproc("rx")).await?;
    receiver.connect_registry(&req)?;
    receiver.register("quiet", "", 1).await?.wait(SETTLE).await?;

    eventually("record to appear", || {
        let d = discovery.clone();
        async move { d.receiver_count("quiet") == 1 }
    })
    .await?;
    eventually("record to expire", || {
        let d = discovery.clone();
        async move { d.receiver_count("quiet") == 0 }
    })
    .await?;

    receiver.close();
    registry.close();
    Ok(())
}

#[tokio::test]
async fn heartbeats_keep_records_alive() -> Result<()> {
    let (registry, bcast, req) = start_registry(Some((50, 150))).await?;
    let discovery = Discovery::new(ServiceType::Gateway);
    discovery.connect_registry(&bcast)?;
    discovery.subscribe("steady")?;

    let receiver = Receiver::new();
    receiver.set_heartbeat_interval(40)?;
    receiver.bind(&inproc("rx")).await?;
    receiver.connect_registry(&req)?;
    receiver.register("steady", "", 1).await?.wait(SETTLE).await?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(discovery.receiver_count("steady"), 1);

    receiver.close();
    registry.close();
    Ok(())
}

#[tokio::test]
async fn federated_registries_share_records() -> Result<()> {
    let (home, home_bcast, home_req) = start_registry(None).await?;
    let (remote, remote_bcast, _) = start_registry(None).await?;
    remote.add_peer(&home_bcast)?;

    let _rx = echo_receiver(&home_req, &inproc("rx"), "far", 1, "home").await?;

    let discovery = Arc::new(Discovery::new(ServiceType::Gateway));
    discovery.connect_registry(&remote_bcast)?;
    discovery.subscribe("far")?;
    eventually("peer record via federation", || {
        let d = discovery.clone();
        async move { d.receiver_count("far") == 1 }
    })
    .await?;
    let record = &discovery.get_receivers("far")[0];
    assert_eq!(Some(record.origin), home.id());

    home.close();
    remote.close();
    Ok(())
}

#[tokio::test]
async fn invalid_endpoint_is_rejected() -> Result<()> {
    let (registry, _, req) = start_registry(None).await?;
    let receiver = Receiver::new();
    receiver.connect_registry(&req)?;
    // Parses as an endpoint but exceeds the wire limit.
    let advertise = format!("inproc://{}", "x".repeat(300));
    let outcome = receiver.register("echo", &advertise, 1).await;
    assert!(matches!(outcome, Err(Error::InvalidEndpoint(_))));

    registry.close();
    Ok(())
}

#[tokio::test]
async fn spot_records_are_separate_from_gateway_records() -> Result<()> {
    let (registry, bcast, req) = start_registry(None).await?;
    let _rx = echo_receiver(&req, &inproc("rx"), "shared", 1, "gw").await?;

    let spots = Arc::new(Discovery::new(ServiceType::Spot));
    spots.connect_registry(&bcast)?;
    spots.subscribe("shared")?;
    let gateways = Arc::new(Discovery::new(ServiceType::Gateway));
    gateways.connect_registry(&bcast)?;
    gateways.subscribe("shared")?;

    eventually("gateway record", || {
        let d = gateways.clone();
        async move { d.receiver_count("shared") == 1 }
    })
    .await?;
    assert_eq!(spots.receiver_count("shared"), 0);

    registry.close();
    Ok(())
}
