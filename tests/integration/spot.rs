//! Spot pub/sub across nodes and topic delivery modes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use switchyard_core::config::SpotConfig;
use switchyard_services::{
    Discovery, Error, Frame, Message, ServiceType, Spot, SpotNode, TopicMode, Wait,
};
use switchyard_transport::SocketOptions;

use crate::{eventually, inproc, start_registry, SETTLE};

/// Subscriptions travel to the publisher asynchronously; publish until the
/// first message makes it through.
async fn publish_until_received(publisher: &Spot, subscriber: &Spot, topic: &str, parts: Message) -> Result<(String, Message)> {
    let deadline = tokio::time::Instant::now() + SETTLE;
    while tokio::time::Instant::now() < deadline {
        publisher.publish(topic, parts.clone(), Wait::Block).await?;
        match subscriber.recv(Wait::millis(50)).await {
            Ok(got) => return Ok(got),
            Err(Error::Timeout) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    bail!("nothing received on {topic}")
}

#[tokio::test]
async fn round_trip_between_nodes() -> Result<()> {
    let a = SpotNode::new();
    let b = SpotNode::new();
    let a_ep = a.bind("tcp://127.0.0.1:0").await?;
    b.connect_peer_pub(&a_ep)?;

    let publisher = a.spot()?;
    let subscriber = b.spot()?;
    publisher.topic_create("t", TopicMode::Queue)?;
    subscriber.subscribe("t")?;

    let parts = vec![Frame::from("a"), Frame::from("b")];
    let (topic, got) = publish_until_received(&publisher, &subscriber, "t", parts.clone()).await?;
    assert_eq!(topic, "t");
    assert_eq!(got, parts);

    a.close();
    b.close();
    Ok(())
}

#[tokio::test]
async fn order_is_kept_per_topic() -> Result<()> {
    let a = SpotNode::new();
    let b = SpotNode::new();
    let a_ep = a.bind(&inproc("spot")).await?;
    b.connect_peer_pub(&a_ep)?;

    let publisher = a.spot()?;
    let subscriber = b.spot()?;
    publisher.topic_create("seq", TopicMode::Queue)?;
    subscriber.subscribe("seq")?;
    publish_until_received(&publisher, &subscriber, "seq", vec![Frame::from("warmup")]).await?;
    // Drain any extra warmup copies.
    while subscriber.recv(Wait::millis(50)).await.is_ok() {}

    for i in 0..100u32 {
        publisher
            .publish("seq", vec![Frame::from(i.to_string())], Wait::Block)
            .await?;
    }
    for i in 0..100u32 {
        let (_, parts) = subscriber.recv(Wait::Timeout(SETTLE)).await?;
        assert_eq!(parts[0], Frame::from(i.to_string()));
    }

    a.close();
    b.close();
    Ok(())
}

#[tokio::test]
async fn patterns_match_prefixes_across_nodes() -> Result<()> {
    let a = SpotNode::new();
    let b = SpotNode::new();
    let a_ep = a.bind(&inproc("spot")).await?;
    b.connect_peer_pub(&a_ep)?;

    let publisher = a.spot()?;
    let subscriber = b.spot()?;
    publisher.topic_create("md.eur", TopicMode::RingBuffer)?;
    publisher.topic_create("other", TopicMode::RingBuffer)?;
    subscriber.subscribe_pattern("md.*")?;

    let (topic, _) = publish_until_received(&publisher, &subscriber, "md.eur", vec![Frame::from("1")]).await?;
    assert_eq!(topic, "md.eur");
    publisher.publish("other", vec![Frame::from("x")], Wait::DontWait).await?;
    while let Ok((topic, _)) = subscriber.recv(Wait::millis(50)).await {
        assert_eq!(topic, "md.eur");
    }

    a.close();
    b.close();
    Ok(())
}

#[tokio::test]
async fn ring_buffer_keeps_latest_and_queue_pushes_back() -> Result<()> {
    let config = SpotConfig {
        queue_capacity: 4,
        ring_capacity: 4,
        ..SpotConfig::default()
    };
    let node = SpotNode::with_options(SocketOptions::default(), &config);
    let publisher = node.spot()?;
    let subscriber = node.spot()?;
    publisher.topic_create("ring", TopicMode::RingBuffer)?;
    publisher.topic_create("queue", TopicMode::Queue)?;
    subscriber.subscribe("ring")?;
    subscriber.subscribe("queue")?;

    // Overproduction on a ring never blocks.
    for i in 0..10u32 {
        publisher
            .publish("ring", vec![Frame::from(i.to_string())], Wait::DontWait)
            .await?;
    }
    let mut latest = Vec::new();
    while let Ok((_, parts)) = subscriber.recv(Wait::DontWait).await {
        latest.push(parts[0].as_str().unwrap_or_default().to_string());
    }
    assert_eq!(latest, vec!["6", "7", "8", "9"]);

    // A queue reports back instead of dropping.
    for i in 0..4u32 {
        publisher
            .publish("queue", vec![Frame::from(i.to_string())], Wait::DontWait)
            .await?;
    }
    assert!(matches!(
        publisher
            .publish("queue", vec![Frame::from("4")], Wait::DontWait)
            .await,
        Err(Error::WouldBlock)
    ));
    assert!(matches!(
        publisher
            .publish("queue", vec![Frame::from("4")], Wait::Timeout(Duration::from_millis(20)))
            .await,
        Err(Error::Timeout)
    ));
    for i in 0..4u32 {
        let (_, parts) = subscriber.recv(Wait::DontWait).await?;
        assert_eq!(parts[0], Frame::from(i.to_string()));
    }

    node.close();
    Ok(())
}

/// Text of the first frame of every message waiting on `spot`.
async fn drain(spot: &Spot) -> Vec<String> {
    let mut got = Vec::new();
    while let Ok((_, parts)) = spot.recv(Wait::DontWait).await {
        got.push(parts[0].as_str().unwrap_or_default().to_string());
    }
    got
}

#[tokio::test]
async fn remote_ring_keeps_latest_under_overproduction() -> Result<()> {
    let options = SocketOptions {
        send_hwm: 8,
        ..SocketOptions::default()
    };
    let a = SpotNode::with_options(options, &SpotConfig::default());
    let b = SpotNode::with_options(
        SocketOptions::default(),
        &SpotConfig {
            ring_capacity: 4,
            ..SpotConfig::default()
        },
    );
    let a_ep = a.bind(&inproc("spot")).await?;
    b.connect_peer_pub(&a_ep)?;

    let publisher = a.spot()?;
    let subscriber = b.spot()?;
    publisher.topic_create("r", TopicMode::RingBuffer)?;
    subscriber.subscribe("r")?;
    publish_until_received(&publisher, &subscriber, "r", vec![Frame::from("warmup")]).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    drain(&subscriber).await;

    for i in 0..1000u32 {
        publisher
            .publish("r", vec![Frame::from(i.to_string())], Wait::DontWait)
            .await?;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(drain(&subscriber).await, vec!["996", "997", "998", "999"]);

    a.close();
    b.close();
    Ok(())
}

#[tokio::test]
async fn queue_publish_is_all_or_nothing() -> Result<()> {
    let config = SpotConfig {
        queue_capacity: 1,
        ..SpotConfig::default()
    };
    let node = SpotNode::with_options(SocketOptions::default(), &config);
    let publisher = node.spot()?;
    let s1 = node.spot()?;
    let s2 = node.spot()?;
    publisher.topic_create("q", TopicMode::Queue)?;
    s1.subscribe("q")?;
    s2.subscribe("q")?;

    publisher.publish("q", vec![Frame::from("0")], Wait::DontWait).await?;
    assert_eq!(drain(&s1).await, vec!["0"]);

    // s2 still holds "0": nobody gets "1".
    assert!(matches!(
        publisher.publish("q", vec![Frame::from("1")], Wait::DontWait).await,
        Err(Error::WouldBlock)
    ));
    assert!(matches!(
        publisher
            .publish("q", vec![Frame::from("1")], Wait::Timeout(Duration::from_millis(20)))
            .await,
        Err(Error::Timeout)
    ));
    assert!(drain(&s1).await.is_empty());

    // Once s2 has room the publication reaches both.
    assert_eq!(drain(&s2).await, vec!["0"]);
    publisher.publish("q", vec![Frame::from("2")], Wait::DontWait).await?;
    assert_eq!(drain(&s1).await, vec!["2"]);
    assert_eq!(drain(&s2).await, vec!["2"]);

    node.close();
    Ok(())
}

#[tokio::test]
async fn discovery_drives_peering() -> Result<()> {
    let (registry, bcast, req) = start_registry(None).await?;

    let producer = SpotNode::new();
    let producer_ep = producer.bind(&inproc("spot")).await?;
    producer.connect_registry(&req)?;
    producer.register("market", "").await?.wait(SETTLE).await?;

    let consumer = Arc::new(SpotNode::new());
    consumer.bind(&inproc("spot")).await?;
    consumer.connect_registry(&req)?;
    consumer.register("market", "").await?.wait(SETTLE).await?;
    let discovery = Arc::new(Discovery::new(ServiceType::Spot));
    discovery.connect_registry(&bcast)?;
    consumer.set_discovery(discovery.clone(), "market")?;

    eventually("consumer to peer with producer", || {
        let c = consumer.clone();
        let ep = producer_ep.clone();
        async move { c.peers() == vec![ep] }
    })
    .await?;

    let publisher = producer.spot()?;
    let subscriber = consumer.spot()?;
    publisher.topic_create("ticks", TopicMode::Queue)?;
    subscriber.subscribe("ticks")?;
    let (topic, _) = publish_until_received(&publisher, &subscriber, "ticks", vec![Frame::from("1")]).await?;
    assert_eq!(topic, "ticks");

    producer.unregister("market").await?;
    eventually("peer withdrawn", || {
        let c = consumer.clone();
        async move { c.peers().is_empty() }
    })
    .await?;

    producer.close();
    consumer.close();
    registry.close();
    Ok(())
}

#[tokio::test]
async fn bad_names_are_rejected() -> Result<()> {
    let (registry, _, req) = start_registry(None).await?;
    let node = SpotNode::new();
    node.bind(&inproc("spot")).await?;
    node.connect_registry(&req)?;
    assert!(matches!(
        node.register("Not_Valid", "").await,
        Err(Error::InvalidArgument(_))
    ));
    let handle = node.register("", "").await?;
    assert_eq!(handle.service(), "spot-node");

    let discovery = Arc::new(Discovery::new(ServiceType::Gateway));
    assert!(matches!(
        node.set_discovery(discovery, "spot-node"),
        Err(Error::InvalidArgument(_))
    ));

    let spot = node.spot()?;
    assert!(matches!(spot.subscribe_pattern("*.x"), Err(Error::InvalidArgument(_))));
    assert!(matches!(spot.unsubscribe("never"), Err(Error::InvalidArgument(_))));

    node.close();
    registry.close();
    Ok(())
}
