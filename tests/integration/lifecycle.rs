//! Teardown: every role closes idempotently and refuses work afterwards.

use std::sync::Arc;

use anyhow::Result;

use switchyard_services::{
    Discovery, Error, Frame, Gateway, Receiver, Registry, ServiceType, SpotNode, TopicMode, Wait,
};

use crate::inproc;

#[tokio::test]
async fn double_close_everywhere() -> Result<()> {
    let registry = Registry::new();
    registry.set_endpoints(&inproc("bcast"), &inproc("req")).await?;
    registry.start()?;
    registry.close();
    registry.close();
    assert!(matches!(registry.add_peer("inproc://x"), Err(Error::Closed)));

    let discovery = Arc::new(Discovery::new(ServiceType::Gateway));
    let gateway = Gateway::new(discovery.clone());
    gateway.close();
    gateway.close();
    assert!(matches!(
        gateway.send("s", vec![Frame::from("x")], Wait::DontWait).await,
        Err(Error::Closed)
    ));
    // Closing the gateway leaves its discovery alone.
    assert!(!discovery.is_closed());
    discovery.close();
    discovery.close();

    let receiver = Receiver::new();
    receiver.close();
    receiver.close();
    assert!(matches!(receiver.connect_registry("inproc://x"), Err(Error::Closed)));

    let node = SpotNode::new();
    let spot = node.spot()?;
    spot.topic_create("t", TopicMode::Queue)?;
    spot.close();
    spot.close();
    assert!(matches!(
        spot.publish("t", vec![], Wait::DontWait).await,
        Err(Error::Closed)
    ));
    node.close();
    node.close();
    assert!(matches!(node.bind("inproc://x").await, Err(Error::Closed)));
    Ok(())
}

#[tokio::test]
async fn closed_registry_endpoints_can_be_reused() -> Result<()> {
    let bcast = inproc("bcast");
    let req = inproc("req");
    let first = Registry::new();
    first.set_endpoints(&bcast, &req).await?;
    first.close();

    let second = Registry::new();
    second.set_endpoints(&bcast, &req).await?;
    second.start()?;
    assert!(second.is_running());
    second.close();
    Ok(())
}
