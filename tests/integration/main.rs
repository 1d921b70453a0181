//! Switchyard integration test harness.
//!
//! Every test builds its own registry, providers and consumers inside one
//! process, over `inproc://` names unique to the test or ephemeral
//! `tcp://127.0.0.1:0` ports, so tests can run in parallel.
//!
//!   cargo test --test integration

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use switchyard_services::{Receiver, Registry, Wait};

mod gateway;
mod lifecycle;
mod registry;
mod spot;
mod tls;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long any convergence may take before a test fails.
pub const SETTLE: Duration = Duration::from_secs(5);

static NEXT: AtomicUsize = AtomicUsize::new(0);

/// A fresh `inproc://` endpoint.
pub fn inproc(label: &str) -> String {
    format!("inproc://it-{label}-{}", NEXT.fetch_add(1, Ordering::Relaxed))
}

/// A started registry with inproc endpoints. Returns it with its broadcast
/// and request endpoints.
pub async fn start_registry(heartbeat: Option<(u64, u64)>) -> Result<(Registry, String, String)> {
    let registry = Registry::new();
    registry
        .set_endpoints(&inproc("bcast"), &inproc("req"))
        .await?;
    if let Some((interval, timeout)) = heartbeat {
        registry.set_heartbeat(interval, timeout)?;
    }
    registry.start()?;
    let bcast = registry.broadcast_endpoint().unwrap_or_default();
    let req = registry.request_endpoint().unwrap_or_default();
    Ok((registry, bcast, req))
}

/// A receiver registered for `service` at `bind`, answering every request
/// with `[tag, request parts...]`.
pub async fn echo_receiver(
    registry_req: &str,
    bind: &str,
    service: &str,
    weight: u32,
    tag: &'static str,
) -> Result<Arc<Receiver>> {
    let receiver = Arc::new(Receiver::new());
    receiver.bind(bind).await?;
    receiver.connect_registry(registry_req)?;
    receiver
        .register(service, "", weight)
        .await?
        .wait(SETTLE)
        .await?;
    serve_echo(receiver.clone(), tag);
    Ok(receiver)
}

/// Answer every request on `receiver` with `[tag, request parts...]`.
pub fn serve_echo(serving: Arc<Receiver>, tag: &'static str) {
    tokio::spawn(async move {
        let router = serving.router_socket();
        while let Ok((peer, msg)) = router.recv(Wait::Block).await {
            let mut reply = vec![switchyard_services::Frame::from(tag)];
            reply.extend(msg);
            if router.send_to(&peer, reply, Wait::Block).await.is_err() {
                break;
            }
        }
    });
}

/// Poll `check` every 10 ms until it holds or `SETTLE` runs out.
pub async fn eventually<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + SETTLE;
    loop {
        if check().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
