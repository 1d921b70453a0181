//! Subscriber socket. Receives from any number of publishers.
//!
//! Prefix subscriptions are reference counted locally; each connection
//! forwards the set of distinct prefixes to its publisher and keeps it in
//! sync as the set changes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use switchyard_core::{Message, Wait};

use crate::codec::{self, SocketKind};
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::options::{SocketOption, SocketOptions};
use crate::publisher::{control, CTL_SUBSCRIBE, CTL_UNSUBSCRIBE};
use crate::queue::{self, lock, read, write};
use crate::stream;
use crate::tls::TlsClient;

struct Inner {
    filters: watch::Sender<BTreeMap<Bytes, usize>>,
    connections: DashMap<String, CancellationToken>,
    in_tx: mpsc::Sender<Message>,
    in_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    options: Mutex<SocketOptions>,
    tls_client: RwLock<Option<TlsClient>>,
    cancel: CancellationToken,
}

pub struct SubSocket {
    inner: Arc<Inner>,
}

impl Default for SubSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl SubSocket {
    pub fn new() -> Self {
        Self::with_options(SocketOptions::default())
    }

    pub fn with_options(options: SocketOptions) -> Self {
        let (in_tx, in_rx) = mpsc::channel(options.recv_hwm);
        let (filters, _) = watch::channel(BTreeMap::new());
        Self {
            inner: Arc::new(Inner {
                filters,
                connections: DashMap::new(),
                in_tx,
                in_rx: tokio::sync::Mutex::new(in_rx),
                options: Mutex::new(options),
                tls_client: RwLock::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Connect to a publisher. Connecting twice to the same endpoint is a
    /// no-op.
    pub fn connect(&self, endpoint: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let ep: Endpoint = endpoint.parse()?;
        let key = ep.to_string();
        if self.inner.connections.contains_key(&key) {
            return Ok(());
        }
        let token = self.inner.cancel.child_token();
        self.inner.connections.insert(key, token.clone());
        tokio::spawn(connect_loop(self.inner.clone(), ep, token));
        Ok(())
    }

    pub fn disconnect(&self, endpoint: &str) -> bool {
        let key = endpoint
            .parse::<Endpoint>()
            .map(|e| e.to_string())
            .unwrap_or_else(|_| endpoint.to_string());
        match self.inner.connections.remove(&key) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_connected_to(&self, endpoint: &str) -> bool {
        self.inner.connections.contains_key(endpoint)
    }

    pub fn connected_endpoints(&self) -> Vec<String> {
        self.inner.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Add one reference to a prefix. The empty prefix matches everything.
    pub fn subscribe(&self, prefix: impl AsRef<[u8]>) {
        let prefix = Bytes::copy_from_slice(prefix.as_ref());
        self.inner.filters.send_modify(|m| *m.entry(prefix).or_insert(0) += 1);
    }

    /// Drop one reference. Returns false if the prefix was not subscribed.
    pub fn unsubscribe(&self, prefix: impl AsRef<[u8]>) -> bool {
        let prefix = prefix.as_ref();
        let mut found = false;
        self.inner.filters.send_if_modified(|m| {
            let Some(count) = m.get_mut(prefix) else {
                return false;
            };
            found = true;
            *count -= 1;
            if *count == 0 {
                m.remove(prefix);
                true
            } else {
                false
            }
        });
        found
    }

    pub async fn recv(&self, wait: Wait) -> Result<Message, TransportError> {
        queue::recv_with(&self.inner.in_rx, wait, &self.inner.cancel).await
    }

    pub fn set_option(&self, option: SocketOption) {
        lock(&self.inner.options).apply(option);
    }

    pub fn set_tls_client(&self, client: TlsClient) {
        *write(&self.inner.tls_client) = Some(client);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn close(&self) {
        if !self.inner.cancel.is_cancelled() {
            self.inner.cancel.cancel();
            self.inner.connections.clear();
        }
    }
}

impl Drop for SubSocket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn connect_loop(inner: Arc<Inner>, ep: Endpoint, token: CancellationToken) {
    loop {
        let tls = read(&inner.tls_client).clone();
        let attempt = tokio::select! {
            _ = token.cancelled() => return,
            r = stream::connect(&ep, tls.as_ref()) => r,
        };
        match attempt {
            Ok(s) => {
                if let Err(e) = session(&inner, codec::framed(s), &token).await {
                    tracing::debug!(endpoint = %ep, error = %e, "subscriber connection ended");
                }
            }
            Err(e) => tracing::trace!(endpoint = %ep, error = %e, "subscriber connect failed"),
        }
        let delay = lock(&inner.options).reconnect_interval;
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn session(
    inner: &Arc<Inner>,
    mut conn: codec::Connection,
    token: &CancellationToken,
) -> Result<(), TransportError> {
    codec::handshake(&mut conn, SocketKind::Sub, &Bytes::new()).await?;

    let (ctl_tx, mut ctl_rx) = mpsc::channel(256);
    let mut filters = inner.filters.subscribe();
    let sync = async move {
        let mut sent = BTreeSet::new();
        loop {
            let current: BTreeSet<Bytes> = filters.borrow_and_update().keys().cloned().collect();
            for p in current.difference(&sent) {
                if ctl_tx.send(control(CTL_SUBSCRIBE, p)).await.is_err() {
                    return;
                }
            }
            for p in sent.difference(&current) {
                if ctl_tx.send(control(CTL_UNSUBSCRIBE, p)).await.is_err() {
                    return;
                }
            }
            sent = current;
            if filters.changed().await.is_err() {
                return;
            }
        }
    };

    let in_tx = inner.in_tx.clone();
    let pump = codec::pump(conn, &mut ctl_rx, token, |msg| {
        let in_tx = in_tx.clone();
        async move { in_tx.send(msg).await.is_ok() }
    });

    tokio::select! {
        r = pump => r,
        _ = sync => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::PubSocket;
    use std::time::Duration;
    use switchyard_core::frame::message;

    #[test]
    fn unsubscribe_is_refcounted() {
        let sub = SubSocket::new();
        sub.subscribe("a");
        sub.subscribe("a");
        assert!(sub.unsubscribe("a"));
        assert!(sub.inner.filters.borrow().contains_key(&b"a"[..]));
        assert!(sub.unsubscribe("a"));
        assert!(!sub.inner.filters.borrow().contains_key(&b"a"[..]));
        assert!(!sub.unsubscribe("a"));
    }

    #[tokio::test]
    async fn late_subscription_reaches_connected_publisher() {
        let publisher = PubSocket::new();
        let mut joins = publisher.subscriber_joined();
        let ep = publisher.bind("tcp://127.0.0.1:0").await.unwrap();

        let sub = SubSocket::new();
        sub.connect(&ep.to_string()).unwrap();
        sub.subscribe("news");
        tokio::time::timeout(Duration::from_secs(5), joins.recv())
            .await
            .unwrap()
            .unwrap();

        publisher.send(message(["news", "1"])).unwrap();
        let got = sub.recv(Wait::millis(5000)).await.unwrap();
        assert_eq!(got, message(["news", "1"]));
    }

    #[tokio::test]
    async fn receives_from_two_publishers() {
        let p1 = PubSocket::new();
        let p2 = PubSocket::new();
        let mut j1 = p1.subscriber_joined();
        let mut j2 = p2.subscriber_joined();
        let e1 = p1.bind("inproc://sub-test-two-1").await.unwrap();
        let e2 = p2.bind("inproc://sub-test-two-2").await.unwrap();

        let sub = SubSocket::new();
        sub.subscribe("");
        sub.connect(&e1.to_string()).unwrap();
        sub.connect(&e2.to_string()).unwrap();
        j1.recv().await.unwrap();
        j2.recv().await.unwrap();

        p1.send(message(["from-1"])).unwrap();
        p2.send(message(["from-2"])).unwrap();
        let mut got = vec![
            sub.recv(Wait::millis(5000)).await.unwrap(),
            sub.recv(Wait::millis(5000)).await.unwrap(),
        ];
        got.sort();
        assert_eq!(got, vec![message(["from-1"]), message(["from-2"])]);

        assert!(sub.disconnect(&e1.to_string()));
        assert_eq!(sub.connected_endpoints(), vec![e2.to_string()]);
    }
}
