//! Dealer socket. One reconnecting connection to a router under a fixed identity.
//!
//! Outbound messages queue while disconnected and flow once the connection
//! is (re)established.

use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use switchyard_core::{Message, Wait};

use crate::codec::{self, SocketKind};
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::options::{SocketOption, SocketOptions};
use crate::queue::{self, lock, read, write};
use crate::stream;
use crate::tls::TlsClient;

struct Inner {
    routing_id: Bytes,
    options: Mutex<SocketOptions>,
    out_tx: mpsc::Sender<Message>,
    out_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    in_tx: mpsc::Sender<Message>,
    in_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    tls_client: RwLock<Option<TlsClient>>,
    current: Mutex<Option<(String, CancellationToken)>>,
    cancel: CancellationToken,
}

pub struct DealerSocket {
    inner: Arc<Inner>,
}

impl DealerSocket {
    pub fn new(routing_id: impl Into<Bytes>) -> Self {
        Self::with_options(routing_id, SocketOptions::default())
    }

    pub fn with_options(routing_id: impl Into<Bytes>, options: SocketOptions) -> Self {
        let (out_tx, out_rx) = mpsc::channel(options.send_hwm);
        let (in_tx, in_rx) = mpsc::channel(options.recv_hwm);
        Self {
            inner: Arc::new(Inner {
                routing_id: routing_id.into(),
                options: Mutex::new(options),
                out_tx,
                out_rx: tokio::sync::Mutex::new(out_rx),
                in_tx,
                in_rx: tokio::sync::Mutex::new(in_rx),
                tls_client: RwLock::new(None),
                current: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn routing_id(&self) -> &Bytes {
        &self.inner.routing_id
    }

    /// Connect to a router, replacing any previous connection.
    pub fn connect(&self, endpoint: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let ep: Endpoint = endpoint.parse()?;
        let token = self.inner.cancel.child_token();
        if let Some((_, old)) = lock(&self.inner.current).replace((ep.to_string(), token.clone())) {
            old.cancel();
        }
        tokio::spawn(connect_loop(self.inner.clone(), ep, token));
        Ok(())
    }

    /// Endpoint of the current connection target, if any.
    pub fn endpoint(&self) -> Option<String> {
        lock(&self.inner.current).as_ref().map(|(ep, _)| ep.clone())
    }

    pub fn disconnect(&self) {
        if let Some((_, token)) = lock(&self.inner.current).take() {
            token.cancel();
        }
    }

    pub async fn send(&self, msg: Message, wait: Wait) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        queue::send_with(&self.inner.out_tx, msg, wait).await
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
            lock(&self.inner.current).take();
        }
    }
}

impl Drop for DealerSocket {
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
                    tracing::debug!(endpoint = %ep, error = %e, "dealer connection ended");
                }
            }
            Err(e) => tracing::trace!(endpoint = %ep, error = %e, "dealer connect failed"),
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
    codec::handshake(&mut conn, SocketKind::Dealer, &inner.routing_id).await?;
    // Only one live connection drains the outbound queue at a time.
    let mut out_rx = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(()),
        g = inner.out_rx.lock() => g,
    };
    let in_tx = inner.in_tx.clone();
    codec::pump(conn, &mut *out_rx, token, |msg| {
        let in_tx = in_tx.clone();
        async move { in_tx.send(msg).await.is_ok() }
    })
    .await
}
