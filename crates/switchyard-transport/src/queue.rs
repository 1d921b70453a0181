//! Wait-mode aware channel operations shared by all sockets.

use std::sync::{MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use switchyard_core::Wait;

use crate::error::TransportError;

pub(crate) async fn send_with<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    wait: Wait,
) -> Result<(), TransportError> {
    match wait {
        Wait::DontWait => tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::WouldBlock,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        }),
        Wait::Block => tx.send(item).await.map_err(|_| TransportError::Closed),
        Wait::Timeout(d) => match tokio::time::timeout(d, tx.send(item)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        },
    }
}

pub(crate) async fn recv_with<T>(
    rx: &Mutex<mpsc::Receiver<T>>,
    wait: Wait,
    cancel: &CancellationToken,
) -> Result<T, TransportError> {
    if cancel.is_cancelled() {
        return Err(TransportError::Closed);
    }
    match wait {
        Wait::DontWait => {
            let mut guard = rx.try_lock().map_err(|_| TransportError::WouldBlock)?;
            guard.try_recv().map_err(|e| match e {
                mpsc::error::TryRecvError::Empty => TransportError::WouldBlock,
                mpsc::error::TryRecvError::Disconnected => TransportError::Closed,
            })
        }
        Wait::Block => recv_blocking(rx, cancel).await,
        Wait::Timeout(d) => tokio::time::timeout(d, recv_blocking(rx, cancel))
            .await
            .map_err(|_| TransportError::Timeout)?,
    }
}

async fn recv_blocking<T>(
    rx: &Mutex<mpsc::Receiver<T>>,
    cancel: &CancellationToken,
) -> Result<T, TransportError> {
    let mut guard = rx.lock().await;
    tokio::select! {
        _ = cancel.cancelled() => Err(TransportError::Closed),
        item = guard.recv() => item.ok_or(TransportError::Closed),
    }
}

// ── Short critical sections ───────────────────────────────────────────────────

/// Lock a std mutex, ignoring poisoning. Guarded state is only touched in
/// short non-panicking sections.
pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

/// Identity for a peer that did not announce one.
pub(crate) fn random_routing_id() -> bytes::Bytes {
    let mut id = vec![0u8];
    id.extend_from_slice(&rand::random::<u32>().to_be_bytes());
    bytes::Bytes::from(id)
}
