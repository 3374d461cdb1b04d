//! Shutdown signalling.
//!
//! A single [`Broadcaster`] tells any number of [`Watcher`] instances that the
//! daemon is stopping. The signal is one-shot. [`Broadcaster::signal_and_wait`]
//! returns once every registered watcher has observed it, which lets the
//! binary wait for the generation loop and the API server to wind down.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{
    Notify,
    broadcast::{self, error},
};
use tracing::info;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = broadcast::channel(1);
    let peers = Arc::new(AtomicU32::new(1));
    let notify = Arc::new(Notify::new());

    let watcher = Watcher {
        peers: Arc::clone(&peers),
        receiver,
        notify: Arc::clone(&notify),
        acked: false,
    };
    let broadcaster = Broadcaster {
        peers,
        sender,
        notify,
    };
    (watcher, broadcaster)
}

#[derive(Debug)]
/// Sends the shutdown signal.
pub struct Broadcaster {
    peers: Arc<AtomicU32>,
    sender: broadcast::Sender<()>,
    notify: Arc<Notify>,
}

impl Broadcaster {
    /// Send the signal without waiting for watchers.
    pub fn signal(self) {
        drop(self.sender);
    }

    /// Send the signal and wait until every registered watcher received it.
    pub async fn signal_and_wait(self) {
        drop(self.sender);
        loop {
            // Register interest before reading the count so a watcher
            // dropping in between is not missed.
            let notified = self.notify.notified();
            let peers = self.peers.load(Ordering::SeqCst);
            if peers == 0 {
                break;
            }
            info!("Waiting for {peers} peers");
            notified.await;
        }
    }
}

#[derive(Debug)]
/// Waits for the shutdown signal.
///
/// Each watcher counts as one peer of the [`Broadcaster`] until it has seen
/// the signal or is dropped.
pub struct Watcher {
    peers: Arc<AtomicU32>,
    receiver: broadcast::Receiver<()>,
    notify: Arc<Notify>,
    acked: bool,
}

impl Watcher {
    fn ack(&mut self) {
        if self.acked {
            return;
        }
        self.acked = true;
        let mut old = self.peers.load(Ordering::Relaxed);
        while old > 0 {
            match self.peers.compare_exchange_weak(
                old,
                old - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.notify.notify_waiters();
                    break;
                }
                Err(current) => old = current,
            }
        }
    }

    /// Wait for the signal.
    pub async fn recv(mut self) {
        // Nothing is ever sent, the channel only closes. Any outcome means the
        // broadcaster is gone.
        let _ = self.receiver.recv().await;
        self.ack();
    }

    /// Check for the signal without waiting.
    pub fn try_recv(&mut self) -> bool {
        match self.receiver.try_recv() {
            Ok(()) | Err(error::TryRecvError::Closed | error::TryRecvError::Lagged(_)) => {
                self.ack();
                true
            }
            Err(error::TryRecvError::Empty) => false,
        }
    }

    /// Create another watcher the [`Broadcaster`] will wait for.
    #[must_use]
    pub fn register(&self) -> Self {
        self.peers.fetch_add(1, Ordering::SeqCst);
        Self {
            peers: Arc::clone(&self.peers),
            receiver: self.receiver.resubscribe(),
            notify: Arc::clone(&self.notify),
            acked: false,
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.ack();
    }
}
