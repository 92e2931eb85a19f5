//! Shutdown coordination for tsload.
//!
//! tsload runs one task per simulated series, potentially tens of thousands of
//! them, and must be able to stop every one of those tasks and know when they
//! have all gone away. This crate provides that with two halves, a
//! `Broadcaster` and a `Watcher`.
//!
//! The `Broadcaster` fires the signal exactly once. Every registered `Watcher`
//! observes the signal at its next suspension point and, on observing it or on
//! being dropped, decrements a shared peer count. `Broadcaster::signal_and_wait`
//! blocks until that count reaches zero, making the pair a broadcast
//! cancellation token and a wait-group in one.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::{Notify, watch};
use tracing::{debug, info};

#[derive(Debug)]
struct Shared {
    /// Registered watchers that have not yet observed the signal or dropped.
    peers: AtomicUsize,
    /// Wakes the `Broadcaster` whenever `peers` decreases.
    departed: Notify,
}

/// Construct a `Watcher` and `Broadcaster` pair.
///
/// The returned `Watcher` is registered: the `Broadcaster` will wait for it.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    let shared = Arc::new(Shared {
        peers: AtomicUsize::new(1),
        departed: Notify::new(),
    });

    let w = Watcher {
        shared: Arc::clone(&shared),
        receiver,
        registered: true,
        departed: false,
        received: false,
    };
    let b = Broadcaster { shared, sender };

    (w, b)
}

/// Fires the one-time signal to every `Watcher`.
///
/// Dropping a `Broadcaster` without calling one of its methods also releases
/// the watchers, as they cannot distinguish a closed channel from a signal.
#[derive(Debug)]
pub struct Broadcaster {
    shared: Arc<Shared>,
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Send the signal. Does not wait for watchers to acknowledge.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Send the signal and block until every registered `Watcher` has
    /// observed it or been dropped.
    pub async fn signal_and_wait(self) {
        self.sender.send_replace(true);

        loop {
            // Register interest before reading the count. A watcher departing
            // between the load and the await would otherwise be missed.
            let notified = self.shared.departed.notified();

            let peers = self.shared.peers.load(Ordering::SeqCst);
            if peers == 0 {
                break;
            }
            debug!("waiting for {peers} peers");

            notified.await;
        }
        info!("all peers departed");
    }

    /// The number of registered watchers still outstanding.
    #[must_use]
    pub fn peers(&self) -> usize {
        self.shared.peers.load(Ordering::SeqCst)
    }
}

/// Errors for `Watcher::register`.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum RegisterError {
    /// The signal was already observed by the watcher being registered from.
    #[error("signal has been received")]
    SignalReceived,
}

/// Observes the signal sent by a `Broadcaster`.
#[derive(Debug)]
pub struct Watcher {
    shared: Arc<Shared>,
    receiver: watch::Receiver<bool>,
    /// Whether the `Broadcaster` counts this instance among its peers.
    registered: bool,
    /// Whether this instance has already decremented the peer count.
    departed: bool,
    /// Whether this instance has observed the signal.
    received: bool,
}

impl Watcher {
    fn depart(&mut self) {
        if !self.registered || self.departed {
            return;
        }
        self.departed = true;

        // fetch_sub would wrap at zero, the count must saturate instead.
        let mut old = self.shared.peers.load(Ordering::Relaxed);
        while old > 0 {
            match self.shared.peers.compare_exchange_weak(
                old,
                old - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.shared.departed.notify_waiters();
                    break;
                }
                Err(x) => old = x,
            }
        }
    }

    /// Wait for the signal, consuming this watcher.
    ///
    /// Completes immediately if the signal was already sent.
    pub async fn recv(mut self) {
        // An error means the `Broadcaster` is gone, which releases us all the
        // same.
        let _ = self.receiver.wait_for(|fired| *fired).await;
        self.depart();
    }

    /// Check for the signal without blocking.
    ///
    /// Returns `true` once the signal has been sent. A watcher that has seen
    /// the signal is no longer counted by the `Broadcaster`.
    pub fn try_recv(&mut self) -> bool {
        let fired = match self.receiver.has_changed() {
            Ok(_) => *self.receiver.borrow(),
            Err(_) => true,
        };
        if fired {
            self.received = true;
            self.depart();
        }
        fired
    }

    /// Register a new watcher that the `Broadcaster` will wait for.
    ///
    /// # Errors
    ///
    /// Returns `RegisterError::SignalReceived` if this watcher has already
    /// observed the signal.
    pub fn register(&self) -> Result<Self, RegisterError> {
        if self.received {
            return Err(RegisterError::SignalReceived);
        }
        self.shared.peers.fetch_add(1, Ordering::SeqCst);

        Ok(Self {
            shared: Arc::clone(&self.shared),
            receiver: self.receiver.clone(),
            registered: true,
            departed: false,
            received: false,
        })
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.depart();
    }
}

impl Clone for Watcher {
    /// Clones are not registered; the `Broadcaster` does not wait for them.
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            receiver: self.receiver.clone(),
            registered: false,
            departed: false,
            received: self.received,
        }
    }
}
