//! Cooperative cancellation signal.
//!
//! A thin wrapper over a `watch` channel: the scheduler owns the sender, and
//! every job step holds a cheap clone of the receiver side, checking it
//! between suspension points and inside poll loops.

use tokio::sync::watch;

#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

pub fn channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

impl ShutdownHandle {
    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Shutdown {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is signalled. Pending forever if the
    /// handle is dropped without signalling, which is what a `select!`
    /// against real work wants.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without signalling; never resolve.
                std::future::pending::<()>().await;
            }
        }
    }

    /// A signal that never fires, for single-shot entry points that bypass
    /// the scheduler.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel stays open.
        std::mem::forget(tx);
        Shutdown { rx }
    }
}
