use std::sync::Arc;

use tokio::sync::watch;

/// Sends a one-shot shutdown signal to every listener created from it.
///
/// The signal latches: a listener created after [ShutdownHandle::shutdown] was called still
/// observes it. Signalling more than once is a no-op, which lets callers such as a repeated
/// stop request stay idempotent without tracking state of their own.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Signal shutdown.
    ///
    /// Returns `true` if this call delivered the signal and `false` if it had already been sent.
    pub fn shutdown(&self) -> bool {
        let sent = self.sender.send_if_modified(|signalled| {
            if *signalled {
                false
            } else {
                *signalled = true;
                true
            }
        });

        if !sent {
            log::debug!("Shutdown already signalled, ignoring repeated request");
        }

        sent
    }

    pub fn new_listener(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Point in time check if the shutdown signal has been received.
    pub fn should_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait for the shutdown signal. Returns immediately if it was already sent.
    ///
    /// If every [ShutdownHandle] is dropped without signalling then this never resolves, so it
    /// is safe to race against other work in a `select!`.
    pub async fn wait_for_shutdown(&mut self) {
        if self.receiver.wait_for(|signalled| *signalled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn listener_created_after_shutdown_sees_signal() {
        let handle = ShutdownHandle::new();
        assert!(handle.shutdown());

        let listener = handle.new_listener();
        assert!(listener.should_shutdown());
    }

    #[test]
    fn repeated_shutdown_is_reported_once() {
        let handle = ShutdownHandle::new();
        assert!(handle.shutdown());
        assert!(!handle.shutdown());
        assert!(handle.new_listener().should_shutdown());
    }

    #[tokio::test]
    async fn wait_for_shutdown_wakes_on_signal() {
        let handle = ShutdownHandle::new();
        let mut listener = handle.new_listener();

        let signaller = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            signaller.shutdown();
        });

        tokio::time::timeout(Duration::from_secs(2), listener.wait_for_shutdown())
            .await
            .expect("listener should have been woken");
    }

    #[tokio::test]
    async fn wait_for_shutdown_pends_when_handle_dropped() {
        let handle = ShutdownHandle::new();
        let mut listener = handle.new_listener();
        drop(handle);

        let result =
            tokio::time::timeout(Duration::from_millis(50), listener.wait_for_shutdown()).await;
        assert!(result.is_err());
    }
}
