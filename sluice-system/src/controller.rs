use std::io;
use std::time::Duration;

use tokio::sync::watch;

/// Shutdown request broadcast by the [`Controller`].
///
/// A receiver has to ensure that it doesn't take longer than `timeout` to finish its shutdown.
/// Ideally, open work is persisted or finished in an orderly manner but no new work is accepted
/// anymore.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

/// Notifies a task about a [`Shutdown`].
///
/// Obtain a handle through [`Controller::handle`]. Handles can be cloned freely.
#[derive(Clone, Debug)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Returns the shutdown request, if one has been issued.
    pub fn get(&self) -> Option<Shutdown> {
        *self.0.borrow()
    }

    /// Waits for a shutdown request.
    ///
    /// Resolves immediately if shutdown has already been requested. If the controller is dropped
    /// without a request, this resolves with an immediate shutdown.
    pub async fn notified(&mut self) -> Shutdown {
        loop {
            if let Some(shutdown) = *self.0.borrow_and_update() {
                return shutdown;
            }

            if self.0.changed().await.is_err() {
                return Shutdown { timeout: None };
            }
        }
    }
}

/// Starts and gracefully stops Sluice.
///
/// The controller listens for process signals and broadcasts a [`Shutdown`] to all handles:
///
///  - `SIGINT` requests an immediate shutdown.
///  - `SIGTERM` requests a graceful shutdown with the configured timeout.
///
/// Tasks obtain a [`ShutdownHandle`] via [`handle`](Self::handle) and stop once it resolves.
///
/// ### Example
///
/// ```
/// use std::time::Duration;
/// use sluice_system::Controller;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let controller = Controller::start(Duration::from_secs(10));
/// let mut handle = controller.handle();
///
/// controller.shutdown(None);
/// assert_eq!(handle.notified().await.timeout, None);
/// # }
/// ```
#[derive(Debug)]
pub struct Controller {
    sender: watch::Sender<Option<Shutdown>>,
}

impl Controller {
    /// Creates a controller without listening for signals.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    /// Creates a controller and starts listening for process signals.
    ///
    /// `timeout` is passed on with graceful shutdowns. Must be called from within a Tokio
    /// runtime.
    pub fn start(timeout: Duration) -> Self {
        let controller = Self::new();
        let sender = controller.sender.clone();

        tokio::spawn(async move {
            if let Some(shutdown) = wait_for_signal(timeout).await {
                sender.send_replace(Some(shutdown));
            }
        });

        controller
    }

    /// Returns a new handle that resolves once shutdown is requested.
    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.sender.subscribe())
    }

    /// Requests a shutdown manually.
    ///
    /// Later requests do not override the first one.
    pub fn shutdown(&self, timeout: Option<Duration>) {
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(Shutdown { timeout });
            true
        });
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_signal(timeout: Duration) -> Option<Shutdown> {
    let mut terminate = match terminate_signal() {
        Ok(signal) => signal,
        Err(error) => {
            sluice_log::error!(
                error = &error as &dyn std::error::Error,
                "failed to register signal handler"
            );
            return None;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => {
                sluice_log::info!("SIGINT received, exiting");
                Some(Shutdown { timeout: None })
            }
            Err(error) => {
                sluice_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to listen for SIGINT"
                );
                None
            }
        },
        _ = terminate.recv() => {
            sluice_log::info!("SIGTERM received, stopping in {}s", timeout.as_secs());
            Some(Shutdown { timeout: Some(timeout) })
        }
    }
}

#[cfg(unix)]
fn terminate_signal() -> io::Result<tokio::signal::unix::Signal> {
    use tokio::signal::unix::{SignalKind, signal};
    signal(SignalKind::terminate())
}

#[cfg(not(unix))]
fn terminate_signal() -> io::Result<NeverSignal> {
    Ok(NeverSignal)
}

#[cfg(not(unix))]
struct NeverSignal;

#[cfg(not(unix))]
impl NeverSignal {
    async fn recv(&mut self) -> Option<()> {
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_shutdown_notifies_handles() {
        let controller = Controller::new();
        let mut first = controller.handle();
        let mut second = first.clone();
        assert_eq!(first.get(), None);

        controller.shutdown(Some(Duration::from_secs(3)));

        let expected = Shutdown {
            timeout: Some(Duration::from_secs(3)),
        };
        assert_eq!(first.notified().await, expected);
        assert_eq!(second.notified().await, expected);
    }

    #[tokio::test]
    async fn test_late_handle_sees_shutdown() {
        let controller = Controller::new();
        controller.shutdown(None);

        let mut handle = controller.handle();
        assert_eq!(handle.notified().await, Shutdown { timeout: None });
    }

    #[tokio::test]
    async fn test_first_shutdown_wins() {
        let controller = Controller::new();
        controller.shutdown(Some(Duration::from_secs(10)));
        controller.shutdown(None);

        assert_eq!(
            controller.handle().get(),
            Some(Shutdown {
                timeout: Some(Duration::from_secs(10))
            })
        );
    }

    #[tokio::test]
    async fn test_dropped_controller_resolves() {
        let controller = Controller::new();
        let mut handle = controller.handle();
        drop(controller);

        assert_eq!(handle.notified().await, Shutdown { timeout: None });
    }
}
