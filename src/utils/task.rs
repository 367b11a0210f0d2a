use crate::utils::Event;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long `shutdown` waits for a background loop to notice the signal
/// before leaving it to finish on its own.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(10);

/// A named thread paired with its own cancellation signal.
pub struct BackgroundTask {
    shutdown: Arc<Event>,
    finished: Arc<Event>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn `body`, handing it the shutdown event it must poll (usually by
    /// sleeping on it).
    pub fn spawn<F>(name: String, body: F) -> io::Result<Self>
    where
        F: FnOnce(&Event) + Send + 'static,
    {
        let shutdown = Arc::new(Event::new());
        let finished = Arc::new(Event::new());
        let handle = {
            let shutdown = shutdown.clone();
            let finished = finished.clone();
            thread::Builder::new().name(name).spawn(move || {
                body(&shutdown);
                finished.set();
            })?
        };
        Ok(Self {
            shutdown,
            finished,
            handle: Some(handle),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.handle.is_some() && !self.finished.is_set()
    }

    /// Signal the loop and give it [`SHUTDOWN_GRACE`] to exit. A loop stuck
    /// in an external call is detached rather than joined.
    pub fn shutdown(&mut self) {
        self.shutdown.set();
        if let Some(handle) = self.handle.take() {
            if self.finished.wait(SHUTDOWN_GRACE) {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.shutdown.set();
    }
}
