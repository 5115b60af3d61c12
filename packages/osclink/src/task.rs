use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

/// Long-lived reader thread with a cooperative stop flag.
///
/// The thread body must check [`StopFlag::is_set`] at least once per poll
/// timeout so that [`ReaderTask::stop_and_join`] returns promptly.
pub(crate) struct ReaderTask {
    name: &'static str,
    stop: StopFlag,
    handle: Option<JoinHandle<()>>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub(crate) fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl ReaderTask {
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(StopFlag) + Send + 'static,
    {
        let stop = StopFlag::default();
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                body(flag);
                debug!(task = name, "reader thread exiting");
            })?;
        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    /// True once the thread body has returned on its own.
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    pub(crate) fn stop_and_join(&mut self) {
        self.stop.set();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!(task = self.name, "reader thread panicked");
        }
    }
}

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
