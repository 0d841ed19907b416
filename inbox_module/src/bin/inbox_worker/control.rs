use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

pub(super) struct WorkerControl {
    stop: Arc<AtomicBool>,
    handles: Vec<(String, thread::JoinHandle<()>)>,
}

impl WorkerControl {
    pub(super) fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    pub(super) fn spawn<F>(&mut self, name: impl Into<String>, body: F) -> std::io::Result<()>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let name = name.into();
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(stop))?;
        self.handles.push((name, handle));
        Ok(())
    }

    pub(super) fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked name={}", name);
            }
        }
    }
}
