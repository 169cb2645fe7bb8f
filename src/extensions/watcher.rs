//! Hot reload: directory watching and debouncing

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use super::discovery::ModulePattern;

/// Runs a callback once a burst of triggers has gone quiet for `delay`
///
/// Every trigger restarts the delay. Shutting down cancels a pending run.
/// The timer runs as a task on a single-threaded runtime owned by the
/// debouncer, so it works whether or not the caller is inside tokio.
pub struct Debouncer {
    tx: mpsc::UnboundedSender<()>,
    cancel: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

/// Cloneable handle that restarts a [`Debouncer`]'s delay
#[derive(Clone)]
pub struct DebounceTrigger {
    tx: mpsc::UnboundedSender<()>,
}

impl DebounceTrigger {
    pub fn trigger(&self) {
        // A closed channel means the debouncer is shutting down
        let _ = self.tx.send(());
    }
}

impl Debouncer {
    pub fn spawn<F>(delay: Duration, callback: F) -> io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let runtime = Builder::new_current_thread().enable_time().build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel, cancelled) = oneshot::channel();

        let worker = thread::Builder::new()
            .name("extension-debounce".to_string())
            .spawn(move || drive(runtime, rx, cancelled, delay, callback))?;

        Ok(Self {
            tx,
            cancel: Some(cancel),
            worker: Some(worker),
        })
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    pub fn handle(&self) -> DebounceTrigger {
        DebounceTrigger {
            tx: self.tx.clone(),
        }
    }

    /// Cancel any pending run and wait for the timer task to finish
    pub fn shutdown(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        let Some(worker) = self.worker.take() else {
            return;
        };

        // Shutting down from inside the callback: the task exits on its own
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            error!("Extension debounce worker panicked");
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drive<F>(
    runtime: Runtime,
    rx: mpsc::UnboundedReceiver<()>,
    cancelled: oneshot::Receiver<()>,
    delay: Duration,
    callback: F,
) where
    F: Fn(),
{
    runtime.block_on(debounce(rx, cancelled, delay, callback));
}

async fn debounce<F>(
    mut rx: mpsc::UnboundedReceiver<()>,
    mut cancelled: oneshot::Receiver<()>,
    delay: Duration,
    callback: F,
) where
    F: Fn(),
{
    loop {
        // Idle until the first trigger of a burst
        tokio::select! {
            biased;
            _ = &mut cancelled => return,
            received = rx.recv() => {
                if received.is_none() {
                    return;
                }
            }
        }

        let timer = time::sleep(delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                _ = &mut cancelled => return,
                received = rx.recv() => match received {
                    Some(()) => timer.as_mut().reset(Instant::now() + delay),
                    None => return,
                },
                () = &mut timer => break,
            }
        }

        if panic::catch_unwind(AssertUnwindSafe(&callback)).is_err() {
            error!("Debounced extension reload panicked");
        }
    }
}

/// Watches the extensions directory and feeds a debouncer
pub struct ExtensionWatcher {
    watcher: Option<RecommendedWatcher>,
    debouncer: Debouncer,
}

impl ExtensionWatcher {
    /// Start watching `dir` (non-recursively); `on_change` runs debounced
    pub fn start<F>(
        dir: &Path,
        pattern: ModulePattern,
        delay: Duration,
        on_change: F,
    ) -> anyhow::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let debouncer = Debouncer::spawn(delay, on_change)?;
        let trigger = debouncer.handle();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) if is_relevant(&event, &pattern) => {
                    info!(kind = ?event.kind, paths = ?event.paths, "Detected change in extensions directory");
                    trigger.trigger();
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Extension watcher error"),
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        debug!(dir = %dir.display(), ?delay, "Watching extensions directory");

        Ok(Self {
            watcher: Some(watcher),
            debouncer,
        })
    }

    /// Stop delivering events and cancel any pending reload
    pub fn stop(&mut self) {
        // Drop the watcher first so no event can restart the debouncer
        self.watcher.take();
        self.debouncer.shutdown();
    }
}

impl Drop for ExtensionWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_relevant(event: &Event, pattern: &ModulePattern) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    ) && event.paths.iter().any(|path| pattern.matches(path))
}
