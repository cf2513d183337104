//! Fan-out of output chunks and submitted commands to observers.
//!
//! The reader task only enqueues events; a dedicated blocking drain task
//! invokes the callbacks, so a slow or panicking observer never stalls the
//! socket.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Observer of terminal output or submitted commands.
pub type Callback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug)]
enum Event {
    Output(String),
    Command(String),
}

#[derive(Default)]
struct Registry {
    output: Vec<Callback>,
    command: Vec<Callback>,
}

/// Per-session callback registries and their drain task.
#[derive(Default)]
pub struct Dispatcher {
    registry: Arc<RwLock<Registry>>,
    queue: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an output observer.
    pub fn register_output<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .output
            .push(Arc::new(callback));
    }

    /// Registers a command observer.
    pub fn register_command<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .command
            .push(Arc::new(callback));
    }

    /// Number of registered (output, command) observers.
    pub fn counts(&self) -> (usize, usize) {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        (registry.output.len(), registry.command.len())
    }

    /// Starts the drain task if it is not running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let registry = Arc::clone(&self.registry);

        let handle = tokio::task::spawn_blocking(move || {
            while let Some(event) = rx.blocking_recv() {
                dispatch(&registry, &event);
            }
            debug!("Callback drain finished");
        });

        *queue = Some(tx);
        *self.drain.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Queues an output notification.
    pub fn notify_output(&self, text: &str) {
        self.enqueue(Event::Output(text.to_string()));
    }

    /// Queues a command notification.
    pub fn notify_command(&self, command: &str) {
        self.enqueue(Event::Command(command.to_string()));
    }

    fn enqueue(&self, event: Event) {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = queue.as_ref() {
            if tx.send(event).is_err() {
                debug!("Callback drain is gone, dropping event");
            }
        }
    }

    /// Stops the drain task and clears both registries.
    ///
    /// Events already queued are discarded together with the observers.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            registry.output.clear();
            registry.command.clear();
        }
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.drain.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

fn dispatch(registry: &RwLock<Registry>, event: &Event) {
    // Snapshot so observers may register more callbacks while running.
    let (callbacks, text, kind) = {
        let registry = registry.read().unwrap_or_else(|e| e.into_inner());
        match event {
            Event::Output(text) => (registry.output.clone(), text, "output"),
            Event::Command(text) => (registry.command.clone(), text, "command"),
        }
    };

    for (index, callback) in callbacks.iter().enumerate() {
        if panic::catch_unwind(AssertUnwindSafe(|| callback(text))).is_err() {
            error!(kind, index, "Callback panicked");
        }
    }
}
