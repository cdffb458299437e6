//! Registry of live handler threads.
//!
//! Each handler thread holds a [`CompletionGuard`] that reports its slab key
//! on a channel when the thread finishes, including by panic. The control
//! thread drains that channel to join and remove finished handlers instead of
//! scanning every entry.

use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// A spawned handler thread.
#[derive(Debug)]
pub struct Handler {
    pub name: String,
    pub peer: SocketAddr,
    handle: JoinHandle<()>,
}

/// Reports completion when dropped.
struct CompletionGuard {
    id: usize,
    done: Sender<usize>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        // The receiver lives as long as the registry.
        let _ = self.done.send(self.id);
    }
}

/// Live handlers keyed by slab index.
///
/// O(1) insert and remove; capacity bounds concurrent handlers.
pub struct HandlerRegistry {
    handlers: Slab<Handler>,
    max_handlers: usize,
    done_tx: Sender<usize>,
    done_rx: Receiver<usize>,
}

impl HandlerRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_handlers: usize) -> Self {
        let (done_tx, done_rx) = mpsc::channel();
        Self {
            handlers: Slab::with_capacity(max_handlers),
            max_handlers,
            done_tx,
            done_rx,
        }
    }

    /// Spawn `work` on a new named thread and register it.
    ///
    /// Returns `Ok(None)` without spawning if the registry is at capacity;
    /// `work` is dropped in that case.
    pub fn spawn<F>(&mut self, peer: SocketAddr, work: F) -> io::Result<Option<usize>>
    where
        F: FnOnce(&str) + Send + 'static,
    {
        if self.is_full() {
            return Ok(None);
        }

        let entry = self.handlers.vacant_entry();
        let id = entry.key();
        let name = format!("handler-{}", Uuid::new_v4().simple());
        let done = self.done_tx.clone();

        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            // Armed inside the thread so a failed spawn reports nothing.
            let _guard = CompletionGuard { id, done };
            work(&thread_name);
        })?;

        entry.insert(Handler { name, peer, handle });
        Ok(Some(id))
    }

    /// Join every handler that has reported completion.
    ///
    /// Returns the number reaped.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        while let Ok(id) = self.done_rx.try_recv() {
            self.join(id);
            reaped += 1;
        }
        reaped
    }

    /// Block up to `timeout` for one handler to finish, then reap whatever
    /// has finished. Returns the number reaped.
    pub fn wait_for_slot(&mut self, timeout: Duration) -> usize {
        match self.done_rx.recv_timeout(timeout) {
            Ok(id) => {
                self.join(id);
                1 + self.reap()
            }
            Err(_) => 0,
        }
    }

    /// Wait for every registered handler to finish.
    ///
    /// With a timeout, handlers still running at the deadline are detached
    /// and counted in the return value. The registry is empty afterwards.
    pub fn drain(&mut self, timeout: Option<Duration>) -> usize {
        let deadline = timeout.map(|t| Instant::now() + t);

        while !self.handlers.is_empty() {
            let received = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    self.done_rx.recv_timeout(remaining)
                }
                None => self
                    .done_rx
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(id) => self.join(id),
                Err(_) => break,
            }
        }

        let abandoned = self.handlers.len();
        for handler in self.handlers.drain() {
            warn!(handler = %handler.name, peer = %handler.peer, "Abandoning unfinished handler");
        }
        abandoned
    }

    fn join(&mut self, id: usize) {
        let Some(handler) = self.handlers.try_remove(id) else {
            return;
        };
        match handler.handle.join() {
            Ok(()) => debug!(handler = %handler.name, "Handler reaped"),
            Err(_) => warn!(handler = %handler.name, peer = %handler.peer, "Handler panicked"),
        }
    }

    pub fn is_full(&self) -> bool {
        self.handlers.len() >= self.max_handlers
    }

    /// Number of live handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Maximum number of handlers allowed.
    pub fn capacity(&self) -> usize {
        self.max_handlers
    }

    #[cfg(test)]
    pub fn get(&self, id: usize) -> Option<&Handler> {
        self.handlers.get(id)
    }
}
