//! Background loop threads.
//!
//! Each `Worker` spawns exactly one thread and owns the sending half of its
//! shutdown channel. Dropping the `Worker` signals shutdown and joins the
//! thread, so loops never outlive their owner. Sleeps inside a loop go
//! through `Shutdown::sleep`, which wakes early when shutdown is signalled.
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel as xch;

/// Receiving side of a worker's shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: xch::Receiver<()>,
}

impl Shutdown {
    /// Wait up to `d`; returns `false` if shutdown was signalled.
    pub fn sleep(&self, d: Duration) -> bool {
        match self.rx.recv_timeout(d) {
            Err(xch::RecvTimeoutError::Timeout) => true,
            Ok(()) | Err(xch::RecvTimeoutError::Disconnected) => false,
        }
    }

    pub fn is_signalled(&self) -> bool {
        !matches!(self.rx.try_recv(), Err(xch::TryRecvError::Empty))
    }
}

#[derive(Debug)]
pub struct Worker {
    name: String,
    shutdown_tx: Option<xch::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Run `body` on a new thread; it should return once `Shutdown` fires.
    pub fn spawn_loop<F>(name: &str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(Shutdown) + Send + 'static,
    {
        let (tx, rx) = xch::bounded(1);
        let shutdown = Shutdown { rx };
        let thread_name = name.to_string();
        let join_handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                body(shutdown);
                tracing::trace!(worker = %thread_name, "worker thread exiting cleanly");
            })?;
        Ok(Self {
            name: name.to_string(),
            shutdown_tx: Some(tx),
            join_handle: Some(join_handle),
        })
    }

    /// Call `tick` immediately and then every `period` until shutdown.
    pub fn spawn_periodic<F>(name: &str, period: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        Self::spawn_loop(name, move |shutdown| {
            loop {
                tick();
                if !shutdown.sleep(period) {
                    break;
                }
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal shutdown and wait for the thread to finish.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(()) => tracing::trace!(worker = %self.name, "worker joined"),
                Err(e) => tracing::warn!(worker = %self.name, ?e, "worker thread panicked during shutdown"),
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
