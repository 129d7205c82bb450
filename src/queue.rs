//! Deferred function queue: schedules closures to run on a specific thread's
//! event loop.
//!
//! Every loop owns an `eventfd` registered with its own poller; a
//! [`LoopHandle`] can be cloned and sent to other threads, and queuing a
//! closure signals that eventfd so a blocked loop wakes up and drains the
//! queue. Closures queued to the same loop run in FIFO order relative to
//! each other. Queuing from the loop's own thread schedules the closure for
//! the *next* iteration; it never executes reentrantly.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use log::debug;
use nix::sys::eventfd::EventFd;

use crate::error::{Error, Result};
use crate::event_loop;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// A remote control for an [`EventLoop`](crate::EventLoop) that may be
/// running on another thread.
///
/// Cheap to clone, `Send` and `Sync`. A handle outliving its loop is fine;
/// queuing to a dead loop returns [`Error::Closed`].
pub struct LoopHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    loop_id: u64,
    wake_fd: Arc<EventFd>,
    tx: mpsc::Sender<Job>,
    alive: AtomicBool,
}

impl Clone for LoopHandle {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl LoopHandle {
    pub(crate) fn new(loop_id: u64, wake_fd: Arc<EventFd>, tx: mpsc::Sender<Job>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                loop_id,
                wake_fd,
                tx,
                alive: AtomicBool::new(true),
            }),
        }
    }

    pub(crate) fn loop_id(&self) -> u64 {
        self.inner.loop_id
    }

    pub(crate) fn mark_dead(&self) {
        self.inner.alive.store(false, Ordering::Release);
    }

    /// Queues `f` to run on the target loop's next iteration.
    ///
    /// Safe to call from any thread, including the target's own. Returns
    /// [`Error::Closed`] if the loop has been dropped.
    pub fn queue(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        self.queue_job(Box::new(f))
    }

    pub(crate) fn queue_job(&self, job: Job) -> Result<()> {
        if !self.inner.alive.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.inner.tx.send(job).map_err(|_| Error::Closed)?;
        match self.inner.wake_fd.write(1) {
            Ok(_) => Ok(()),
            Err(e) => Err(Error::Comm(io::Error::from(e))),
        }
    }

    /// Runs `f` on the target loop's thread and blocks until it returns,
    /// handing the result back.
    ///
    /// # Panics
    ///
    /// Panics when called from the target loop's own thread: the closure
    /// could never run while this call blocks waiting for it.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] if the loop has been dropped, or is dropped before
    /// the closure runs.
    pub fn call_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if event_loop::try_current_id() == Some(self.inner.loop_id) {
            panic!("LoopHandle::call_blocking called from the target loop's own thread");
        }

        let (tx, rx) = oneshot::channel();
        self.queue(move || {
            let _ = tx.send(f());
        })?;
        rx.recv().map_err(|_| Error::Closed)
    }
}

/// Queues `f` to run on the calling thread's own event loop, on its next
/// iteration.
///
/// The `Send` bound exists because same-thread and cross-thread queuing
/// share one FIFO channel; sharing the channel is what makes their relative
/// order well defined.
///
/// # Panics
///
/// Panics if the calling thread has no event loop.
pub fn queue_function(f: impl FnOnce() + Send + 'static) {
    let handle = event_loop::with_current(|core| core.handle().clone());
    // Own loop is alive by construction; the eventfd write is the only
    // failure left and there is no meaningful recovery from losing the wake.
    if let Err(e) = handle.queue(f) {
        panic!("failed to wake own event loop: {e}");
    }
}

/// Drain side owned by the loop: the eventfd plus the receiving end of the
/// job channel.
pub(crate) struct WakeQueue {
    wake_fd: Arc<EventFd>,
    rx: mpsc::Receiver<Job>,
}

impl WakeQueue {
    pub(crate) fn new() -> io::Result<(WakeQueue, mpsc::Sender<Job>)> {
        use nix::sys::eventfd::EfdFlags;

        let wake_fd = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(io::Error::from)?;
        let (tx, rx) = mpsc::channel();

        Ok((
            WakeQueue {
                wake_fd: Arc::new(wake_fd),
                rx,
            },
            tx,
        ))
    }

    pub(crate) fn wake_fd(&self) -> &Arc<EventFd> {
        &self.wake_fd
    }

    /// Clears the wake counter and runs every closure queued *before* this
    /// drain began. Closures queued by the drained closures stay in the
    /// channel for the next iteration.
    pub(crate) fn drain_and_run(&self) {
        let _ = self.wake_fd.read();

        let jobs: Vec<Job> = std::iter::from_fn(|| self.rx.try_recv().ok()).collect();
        if !jobs.is_empty() {
            debug!("running {} queued function(s)", jobs.len());
        }
        for job in jobs {
            job();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn assert_send<T: Send>() {}
    const fn assert_sync<T: Sync>() {}

    const _: () = assert_send::<LoopHandle>();
    const _: () = assert_sync::<LoopHandle>();
}
