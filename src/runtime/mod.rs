//! The cooperative async runtime: per-thread event loops plus a fixed pool
//! of worker threads.
//!
//! Every thread that touches the runtime owns an event loop (created
//! lazily) and a run queue. I/O-performing delegates submit an operation
//! descriptor to the loop owning the target handle, suspend, and are
//! resumed by that loop when the OS signals completion. The main thread
//! drives its own loop from the UI frame via [`handle_events`]; workers
//! drive theirs on their own threads.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::{ErrorKind, Result, SystemError};
use crate::sys;

pub(crate) mod op;
mod task;

pub(crate) use op::Operation;
pub(crate) use task::current_ordinal;

/// io_uring submission queue depth, set at [`init`]. Only used on Linux.
static QUEUE_ENTRIES: AtomicU32 = AtomicU32::new(128);

static WORKERS: Mutex<Option<task::WorkerPool>> = Mutex::new(None);

thread_local! {
    static EVENT_LOOP: RefCell<Option<sys::EventLoop>> = const { RefCell::new(None) };
}

fn with_event_loop<R>(f: impl FnOnce(&mut sys::EventLoop) -> R) -> R {
    EVENT_LOOP.with(|cell| {
        let mut cell = cell.borrow_mut();
        if cell.is_none() {
            let entries = QUEUE_ENTRIES.load(Ordering::Relaxed);
            match sys::EventLoop::new(entries) {
                Ok(event_loop) => *cell = Some(event_loop),
                Err(e) => panic!("failed to create event loop: {e}"),
            }
        }
        f(cell.as_mut().unwrap())
    })
}

/// Appends an operation to the calling thread's event loop.
pub(crate) fn push_local(op: Operation) {
    with_event_loop(|event_loop| event_loop.push(op));
}

pub(crate) fn run_event_loop_once(wait: bool) {
    with_event_loop(|event_loop| event_loop.run_once(wait));
}

pub(crate) fn event_loop_size() -> usize {
    with_event_loop(|event_loop| event_loop.size())
}

/// Submits an operation to the event loop of the thread whose ring owns the
/// handle's in-flight I/O.
///
/// On Linux and macOS cancellation only reaches operations issued on the
/// same ring/queue, so operations for one handle are funneled to one loop.
pub(crate) fn submit_to(home: usize, op: Operation) {
    if home == current_ordinal() {
        push_local(op);
    } else {
        task::push_foreign_op(home, op);
    }
}

/// Initializes the async runtime.
///
/// `num_threads` is the total thread count including the caller (0 means
/// use the machine's available parallelism); `queue_entries` sizes the
/// io_uring on Linux. Returns the actual number of threads.
pub fn init(num_threads: u8, queue_entries: u16) -> Result<u8> {
    if queue_entries != 0 {
        QUEUE_ENTRIES.store(u32::from(queue_entries), Ordering::Relaxed);
    }

    sys::startup();

    let requested = if num_threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(255)
    } else {
        usize::from(num_threads)
    };

    // The caller (ordinal 0 in the common case) runs an event loop too, so
    // only N-1 extra threads are spawned. Its loop is created eagerly so
    // setup failures surface here instead of at first use.
    let _ = current_ordinal();
    EVENT_LOOP.with(|cell| -> Result<()> {
        let mut cell = cell.borrow_mut();
        if cell.is_none() {
            let entries = QUEUE_ENTRIES.load(Ordering::Relaxed);
            let event_loop = sys::EventLoop::new(entries).map_err(|e| {
                SystemError::new(
                    e.raw_os_error().unwrap_or(0) as crate::error::ErrorCode,
                    ErrorKind::System,
                )
            })?;
            *cell = Some(event_loop);
        }
        Ok(())
    })?;

    let mut workers = WORKERS.lock().unwrap();
    if workers.is_none() && requested > 1 {
        *workers = Some(task::spawn_workers(requested - 1));
    }

    Ok(requested as u8)
}

/// Stops and joins the worker threads.
///
/// Callers are expected to have canceled outstanding operations first; the
/// core does not cancel on shutdown.
pub fn cleanup() {
    if let Some(pool) = WORKERS.lock().unwrap().take() {
        pool.stop();
    }
}

/// Runs one iteration of the calling thread's event loop and drains its run
/// queue. The shell calls this once per UI frame.
pub fn handle_events(wait: bool) {
    let ordinal = current_ordinal();
    task::drain_foreign_ops(ordinal);
    run_event_loop_once(wait);
    task::drain_run_queue(ordinal);
}

/// Suspends the current task and resumes it on a worker thread.
///
/// An idle worker is preferred; otherwise the one with the least queued
/// work. With no workers configured this is a no-op.
pub fn queue_to_thread() -> impl Future<Output = ()> {
    struct QueueToThread {
        moved: bool,
    }

    impl Future for QueueToThread {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.moved {
                return Poll::Ready(());
            }
            let Some(target) = task::least_loaded_worker() else {
                return Poll::Ready(());
            };
            self.moved = true;
            if let Some(current) = task::current_task() {
                current.set_owner(target);
            }
            // The waker routes the task onto the new owner's queue.
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    QueueToThread { moved: false }
}

/// Installs a recurring function on one worker (`Some(ordinal)`) or all
/// workers (`None`). The function runs once per loop tick for as long as it
/// returns true.
pub fn queue_to_thread_ex<F>(target: Option<usize>, f: F)
where
    F: FnMut() -> bool + Send + Clone + 'static,
{
    task::push_recurring(target, f);
}

struct JoinState<T> {
    value: Option<T>,
    waker: Option<Waker>,
}

/// Handle to a spawned task's eventual output.
pub struct JoinHandle<T> {
    state: Arc<Mutex<JoinState<T>>>,
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JoinHandle")
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.state.lock().unwrap();
        match state.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Starts a task on the calling thread's run queue.
///
/// The task stays on this thread unless it migrates itself with
/// [`queue_to_thread`].
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let state = Arc::new(Mutex::new(JoinState {
        value: None,
        waker: None,
    }));
    let shared = state.clone();

    task::spawn_on(
        current_ordinal(),
        Box::pin(async move {
            let value = future.await;
            let waker = {
                let mut state = shared.lock().unwrap();
                state.value = Some(value);
                state.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }),
    );

    JoinHandle { state }
}

/// Drives the calling thread's event loop until the future completes.
///
/// The future runs as a regular task, so it may migrate to workers and
/// still finish; the calling thread keeps pumping its own loop meanwhile.
pub fn block_on<F>(future: F) -> F::Output
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let handle = spawn(future);
    loop {
        {
            let mut state = handle.state.lock().unwrap();
            if let Some(value) = state.value.take() {
                return value;
            }
        }
        handle_events(true);
        if event_loop_size() == 0 {
            // The task is parked on another thread; avoid spinning.
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

/// Submits a fire-and-forget operation for `handle` on its home loop.
pub(crate) fn submit_detached(home: Option<usize>, op: Operation) {
    match home {
        Some(home) => submit_to(home, op),
        // Never registered with a loop; run it on the current thread.
        None => push_local(op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Once;

    fn init_runtime() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            init(4, 64).expect("runtime init failed");
        });
    }

    #[test]
    fn spawn_and_block_on() {
        init_runtime();
        let value = block_on(async { 7 * 6 });
        assert_eq!(value, 42);
    }

    #[test]
    fn queue_to_thread_moves_off_caller() {
        init_runtime();
        let caller = std::thread::current().id();
        let thread = block_on(async move {
            queue_to_thread().await;
            std::thread::current().id()
        });
        assert_ne!(thread, caller);
    }

    #[test]
    fn join_handle_is_awaitable() {
        init_runtime();
        let value = block_on(async {
            let inner = spawn(async { 5 });
            inner.await + 1
        });
        assert_eq!(value, 6);
    }

    #[test]
    fn recurring_functions_stop_requeuing() {
        init_runtime();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        queue_to_thread_ex(None, move || seen.fetch_add(1, Ordering::Relaxed) < 2);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while count.load(Ordering::Relaxed) < 3 && std::time::Instant::now() < deadline {
            handle_events(false);
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(count.load(Ordering::Relaxed) >= 3);
    }
}
