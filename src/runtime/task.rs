//! Cooperative task scheduling over a fixed pool of OS threads.
//!
//! A task is a boxed future plus the ordinal of the thread it lives on. Its
//! waker pushes it onto that thread's run queue, so a task always resumes on
//! its owning thread no matter where the completion surfaced. The one
//! sanctioned migration point is [`queue_to_thread`](super::queue_to_thread),
//! which retargets the ordinal before waking.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::Duration;

use log::trace;

use super::op::Operation;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A resumable unit of work, owned by one thread at a time.
pub(crate) struct Task {
    future: Mutex<Option<BoxFuture>>,
    owner: AtomicUsize,
    queued: AtomicBool,
}

impl Task {
    fn new(future: BoxFuture, owner: usize) -> Arc<Task> {
        Arc::new(Task {
            future: Mutex::new(Some(future)),
            owner: AtomicUsize::new(owner),
            queued: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_owner(&self, ordinal: usize) {
        self.owner.store(ordinal, Ordering::Release);
    }
}

impl std::task::Wake for Task {
    fn wake(self: Arc<Self>) {
        schedule(self);
    }
}

/// Per-thread shared state reachable from other threads.
///
/// Each thread owns its run queue and event loop; cross-thread access is
/// limited to pushing onto the queues under their mutexes and poking the
/// `has_work` flag.
pub(crate) struct ThreadState {
    /// Resumable tasks, drained by swapping with an empty vector.
    run_queue: Mutex<Vec<Arc<Task>>>,
    /// Operations submitted from foreign threads for this thread's loop.
    foreign_ops: Mutex<Vec<Operation>>,
    /// Recurring per-tick functions; retained while they return true.
    recurring: Mutex<Vec<Box<dyn FnMut() -> bool + Send>>>,
    /// Approximate queued work, for least-loaded selection.
    load: AtomicUsize,
    has_work: AtomicBool,
    should_stop: AtomicBool,
    is_worker: bool,
    park: Mutex<bool>,
    unpark: Condvar,
}

impl ThreadState {
    fn new(is_worker: bool) -> Arc<ThreadState> {
        Arc::new(ThreadState {
            run_queue: Mutex::new(Vec::new()),
            foreign_ops: Mutex::new(Vec::new()),
            recurring: Mutex::new(Vec::new()),
            load: AtomicUsize::new(0),
            has_work: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
            is_worker,
            park: Mutex::new(false),
            unpark: Condvar::new(),
        })
    }

    fn notify(&self) {
        self.has_work.store(true, Ordering::Release);
        let mut pending = self.park.lock().unwrap();
        *pending = true;
        self.unpark.notify_one();
    }

    pub(crate) fn size(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }
}

static THREADS: RwLock<Vec<Arc<ThreadState>>> = RwLock::new(Vec::new());

thread_local! {
    static ORDINAL: Cell<Option<usize>> = const { Cell::new(None) };
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

/// Registers the calling thread if needed and returns its ordinal.
pub(crate) fn current_ordinal() -> usize {
    if let Some(ordinal) = ORDINAL.with(|o| o.get()) {
        return ordinal;
    }
    let state = ThreadState::new(false);
    let ordinal = {
        let mut threads = THREADS.write().unwrap();
        threads.push(state);
        threads.len() - 1
    };
    ORDINAL.with(|o| o.set(Some(ordinal)));
    ordinal
}

fn state_of(ordinal: usize) -> Arc<ThreadState> {
    THREADS.read().unwrap()[ordinal].clone()
}

/// Queues a task onto its owning thread. No-op if it is already queued.
pub(crate) fn schedule(task: Arc<Task>) {
    if task.queued.swap(true, Ordering::AcqRel) {
        return;
    }
    let owner = task.owner.load(Ordering::Acquire);
    let state = state_of(owner);
    state.run_queue.lock().unwrap().push(task);
    state.load.fetch_add(1, Ordering::Relaxed);
    state.notify();
}

/// Delivers an operation to another thread's event loop.
pub(crate) fn push_foreign_op(ordinal: usize, op: Operation) {
    let state = state_of(ordinal);
    state.foreign_ops.lock().unwrap().push(op);
    state.notify();
}

/// Creates a task owned by `ordinal` and queues its first resumption.
pub(crate) fn spawn_on(ordinal: usize, future: BoxFuture) -> Arc<Task> {
    let task = Task::new(future, ordinal);
    schedule(task.clone());
    task
}

/// The task currently being polled on this thread, if any.
pub(crate) fn current_task() -> Option<Arc<Task>> {
    CURRENT_TASK.with(|t| t.borrow().clone())
}

/// The ordinal of the least-loaded worker; an idle worker wins immediately.
pub(crate) fn least_loaded_worker() -> Option<usize> {
    let threads = THREADS.read().unwrap();
    let mut best = None;
    let mut best_load = usize::MAX;
    for (ordinal, state) in threads.iter().enumerate() {
        if !state.is_worker || state.should_stop.load(Ordering::Relaxed) {
            continue;
        }
        let load = state.size();
        if load == 0 {
            return Some(ordinal);
        }
        if load < best_load {
            best_load = load;
            best = Some(ordinal);
        }
    }
    best
}

/// Installs a recurring function on one worker, or all workers when
/// `target` is `None`. It runs once per loop tick until it returns false.
pub(crate) fn push_recurring<F>(target: Option<usize>, f: F)
where
    F: FnMut() -> bool + Send + Clone + 'static,
{
    let threads = THREADS.read().unwrap();
    for (ordinal, state) in threads.iter().enumerate() {
        if !state.is_worker {
            continue;
        }
        if let Some(target) = target {
            if target != ordinal {
                continue;
            }
        }
        state.recurring.lock().unwrap().push(Box::new(f.clone()));
        state.notify();
    }
}

/// Drains operations other threads submitted for this thread's loop.
pub(crate) fn drain_foreign_ops(ordinal: usize) {
    let state = state_of(ordinal);
    let ops = std::mem::take(&mut *state.foreign_ops.lock().unwrap());
    for op in ops {
        super::push_local(op);
    }
}

/// Polls every task queued on this thread.
///
/// The queue is swapped with an empty vector so the mutex is held for
/// minimal time and other threads can keep pushing while tasks run.
pub(crate) fn drain_run_queue(ordinal: usize) {
    let state = state_of(ordinal);
    let tasks = std::mem::take(&mut *state.run_queue.lock().unwrap());
    for task in tasks {
        poll_task(task);
        state.load.fetch_sub(1, Ordering::Relaxed);
    }
}

fn run_recurring(state: &ThreadState) {
    let mut fns = std::mem::take(&mut *state.recurring.lock().unwrap());
    fns.retain_mut(|f| f());
    state.recurring.lock().unwrap().append(&mut fns);
}

fn poll_task(task: Arc<Task>) {
    task.queued.store(false, Ordering::Release);
    let waker = Waker::from(task.clone());
    let mut cx = Context::from_waker(&waker);

    CURRENT_TASK.with(|t| *t.borrow_mut() = Some(task.clone()));
    let mut future = task.future.lock().unwrap();
    if let Some(fut) = future.as_mut() {
        if let Poll::Ready(()) = fut.as_mut().poll(&mut cx) {
            *future = None;
        }
    }
    drop(future);
    CURRENT_TASK.with(|t| *t.borrow_mut() = None);
}

/// Handle used by `cleanup` to stop and join the workers.
pub(crate) struct WorkerPool {
    states: Vec<Arc<ThreadState>>,
    joins: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn stop(self) {
        for state in &self.states {
            state.should_stop.store(true, Ordering::Release);
            state.notify();
        }
        for join in self.joins {
            let _ = join.join();
        }
    }
}

/// Spawns `count` worker threads, each owning an event loop and run queue.
pub(crate) fn spawn_workers(count: usize) -> WorkerPool {
    let mut states = Vec::with_capacity(count);
    let mut joins = Vec::with_capacity(count);

    for _ in 0..count {
        let state = ThreadState::new(true);
        let ordinal = {
            let mut threads = THREADS.write().unwrap();
            threads.push(state.clone());
            threads.len() - 1
        };
        states.push(state.clone());
        joins.push(
            thread::Builder::new()
                .name(format!("netterm-worker-{ordinal}"))
                .spawn(move || worker_main(ordinal, state))
                .expect("failed to spawn worker thread"),
        );
    }

    WorkerPool { states, joins }
}

fn worker_main(ordinal: usize, state: Arc<ThreadState>) {
    ORDINAL.with(|o| o.set(Some(ordinal)));
    trace!("worker {ordinal} started");

    loop {
        let had_work = state.has_work.swap(false, Ordering::AcqRel);
        if !had_work && super::event_loop_size() == 0 {
            // Idle: sleep until another thread queues work for us. The
            // bounded wait keeps the stop flag observed even on a missed
            // notification.
            let mut pending = state.park.lock().unwrap();
            while !*pending && !state.should_stop.load(Ordering::Acquire) {
                let (guard, timeout) = state
                    .unpark
                    .wait_timeout(pending, Duration::from_millis(200))
                    .unwrap();
                pending = guard;
                if timeout.timed_out() {
                    break;
                }
            }
            *pending = false;
        }

        if state.should_stop.load(Ordering::Acquire) {
            break;
        }

        run_recurring(&state);
        drain_foreign_ops(ordinal);
        super::run_event_loop_once(true);
        drain_run_queue(ordinal);
    }

    trace!("worker {ordinal} stopped");
}
