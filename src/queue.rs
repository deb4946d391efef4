//! Lock-free FIFO used to hand deferred work to a poller from any thread.
//!
//! Michael–Scott queue: a linked list with a permanent sentinel node and
//! CAS loops on `head`, `tail`, and `tail.next`. Many producers may
//! enqueue concurrently; the owning worker drains. Dequeued nodes are
//! reclaimed through epoch-based deferred destruction, so a producer that
//! still holds a reference to a node can never observe freed memory.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicI32, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};

use crate::error::Error;
use crate::event_loop::EventLoop;

/// A deferred work item executed on the worker thread that drains it.
///
/// The closure captures whatever the work needs. Returning
/// [`Error::ServerShutdown`] breaks the draining worker out of its poll
/// loop.
pub(crate) type Task = Box<dyn FnOnce(&mut EventLoop) -> Result<(), Error> + Send + 'static>;

struct Node<T> {
    /// Uninitialized in the sentinel; moved out by the winning dequeuer.
    value: MaybeUninit<T>,
    next: Atomic<Node<T>>,
}

/// Unbounded MPSC FIFO.
///
/// `len` is advisory: it trails the structural state by design and is
/// only good enough for [`is_empty`](TaskQueue::is_empty) checks.
pub(crate) struct TaskQueue<T> {
    head: Atomic<Node<T>>,
    tail: Atomic<Node<T>>,
    len: AtomicI32,
}

// Safety: values are moved in whole through the queue; nodes are shared
// only via the epoch-protected atomics above.
unsafe impl<T: Send> Send for TaskQueue<T> {}
unsafe impl<T: Send> Sync for TaskQueue<T> {}

impl<T> TaskQueue<T> {
    pub(crate) fn new() -> Self {
        let queue = TaskQueue {
            head: Atomic::null(),
            tail: Atomic::null(),
            len: AtomicI32::new(0),
        };
        let guard = unsafe { epoch::unprotected() };
        let sentinel = Owned::new(Node {
            value: MaybeUninit::uninit(),
            next: Atomic::null(),
        })
        .into_shared(guard);
        queue.head.store(sentinel, Ordering::Relaxed);
        queue.tail.store(sentinel, Ordering::Relaxed);
        queue
    }

    /// Append a value at the tail. Lock-free; callable from any thread.
    pub(crate) fn enqueue(&self, value: T) {
        let guard = &epoch::pin();
        let node = Owned::new(Node {
            value: MaybeUninit::new(value),
            next: Atomic::null(),
        })
        .into_shared(guard);

        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, guard);

            // Tail moved under us; start over.
            if tail != self.tail.load(Ordering::Acquire, guard) {
                continue;
            }

            if next.is_null() {
                if tail_ref
                    .next
                    .compare_exchange(
                        Shared::null(),
                        node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    )
                    .is_ok()
                {
                    // Advisory swing; a helper may already have done it.
                    let _ = self.tail.compare_exchange(
                        tail,
                        node,
                        Ordering::Release,
                        Ordering::Relaxed,
                        guard,
                    );
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            } else {
                // Tail is lagging; help it forward before retrying.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
            }
        }
    }

    /// Pop the oldest value, or `None` when the queue is empty.
    pub(crate) fn dequeue(&self) -> Option<T> {
        let guard = &epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            let tail = self.tail.load(Ordering::Acquire, guard);
            let head_ref = unsafe { head.deref() };
            let next = head_ref.next.load(Ordering::Acquire, guard);

            if head != self.head.load(Ordering::Acquire, guard) {
                continue;
            }

            if head == tail {
                if next.is_null() {
                    return None;
                }
                // A producer finished linking but not swinging; help.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
            } else if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                self.len.fetch_sub(1, Ordering::Relaxed);
                // Only the winning CAS reads the slot; the node it came
                // from is the new sentinel, so its slot is dead after this.
                let value = unsafe { next.deref().value.assume_init_read() };
                unsafe { guard.defer_destroy(head) };
                return Some(value);
            }
        }
    }

    /// Advisory emptiness check.
    pub(crate) fn is_empty(&self) -> bool {
        self.len.load(Ordering::Acquire) == 0
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> i32 {
        self.len.load(Ordering::Acquire)
    }
}

impl<T> Drop for TaskQueue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
        // Free the final sentinel; nobody can race a queue being dropped.
        unsafe {
            let guard = epoch::unprotected();
            let sentinel = self.head.load(Ordering::Relaxed, guard);
            drop(sentinel.into_owned());
        }
    }
}
