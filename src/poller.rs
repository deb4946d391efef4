//! epoll wrapper with a cross-thread wake channel.
//!
//! Each worker owns one `Poller`: an epoll instance, an eventfd registered
//! on it for read, and a pair of lock-free task queues (urgent, normal).
//! Any thread may enqueue a task and poke the eventfd; the owning worker
//! drains both queues from inside its poll loop. Wakes are coalesced: a
//! storm of enqueues produces at most one pending eventfd notification.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use log::{error, warn};

use crate::error::Error;
use crate::metrics;
use crate::queue::{Task, TaskQueue};

/// Read-readiness mask used for every registered FD.
pub(crate) const READ_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
/// Write-readiness mask.
pub(crate) const WRITE_EVENTS: u32 = libc::EPOLLOUT as u32;
const READ_WRITE_EVENTS: u32 = READ_EVENTS | WRITE_EVENTS;

/// Exceptional conditions epoll reports whether or not they were asked
/// for. EPOLLRDHUP fires when the peer shuts down its write half.
pub(crate) const ERR_EVENTS: u32 =
    (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;

/// Event classes the worker dispatches on.
pub(crate) const IN_EVENTS: u32 = ERR_EVENTS | READ_EVENTS;
pub(crate) const OUT_EVENTS: u32 = ERR_EVENTS | WRITE_EVENTS;

/// Capacity of the scratch array handed to `epoll_wait`.
const EVENTS_CAP: usize = 1024;

/// Cap on normal-priority tasks executed per drain pass. Urgent tasks
/// are always drained to exhaustion first.
const MAX_TASKS_ONCE: usize = 100;

/// What one poll iteration hands to the worker callback.
pub(crate) enum PollEvent {
    /// Readiness on a registered FD (never the wake eventfd).
    Io { fd: RawFd, events: u32 },
    /// A task drained from one of the queues, to be run by the owner.
    Task(Task),
}

pub(crate) struct Poller {
    epoll_fd: RawFd,
    event_fd: RawFd,
    urgent_task_queue: TaskQueue<Task>,
    task_queue: TaskQueue<Task>,
    /// 0 = worker will notice new tasks on its own, 1 = a wake is pending.
    wake_up_call: AtomicI32,
    closed: AtomicBool,
}

impl Poller {
    pub(crate) fn new() -> Result<Self, Error> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let event_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if event_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epoll_fd);
            }
            return Err(Error::Io(err));
        }

        let poller = Poller {
            epoll_fd,
            event_fd,
            urgent_task_queue: TaskQueue::new(),
            task_queue: TaskQueue::new(),
            wake_up_call: AtomicI32::new(0),
            closed: AtomicBool::new(false),
        };

        // The eventfd lives on the epoll set for the poller's lifetime.
        if let Err(e) = poller.add_read(poller.event_fd) {
            poller.close();
            return Err(Error::Io(e));
        }

        Ok(poller)
    }

    /// The single worker loop.
    ///
    /// Calls `epoll_wait` with a zero timeout, so the owning worker spins
    /// hot rather than parking. That buys the lowest possible dispatch
    /// latency at the price of a busy CPU; the eventfd registration keeps
    /// task delivery correct either way.
    ///
    /// Each iteration: dispatch ready FDs through `callback`, then, if
    /// the eventfd fired, drain the urgent queue to exhaustion and up to
    /// [`MAX_TASKS_ONCE`] normal tasks. `callback` errors are classified:
    /// [`Error::AcceptSocket`] and [`Error::ServerShutdown`] terminate
    /// the loop, anything else is logged and survived.
    pub(crate) fn polling(
        &self,
        mut callback: impl FnMut(PollEvent) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let mut events: Vec<libc::epoll_event> =
            vec![unsafe { std::mem::zeroed() }; EVENTS_CAP];
        let mut event_fd_buf = [0u8; 8];
        let mut task_ready = false;

        loop {
            let n = unsafe {
                libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), EVENTS_CAP as i32, 0)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                error!("epoll_wait failed: {err}");
                return Err(Error::Io(err));
            }
            if n == 0 {
                continue;
            }

            for ev in &events[..n as usize] {
                let fd = ev.u64 as RawFd;
                if fd == self.event_fd {
                    task_ready = true;
                    // One read zeroes the counter however many wakes
                    // accumulated.
                    unsafe {
                        libc::read(
                            self.event_fd,
                            event_fd_buf.as_mut_ptr() as *mut libc::c_void,
                            event_fd_buf.len(),
                        );
                    }
                } else {
                    match callback(PollEvent::Io {
                        fd,
                        events: ev.events,
                    }) {
                        Ok(()) => {}
                        Err(err @ (Error::AcceptSocket | Error::ServerShutdown)) => {
                            return Err(err);
                        }
                        Err(err) => warn!("event callback error on fd {fd}: {err}"),
                    }
                }
            }

            if task_ready {
                task_ready = false;

                while let Some(task) = self.urgent_task_queue.dequeue() {
                    match callback(PollEvent::Task(task)) {
                        Ok(()) => {}
                        Err(Error::ServerShutdown) => return Err(Error::ServerShutdown),
                        Err(err) => warn!("urgent task error: {err}"),
                    }
                    metrics::TASKS_EXECUTED.increment();
                }

                for _ in 0..MAX_TASKS_ONCE {
                    let Some(task) = self.task_queue.dequeue() else {
                        break;
                    };
                    match callback(PollEvent::Task(task)) {
                        Ok(()) => {}
                        Err(Error::ServerShutdown) => return Err(Error::ServerShutdown),
                        Err(err) => warn!("task error: {err}"),
                    }
                    metrics::TASKS_EXECUTED.increment();
                }

                self.wake_up_call.store(0, Ordering::Release);
                // Producers that raced the drain may have enqueued while
                // wake_up_call was still 1 and skipped the notification.
                // Re-arm on their behalf so nothing is orphaned.
                if (!self.task_queue.is_empty() || !self.urgent_task_queue.is_empty())
                    && self
                        .wake_up_call
                        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    && let Err(err) = self.notify()
                {
                    warn!("eventfd re-arm failed: {err}");
                    task_ready = true;
                }
            }
        }
    }

    /// Enqueue a task at urgent priority and wake the owning worker.
    pub(crate) fn add_urgent_task(&self, task: Task) -> Result<(), Error> {
        self.urgent_task_queue.enqueue(task);
        metrics::TASKS_ENQUEUED.increment();
        self.wake_up()
    }

    /// Enqueue a task at normal priority and wake the owning worker.
    pub(crate) fn add_task(&self, task: Task) -> Result<(), Error> {
        self.task_queue.enqueue(task);
        metrics::TASKS_ENQUEUED.increment();
        self.wake_up()
    }

    fn wake_up(&self) -> Result<(), Error> {
        if self
            .wake_up_call
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.notify().map_err(Error::Io)?;
        }
        Ok(())
    }

    fn notify(&self) -> io::Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.event_fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // EAGAIN means the counter is saturated: a notification is
            // already pending, which is all a wake needs.
            if err.raw_os_error() != Some(libc::EAGAIN) {
                return Err(err);
            }
            return Ok(());
        }
        metrics::POLLER_WAKEUPS.increment();
        Ok(())
    }

    // epoll_ctl wrappers. The masks are fixed; error conditions
    // (EPOLLERR | EPOLLHUP | EPOLLRDHUP) are reported regardless.

    pub(crate) fn add_read(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, READ_EVENTS)
    }

    #[allow(dead_code)]
    pub(crate) fn add_write(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, WRITE_EVENTS)
    }

    #[allow(dead_code)]
    pub(crate) fn add_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, READ_WRITE_EVENTS)
    }

    pub(crate) fn mod_read(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, READ_EVENTS)
    }

    #[allow(dead_code)]
    pub(crate) fn mod_write(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, WRITE_EVENTS)
    }

    pub(crate) fn mod_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, READ_WRITE_EVENTS)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        let ret =
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            warn!("epoll_ctl del fd {fd} failed: {err}");
            return Err(err);
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            warn!("epoll_ctl op {op} fd {fd} mask {mask:#x} failed: {err}");
            return Err(err);
        }
        Ok(())
    }

    /// Close the epoll and eventfd descriptors. Idempotent; called by the
    /// supervisor after the owning worker has been joined.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            unsafe {
                libc::close(self.epoll_fd);
                libc::close(self.event_fd);
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn noop_task() -> Task {
        Box::new(|_| Ok(()))
    }

    #[test]
    fn wake_is_coalesced() {
        let poller = Poller::new().unwrap();
        for _ in 0..32 {
            poller.add_task(noop_task()).unwrap();
        }
        assert_eq!(poller.wake_up_call.load(Ordering::Acquire), 1);

        // However many enqueues raced, exactly one notification is
        // readable; the next read would block.
        let mut buf = [0u8; 8];
        let n = unsafe {
            libc::read(poller.event_fd, buf.as_mut_ptr() as *mut libc::c_void, 8)
        };
        assert_eq!(n, 8);
        let n = unsafe {
            libc::read(poller.event_fd, buf.as_mut_ptr() as *mut libc::c_void, 8)
        };
        assert!(n < 0);
        assert_eq!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(libc::EAGAIN)
        );
    }

    #[test]
    fn polling_drains_tasks_and_exits_on_shutdown() {
        let poller = Arc::new(Poller::new().unwrap());
        let expected = 64usize;

        let producer = {
            let poller = Arc::clone(&poller);
            thread::spawn(move || {
                for _ in 0..expected {
                    poller.add_task(noop_task()).unwrap();
                }
                poller
                    .add_urgent_task(Box::new(|_| Err(Error::ServerShutdown)))
                    .unwrap();
            })
        };

        let seen = AtomicUsize::new(0);
        let result = poller.polling(|event| match event {
            PollEvent::Io { .. } => Ok(()),
            PollEvent::Task(_) => {
                // The poison is urgent and may overtake in-flight normal
                // tasks, so count it too and stop once everything landed.
                if seen.fetch_add(1, Ordering::Relaxed) + 1 == expected + 1 {
                    Err(Error::ServerShutdown)
                } else {
                    Ok(())
                }
            }
        });

        producer.join().unwrap();
        assert!(matches!(result, Err(Error::ServerShutdown)));
        assert_eq!(seen.load(Ordering::Relaxed), expected + 1);
        assert!(poller.task_queue.is_empty());
        assert!(poller.urgent_task_queue.is_empty());
    }

    #[test]
    fn polling_dispatches_io_readiness() {
        let poller = Poller::new().unwrap();

        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        assert_eq!(ret, 0);
        let (rd, wr) = (fds[0], fds[1]);
        poller.add_read(rd).unwrap();

        let payload = b"x";
        let n = unsafe { libc::write(wr, payload.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);

        let mut ready_fd = -1;
        let result = poller.polling(|event| match event {
            PollEvent::Io { fd, events } => {
                assert!(events & IN_EVENTS != 0);
                ready_fd = fd;
                Err(Error::ServerShutdown)
            }
            PollEvent::Task(_) => Ok(()),
        });

        assert!(matches!(result, Err(Error::ServerShutdown)));
        assert_eq!(ready_fd, rd);
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
