// Copyright 2025 The Kindling Developers.
// SPDX-License-Identifier: Apache-2.0

//! The machine's dedicated I/O worker.
//!
//! One long-lived thread multiplexes two kinds of work: readiness polling on
//! registered file descriptors (event fd fast paths) and asynchronous file
//! operations queued by devices. All callbacks run on the worker thread and
//! may re-enter the device manager.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{error, warn};
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::EventFd;

const EVENT_BUFFER_SIZE: usize = 64;

/// Invoked on the worker thread whenever the registered fd becomes ready.
pub type PollCallback = Box<dyn FnMut(EventSet) + Send>;

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum IoThreadError {
    /// Cannot create the epoll fd: {0}
    EpollCreate(io::Error),
    /// Cannot create the wakeup eventfd: {0}
    EventFd(io::Error),
    /// Polling I/O error: {0}
    Poll(io::Error),
    /// A poll handler for fd {0} is already registered
    AlreadyRegistered(RawFd),
    /// No poll handler is registered for fd {0}
    NotRegistered(RawFd),
    /// The worker thread is already running
    AlreadyRunning,
    /// Cannot spawn the worker thread: {0}
    Spawn(io::Error),
}

enum IoJob {
    Read {
        fd: RawFd,
        length: usize,
        offset: u64,
        complete: Box<dyn FnOnce(io::Result<Vec<u8>>) + Send>,
    },
    Write {
        fd: RawFd,
        data: Vec<u8>,
        offset: u64,
        complete: Box<dyn FnOnce(io::Result<usize>) + Send>,
    },
    Fsync {
        fd: RawFd,
        complete: Box<dyn FnOnce(io::Result<()>) + Send>,
    },
}

/// The I/O worker. Construction creates the poller; [`IoThread::start`]
/// spawns the thread. Registration is allowed before the thread runs, so
/// devices can install their fast paths while the machine is still being
/// wired together.
pub struct IoThread {
    epoll: Epoll,
    handlers: Mutex<HashMap<RawFd, Arc<Mutex<PollCallback>>>>,
    jobs: Mutex<VecDeque<IoJob>>,
    wakeup: EventFd,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IoThread {
    pub fn new() -> Result<IoThread, IoThreadError> {
        let epoll = Epoll::new().map_err(IoThreadError::EpollCreate)?;
        let wakeup = EventFd::new(0).map_err(IoThreadError::EventFd)?;
        epoll
            .ctl(
                ControlOperation::Add,
                wakeup.as_raw_fd(),
                EpollEvent::new(EventSet::IN, wakeup.as_raw_fd() as u64),
            )
            .map_err(IoThreadError::Poll)?;
        Ok(IoThread {
            epoll,
            handlers: Mutex::new(HashMap::new()),
            jobs: Mutex::new(VecDeque::new()),
            wakeup,
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    /// Spawns the worker thread.
    pub fn start(self: Arc<Self>) -> Result<(), IoThreadError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(IoThreadError::AlreadyRunning);
        }
        let worker = Arc::clone(&self);
        let thread = std::thread::Builder::new()
            .name("io-thread".to_string())
            .spawn(move || worker.poll_loop())
            .map_err(IoThreadError::Spawn)?;
        *self.thread.lock().expect("Poisoned lock") = Some(thread);
        Ok(())
    }

    /// Stops the worker and joins it. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.wakeup.write(1);
        if let Some(thread) = self.thread.lock().expect("Poisoned lock").take() {
            let _ = thread.join();
        }
    }

    /// Registers `callback` to run whenever `fd` is ready for `events`.
    pub fn start_polling(
        &self,
        fd: RawFd,
        events: EventSet,
        callback: PollCallback,
    ) -> Result<(), IoThreadError> {
        let mut handlers = self.handlers.lock().expect("Poisoned lock");
        if handlers.contains_key(&fd) {
            return Err(IoThreadError::AlreadyRegistered(fd));
        }
        self.epoll
            .ctl(ControlOperation::Add, fd, EpollEvent::new(events, fd as u64))
            .map_err(IoThreadError::Poll)?;
        handlers.insert(fd, Arc::new(Mutex::new(callback)));
        Ok(())
    }

    /// Unregisters `fd` and drains any in-flight invocation of its callback
    /// before returning, so the caller may free whatever the callback
    /// captures. Must not be called from inside that same callback.
    pub fn stop_polling(&self, fd: RawFd) -> Result<(), IoThreadError> {
        let callback = self
            .handlers
            .lock()
            .expect("Poisoned lock")
            .remove(&fd)
            .ok_or(IoThreadError::NotRegistered(fd))?;
        self.epoll
            .ctl(ControlOperation::Delete, fd, EpollEvent::default())
            .map_err(IoThreadError::Poll)?;
        drop(callback.lock().expect("Poisoned lock"));
        Ok(())
    }

    /// Queues an asynchronous positional read of `length` bytes. The
    /// completion runs on the worker thread once the thread is started.
    pub fn read_at(
        &self,
        fd: RawFd,
        length: usize,
        offset: u64,
        complete: Box<dyn FnOnce(io::Result<Vec<u8>>) + Send>,
    ) {
        self.push_job(IoJob::Read {
            fd,
            length,
            offset,
            complete,
        });
    }

    /// Queues an asynchronous positional write of `data`.
    pub fn write_at(
        &self,
        fd: RawFd,
        data: Vec<u8>,
        offset: u64,
        complete: Box<dyn FnOnce(io::Result<usize>) + Send>,
    ) {
        self.push_job(IoJob::Write {
            fd,
            data,
            offset,
            complete,
        });
    }

    /// Queues an fsync of `fd`.
    pub fn fsync(&self, fd: RawFd, complete: Box<dyn FnOnce(io::Result<()>) + Send>) {
        self.push_job(IoJob::Fsync { fd, complete });
    }

    fn push_job(&self, job: IoJob) {
        self.jobs.lock().expect("Poisoned lock").push_back(job);
        let _ = self.wakeup.write(1);
    }

    fn poll_loop(&self) {
        let mut events = vec![EpollEvent::default(); EVENT_BUFFER_SIZE];
        while self.running.load(Ordering::SeqCst) {
            let count = match self.epoll.wait(-1, &mut events[..]) {
                Ok(count) => count,
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => {
                    error!("io-thread: epoll wait failed: {err}");
                    break;
                }
            };
            for event in &events[..count] {
                let fd = event.fd();
                if fd == self.wakeup.as_raw_fd() {
                    let _ = self.wakeup.read();
                    continue;
                }
                // Clone the handler out so the registry lock is not held
                // while the callback runs; the callback's own mutex is what
                // `stop_polling` synchronizes against.
                let callback = self
                    .handlers
                    .lock()
                    .expect("Poisoned lock")
                    .get(&fd)
                    .cloned();
                match callback {
                    Some(callback) => {
                        (callback.lock().expect("Poisoned lock"))(event.event_set())
                    }
                    None => warn!("io-thread: event on unregistered fd {fd}"),
                }
            }
            self.drain_jobs();
        }
    }

    fn drain_jobs(&self) {
        loop {
            let job = self.jobs.lock().expect("Poisoned lock").pop_front();
            match job {
                Some(job) => Self::execute_job(job),
                None => break,
            }
        }
    }

    fn execute_job(job: IoJob) {
        match job {
            IoJob::Read {
                fd,
                length,
                offset,
                complete,
            } => {
                let mut buffer = vec![0u8; length];
                // SAFETY: the buffer is live and at least `length` bytes.
                let ret = unsafe {
                    libc::pread(fd, buffer.as_mut_ptr().cast(), length, offset as libc::off_t)
                };
                if ret < 0 {
                    complete(Err(io::Error::last_os_error()));
                } else {
                    buffer.truncate(ret as usize);
                    complete(Ok(buffer));
                }
            }
            IoJob::Write {
                fd,
                data,
                offset,
                complete,
            } => {
                // SAFETY: the buffer is live and at least `data.len()` bytes.
                let ret = unsafe {
                    libc::pwrite(fd, data.as_ptr().cast(), data.len(), offset as libc::off_t)
                };
                if ret < 0 {
                    complete(Err(io::Error::last_os_error()));
                } else {
                    complete(Ok(ret as usize));
                }
            }
            IoJob::Fsync { fd, complete } => {
                // SAFETY: fsync takes no pointers; the fd is the caller's.
                let ret = unsafe { libc::fsync(fd) };
                if ret < 0 {
                    complete(Err(io::Error::last_os_error()));
                } else {
                    complete(Ok(()));
                }
            }
        }
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for IoThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoThread")
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
