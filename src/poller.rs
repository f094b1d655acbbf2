//! A thin, thread-safe layer over `epoll`.
//!
//! Every descriptor is registered edge-triggered. Descriptors registered in
//! [`Mode::OneShot`] are disabled by the kernel after one delivered event and
//! stay silent until [`Poller::rearm`] is called. The poller mirrors that in
//! its own registration table: a delivered one-shot descriptor is marked
//! [`State::Dispatched`] and its payload (usually the connection itself) is
//! moved out to the caller. Getting the payload back into the table is the
//! only way to re-arm, so a descriptor can be owned by at most one worker.

use std::{
    collections::HashMap,
    io,
    os::fd::RawFd,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use epoll::{ControlOptions::*, Event, Events};
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// How a registration behaves after an event has been delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Reported once per readiness transition, forever.
    Edge,
    /// Reported once, then disabled until re-armed.
    OneShot,
}

/// Where a registered descriptor currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for the kernel to report readiness.
    Armed,
    /// Delivered by [`Poller::wait`] and not re-armed yet.
    Dispatched,
}

/// What the kernel reported for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Readable,
    Hangup,
    Error,
}

impl EventKind {
    fn from_bits(bits: u32) -> Self {
        let events = Events::from_bits_truncate(bits);

        // Readable wins over hangup: a peer that wrote and then closed still
        // has bytes for us, and the following read will see the EOF anyway.
        if events.contains(Events::EPOLLERR) {
            EventKind::Error
        } else if events.contains(Events::EPOLLIN) {
            EventKind::Readable
        } else if events.intersects(Events::EPOLLHUP | Events::EPOLLRDHUP) {
            EventKind::Hangup
        } else {
            // Only readability is ever requested.
            EventKind::Readable
        }
    }
}

/// One entry of the batch returned by [`Poller::wait`].
#[derive(Debug)]
pub struct Ready<T> {
    pub fd: RawFd,
    pub kind: EventKind,
    /// The parked payload of a one-shot registration. Always `None` for edge
    /// registrations, which keep their payload in the table.
    pub payload: Option<T>,
}

struct Registration<T> {
    mode: Mode,
    state: State,
    payload: Option<T>,
}

impl<T> Registration<T> {
    fn flags(&self) -> Events {
        let mut flags = Events::EPOLLIN | Events::EPOLLET;
        if self.mode == Mode::OneShot {
            flags |= Events::EPOLLONESHOT;
        }
        flags
    }
}

pub struct Poller<T> {
    epoll: RawFd,
    capacity: usize,
    registrations: Mutex<HashMap<RawFd, Registration<T>>>,
}

impl<T> Poller<T> {
    /// Creates an epoll instance that reports at most `capacity` descriptors
    /// per call to [`wait`](Poller::wait).
    pub fn new(capacity: usize) -> Result<Self> {
        let epoll = epoll::create(true).map_err(Error::Poll)?;

        Ok(Poller {
            epoll,
            capacity: capacity.max(1),
            registrations: Mutex::new(HashMap::new()),
        })
    }

    /// Adds `fd` to the notification set, watching for readability.
    ///
    /// Fails if the kernel rejects the descriptor or if it is already
    /// registered in [`Mode::Edge`]. An existing one-shot registration for
    /// the same descriptor is replaced and re-armed; the payload it held, if
    /// any, is handed back.
    pub fn register(
        &self,
        fd: RawFd,
        mode: Mode,
        payload: Option<T>,
    ) -> Result<Option<T>> {
        let mut table = self.table();

        let registration = Registration {
            mode,
            state: State::Armed,
            payload,
        };
        let event = Event::new(registration.flags(), fd as u64);

        match table.get(&fd).map(|existing| existing.mode) {
            Some(Mode::Edge) => {
                return Err(Error::registration(fd, "already registered"))
            }
            Some(Mode::OneShot) => {
                epoll::ctl(self.epoll, EPOLL_CTL_MOD, fd, event)
                    .map_err(|err| Error::registration(fd, err))?;
            }
            None => {
                epoll::ctl(self.epoll, EPOLL_CTL_ADD, fd, event)
                    .map_err(|err| Error::registration(fd, err))?;
            }
        }

        trace!(fd, ?mode, "registered");
        let displaced = table.insert(fd, registration);
        Ok(displaced.and_then(|old| old.payload))
    }

    /// Re-enables delivery for a one-shot descriptor that was handed out by
    /// [`wait`](Poller::wait), parking `payload` until the next event.
    ///
    /// If the kernel refuses the modification the registration is dropped
    /// along with the payload.
    pub fn rearm(&self, fd: RawFd, payload: T) -> Result<()> {
        let mut table = self.table();

        let Some(registration) = table.get_mut(&fd) else {
            return Err(Error::registration(fd, "not registered"));
        };
        if registration.mode != Mode::OneShot {
            return Err(Error::registration(fd, "not a one-shot registration"));
        }
        if registration.state != State::Dispatched {
            return Err(Error::registration(fd, "already armed"));
        }

        registration.state = State::Armed;
        registration.payload = Some(payload);
        let event = Event::new(registration.flags(), fd as u64);

        if let Err(err) = epoll::ctl(self.epoll, EPOLL_CTL_MOD, fd, event) {
            table.remove(&fd);
            return Err(Error::registration(fd, err));
        }

        trace!(fd, "re-armed");
        Ok(())
    }

    /// Removes `fd` from the notification set and returns whatever payload
    /// was parked for it.
    ///
    /// Call this before closing the descriptor: the kernel forgets closed
    /// descriptors on its own, this table does not.
    pub fn deregister(&self, fd: RawFd) -> Result<Option<T>> {
        let mut table = self.table();

        let Some(registration) = table.remove(&fd) else {
            return Err(Error::registration(fd, "not registered"));
        };

        // The descriptor may already be gone from the kernel's set if it was
        // closed behind our back. The table entry is what matters here.
        let event = Event::new(Events::empty(), 0);
        match epoll::ctl(self.epoll, EPOLL_CTL_DEL, fd, event) {
            Ok(()) => {}
            Err(err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc::ENOENT) | Some(libc::EBADF)
                ) => {}
            Err(err) => return Err(Error::registration(fd, err)),
        }

        trace!(fd, "deregistered");
        Ok(registration.payload)
    }

    /// Blocks until at least one registered descriptor is ready or `timeout`
    /// elapses (`None` waits forever).
    ///
    /// Delivered one-shot descriptors move to [`State::Dispatched`] and their
    /// payload moves into the returned batch. An interrupted wait returns an
    /// empty batch.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Ready<T>>> {
        let mut events = vec![Event::new(Events::empty(), 0); self.capacity];
        let timeout = match timeout {
            Some(timeout) => timeout.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };

        let num_events = match epoll::wait(self.epoll, timeout, &mut events) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(Error::Poll(err)),
        };

        // Workers re-arm under this lock, so any event we see here was
        // produced after the matching registration change became visible.
        let mut table = self.table();
        let mut ready = Vec::with_capacity(num_events);

        for event in &events[..num_events] {
            let fd = event.data as RawFd;
            let kind = EventKind::from_bits(event.events);

            let Some(registration) = table.get_mut(&fd) else {
                trace!(fd, "event for a descriptor that is gone");
                continue;
            };

            let payload = match registration.mode {
                Mode::Edge => None,
                Mode::OneShot => {
                    if registration.state == State::Dispatched {
                        warn!(fd, "event for a dispatched descriptor dropped");
                        continue;
                    }
                    registration.state = State::Dispatched;
                    registration.payload.take()
                }
            };

            ready.push(Ready { fd, kind, payload });
        }

        Ok(ready)
    }

    /// The current state of `fd`, if it is registered.
    pub fn state(&self, fd: RawFd) -> Option<State> {
        self.table().get(&fd).map(|registration| registration.state)
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RawFd, Registration<T>>> {
        // Every mutation completes before the guard drops, so a panic in
        // another thread cannot leave a half-written entry behind.
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Drop for Poller<T> {
    fn drop(&mut self) {
        if let Err(err) = epoll::close(self.epoll) {
            warn!("failed to close epoll instance: {err}");
        }
    }
}
