//! Waking the scheduler thread, and the cross-thread control mailbox.
//!
//! The loop parks its thread when nothing is runnable. Control surfaces
//! (mutators, injection, shutdown) may be driven from other threads; they
//! deposit commands in the mailbox and buzz the waker so the loop observes
//! them at the next iteration boundary.

use std::sync::{Mutex, MutexGuard};
use std::thread::Thread;

use crate::message::Message;
use crate::scheduling::Band;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Can unpark the scheduler thread, once armed.
#[derive(Default)]
pub(crate) struct Waker {
    thread: Mutex<Option<Thread>>,
}

impl Waker {
    /// Binds the waker to the calling thread.
    pub fn arm(&self) {
        *lock(&self.thread) = Some(std::thread::current());
    }

    /// Releases the binding when the loop exits.
    pub fn disarm(&self) {
        *lock(&self.thread) = None;
    }

    /// Unparks the bound thread, if any. Unparking before a park is
    /// remembered, so wakes are never lost.
    pub fn wake(&self) {
        if let Some(thread) = lock(&self.thread).as_ref() {
            thread.unpark();
        }
    }
}

/// A control command applied at an iteration boundary.
pub(crate) enum Command {
    /// Resize an edge's capacity.
    SetCapacity { edge: usize, capacity: usize },
    /// Move an edge to another priority band.
    SetPriority { edge: usize, band: Band },
    /// Deliver an externally injected message onto a synthetic input edge.
    Inject { edge: usize, message: Message },
}

/// A mutex-guarded queue of pending control commands.
#[derive(Default)]
pub(crate) struct Mailbox {
    commands: Mutex<Vec<Command>>,
}

impl Mailbox {
    /// Deposits a command for the next iteration boundary.
    pub fn push(&self, command: Command) {
        lock(&self.commands).push(command);
    }

    /// Moves all pending commands into `into`, preserving order.
    pub fn drain(&self, into: &mut Vec<Command>) {
        let mut commands = lock(&self.commands);
        into.append(&mut commands);
    }

    /// True when commands are waiting.
    pub fn is_pending(&self) -> bool {
        !lock(&self.commands).is_empty()
    }
}
