//! Buffered, typed event streams.
//!
//! A [`Registry`] binds stream names to actions on batches of timestamped
//! events, and hands out cloneable [`Logger`] handles. Timestamps are
//! durations since an instant common to every stream in the registry, so
//! events from different streams can be interleaved by time.

#![warn(missing_docs)]

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Number of buffered events before a logger flushes on its own.
const BUFFER_CAPACITY: usize = 1024;

/// A map from stream names to typed event loggers.
pub struct Registry {
    /// An instant common to all streams in this registry.
    time: Instant,
    map: HashMap<String, Entry>,
}

struct Entry {
    logger: Box<dyn Any>,
    flush: Box<dyn Fn()>,
}

impl Registry {
    /// Creates a new registry whose streams all measure time from `time`.
    pub fn new(time: Instant) -> Self {
        Registry {
            time,
            map: HashMap::new(),
        }
    }

    /// Binds a stream name to an action on batches of logged events.
    ///
    /// Returns any previously installed logger rather than overwriting it
    /// mid-stream: handles already cloned from the old logger keep writing
    /// to the old destination, while new calls to [`Registry::get`] observe
    /// the new one.
    ///
    /// The action is called with a timestamp that lower-bounds all events
    /// that may still arrive, and the batch of events logged since the last
    /// call. The end of a stream is indicated by an empty final batch when
    /// the last handle is dropped.
    pub fn insert<E: 'static, F>(&mut self, name: &str, action: F) -> Option<Box<dyn Any>>
    where
        F: FnMut(&Duration, &[(Duration, E)]) + 'static,
    {
        let logger = Logger::<E>::new(self.time, action);
        let flusher = logger.clone();
        let entry = Entry {
            logger: Box::new(logger),
            flush: Box::new(move || flusher.flush()),
        };
        self.map.insert(name.to_owned(), entry).map(|e| e.logger)
    }

    /// Removes a bound stream, closing it once all handles are dropped.
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Any>> {
        self.map.remove(name).map(|e| e.logger)
    }

    /// Retrieves a handle to a bound stream, if the types line up.
    pub fn get<E: 'static>(&self, name: &str) -> Option<Logger<E>> {
        self.map
            .get(name)
            .and_then(|entry| entry.logger.downcast_ref::<Logger<E>>())
            .cloned()
    }

    /// Flushes all bound streams.
    pub fn flush(&mut self) {
        for entry in self.map.values() {
            (entry.flush)();
        }
    }
}

/// A buffering logger for a single typed event stream.
///
/// Events are stamped with the elapsed duration since the registry's common
/// instant at the moment of logging, and delivered to the bound action when
/// the buffer fills, on [`Logger::flush`], or when the last handle drops.
pub struct Logger<E> {
    time: Instant,
    inner: Rc<RefCell<LoggerInner<E>>>,
}

struct LoggerInner<E> {
    action: Box<dyn FnMut(&Duration, &[(Duration, E)])>,
    buffer: Vec<(Duration, E)>,
}

impl<E> Clone for Logger<E> {
    fn clone(&self) -> Self {
        Logger {
            time: self.time,
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<E> Logger<E> {
    /// Allocates a new shareable logger bound to a write destination.
    pub fn new<F>(time: Instant, action: F) -> Self
    where
        F: FnMut(&Duration, &[(Duration, E)]) + 'static,
    {
        Logger {
            time,
            inner: Rc::new(RefCell::new(LoggerInner {
                action: Box::new(action),
                buffer: Vec::with_capacity(BUFFER_CAPACITY),
            })),
        }
    }

    /// Logs an event.
    ///
    /// The event is stamped now but may be delivered later, when the buffer
    /// fills or the logger is flushed.
    pub fn log<T: Into<E>>(&self, event: T) {
        let elapsed = self.time.elapsed();
        let mut inner = self.inner.borrow_mut();
        inner.buffer.push((elapsed, event.into()));
        if inner.buffer.len() == inner.buffer.capacity() {
            inner.deliver(&self.time.elapsed());
        }
    }

    /// Delivers buffered events and communicates the new lower bound.
    pub fn flush(&self) {
        self.inner.borrow_mut().deliver(&self.time.elapsed());
    }
}

impl<E> LoggerInner<E> {
    fn deliver(&mut self, lower_bound: &Duration) {
        (self.action)(lower_bound, &self.buffer[..]);
        self.buffer.clear();
    }
}

impl<E> Drop for LoggerInner<E> {
    fn drop(&mut self) {
        // Final delivery; an empty batch marks the end of the stream.
        let bound = self.buffer.last().map(|(t, _)| *t).unwrap_or_default();
        (self.action)(&bound, &self.buffer[..]);
    }
}
