//! Tracing seam.
//!
//! The scheduler opens a span around every hook invocation and propagates
//! the message trace id to the installed [`Tracer`]. The default
//! [`NoopTracer`] makes all of this free; a real backend plugs in at
//! scheduler construction.

use std::any::Any;

/// A span in progress. Dropping the value ends the span.
pub struct Span {
    _guard: Option<Box<dyn Any>>,
}

impl Span {
    /// A span that tracks nothing.
    pub fn noop() -> Self {
        Span { _guard: None }
    }

    /// Wraps a backend guard whose drop ends the span.
    pub fn from_guard(guard: Box<dyn Any>) -> Self {
        Span { _guard: Some(guard) }
    }
}

/// A pluggable trace backend.
///
/// All methods default to no-ops so minimal backends implement only what
/// they need.
pub trait Tracer {
    /// Opens a span; the returned guard ends it on drop.
    fn start_span(&self, name: &'static str, attrs: &[(&'static str, &str)]) -> Span {
        let _ = (name, attrs);
        Span::noop()
    }

    /// Installs the trace id of the message about to be processed.
    fn set_trace_id(&self, trace_id: &str) {
        let _ = trace_id;
    }

    /// The currently installed trace id, if any.
    fn get_trace_id(&self) -> Option<String> {
        None
    }
}

/// The default tracer: spans and trace ids go nowhere.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}

#[cfg(test)]
mod tests {

    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recording {
        spans: Rc<RefCell<Vec<&'static str>>>,
        trace: Rc<RefCell<Option<String>>>,
    }

    impl Tracer for Recording {
        fn start_span(&self, name: &'static str, _attrs: &[(&'static str, &str)]) -> Span {
            self.spans.borrow_mut().push(name);
            Span::noop()
        }
        fn set_trace_id(&self, trace_id: &str) {
            *self.trace.borrow_mut() = Some(trace_id.to_owned());
        }
        fn get_trace_id(&self) -> Option<String> {
            self.trace.borrow().clone()
        }
    }

    #[test]
    fn custom_tracer_observes_calls() {
        let tracer = Recording {
            spans: Rc::new(RefCell::new(Vec::new())),
            trace: Rc::new(RefCell::new(None)),
        };
        let _span = tracer.start_span("node.on_message", &[("node", "a")]);
        tracer.set_trace_id("t-1");
        assert_eq!(tracer.get_trace_id().as_deref(), Some("t-1"));
        assert_eq!(&*tracer.spans.borrow(), &["node.on_message"]);
    }

    #[test]
    fn noop_tracer_is_silent() {
        let tracer = NoopTracer;
        let _span = tracer.start_span("x", &[]);
        tracer.set_trace_id("y");
        assert_eq!(tracer.get_trace_id(), None);
    }
}
