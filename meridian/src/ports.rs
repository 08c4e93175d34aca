//! Port descriptors and runtime payload schemas.
//!
//! Ports are the named attachment points of a node. A port may carry a
//! [`Schema`]: a cheap runtime predicate, optionally backed by a concrete
//! type tag, that every payload crossing the port must satisfy. Without a
//! schema, the port accepts anything.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::message::Payload;
use crate::policy::Policy;

/// Direction of a port relative to its node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Messages arrive here.
    Input,
    /// Messages leave from here.
    Output,
}

/// A runtime payload check attached to a port.
#[derive(Clone)]
pub struct Schema {
    label: String,
    type_tag: Option<TypeId>,
    check: Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>,
}

impl Schema {
    /// A schema admitting exactly payloads of type `T`.
    ///
    /// Carries a type tag, so two `of` schemas can be compared for
    /// compatibility at validation time.
    pub fn of<T: Any>() -> Self {
        Schema {
            label: std::any::type_name::<T>().to_owned(),
            type_tag: Some(TypeId::of::<T>()),
            check: Arc::new(|value| value.is::<T>()),
        }
    }

    /// A schema defined by an arbitrary predicate.
    ///
    /// Predicate schemas cannot be compared statically; they are enforced
    /// only at enqueue time.
    pub fn predicate<F>(label: impl Into<String>, check: F) -> Self
    where
        F: Fn(&dyn Any) -> bool + Send + Sync + 'static,
    {
        Schema {
            label: label.into(),
            type_tag: None,
            check: Arc::new(check),
        }
    }

    /// Human-readable description, used in diagnostics and issues.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether this schema admits the payload.
    pub fn admits(&self, payload: &Payload) -> bool {
        (self.check)(payload.as_ref())
    }

    /// Best-effort compatibility between a producer and a consumer schema.
    ///
    /// Two type-tagged schemas are compatible only when their tags agree;
    /// predicate schemas are assumed compatible and left to enqueue-time
    /// enforcement.
    pub fn compatible(&self, other: &Schema) -> bool {
        match (self.type_tag, other.type_tag) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").field("label", &self.label).finish()
    }
}

/// Describes one port of a node.
#[derive(Clone, Debug)]
pub struct PortSpec {
    name: String,
    schema: Option<Schema>,
    default_policy: Option<Policy>,
}

impl PortSpec {
    /// A port with no schema and no default policy.
    pub fn new(name: impl Into<String>) -> Self {
        PortSpec {
            name: name.into(),
            schema: None,
            default_policy: None,
        }
    }

    /// A port admitting exactly payloads of type `T`.
    ///
    /// # Examples
    ///
    /// ```
    /// use meridian::{Message, PortSpec};
    ///
    /// let port = PortSpec::typed::<u64>("in");
    /// assert!(port.validate(Message::data(3u64).payload()));
    /// assert!(!port.validate(Message::data("three").payload()));
    /// ```
    pub fn typed<T: Any>(name: impl Into<String>) -> Self {
        PortSpec::new(name).with_schema(Schema::of::<T>())
    }

    /// Attaches a schema.
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Attaches a default overflow policy, applied to edges connected to
    /// this port when the connection does not name one.
    pub fn with_default_policy(mut self, policy: Policy) -> Self {
        self.default_policy = Some(policy);
        self
    }

    /// The port name, unique per node side.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The attached schema, if any.
    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    /// The default overflow policy, if any.
    pub fn default_policy(&self) -> Option<&Policy> {
        self.default_policy.as_ref()
    }

    /// Whether the payload satisfies this port's schema. Ports without a
    /// schema admit everything.
    pub fn validate(&self, payload: &Payload) -> bool {
        self.schema.as_ref().map(|s| s.admits(payload)).unwrap_or(true)
    }
}

/// A directed port: direction plus descriptor. Appears in plan tables and
/// introspection output.
#[derive(Clone, Debug)]
pub struct Port {
    /// Which way messages flow through this port.
    pub direction: Direction,
    /// The port descriptor.
    pub spec: PortSpec,
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::message::Message;

    #[test]
    fn typed_schema_admits_and_rejects() {
        let schema = Schema::of::<i64>();
        assert!(schema.admits(Message::data(5i64).payload()));
        assert!(!schema.admits(Message::data(5u32).payload()));
    }

    #[test]
    fn predicate_schema() {
        let even = Schema::predicate("even u32", |v| {
            v.downcast_ref::<u32>().map(|n| n % 2 == 0).unwrap_or(false)
        });
        assert!(even.admits(Message::data(4u32).payload()));
        assert!(!even.admits(Message::data(3u32).payload()));
        assert!(!even.admits(Message::data("nope").payload()));
    }

    #[test]
    fn compatibility_rules() {
        let a = Schema::of::<String>();
        let b = Schema::of::<String>();
        let c = Schema::of::<u8>();
        let p = Schema::predicate("anything", |_| true);
        assert!(a.compatible(&b));
        assert!(!a.compatible(&c));
        assert!(a.compatible(&p));
        assert!(p.compatible(&c));
    }

    #[test]
    fn schemaless_port_admits_everything() {
        let port = PortSpec::new("in");
        assert!(port.validate(Message::data(()).payload()));
    }
}
