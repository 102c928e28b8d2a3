//! Immutable key/value labels describing the entity producing spans.

use crate::{Key, KeyValue, Value};
use std::collections::{btree_map, BTreeMap};

/// Key under which [`ResourceBuilder::with_service_name`] stores its value.
pub const SERVICE_NAME: Key = Key::from_static_str("service.name");

/// An immutable set of attributes identifying the entity producing telemetry,
/// e.g. the service name and version of the instrumented process.
///
/// A `Resource` is attached to the provider configuration once and stamped on
/// every exported span; it never changes afterwards.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resource {
    attrs: BTreeMap<Key, Value>,
}

impl Resource {
    /// A resource with no attributes.
    pub fn empty() -> Self {
        Resource::default()
    }

    /// Create a resource from the given attributes, last write per key wins.
    pub fn new<T: IntoIterator<Item = KeyValue>>(kvs: T) -> Self {
        let mut attrs = BTreeMap::new();
        for kv in kvs {
            attrs.insert(kv.key, kv.value);
        }
        Resource { attrs }
    }

    /// Start building a resource.
    pub fn builder() -> ResourceBuilder {
        ResourceBuilder::default()
    }

    /// Retrieve the value for the given key, if set.
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.attrs.get(key)
    }

    /// Iterate over the attributes in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, Key, Value> {
        self.attrs.iter()
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// Whether this resource carries no attributes.
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Create a new resource combining `self` and `other`, with `other`
    /// taking precedence on key conflicts.
    pub fn merge(&self, other: &Resource) -> Resource {
        let mut attrs = self.attrs.clone();
        for (k, v) in other.attrs.iter() {
            attrs.insert(k.clone(), v.clone());
        }
        Resource { attrs }
    }
}

impl<'a> IntoIterator for &'a Resource {
    type Item = (&'a Key, &'a Value);
    type IntoIter = btree_map::Iter<'a, Key, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.attrs.iter()
    }
}

/// Builder for [`Resource`].
#[derive(Debug, Default)]
pub struct ResourceBuilder {
    attrs: Vec<KeyValue>,
}

impl ResourceBuilder {
    /// Add the conventional `service.name` attribute.
    pub fn with_service_name(self, name: impl Into<Value>) -> Self {
        self.with_attribute(KeyValue {
            key: SERVICE_NAME,
            value: name.into(),
        })
    }

    /// Add a single attribute.
    pub fn with_attribute(mut self, kv: KeyValue) -> Self {
        self.attrs.push(kv);
        self
    }

    /// Add multiple attributes.
    pub fn with_attributes<T: IntoIterator<Item = KeyValue>>(mut self, kvs: T) -> Self {
        self.attrs.extend(kvs);
        self
    }

    /// Finish building the resource.
    pub fn build(self) -> Resource {
        Resource::new(self.attrs)
    }
}
