use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use tokio::sync::{broadcast, watch};

const CHANGE_CAPACITY: usize = 256;

/// Name of an attribute together with the type its value decodes to.
pub struct AttributeKey<T> {
    name: Cow<'static, str>,
    _value: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            _value: PhantomData,
        }
    }

    /// Key whose name is only known at runtime, e.g. read from a deployment descriptor.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> PartialEq for AttributeKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<T> Eq for AttributeKey<T> {}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttributeKey({})", self.name)
    }
}

impl<T> fmt::Display for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AttributeChange {
    pub name: String,
    pub value: JsonValue,
}

pub type AttributeMap = BTreeMap<String, JsonValue>;

/// Last-write-wins attribute values with change notification.
///
/// Values live behind a `watch` channel so callers can suspend until an attribute
/// satisfies a predicate; every effective change is also broadcast as an
/// [`AttributeChange`] for subscribers that react to individual updates.
pub struct AttributeStore {
    values: watch::Sender<AttributeMap>,
    changes: broadcast::Sender<AttributeChange>,
}

impl Default for AttributeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeStore {
    pub fn new() -> Self {
        let (values, _) = watch::channel(AttributeMap::new());
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self { values, changes }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &AttributeKey<T>) -> Option<T> {
        let value = self.get_raw(key.name())?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                tracing::warn!(
                    attribute = key.name(),
                    error = %err,
                    "attribute value does not decode to the requested type"
                );
                None
            }
        }
    }

    pub fn get_raw(&self, name: &str) -> Option<JsonValue> {
        self.values
            .borrow()
            .get(name)
            .filter(|value| !value.is_null())
            .cloned()
    }

    /// Stores `value`; returns `false` when the attribute already held an equal value.
    pub fn set<T: Serialize>(&self, key: &AttributeKey<T>, value: T) -> bool {
        match serde_json::to_value(value) {
            Ok(encoded) => self.set_raw(key.name(), encoded),
            Err(err) => {
                tracing::warn!(
                    attribute = key.name(),
                    error = %err,
                    "attribute value cannot be encoded; update dropped"
                );
                false
            }
        }
    }

    pub fn set_raw(&self, name: &str, value: JsonValue) -> bool {
        let changed = self.values.send_if_modified(|values| {
            if values.get(name) == Some(&value) {
                false
            } else {
                values.insert(name.to_string(), value.clone());
                true
            }
        });

        if changed {
            // No subscribers is not an error.
            let _ = self.changes.send(AttributeChange {
                name: name.to_string(),
                value,
            });
        }
        changed
    }

    pub fn clear(&self, name: &str) -> bool {
        self.set_raw(name, JsonValue::Null)
    }

    pub fn snapshot(&self) -> AttributeMap {
        self.values
            .borrow()
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    pub fn watch(&self) -> watch::Receiver<AttributeMap> {
        self.values.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AttributeChange> {
        self.changes.subscribe()
    }
}

/// Truthiness used when waiting for an attribute to become "ready".
pub fn is_ready_value(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(flag) => *flag,
        JsonValue::String(text) => !text.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(entries) => !entries.is_empty(),
        JsonValue::Number(_) => true,
    }
}
