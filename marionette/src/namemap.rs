//! Process-local keyed store shared by the puppets of one rank.
//!
//! A name is either a slot (last write wins, reads copy) or a FIFO queue
//! (writes append, reads pop). A name never refers to both.

mod value;
pub mod wire;


pub use value::{Array, FromValue, Value};

use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameMapError {
    #[error("No value stored under {0}")]
    Missing(String),
    #[error("Queue {0} is empty")]
    EmptyQueue(String),
    #[error("Value under {name} is a {found}, not a {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Default)]
pub struct NameMap {
    values: BTreeMap<String, Value>,
    queues: BTreeMap<String, VecDeque<Value>>,
    /// last value handed to hosted code per name, keeps popped arrays alive
    retained: BTreeMap<String, Value>,
}

impl NameMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the queue called `name` if there is one, otherwise overwrite the slot.
    pub fn add(&mut self, name: &str, value: Value) {
        trace!(kind = value.kind(), "Saving {name}");
        match self.queues.get_mut(name) {
            Some(queue) => queue.push_back(value),
            None => {
                self.values.insert(name.to_string(), value);
            }
        }
    }

    /// Pop the oldest entry of a queue, or copy the slot value.
    pub fn get(&mut self, name: &str) -> Result<Value, NameMapError> {
        if let Some(queue) = self.queues.get_mut(name) {
            return queue
                .pop_front()
                .ok_or_else(|| NameMapError::EmptyQueue(name.to_string()));
        }

        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| NameMapError::Missing(name.to_string()))
    }

    pub fn get_as<T: FromValue>(&mut self, name: &str) -> Result<T, NameMapError> {
        let value = self.get(name)?;
        let found = value.kind();

        T::from_value(value).ok_or_else(|| NameMapError::TypeMismatch {
            name: name.to_string(),
            expected: T::KIND,
            found,
        })
    }

    /// [`NameMap::get`] for values leaving through the module ABI: the value
    /// is kept until the next read of `name` so borrowed storage outlives the call.
    pub(crate) fn take_retained(&mut self, name: &str) -> Result<Value, NameMapError> {
        let value = self.get(name)?;
        self.retained.insert(name.to_string(), value.clone());

        Ok(value)
    }

    /// Turn `name` into a queue. An existing slot value becomes its first entry.
    pub fn create_queue(&mut self, name: &str) {
        if self.queues.contains_key(name) {
            return;
        }

        let mut queue = VecDeque::new();
        if let Some(value) = self.values.remove(name) {
            debug!("Moving slot value of {name} into its new queue");
            queue.push_back(value);
        }
        self.queues.insert(name.to_string(), queue);
    }

    /// Names that are not queues count as empty.
    pub fn queue_empty(&self, name: &str) -> bool {
        self.queues.get(name).map_or(true, VecDeque::is_empty)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.values.contains_key(name) || self.queues.contains_key(name)
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.queues.clear();
        self.retained.clear();
    }
}
