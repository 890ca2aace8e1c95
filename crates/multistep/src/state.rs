// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! State shared between the steps of a single pipeline run.
//!
//! Pipelines that know their data ahead of time should keep it in typed fields
//! of their own state struct and implement [`StepState`] to expose the
//! [`StateBag`] the runner needs. The bag itself is a string-keyed map of
//! [`StateValue`]s for optional or extension data, and it holds the runner's
//! reserved control keys.

use std::collections::BTreeMap;
use std::net::IpAddr;

use thiserror::Error;

/// Set by the runner to the message of the error that halted the pipeline.
pub const ERROR_KEY: &str = "error";

/// Set by the runner when a step returns [`crate::StepOutcome::Halt`].
pub const HALTED_KEY: &str = "halted";

/// Set by the runner when the pipeline stops because it was cancelled.
pub const CANCELLED_KEY: &str = "cancelled";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("state key {0:?} has not been set by any previous step")]
    MissingKey(String),

    #[error("state key {key:?} holds a {actual}, expected a {expected}")]
    TypeMismatch { key: String, expected: &'static str, actual: &'static str },
}

/// A value stored in a [`StateBag`].
#[derive(Clone, Debug, PartialEq)]
pub enum StateValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
    Addr(IpAddr),
}

impl StateValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            StateValue::Bool(_) => "bool",
            StateValue::Int(_) => "integer",
            StateValue::Str(_) => "string",
            StateValue::List(_) => "list",
            StateValue::Addr(_) => "address",
        }
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        StateValue::Int(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::Str(value.to_owned())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::Str(value)
    }
}

impl From<Vec<String>> for StateValue {
    fn from(value: Vec<String>) -> Self {
        StateValue::List(value)
    }
}

impl From<IpAddr> for StateValue {
    fn from(value: IpAddr) -> Self {
        StateValue::Addr(value)
    }
}

/// Conversion out of a [`StateValue`] for typed reads.
pub trait FromStateValue: Sized {
    const TYPE_NAME: &'static str;

    fn from_state_value(value: &StateValue) -> Option<Self>;
}

macro_rules! from_state_value {
    ($ty:ty, $name:literal, $variant:ident) => {
        impl FromStateValue for $ty {
            const TYPE_NAME: &'static str = $name;

            fn from_state_value(value: &StateValue) -> Option<Self> {
                match value {
                    StateValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

from_state_value!(bool, "bool", Bool);
from_state_value!(i64, "integer", Int);
from_state_value!(String, "string", Str);
from_state_value!(Vec<String>, "list", List);
from_state_value!(IpAddr, "address", Addr);

/// A string-keyed map shared by every step of one pipeline run.
///
/// Writes are visible to every step that runs afterwards. The bag is owned by
/// a single run and is never shared between concurrent runs, so it does no
/// synchronization of its own.
#[derive(Clone, Debug, Default)]
pub struct StateBag {
    values: BTreeMap<String, StateValue>,
}

impl StateBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` under `key`, replacing any previous value.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<StateValue>) {
        self.values.insert(key.into(), value.into());
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Result<&StateValue, StateError> {
        self.values
            .get(key)
            .ok_or_else(|| StateError::MissingKey(key.to_owned()))
    }

    /// Returns the value stored under `key`, if there is one.
    pub fn get_ok(&self, key: &str) -> Option<&StateValue> {
        self.values.get(key)
    }

    /// Returns a copy of the value under `key` converted to `T`.
    pub fn get_as<T: FromStateValue>(&self, key: &str) -> Result<T, StateError> {
        let value = self.get(key)?;
        T::from_state_value(value).ok_or_else(|| StateError::TypeMismatch {
            key: key.to_owned(),
            expected: T::TYPE_NAME,
            actual: value.type_name(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<StateValue> {
        self.values.remove(key)
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.get_ok(HALTED_KEY), Some(StateValue::Bool(true)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.get_ok(CANCELLED_KEY), Some(StateValue::Bool(true)))
    }

    /// Returns the message recorded under the reserved `error` key.
    pub fn error_message(&self) -> Option<&str> {
        match self.get_ok(ERROR_KEY) {
            Some(StateValue::Str(msg)) => Some(msg),
            _ => None,
        }
    }

    /// Records the error that stopped the pipeline. The first recorded error
    /// wins; later ones are ignored.
    pub(crate) fn record_error(&mut self, message: String) {
        if !self.contains(ERROR_KEY) {
            self.put(ERROR_KEY, message);
        }
    }
}

/// State types the [`crate::Runner`] can drive.
pub trait StepState: Send + 'static {
    fn bag(&self) -> &StateBag;
    fn bag_mut(&mut self) -> &mut StateBag;

    /// True when the run is unwinding because a step halted.
    fn is_halted(&self) -> bool {
        self.bag().is_halted()
    }

    /// True when the run is unwinding because it was cancelled.
    fn is_cancelled(&self) -> bool {
        self.bag().is_cancelled()
    }
}

impl StepState for StateBag {
    fn bag(&self) -> &StateBag {
        self
    }

    fn bag_mut(&mut self) -> &mut StateBag {
        self
    }
}
