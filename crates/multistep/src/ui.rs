// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator-facing progress reporting.

use std::sync::Mutex;

use tracing::{error, info};

/// Fire-and-forget progress messages shown to the person running the build.
pub trait Ui: Send + Sync {
    fn say(&self, message: &str);
    fn error(&self, message: &str);
}

/// A [`Ui`] that forwards messages to the tracing subscriber.
#[derive(Debug, Default)]
pub struct TracingUi {
    build_name: Option<String>,
}

impl TracingUi {
    pub fn new(build_name: impl Into<String>) -> Self {
        Self { build_name: Some(build_name.into()) }
    }
}

impl Ui for TracingUi {
    fn say(&self, message: &str) {
        match &self.build_name {
            Some(build) => info!(%build, "{message}"),
            None => info!("{message}"),
        }
    }

    fn error(&self, message: &str) {
        match &self.build_name {
            Some(build) => error!(%build, "{message}"),
            None => error!("{message}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UiMessage {
    Say(String),
    Error(String),
}

/// A [`Ui`] that keeps every message, for tests.
#[derive(Debug, Default)]
pub struct RecordingUi {
    messages: Mutex<Vec<UiMessage>>,
}

impl RecordingUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<UiMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// True if any message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.messages.lock().unwrap().iter().any(|m| match m {
            UiMessage::Say(s) | UiMessage::Error(s) => s.contains(needle),
        })
    }

    pub fn errors(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                UiMessage::Error(s) => Some(s.clone()),
                UiMessage::Say(_) => None,
            })
            .collect()
    }
}

impl Ui for RecordingUi {
    fn say(&self, message: &str) {
        info!("{message}");
        self.messages.lock().unwrap().push(UiMessage::Say(message.to_owned()));
    }

    fn error(&self, message: &str) {
        error!("{message}");
        self.messages
            .lock()
            .unwrap()
            .push(UiMessage::Error(message.to_owned()));
    }
}
