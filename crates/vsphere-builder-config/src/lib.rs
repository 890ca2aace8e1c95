// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build templates for the vSphere image builders.
//!
//! A template is a single TOML document whose top-level `type` key selects
//! the builder. [`BuildConfig::prepare`] fills in defaults and validates the
//! whole template, reporting every problem it finds at once.

use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub mod common;
pub mod duration;
pub mod supervisor;

pub use common::*;
pub use supervisor::{
    BootstrapProvider, ImageType, ImportConfig, PublishConfig,
    SupervisorConfig,
};

/// Builds a VM from scratch, booting it from installation media.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct IsoConfig {
    #[serde(flatten)]
    pub vm: VmConfig,
}

impl IsoConfig {
    fn prepare(&mut self, p: &mut Problems) {
        let hw = &mut self.vm.hardware;
        hw.cpus.get_or_insert(1);
        hw.memory_mb.get_or_insert(1024);
        hw.guest_os_type.get_or_insert_with(|| "otherGuest".to_string());
        if hw.disks.is_empty() {
            p.push("hardware.disk", "at least one disk is required");
        }
        if self.vm.location.datastore.is_none() {
            p.push("location.datastore", "must be set");
        }
        self.vm.prepare(p);
    }
}

/// Builds a VM by cloning an existing VM or template.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct CloneConfig {
    #[serde(flatten)]
    pub vm: VmConfig,

    /// Inventory path of the VM or template to clone.
    pub template: String,

    #[serde(default)]
    pub linked_clone: bool,
}

impl CloneConfig {
    fn prepare(&mut self, p: &mut Problems) {
        p.require("template", &self.template);
        if !self.vm.cdrom.iso_files.is_empty()
            && self.vm.location.datastore.is_none()
        {
            p.push("location.datastore", "required to upload ISO files");
        }
        self.vm.prepare(p);
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BuildConfig {
    Iso(IsoConfig),
    Clone(CloneConfig),
    Supervisor(SupervisorConfig),
}

impl BuildConfig {
    pub fn from_toml(raw: &str) -> Result<Self, ParseError> {
        Ok(toml::from_str(raw)?)
    }

    /// Short name of the builder, as used in the `type` key.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildConfig::Iso(_) => "iso",
            BuildConfig::Clone(_) => "clone",
            BuildConfig::Supervisor(_) => "supervisor",
        }
    }

    /// Fills in defaults and validates the template.
    pub fn prepare(&mut self) -> Result<(), ConfigErrors> {
        let mut p = Problems::default();
        match self {
            BuildConfig::Iso(c) => c.prepare(&mut p),
            BuildConfig::Clone(c) => c.prepare(&mut p),
            BuildConfig::Supervisor(c) => c.prepare(&mut p),
        }
        p.finish()
    }
}

/// One problem found in a template.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ConfigError {
    pub field: String,
    pub message: String,
}

/// Every problem found in a template.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{} configuration error(s):{}", .0.len(), bullets(.0))]
pub struct ConfigErrors(pub Vec<ConfigError>);

fn bullets(errs: &[ConfigError]) -> String {
    errs.iter().map(|e| format!("\n  * {e}")).collect()
}

impl ConfigErrors {
    pub fn iter(&self) -> impl Iterator<Item = &ConfigError> {
        self.0.iter()
    }

    /// True if some problem was reported against `field`.
    pub fn has_field(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }
}

/// Accumulates problems while a template is validated.
#[derive(Default)]
pub(crate) struct Problems(Vec<ConfigError>);

impl Problems {
    pub(crate) fn push(
        &mut self,
        field: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.0.push(ConfigError { field: field.into(), message: message.into() });
    }

    pub(crate) fn require(&mut self, field: impl Into<String>, value: &str) {
        if value.trim().is_empty() {
            self.push(field, "must be set");
        }
    }

    fn finish(self) -> Result<(), ConfigErrors> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ConfigErrors(self.0))
        }
    }
}

/// Errors which may be returned when loading a template.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Invalid(#[from] ConfigErrors),
}

/// Parses a TOML file into a template, without validating it.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<BuildConfig, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    BuildConfig::from_toml(&contents)
}

/// Parses and prepares a template.
pub fn load<P: AsRef<Path>>(path: P) -> Result<BuildConfig, ParseError> {
    let mut cfg = parse(path)?;
    cfg.prepare()?;
    Ok(cfg)
}
