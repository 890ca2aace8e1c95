// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for builds that run on a vSphere Supervisor cluster, where
//! VMs are declared as objects in a namespace and reconciled by the cluster.

use std::time::Duration;

use camino::Utf8PathBuf;
use serde_derive::{Deserialize, Serialize};

use crate::common::{CommunicatorConfig, ProvisionerConfig};
use crate::Problems;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BootstrapProvider {
    #[default]
    CloudInit,
    Sysprep,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    #[default]
    Ovf,
    Iso,
}

/// Publishing the finished source VM as a new image.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct PublishConfig {
    /// Content library backed location the image is published to.
    pub location_name: String,

    /// Name of the published image; defaults to the source VM name.
    pub image_name: Option<String>,

    #[serde(with = "crate::duration", default = "default_publish_timeout")]
    pub timeout: Duration,
}

fn default_publish_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

/// Importing an image from a URL before the source VM is created.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ImportConfig {
    pub source_url: String,
    pub target_location_name: String,

    #[serde(default)]
    pub image_type: ImageType,

    /// Name of the import request; derived from the source name if unset.
    pub name: Option<String>,

    #[serde(with = "crate::duration", default = "default_import_timeout")]
    pub timeout: Duration,
}

fn default_import_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Defaults to `$KUBECONFIG`, then `~/.kube/config`.
    pub kubeconfig_path: Option<Utf8PathBuf>,

    /// Defaults to `default`.
    pub supervisor_namespace: Option<String>,

    pub class_name: String,

    /// Image the source VM is deployed from. May be omitted when `import` is
    /// set, in which case the imported image is used.
    pub image_name: Option<String>,

    pub storage_class: String,

    /// Name of the source VM and its companion objects. Generated when unset.
    pub source_name: Option<String>,

    pub network_type: Option<String>,
    pub network_name: Option<String>,

    #[serde(default)]
    pub bootstrap_provider: BootstrapProvider,

    pub bootstrap_data_file: Option<Utf8PathBuf>,

    /// Leave the source objects in place after a successful build.
    #[serde(default)]
    pub keep_input_artifact: bool,

    #[serde(with = "crate::duration", default = "default_watch_timeout")]
    pub watch_source_timeout: Duration,

    #[serde(default)]
    pub communicator: CommunicatorConfig,

    #[serde(default, rename = "provisioner")]
    pub provisioners: Vec<ProvisionerConfig>,

    pub publish: Option<PublishConfig>,
    pub import: Option<ImportConfig>,
}

fn default_watch_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

impl SupervisorConfig {
    pub fn namespace(&self) -> &str {
        self.supervisor_namespace.as_deref().unwrap_or("default")
    }

    pub(crate) fn prepare(&mut self, p: &mut Problems) {
        if self.supervisor_namespace.is_none() {
            self.supervisor_namespace = Some("default".to_string());
        }
        p.require("class_name", &self.class_name);
        p.require("storage_class", &self.storage_class);

        if self.image_name.is_none() && self.import.is_none() {
            p.push("image_name", "must be set unless an image is imported");
        }
        if let Some(file) = &self.bootstrap_data_file {
            if !file.is_file() {
                p.push("bootstrap_data_file", format!("{file} does not exist"));
            }
        }
        if self.network_name.is_some() && self.network_type.is_none() {
            p.push("network_type", "must be set when network_name is set");
        }

        self.communicator.prepare(p);
        for (i, prov) in self.provisioners.iter().enumerate() {
            prov.validate(i, p);
        }
        if !self.provisioners.is_empty() && !self.communicator.is_enabled() {
            p.push("provisioner", "provisioners require a communicator");
        }

        if let Some(publish) = &self.publish {
            p.require("publish.location_name", &publish.location_name);
        }
        if let Some(import) = &self.import {
            p.require("import.source_url", &import.source_url);
            p.require("import.target_location_name", &import.target_location_name);
            if !import.source_url.is_empty()
                && !import.source_url.starts_with("https://")
                && !import.source_url.starts_with("http://")
            {
                p.push("import.source_url", "must be an http or https URL");
            }
        }
    }
}
