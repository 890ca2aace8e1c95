// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;

use multistep::WatchObserver;
use vsphere_builder_config::SupervisorConfig;

use super::{Backends, Builder};
use crate::artifact::Artifact;
use crate::state::BuildState;
use crate::steps::guest::{ConnectCommunicator, Provision};
use crate::steps::supervisor::{
    generated_source_name, ConnectSupervisor, CreateSource, ImportImage,
    PublishSource, WaitForServiceIp, WatchSource,
};
use crate::steps::BoxedStep;

/// Deploys a source VM on a vSphere Supervisor cluster, customizes it and
/// optionally publishes it as a new image.
pub struct SupervisorBuilder {
    config: SupervisorConfig,
    backends: Backends,
    source_name: String,
    observer: WatchObserver,
}

impl SupervisorBuilder {
    pub const ID: &'static str = "vsphere.supervisor";

    pub fn new(config: SupervisorConfig, backends: Backends) -> Self {
        let source_name =
            config.source_name.clone().unwrap_or_else(generated_source_name);
        Self { config, backends, source_name, observer: WatchObserver::new() }
    }

    /// Reports whether one of this builder's steps is waiting on a watch of
    /// a cluster object.
    pub fn watch_observer(&self) -> WatchObserver {
        self.observer.clone()
    }
}

impl Builder for SupervisorBuilder {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn name(&self) -> &str {
        &self.source_name
    }

    fn steps(&self) -> Vec<BoxedStep> {
        let cfg = &self.config;
        let source = &self.source_name;
        let mut steps: Vec<BoxedStep> = vec![Box::new(ConnectSupervisor::new(
            cfg.kubeconfig_path.clone(),
            cfg.namespace().to_owned(),
            self.backends.kube.clone(),
        ))];

        if let Some(import) = &cfg.import {
            steps.push(Box::new(
                ImportImage::new(import.clone(), source.clone())
                    .observer(self.observer.clone()),
            ));
        }
        steps.push(Box::new(CreateSource::new(cfg.clone(), source.clone())));
        steps.push(Box::new(
            WatchSource::new(cfg.watch_source_timeout)
                .observer(self.observer.clone()),
        ));

        if cfg.communicator.is_enabled() {
            steps.push(Box::new(WaitForServiceIp::new(cfg.watch_source_timeout)));
            steps.push(Box::new(ConnectCommunicator::new(
                cfg.communicator.clone(),
                self.backends.communicator.clone(),
            )));
            steps.push(Box::new(Provision::new(cfg.provisioners.clone())));
        }

        if let Some(publish) = &cfg.publish {
            steps.push(Box::new(
                PublishSource::new(publish.clone(), source.clone())
                    .observer(self.observer.clone()),
            ));
        }
        steps
    }

    fn artifact(&self, state: &BuildState) -> Option<Artifact> {
        let image = state.published_image.clone()?;
        let publish = self.config.publish.as_ref()?;

        let mut details = BTreeMap::new();
        if let Some(imported) = &state.imported_image {
            details.insert("imported_image".to_string(), imported.clone());
        }
        if self.config.keep_input_artifact {
            details.insert("source_kept".to_string(), "true".to_string());
        }

        Some(Artifact {
            builder_id: Self::ID,
            id: image.clone(),
            name: self.source_name.clone(),
            datacenter: None,
            location: Some(self.config.namespace().to_owned()),
            files: Vec::new(),
            content_library: Some(publish.location_name.clone()),
            image_name: Some(image),
            state: details,
        })
    }
}
