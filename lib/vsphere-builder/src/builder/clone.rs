// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use vsphere_builder_config::CloneConfig;

use super::{vm_artifact, vm_steps, Backends, Builder};
use crate::artifact::Artifact;
use crate::state::BuildState;
use crate::steps::vm::CloneVm;
use crate::steps::BoxedStep;
use crate::vsphere::BootDevice;

/// Clones an existing VM or template and customizes the copy.
pub struct CloneBuilder {
    config: CloneConfig,
    backends: Backends,
}

impl CloneBuilder {
    pub const ID: &'static str = "vsphere.clone";

    pub fn new(config: CloneConfig, backends: Backends) -> Self {
        Self { config, backends }
    }
}

impl Builder for CloneBuilder {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn name(&self) -> &str {
        &self.config.vm.location.vm_name
    }

    fn steps(&self) -> Vec<BoxedStep> {
        let vm = &self.config.vm;
        // A clone keeps its source's boot order unless told otherwise.
        let boot_order = vm
            .boot
            .boot_order
            .as_deref()
            .map(BootDevice::parse_order)
            .unwrap_or_default();
        let create = Box::new(CloneVm::new(self.config.clone()));
        vm_steps(vm, &self.backends, create, true, boot_order)
    }

    fn artifact(&self, state: &BuildState) -> Option<Artifact> {
        vm_artifact(Self::ID, &self.config.vm, state)
    }
}

#[cfg(test)]
mod test {
    use vsphere_builder_config::{
        BuildConfig, CommunicatorConfig, CommunicatorKind, ContentLibraryConfig,
    };

    use super::*;
    use crate::builder::{builder_for, run, BuildError, RunOptions};
    use crate::sim::Simulation;
    use crate::steps::testutil::{ctx, vm_config};

    fn config() -> CloneConfig {
        let mut vm = vm_config("web");
        vm.hardware.cpus = Some(4);
        vm.hardware.memory_mb = Some(8192);
        vm.communicator = CommunicatorConfig {
            kind: CommunicatorKind::Ssh,
            username: "admin".into(),
            password: Some("admin".into()),
            ..Default::default()
        };
        CloneConfig { vm, template: "ubuntu-template".into(), linked_clone: false }
    }

    #[tokio::test(start_paused = true)]
    async fn clone_becomes_a_template_in_a_library() {
        let sim = Simulation::default();
        sim.vsphere.add_template("ubuntu-template");
        let mut cfg = config();
        cfg.vm.create_snapshot = true;
        cfg.vm.convert_to_template = true;
        cfg.vm.content_library = Some(ContentLibraryConfig {
            library: "golden".into(),
            name: None,
            description: None,
            ovf: true,
            destroy: false,
        });
        let builder =
            builder_for(BuildConfig::Clone(cfg), &sim.backends()).unwrap();
        assert_eq!(builder.id(), "vsphere.clone");

        let (ctx, _) = ctx();
        let artifact = run(builder.as_ref(), &ctx, RunOptions::default())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(artifact.name, "web");
        assert_eq!(artifact.location.as_deref(), Some("builds"));
        assert_eq!(artifact.state.get("template").map(String::as_str), Some("true"));
        assert_eq!(
            artifact.state.get("snapshot").map(String::as_str),
            Some("Created by vsphere-builder")
        );
        let item = artifact.content_library.clone().unwrap();
        assert_eq!(sim.vsphere.library_items().get(&item).map(String::as_str), Some("web"));
        assert!(sim.vsphere.is_template("web"));

        let hw = sim.vsphere.hardware("web").unwrap();
        assert_eq!(hw.cpus, Some(4));
        assert_eq!(hw.memory_mb, Some(8192));
    }

    #[tokio::test(start_paused = true)]
    async fn destroyed_clone_leaves_no_artifact() {
        let sim = Simulation::default();
        sim.vsphere.add_template("ubuntu-template");
        let mut cfg = config();
        cfg.vm.destroy = true;
        let builder =
            builder_for(BuildConfig::Clone(cfg), &sim.backends()).unwrap();

        let (ctx, _) = ctx();
        let artifact =
            run(builder.as_ref(), &ctx, RunOptions::default()).await.unwrap();
        assert!(artifact.is_none());
        assert!(!sim.vsphere.exists("web"));
        assert!(sim.vsphere.exists("ubuntu-template"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_template_halts_at_clone() {
        let sim = Simulation::default();
        let builder =
            builder_for(BuildConfig::Clone(config()), &sim.backends()).unwrap();
        let (ctx, _) = ctx();

        let Err(BuildError::Halted { step, message }) =
            run(builder.as_ref(), &ctx, RunOptions::default()).await
        else {
            panic!("expected a halted build");
        };
        assert_eq!(step, "clone-vm");
        assert!(message.contains("ubuntu-template"), "{message}");
        assert_eq!(sim.vsphere.logouts(), 1);
    }
}
