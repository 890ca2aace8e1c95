// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use vsphere_builder_config::IsoConfig;

use super::{vm_artifact, vm_steps, Backends, Builder};
use crate::artifact::Artifact;
use crate::state::BuildState;
use crate::steps::vm::{install_boot_order, CreateVm};
use crate::steps::BoxedStep;

/// Creates an empty VM and installs a guest into it from media.
pub struct IsoBuilder {
    config: IsoConfig,
    backends: Backends,
}

impl IsoBuilder {
    pub const ID: &'static str = "vsphere.iso";

    pub fn new(config: IsoConfig, backends: Backends) -> Self {
        Self { config, backends }
    }
}

impl Builder for IsoBuilder {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn name(&self) -> &str {
        &self.config.vm.location.vm_name
    }

    fn steps(&self) -> Vec<BoxedStep> {
        let vm = &self.config.vm;
        let create = Box::new(CreateVm::new(
            vm.location.clone(),
            vm.hardware.clone(),
            vm.destroy,
        ));
        let boot_order = install_boot_order(vm.boot.boot_order.as_deref());
        vm_steps(vm, &self.backends, create, false, boot_order)
    }

    fn artifact(&self, state: &BuildState) -> Option<Artifact> {
        vm_artifact(Self::ID, &self.config.vm, state)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use camino::Utf8PathBuf;
    use multistep::{CancellationSource, RecordingUi, StepContext};
    use std::sync::Arc;
    use vsphere_builder_config::{
        BuildConfig, CommunicatorConfig, CommunicatorKind, ContentLibraryConfig,
        DiskConfig, ExportConfig, ExportFormat, IsoFile, ManifestKind,
        ProvisionerConfig,
    };

    use super::*;
    use crate::builder::{builder_for, run, BuildError, RunOptions};
    use crate::sim::Simulation;
    use crate::steps::testutil::{ctx, vm_config};
    use crate::vsphere::PowerState;

    fn utf8(path: std::path::PathBuf) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path).unwrap()
    }

    fn config(dir: &tempfile::TempDir) -> IsoConfig {
        let iso = utf8(dir.path().join("install.iso"));
        std::fs::write(&iso, b"installer").unwrap();

        let mut vm = vm_config("ubuntu");
        vm.hardware.disks =
            vec![DiskConfig { size_mb: 10240, thin_provisioned: true }];
        vm.cdrom.iso_files = vec![IsoFile { path: iso, checksum: None }];
        vm.cdrom.remove_cdrom = true;
        vm.boot.boot_command = vec!["linux ks=/{{ .Name }}.cfg<enter>".into()];
        vm.communicator = CommunicatorConfig {
            kind: CommunicatorKind::Ssh,
            username: "ubuntu".into(),
            password: Some("ubuntu".into()),
            ..Default::default()
        };
        vm.provisioners = vec![ProvisionerConfig::Shell {
            inline: vec!["apt-get update".into()],
            environment: Default::default(),
        }];
        vm.shutdown.shutdown_command = Some("sudo shutdown -h now".into());
        vm.export = Some(ExportConfig {
            output_directory: utf8(dir.path().join("out")),
            name: None,
            format: ExportFormat::Ovf,
            manifest: ManifestKind::Sha256,
            force: false,
        });
        IsoConfig { vm }
    }

    #[tokio::test(start_paused = true)]
    async fn build_installs_provisions_and_exports() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Simulation::default();
        let builder =
            builder_for(BuildConfig::Iso(config(&dir)), &sim.backends()).unwrap();
        let names: Vec<String> =
            builder.steps().iter().map(|s| s.name().to_owned()).collect();
        assert_eq!(
            names,
            [
                "connect",
                "upload-media",
                "create-vm",
                "configure-hardware",
                "add-cdrom",
                "run",
                "boot-command",
                "wait-for-ip",
                "connect-communicator",
                "provision",
                "shutdown",
                "remove-cdrom",
                "export",
            ]
        );

        let (ctx, ui) = ctx();
        let artifact = run(builder.as_ref(), &ctx, RunOptions::default())
            .await
            .unwrap()
            .expect("a kept VM is an artifact");

        assert_eq!(artifact.builder_id, "vsphere.iso");
        assert_eq!(artifact.name, "ubuntu");
        assert_eq!(artifact.datacenter.as_deref(), Some("dc1"));
        let files: Vec<&str> =
            artifact.files.iter().filter_map(|f| f.file_name()).collect();
        assert_eq!(files, ["ubuntu.ovf", "ubuntu-disk-0.vmdk", "ubuntu.mf"]);

        assert_eq!(sim.vsphere.power_of("ubuntu"), Some(PowerState::PoweredOff));
        assert!(sim.vsphere.files().is_empty(), "uploaded media is removed");
        assert_eq!(sim.vsphere.logouts(), 1);
        assert_eq!(sim.guests.open_sessions(), 0);
        assert_eq!(
            sim.guests.commands(),
            ["apt-get update", "sudo shutdown -h now"]
        );
        assert!(ui.errors().is_empty(), "{:?}", ui.errors());
    }

    #[test]
    fn library_destroy_and_export_are_rejected_together() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Simulation::default();
        let mut cfg = config(&dir);
        cfg.vm.content_library = Some(ContentLibraryConfig {
            library: "golden".into(),
            name: None,
            description: None,
            ovf: false,
            destroy: true,
        });

        let Err(BuildError::Config(errs)) =
            builder_for(BuildConfig::Iso(cfg), &sim.backends())
        else {
            panic!("expected configuration errors");
        };
        assert!(errs.has_field("content_library.destroy"), "{errs}");
        assert!(sim.vsphere.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_power_on_destroys_the_vm() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Simulation::default();
        sim.vsphere.fail("power_on", "host is in maintenance mode");
        let builder =
            builder_for(BuildConfig::Iso(config(&dir)), &sim.backends()).unwrap();
        let (ctx, _) = ctx();

        let err = run(builder.as_ref(), &ctx, RunOptions::default())
            .await
            .unwrap_err();
        let BuildError::Halted { step, message } = err else {
            panic!("expected a halted build");
        };
        assert_eq!(step, "run");
        assert!(message.contains("host is in maintenance mode"), "{message}");
        assert!(!sim.vsphere.exists("ubuntu"));
        assert!(sim.vsphere.files().is_empty());
        assert_eq!(sim.vsphere.logouts(), 1);
        assert!(!dir.path().join("out").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_while_waiting_for_an_address_unwinds() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Simulation::default();
        let builder =
            builder_for(BuildConfig::Iso(config(&dir)), &sim.backends()).unwrap();
        let source = CancellationSource::new();
        let ctx =
            StepContext::new("test", Arc::new(RecordingUi::new()), source.token());

        // The boot wait and the typed command take well under a minute, the
        // address shows up 20s after power on.
        let cancel = async {
            tokio::time::sleep(Duration::from_secs(15)).await;
            source.cancel();
        };
        let (result, ()) = tokio::join!(
            run(builder.as_ref(), &ctx, RunOptions::default()),
            cancel
        );
        let Err(BuildError::Cancelled { step }) = result else {
            panic!("expected a cancelled build");
        };
        assert_eq!(step, "wait-for-ip");
        assert!(!sim.vsphere.exists("ubuntu"));
        assert_eq!(sim.guests.attempts(), 0);
    }
}
