// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builders turn a prepared template into a pipeline of steps, and the state
//! a completed pipeline leaves behind into an [`Artifact`].
//!
//! The ISO and clone builders share one backbone (connect, create or clone,
//! configure, run, shut down) and differ only in how the VM comes into
//! existence. Optional steps are inserted when their part of the template is
//! present. The Supervisor builder declares its source VM on a cluster
//! instead.

use std::sync::Arc;

use multistep::{
    OnError, PauseHook, RunState, Runner, StepContext, StepState,
};
use thiserror::Error;
use tracing::info;
use vsphere_builder_config::{
    BuildConfig, ConfigErrors, HttpAddressStrategy, VmConfig,
};

use crate::artifact::Artifact;
use crate::communicator;
use crate::state::BuildState;
use crate::steps::boot::BootCommand;
use crate::steps::connect::Connect;
use crate::steps::finalize::{
    ContentLibrary, ConvertToTemplate, CreateSnapshot, Export,
};
use crate::steps::guest::{ConnectCommunicator, Provision, WaitForIp};
use crate::steps::http::{HttpIpDiscover, HttpServer};
use crate::steps::media::{AddCdrom, RemoveCdrom, UploadMedia};
use crate::steps::vm::{ConfigureHardware, Run, Shutdown};
use crate::steps::BoxedStep;
use crate::store::KubeConnector;
use crate::vsphere::{self, BootDevice};

mod clone;
mod iso;
mod supervisor;

pub use clone::CloneBuilder;
pub use iso::IsoBuilder;
pub use supervisor::SupervisorBuilder;

/// The remote systems a build talks to.
#[derive(Clone)]
pub struct Backends {
    pub vsphere: Arc<dyn vsphere::Connector>,
    pub kube: Arc<dyn KubeConnector>,
    pub communicator: Arc<dyn communicator::Connector>,
}

pub trait Builder: Send + Sync {
    /// Identifier recorded in artifacts, e.g. `vsphere.iso`.
    fn id(&self) -> &'static str;

    /// Name of the VM or source object being built.
    fn name(&self) -> &str;

    /// A fresh pipeline for one run.
    fn steps(&self) -> Vec<BoxedStep>;

    /// The artifact a completed run leaves behind, if any.
    fn artifact(&self, state: &BuildState) -> Option<Artifact>;
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),

    #[error("build failed in step {step}: {message}")]
    Halted { step: String, message: String },

    #[error("build was cancelled during step {step}")]
    Cancelled { step: String },
}

/// Prepares `config` and picks the builder its `type` names.
pub fn builder_for(
    mut config: BuildConfig,
    backends: &Backends,
) -> Result<Box<dyn Builder>, BuildError> {
    config.prepare()?;
    Ok(match config {
        BuildConfig::Iso(c) => Box::new(IsoBuilder::new(c, backends.clone())),
        BuildConfig::Clone(c) => {
            Box::new(CloneBuilder::new(c, backends.clone()))
        }
        BuildConfig::Supervisor(c) => {
            Box::new(SupervisorBuilder::new(c, backends.clone()))
        }
    })
}

#[derive(Clone, Default)]
pub struct RunOptions {
    /// Awaited before each step, e.g. to step through a build interactively.
    pub pause: Option<PauseHook>,
    pub on_error: OnError,
}

/// Runs a builder's pipeline to completion.
///
/// A failed build reports the error the halting step recorded; a completed
/// one yields the builder's artifact.
pub async fn run(
    builder: &dyn Builder,
    ctx: &StepContext,
    options: RunOptions,
) -> Result<Option<Artifact>, BuildError> {
    let mut state = BuildState::new();
    let mut runner = Runner::new(builder.steps()).with_on_error(options.on_error);
    if let Some(pause) = options.pause {
        runner = runner.with_pause_hook(pause);
    }
    info!(
        builder = builder.id(),
        name = builder.name(),
        steps = ?runner.step_names(),
        "starting build"
    );

    let report = runner.run(ctx, &mut state).await;
    let step = report.failed_step().unwrap_or_default().to_owned();
    match report.state {
        RunState::Completed => {
            let artifact = builder.artifact(&state);
            match &artifact {
                Some(a) => info!(id = %a.id, "build produced an artifact"),
                None => info!("build finished without an artifact"),
            }
            Ok(artifact)
        }
        RunState::Cancelled(_) => Err(BuildError::Cancelled { step }),
        _ => {
            let message = state
                .bag()
                .error_message()
                .map(str::to_owned)
                .or_else(|| report.error.as_ref().map(|e| format!("{e:#}")))
                .unwrap_or_else(|| "unknown error".to_string());
            Err(BuildError::Halted { step, message })
        }
    }
}

/// The shared VM pipeline around the step that creates or clones the VM.
fn vm_steps(
    vm: &VmConfig,
    backends: &Backends,
    create: BoxedStep,
    cloned: bool,
    boot_order: Vec<BootDevice>,
) -> Vec<BoxedStep> {
    let name = vm.location.vm_name.clone();
    let mut steps: Vec<BoxedStep> = vec![Box::new(Connect::new(
        vm.connection.clone(),
        backends.vsphere.clone(),
    ))];

    if !vm.cdrom.iso_files.is_empty() {
        steps.push(Box::new(UploadMedia::new(
            vm.cdrom.iso_files.clone(),
            vm.location.datastore.clone().unwrap_or_default(),
            name.clone(),
            vm.cdrom.remove_cdrom,
        )));
    }

    steps.push(create);
    steps.push(Box::new(ConfigureHardware::new(vm.hardware.clone(), cloned)));

    if vm.cdrom.has_media() {
        steps.push(Box::new(AddCdrom::new(
            vm.cdrom.iso_paths.clone(),
            vm.cdrom.cdrom_type,
        )));
    }

    if vm.http.is_enabled() {
        if vm.http.address_strategy() == HttpAddressStrategy::Discover {
            steps.push(Box::new(HttpIpDiscover::new(
                vm.connection.vcenter_server.clone(),
            )));
        }
        steps.push(Box::new(HttpServer::new(vm.http.clone())));
    }

    steps.push(Box::new(Run::new(boot_order)));
    if !vm.boot.boot_command.is_empty() {
        steps.push(Box::new(BootCommand::new(vm.boot.clone(), name.clone())));
    }

    if vm.communicator.is_enabled() {
        steps.push(Box::new(WaitForIp::new(vm.wait_ip.clone())));
        steps.push(Box::new(ConnectCommunicator::new(
            vm.communicator.clone(),
            backends.communicator.clone(),
        )));
        steps.push(Box::new(Provision::new(vm.provisioners.clone())));
    }

    steps.push(Box::new(Shutdown::new(vm.shutdown.clone())));

    if vm.cdrom.remove_cdrom && vm.cdrom.has_media() {
        steps.push(Box::new(RemoveCdrom));
    }
    if vm.create_snapshot {
        let snapshot = vm.snapshot_name.clone().unwrap_or_else(|| name.clone());
        steps.push(Box::new(CreateSnapshot::new(snapshot)));
    }
    if vm.convert_to_template {
        steps.push(Box::new(ConvertToTemplate));
    }
    if let Some(library) = &vm.content_library {
        steps.push(Box::new(ContentLibrary::new(library.clone(), name.clone())));
    }
    if let Some(export) = &vm.export {
        steps.push(Box::new(Export::new(export.clone(), name)));
    }
    steps
}

/// Artifact of the ISO and clone builders: the VM, unless the build removed
/// it and left nothing else behind.
fn vm_artifact(
    builder_id: &'static str,
    vm: &VmConfig,
    state: &BuildState,
) -> Option<Artifact> {
    let vm_ref = state.vm.as_ref()?;
    if state.destroyed
        && state.exported_files.is_empty()
        && state.content_library_item.is_none()
    {
        return None;
    }

    let mut details = std::collections::BTreeMap::new();
    if state.template {
        details.insert("template".to_string(), "true".to_string());
    }
    if let Some(snapshot) = &state.snapshot {
        details.insert("snapshot".to_string(), snapshot.clone());
    }
    if state.destroyed {
        details.insert("destroyed".to_string(), "true".to_string());
    }

    Some(Artifact {
        builder_id,
        id: vm_ref.id.clone(),
        name: vm_ref.name.clone(),
        datacenter: vm.connection.datacenter.clone(),
        location: vm_ref.folder.clone().or_else(|| vm.location.folder.clone()),
        files: state.exported_files.clone(),
        content_library: state.content_library_item.clone(),
        image_name: None,
        state: details,
    })
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use multistep::{Step, StepOutcome};
    use vsphere_builder_config::{
        CommunicatorConfig, CommunicatorKind, IsoConfig, ProvisionerConfig,
    };

    use super::*;
    use crate::sim::Simulation;
    use crate::steps::testutil::{ctx, vm_config};

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recorded {
        name: &'static str,
        halt: Option<&'static str>,
        journal: Journal,
    }

    #[async_trait]
    impl Step<BuildState> for Recorded {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, _ctx: &StepContext, _state: &mut BuildState) -> StepOutcome {
            self.journal.lock().unwrap().push(format!("run {}", self.name));
            match self.halt {
                Some(message) => StepOutcome::Halt(anyhow::anyhow!(message)),
                None => StepOutcome::Continue,
            }
        }

        async fn cleanup(
            &self,
            _ctx: &StepContext,
            _state: &mut BuildState,
        ) -> anyhow::Result<()> {
            self.journal.lock().unwrap().push(format!("cleanup {}", self.name));
            Ok(())
        }
    }

    struct Fixed {
        journal: Journal,
    }

    impl Builder for Fixed {
        fn id(&self) -> &'static str {
            "test.fixed"
        }

        fn name(&self) -> &str {
            "fixed"
        }

        fn steps(&self) -> Vec<BoxedStep> {
            let step = |name, halt| -> BoxedStep {
                Box::new(Recorded { name, halt, journal: self.journal.clone() })
            };
            vec![step("a", None), step("b", Some("boom")), step("c", None)]
        }

        fn artifact(&self, _state: &BuildState) -> Option<Artifact> {
            panic!("a failed build has no artifact");
        }
    }

    #[tokio::test]
    async fn halted_build_reports_the_recorded_error() {
        let journal = Journal::default();
        let builder = Fixed { journal: journal.clone() };
        let (ctx, _) = ctx();

        let err = run(&builder, &ctx, RunOptions::default()).await.unwrap_err();
        let BuildError::Halted { step, message } = err else {
            panic!("expected a halted build");
        };
        assert_eq!(step, "b");
        assert_eq!(message, "boom");
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["run a", "run b", "cleanup b", "cleanup a"]
        );
    }

    fn step_names(builder: &dyn Builder) -> Vec<String> {
        builder.steps().iter().map(|s| s.name().to_owned()).collect()
    }

    fn iso_config(communicator: CommunicatorKind) -> BuildConfig {
        let mut vm = vm_config("vm1");
        vm.hardware.disks =
            vec![vsphere_builder_config::DiskConfig { size_mb: 1024, thin_provisioned: true }];
        vm.communicator = CommunicatorConfig {
            kind: communicator,
            username: "root".into(),
            password: Some("secret".into()),
            ..Default::default()
        };
        if communicator != CommunicatorKind::None {
            vm.provisioners = vec![ProvisionerConfig::Shell {
                inline: vec!["true".into()],
                environment: Default::default(),
            }];
        }
        BuildConfig::Iso(IsoConfig { vm })
    }

    #[test]
    fn communicator_steps_follow_the_communicator_type() {
        let sim = Simulation::default();
        let count = |names: &[String], name: &str| {
            names.iter().filter(|n| n.as_str() == name).count()
        };

        let builder =
            builder_for(iso_config(CommunicatorKind::None), &sim.backends())
                .unwrap();
        let names = step_names(builder.as_ref());
        for step in ["wait-for-ip", "connect-communicator", "provision"] {
            assert_eq!(count(&names, step), 0, "{step} in {names:?}");
        }

        let builder =
            builder_for(iso_config(CommunicatorKind::Ssh), &sim.backends())
                .unwrap();
        let names = step_names(builder.as_ref());
        for step in ["wait-for-ip", "connect-communicator", "provision"] {
            assert_eq!(count(&names, step), 1, "{step} in {names:?}");
        }
    }

    #[test]
    fn invalid_templates_are_rejected_with_every_problem() {
        let sim = Simulation::default();
        let BuildConfig::Iso(mut iso) = iso_config(CommunicatorKind::None) else {
            unreachable!()
        };
        iso.vm.hardware.disks.clear();
        iso.vm.location.datastore = None;

        let Err(BuildError::Config(errs)) =
            builder_for(BuildConfig::Iso(iso), &sim.backends())
        else {
            panic!("expected configuration errors");
        };
        assert!(errs.has_field("hardware.disk"));
        assert!(errs.has_field("location.datastore"));
    }
}
