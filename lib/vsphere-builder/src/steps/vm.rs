// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Steps that create a VM, change its hardware and move it through its
//! power states.

use std::collections::BTreeMap;

use anyhow::{bail, Context};
use async_trait::async_trait;
use multistep::{
    poll_stream, CleanupPolicy, Readiness, ResourceId, Step, StepContext,
    StepOutcome, Watch,
};
use tracing::{info, warn};
use vsphere_builder_config::{
    CloneConfig, HardwareConfig, LocationConfig, ShutdownConfig,
};

use super::{placement, POLL_INTERVAL};
use crate::state::BuildState;
use crate::vsphere::{
    BootDevice, CloneVmSpec, CreateVmSpec, Device, DiskSpec, HardwareChange,
    NicSpec, PowerState, VmRef, Vsphere,
};

/// Powers a VM off if needed and deletes it.
pub(crate) async fn destroy(
    ctx: &StepContext,
    vsphere: &dyn Vsphere,
    vm: &VmRef,
) -> anyhow::Result<()> {
    ctx.ui.say(&format!("Destroying VM {}...", vm.name));
    if vsphere.power_state(vm).await? == PowerState::PoweredOn {
        vsphere
            .power_off(vm)
            .await
            .with_context(|| format!("powering off {vm} before destroying it"))?;
    }
    vsphere
        .destroy_vm(vm)
        .await
        .with_context(|| format!("destroying {vm}"))?;
    info!(%vm, "destroyed VM");
    Ok(())
}

/// Shared cleanup of the steps that bring a VM into existence: the VM is
/// destroyed when the build failed or when it is not meant to outlive the
/// build.
async fn destroy_created_vm(
    ctx: &StepContext,
    state: &mut BuildState,
    destroy_always: bool,
) -> anyhow::Result<()> {
    if !(state.failed() || destroy_always) || state.destroyed {
        return Ok(());
    }
    let Some(vm) = state.vm.clone() else {
        return Ok(());
    };
    let vsphere = state.vsphere()?.clone();
    destroy(ctx, vsphere.as_ref(), &vm).await?;
    state.destroyed = true;
    Ok(())
}

fn disk_specs(hw: &HardwareConfig) -> Vec<DiskSpec> {
    hw.disks
        .iter()
        .map(|d| DiskSpec {
            size_mb: d.size_mb,
            thin_provisioned: d.thin_provisioned,
        })
        .collect()
}

fn nic_specs(hw: &HardwareConfig) -> Vec<NicSpec> {
    hw.networks
        .iter()
        .map(|n| NicSpec {
            network: n.network.clone(),
            adapter_type: n.adapter_type.clone(),
        })
        .collect()
}

/// Creates an empty VM for an installation from media.
pub struct CreateVm {
    location: LocationConfig,
    hardware: HardwareConfig,
    destroy: bool,
}

impl CreateVm {
    pub fn new(
        location: LocationConfig,
        hardware: HardwareConfig,
        destroy: bool,
    ) -> Self {
        Self { location, hardware, destroy }
    }

    fn spec(&self) -> CreateVmSpec {
        let hw = &self.hardware;
        CreateVmSpec {
            name: self.location.vm_name.clone(),
            placement: placement(&self.location),
            cpus: hw.cpus.unwrap_or(1),
            cores_per_socket: hw.cores_per_socket,
            memory_mb: hw.memory_mb.unwrap_or(1024),
            guest_os_type: hw
                .guest_os_type
                .clone()
                .unwrap_or_else(|| "otherGuest".to_string()),
            firmware: hw.firmware,
            disks: disk_specs(hw),
            networks: nic_specs(hw),
        }
    }

    async fn create(&self, ctx: &StepContext, state: &mut BuildState) -> anyhow::Result<()> {
        let vsphere = state.vsphere()?.clone();
        let spec = self.spec();
        ctx.ui.say(&format!("Creating VM {}...", spec.name));
        let vm = vsphere
            .create_vm(&spec)
            .await
            .with_context(|| format!("creating VM {}", spec.name))?;
        info!(%vm, "created VM");
        state.vm = Some(vm);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for CreateVm {
    fn name(&self) -> &str {
        "create-vm"
    }

    fn cleanup_policy(&self) -> CleanupPolicy {
        if self.destroy {
            CleanupPolicy::Always
        } else {
            CleanupPolicy::OnFailure
        }
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.create(ctx, state).await.into()
    }

    async fn cleanup(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        destroy_created_vm(ctx, state, self.destroy).await
    }
}

/// Clones the VM from an existing VM or template.
pub struct CloneVm {
    config: CloneConfig,
}

impl CloneVm {
    pub fn new(config: CloneConfig) -> Self {
        Self { config }
    }

    async fn clone_vm(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let vsphere = state.vsphere()?.clone();
        let spec = CloneVmSpec {
            template: self.config.template.clone(),
            name: self.config.vm.location.vm_name.clone(),
            placement: placement(&self.config.vm.location),
            linked_clone: self.config.linked_clone,
        };
        ctx.ui.say(&format!(
            "Cloning VM {} from {}...",
            spec.name, spec.template
        ));
        let vm = vsphere.clone_vm(&spec).await.with_context(|| {
            format!("cloning {} to {}", spec.template, spec.name)
        })?;
        info!(%vm, template = %spec.template, linked = spec.linked_clone, "cloned VM");
        state.vm = Some(vm);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for CloneVm {
    fn name(&self) -> &str {
        "clone-vm"
    }

    fn cleanup_policy(&self) -> CleanupPolicy {
        if self.config.vm.destroy {
            CleanupPolicy::Always
        } else {
            CleanupPolicy::OnFailure
        }
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.clone_vm(ctx, state).await.into()
    }

    async fn cleanup(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        destroy_created_vm(ctx, state, self.config.vm.destroy).await
    }
}

/// Applies hardware settings that VM creation doesn't cover. Clones also
/// get their sizing and any extra disks and NICs here.
pub struct ConfigureHardware {
    hardware: HardwareConfig,
    cloned: bool,
}

impl ConfigureHardware {
    pub fn new(hardware: HardwareConfig, cloned: bool) -> Self {
        Self { hardware, cloned }
    }

    fn change(&self) -> HardwareChange {
        let hw = &self.hardware;
        let mut change = HardwareChange {
            cpu_reservation_mhz: hw.cpu_reservation_mhz,
            memory_reservation_mb: hw.memory_reservation_mb,
            nested_hv: hw.nested_hv.then_some(true),
            ..Default::default()
        };
        if self.cloned {
            change.cpus = hw.cpus;
            change.cores_per_socket = hw.cores_per_socket;
            change.memory_mb = hw.memory_mb;
        }
        change
    }

    async fn configure(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let vsphere = state.vsphere()?;
        let vm = state.vm()?;

        let change = self.change();
        if change.is_empty() {
            info!(%vm, "no hardware changes requested");
        } else {
            ctx.ui.say("Customizing hardware...");
            vsphere
                .reconfigure(vm, &change)
                .await
                .with_context(|| format!("reconfiguring {vm}"))?;
        }

        if self.cloned {
            let disks = disk_specs(&self.hardware).into_iter().map(Device::Disk);
            let nics = nic_specs(&self.hardware).into_iter().map(Device::Nic);
            for device in disks.chain(nics) {
                ctx.ui.say(&format!("Adding {device:?}..."));
                vsphere
                    .add_device(vm, &device)
                    .await
                    .with_context(|| format!("adding a device to {vm}"))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for ConfigureHardware {
    fn name(&self) -> &str {
        "configure-hardware"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.configure(ctx, state).await.into()
    }
}

/// Sets the boot order and powers the VM on. On failure the VM is powered
/// back off.
pub struct Run {
    boot_order: Vec<BootDevice>,
}

impl Run {
    pub fn new(boot_order: Vec<BootDevice>) -> Self {
        Self { boot_order }
    }

    async fn power_on(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let vsphere = state.vsphere()?;
        let vm = state.vm()?;
        if !self.boot_order.is_empty() {
            info!(%vm, order = ?self.boot_order, "setting boot order");
            vsphere
                .set_boot_order(vm, &self.boot_order)
                .await
                .with_context(|| format!("setting boot order of {vm}"))?;
        }
        ctx.ui.say("Powering on VM...");
        vsphere
            .power_on(vm)
            .await
            .with_context(|| format!("powering on {vm}"))?;
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for Run {
    fn name(&self) -> &str {
        "run"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.power_on(ctx, state).await.into()
    }

    async fn cleanup(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        if !state.failed() || state.destroyed {
            return Ok(());
        }
        let (Some(vsphere), Some(vm)) = (&state.vsphere, &state.vm) else {
            return Ok(());
        };
        if vsphere.power_state(vm).await? == PowerState::PoweredOn {
            ctx.ui.say("Powering off VM...");
            vsphere
                .power_off(vm)
                .await
                .with_context(|| format!("powering off {vm}"))?;
        }
        Ok(())
    }
}

/// Shuts the guest down, by command over the communicator when one is
/// configured and otherwise through the guest tools, and waits until the VM
/// is off.
pub struct Shutdown {
    config: ShutdownConfig,
}

impl Shutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        Self { config }
    }

    async fn request_shutdown(
        &self,
        ctx: &StepContext,
        state: &BuildState,
    ) -> anyhow::Result<()> {
        let vm = state.vm()?;
        if self.config.disable_shutdown {
            ctx.ui.say("Automatic shutdown disabled. Please shut down the VM.");
            return Ok(());
        }

        match (&self.config.shutdown_command, &state.session) {
            (Some(command), Some(session)) => {
                ctx.ui.say("Executing shutdown command...");
                // The guest commonly drops the connection while going down,
                // so only an explicit failure status counts.
                match session.run(command, &BTreeMap::new()).await {
                    Ok(out) if !out.success() => bail!(
                        "shutdown command exited with status {}: {}",
                        out.exit_status,
                        out.stderr.trim()
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(
                        error = %format!("{e:#}"),
                        "shutdown command did not complete"
                    ),
                }
            }
            _ => {
                ctx.ui.say("Shutting down VM...");
                state
                    .vsphere()?
                    .shutdown_guest(vm)
                    .await
                    .with_context(|| format!("shutting down guest of {vm}"))?;
            }
        }
        Ok(())
    }

    async fn shutdown(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let vsphere = state.vsphere()?.clone();
        let vm = state.vm()?.clone();

        if vsphere.power_state(&vm).await? == PowerState::PoweredOff {
            ctx.ui.say("VM is already powered off.");
            return Ok(());
        }
        self.request_shutdown(ctx, state).await?;

        let events = poll_stream(POLL_INTERVAL, move || {
            let vsphere = vsphere.clone();
            let vm = vm.clone();
            async move { Ok::<_, anyhow::Error>(vsphere.power_state(&vm).await?) }
        });
        let resource = ResourceId::new("VirtualMachine", &state.vm()?.name);
        Watch::new(resource, self.config.shutdown_timeout)
            .wait(events, &ctx.cancel, |power| match power {
                PowerState::PoweredOff => Readiness::Ready(()),
                other => Readiness::Pending(format!("VM is still {other}")),
            })
            .await
            .context("waiting for the VM to shut down")?;
        ctx.ui.say("VM is powered off.");
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for Shutdown {
    fn name(&self) -> &str {
        "shutdown"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.shutdown(ctx, state).await.into()
    }
}

/// Default boot order while installing: the empty disk first so an
/// installed system boots from it, then the media.
pub fn install_boot_order(configured: Option<&str>) -> Vec<BootDevice> {
    match configured {
        Some(order) => BootDevice::parse_order(order),
        None => vec![BootDevice::Disk, BootDevice::Cdrom],
    }
}
