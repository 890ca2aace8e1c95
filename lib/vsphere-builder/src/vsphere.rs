// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boundary to the vSphere control plane.
//!
//! Every operation is a single remote call that either returns a result or a
//! [`DriverError`]. Nothing here retries; steps decide whether and how to
//! wait.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use vsphere_builder_config::{
    CdromType, ConnectionConfig, ExportFormat, Firmware,
};

use crate::bootcommand::KeyStroke;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("could not connect to {server}: {message}")]
    Connect { server: String, message: String },

    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{op} failed: {message}")]
    Task { op: &'static str, message: String },
}

/// A VM in the inventory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmRef {
    /// Managed object id, e.g. `vm-42`.
    pub id: String,
    pub name: String,
    pub folder: Option<String>,
}

impl fmt::Display for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    PoweredOff,
    PoweredOn,
    Suspended,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerState::PoweredOff => "poweredOff",
            PowerState::PoweredOn => "poweredOn",
            PowerState::Suspended => "suspended",
        })
    }
}

/// Placement shared by VM creation and cloning.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Placement {
    pub folder: Option<String>,
    pub cluster: Option<String>,
    pub host: Option<String>,
    pub resource_pool: Option<String>,
    pub datastore: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskSpec {
    pub size_mb: u64,
    pub thin_provisioned: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NicSpec {
    pub network: String,
    pub adapter_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateVmSpec {
    pub name: String,
    pub placement: Placement,
    pub cpus: u32,
    pub cores_per_socket: Option<u32>,
    pub memory_mb: u64,
    pub guest_os_type: String,
    pub firmware: Firmware,
    pub disks: Vec<DiskSpec>,
    pub networks: Vec<NicSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloneVmSpec {
    pub template: String,
    pub name: String,
    pub placement: Placement,
    pub linked_clone: bool,
}

/// Changes applied to an existing VM. `None` leaves a setting alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HardwareChange {
    pub cpus: Option<u32>,
    pub cores_per_socket: Option<u32>,
    pub memory_mb: Option<u64>,
    pub cpu_reservation_mhz: Option<u64>,
    pub memory_reservation_mb: Option<u64>,
    pub nested_hv: Option<bool>,
}

impl HardwareChange {
    pub fn is_empty(&self) -> bool {
        *self == HardwareChange::default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Device {
    Cdrom { iso_path: String, kind: CdromType },
    Disk(DiskSpec),
    Nic(NicSpec),
}

/// Key of a device attached to a VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceKey(pub i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootDevice {
    Disk,
    Cdrom,
    Ethernet,
    Floppy,
}

impl BootDevice {
    pub fn parse_order(order: &str) -> Vec<BootDevice> {
        order
            .split(',')
            .filter_map(|d| match d.trim() {
                "disk" => Some(BootDevice::Disk),
                "cdrom" => Some(BootDevice::Cdrom),
                "ethernet" => Some(BootDevice::Ethernet),
                "floppy" => Some(BootDevice::Floppy),
                _ => None,
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportSpec {
    pub name: String,
    pub format: ExportFormat,
    pub output_directory: Utf8PathBuf,
    pub force: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LibraryImportSpec {
    pub library: String,
    pub name: String,
    pub description: Option<String>,
    pub ovf: bool,
}

/// An authenticated vCenter session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Vsphere: Send + Sync {
    async fn find_vm(&self, name: &str) -> Result<VmRef, DriverError>;
    async fn create_vm(&self, spec: &CreateVmSpec) -> Result<VmRef, DriverError>;
    async fn clone_vm(&self, spec: &CloneVmSpec) -> Result<VmRef, DriverError>;
    async fn reconfigure(
        &self,
        vm: &VmRef,
        change: &HardwareChange,
    ) -> Result<(), DriverError>;
    async fn add_device(
        &self,
        vm: &VmRef,
        device: &Device,
    ) -> Result<DeviceKey, DriverError>;
    async fn remove_devices(
        &self,
        vm: &VmRef,
        keys: &[DeviceKey],
    ) -> Result<(), DriverError>;
    async fn set_boot_order(
        &self,
        vm: &VmRef,
        order: &[BootDevice],
    ) -> Result<(), DriverError>;
    async fn power_on(&self, vm: &VmRef) -> Result<(), DriverError>;
    async fn power_off(&self, vm: &VmRef) -> Result<(), DriverError>;
    async fn power_state(&self, vm: &VmRef) -> Result<PowerState, DriverError>;

    /// The address reported by the guest tools, if any.
    async fn guest_ip(&self, vm: &VmRef) -> Result<Option<IpAddr>, DriverError>;

    /// Asks the guest tools to shut the guest down. Returns once the request
    /// has been delivered, not once the VM is off.
    async fn shutdown_guest(&self, vm: &VmRef) -> Result<(), DriverError>;

    async fn type_keys(
        &self,
        vm: &VmRef,
        keys: &[KeyStroke],
    ) -> Result<(), DriverError>;
    async fn create_snapshot(
        &self,
        vm: &VmRef,
        name: &str,
    ) -> Result<(), DriverError>;
    async fn convert_to_template(&self, vm: &VmRef) -> Result<(), DriverError>;
    async fn destroy_vm(&self, vm: &VmRef) -> Result<(), DriverError>;

    /// Uploads a local file and returns its datastore path.
    async fn upload_file(
        &self,
        local: &Utf8Path,
        datastore: &str,
        remote_path: &str,
    ) -> Result<String, DriverError>;
    async fn delete_file(&self, datastore_path: &str) -> Result<(), DriverError>;

    /// Exports the VM and returns the files written.
    async fn export_vm(
        &self,
        vm: &VmRef,
        spec: &ExportSpec,
    ) -> Result<Vec<Utf8PathBuf>, DriverError>;

    /// Imports the VM into a content library and returns the item id.
    async fn import_to_content_library(
        &self,
        vm: &VmRef,
        spec: &LibraryImportSpec,
    ) -> Result<String, DriverError>;

    async fn logout(&self) -> Result<(), DriverError>;
}

/// Opens vCenter sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn Vsphere>, DriverError>;
}
