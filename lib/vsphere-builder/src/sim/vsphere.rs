// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory vCenter.
//!
//! Guest behavior is derived from the clock rather than from background
//! tasks: a powered-on VM reports an IP address once `ip_delay` has passed,
//! and a guest asked to shut down powers off after `shutdown_delay`.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::time::Instant;
use tracing::debug;
use vsphere_builder_config::{ConnectionConfig, ExportFormat};

use crate::bootcommand::KeyStroke;
use crate::vsphere::{
    BootDevice, CloneVmSpec, Connector, CreateVmSpec, Device, DeviceKey,
    DiskSpec, DriverError, ExportSpec, HardwareChange, LibraryImportSpec,
    PowerState, VmRef, Vsphere,
};

#[derive(Clone, Debug)]
pub struct SimVsphereConfig {
    /// Time from power-on until the guest reports an address.
    pub ip_delay: Duration,

    /// Time from a guest shutdown request until the VM is off.
    pub shutdown_delay: Duration,

    /// Address reported by every guest.
    pub guest_ip: IpAddr,
}

impl Default for SimVsphereConfig {
    fn default() -> Self {
        Self {
            ip_delay: Duration::from_secs(20),
            shutdown_delay: Duration::from_secs(10),
            guest_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 50)),
        }
    }
}

#[derive(Clone, Debug)]
struct SimVm {
    vm: VmRef,
    power: PowerState,
    ip_at: Option<Instant>,
    off_at: Option<Instant>,
    devices: BTreeMap<DeviceKey, Device>,
    boot_order: Vec<BootDevice>,
    hardware: HardwareChange,
    snapshots: Vec<String>,
    template: bool,
    typed: Vec<KeyStroke>,
}

impl SimVm {
    fn settle(&mut self, now: Instant) {
        if self.off_at.is_some_and(|at| now >= at) {
            self.power = PowerState::PoweredOff;
            self.off_at = None;
            self.ip_at = None;
        }
    }

    fn ip(&self, now: Instant, ip: IpAddr) -> Option<IpAddr> {
        match (self.power, self.ip_at) {
            (PowerState::PoweredOn, Some(at)) if now >= at => Some(ip),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Inner {
    vms: BTreeMap<String, SimVm>,
    next_id: u32,
    next_device: i32,
    files: BTreeSet<String>,
    library_items: BTreeMap<String, String>,
    faults: BTreeMap<String, String>,
    calls: Vec<String>,
    logouts: u32,
}

impl Inner {
    fn vm_mut(&mut self, vm: &VmRef) -> Result<&mut SimVm, DriverError> {
        self.vms.get_mut(&vm.id).ok_or_else(|| DriverError::NotFound {
            kind: "VM",
            name: vm.name.clone(),
        })
    }

    fn by_name(&self, name: &str) -> Option<&SimVm> {
        self.vms.values().find(|v| v.vm.name == name)
    }

    fn next_vm_id(&mut self) -> String {
        self.next_id += 1;
        format!("vm-{}", self.next_id)
    }

    fn attach(&mut self, vm: &mut SimVm, device: Device) -> DeviceKey {
        self.next_device += 1;
        let key = DeviceKey(3000 + self.next_device);
        vm.devices.insert(key, device);
        key
    }
}

/// The simulated vCenter. Clones share the same inventory.
#[derive(Clone, Default)]
pub struct SimVsphere {
    inner: Arc<Mutex<Inner>>,
    config: Arc<SimVsphereConfig>,
}

fn task(op: &'static str, message: impl Into<String>) -> DriverError {
    DriverError::Task { op, message: message.into() }
}

impl SimVsphere {
    pub fn new(config: SimVsphereConfig) -> Self {
        Self { inner: Arc::default(), config: Arc::new(config) }
    }

    /// Makes every later call of `op` fail with `message`.
    pub fn fail(&self, op: &str, message: &str) {
        self.inner
            .lock()
            .unwrap()
            .faults
            .insert(op.to_owned(), message.to_owned());
    }

    pub fn clear_faults(&self) {
        self.inner.lock().unwrap().faults.clear();
    }

    /// Every call made so far, as `"<op> <subject>"`.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Adds a powered-off template that clones can be made from.
    pub fn add_template(&self, name: &str) -> VmRef {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_vm_id();
        let vm = VmRef { id: id.clone(), name: name.to_owned(), folder: None };
        let mut sim = SimVm {
            vm: vm.clone(),
            power: PowerState::PoweredOff,
            ip_at: None,
            off_at: None,
            devices: BTreeMap::new(),
            boot_order: Vec::new(),
            hardware: HardwareChange {
                cpus: Some(1),
                memory_mb: Some(1024),
                ..Default::default()
            },
            snapshots: Vec::new(),
            template: true,
            typed: Vec::new(),
        };
        inner.attach(
            &mut sim,
            Device::Disk(DiskSpec { size_mb: 8192, thin_provisioned: true }),
        );
        inner.vms.insert(id, sim);
        vm
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner.lock().unwrap().by_name(name).is_some()
    }

    pub fn power_of(&self, name: &str) -> Option<PowerState> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let vm = inner.vms.values_mut().find(|v| v.vm.name == name)?;
        vm.settle(now);
        Some(vm.power)
    }

    pub fn devices(&self, name: &str) -> Vec<Device> {
        self.with_vm(name, |vm| vm.devices.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn boot_order(&self, name: &str) -> Vec<BootDevice> {
        self.with_vm(name, |vm| vm.boot_order.clone()).unwrap_or_default()
    }

    pub fn hardware(&self, name: &str) -> Option<HardwareChange> {
        self.with_vm(name, |vm| vm.hardware.clone())
    }

    pub fn typed_keys(&self, name: &str) -> Vec<KeyStroke> {
        self.with_vm(name, |vm| vm.typed.clone()).unwrap_or_default()
    }

    pub fn snapshots(&self, name: &str) -> Vec<String> {
        self.with_vm(name, |vm| vm.snapshots.clone()).unwrap_or_default()
    }

    pub fn is_template(&self, name: &str) -> bool {
        self.with_vm(name, |vm| vm.template).unwrap_or(false)
    }

    /// Datastore paths of uploaded files.
    pub fn files(&self) -> Vec<String> {
        self.inner.lock().unwrap().files.iter().cloned().collect()
    }

    pub fn library_items(&self) -> BTreeMap<String, String> {
        self.inner.lock().unwrap().library_items.clone()
    }

    pub fn logouts(&self) -> u32 {
        self.inner.lock().unwrap().logouts
    }

    /// Starts a guest-initiated shutdown of whichever powered-on VM has
    /// `ip`. Returns false if no VM has that address.
    pub fn guest_shutdown(&self, ip: IpAddr) -> bool {
        if ip != self.config.guest_ip {
            return false;
        }
        let now = Instant::now();
        let delay = self.config.shutdown_delay;
        let mut inner = self.inner.lock().unwrap();
        let mut found = false;
        for vm in inner.vms.values_mut() {
            vm.settle(now);
            if vm.ip(now, ip).is_some() && vm.off_at.is_none() {
                vm.off_at = Some(now + delay);
                found = true;
            }
        }
        found
    }

    fn with_vm<T>(&self, name: &str, f: impl FnOnce(&SimVm) -> T) -> Option<T> {
        self.inner.lock().unwrap().by_name(name).map(f)
    }

    /// Records the call and applies any injected fault.
    fn enter(
        &self,
        op: &'static str,
        subject: &str,
    ) -> Result<MutexGuard<'_, Inner>, DriverError> {
        let mut inner = self.inner.lock().unwrap();
        debug!(op, subject, "simulated vSphere call");
        inner.calls.push(format!("{op} {subject}"));
        if let Some(message) = inner.faults.get(op) {
            return Err(task(op, message.clone()));
        }
        Ok(inner)
    }
}

#[async_trait]
impl Vsphere for SimVsphere {
    async fn find_vm(&self, name: &str) -> Result<VmRef, DriverError> {
        let inner = self.enter("find_vm", name)?;
        inner.by_name(name).map(|v| v.vm.clone()).ok_or_else(|| {
            DriverError::NotFound { kind: "VM", name: name.to_owned() }
        })
    }

    async fn create_vm(&self, spec: &CreateVmSpec) -> Result<VmRef, DriverError> {
        let mut inner = self.enter("create_vm", &spec.name)?;
        if inner.by_name(&spec.name).is_some() {
            return Err(DriverError::AlreadyExists {
                kind: "VM",
                name: spec.name.clone(),
            });
        }
        let id = inner.next_vm_id();
        let vm = VmRef {
            id: id.clone(),
            name: spec.name.clone(),
            folder: spec.placement.folder.clone(),
        };
        let mut sim = SimVm {
            vm: vm.clone(),
            power: PowerState::PoweredOff,
            ip_at: None,
            off_at: None,
            devices: BTreeMap::new(),
            boot_order: Vec::new(),
            hardware: HardwareChange {
                cpus: Some(spec.cpus),
                cores_per_socket: spec.cores_per_socket,
                memory_mb: Some(spec.memory_mb),
                ..Default::default()
            },
            snapshots: Vec::new(),
            template: false,
            typed: Vec::new(),
        };
        for disk in &spec.disks {
            inner.attach(&mut sim, Device::Disk(disk.clone()));
        }
        for nic in &spec.networks {
            inner.attach(&mut sim, Device::Nic(nic.clone()));
        }
        inner.vms.insert(id, sim);
        Ok(vm)
    }

    async fn clone_vm(&self, spec: &CloneVmSpec) -> Result<VmRef, DriverError> {
        let mut inner = self.enter("clone_vm", &spec.name)?;
        let source = inner.by_name(&spec.template).cloned().ok_or_else(|| {
            DriverError::NotFound {
                kind: "template",
                name: spec.template.clone(),
            }
        })?;
        if inner.by_name(&spec.name).is_some() {
            return Err(DriverError::AlreadyExists {
                kind: "VM",
                name: spec.name.clone(),
            });
        }
        let id = inner.next_vm_id();
        let vm = VmRef {
            id: id.clone(),
            name: spec.name.clone(),
            folder: spec.placement.folder.clone(),
        };
        let sim = SimVm {
            vm: vm.clone(),
            power: PowerState::PoweredOff,
            ip_at: None,
            off_at: None,
            template: false,
            snapshots: Vec::new(),
            typed: Vec::new(),
            ..source
        };
        inner.vms.insert(id, sim);
        Ok(vm)
    }

    async fn reconfigure(
        &self,
        vm: &VmRef,
        change: &HardwareChange,
    ) -> Result<(), DriverError> {
        let mut inner = self.enter("reconfigure", &vm.name)?;
        let sim = inner.vm_mut(vm)?;
        let hw = &mut sim.hardware;
        hw.cpus = change.cpus.or(hw.cpus);
        hw.cores_per_socket = change.cores_per_socket.or(hw.cores_per_socket);
        hw.memory_mb = change.memory_mb.or(hw.memory_mb);
        hw.cpu_reservation_mhz =
            change.cpu_reservation_mhz.or(hw.cpu_reservation_mhz);
        hw.memory_reservation_mb =
            change.memory_reservation_mb.or(hw.memory_reservation_mb);
        hw.nested_hv = change.nested_hv.or(hw.nested_hv);
        Ok(())
    }

    async fn add_device(
        &self,
        vm: &VmRef,
        device: &Device,
    ) -> Result<DeviceKey, DriverError> {
        let mut inner = self.enter("add_device", &vm.name)?;
        let mut sim = inner.vm_mut(vm)?.clone();
        let key = inner.attach(&mut sim, device.clone());
        inner.vms.insert(vm.id.clone(), sim);
        Ok(key)
    }

    async fn remove_devices(
        &self,
        vm: &VmRef,
        keys: &[DeviceKey],
    ) -> Result<(), DriverError> {
        let mut inner = self.enter("remove_devices", &vm.name)?;
        let sim = inner.vm_mut(vm)?;
        if let Some(missing) = keys.iter().find(|k| !sim.devices.contains_key(k))
        {
            return Err(DriverError::NotFound {
                kind: "device",
                name: missing.0.to_string(),
            });
        }
        for key in keys {
            sim.devices.remove(key);
        }
        Ok(())
    }

    async fn set_boot_order(
        &self,
        vm: &VmRef,
        order: &[BootDevice],
    ) -> Result<(), DriverError> {
        let mut inner = self.enter("set_boot_order", &vm.name)?;
        inner.vm_mut(vm)?.boot_order = order.to_vec();
        Ok(())
    }

    async fn power_on(&self, vm: &VmRef) -> Result<(), DriverError> {
        let now = Instant::now();
        let ip_delay = self.config.ip_delay;
        let mut inner = self.enter("power_on", &vm.name)?;
        let sim = inner.vm_mut(vm)?;
        sim.settle(now);
        if sim.template {
            return Err(task("power_on", "cannot power on a template"));
        }
        if sim.power == PowerState::PoweredOn {
            return Err(task("power_on", "VM is already powered on"));
        }
        sim.power = PowerState::PoweredOn;
        sim.ip_at = Some(now + ip_delay);
        sim.off_at = None;
        Ok(())
    }

    async fn power_off(&self, vm: &VmRef) -> Result<(), DriverError> {
        let now = Instant::now();
        let mut inner = self.enter("power_off", &vm.name)?;
        let sim = inner.vm_mut(vm)?;
        sim.settle(now);
        if sim.power == PowerState::PoweredOff {
            return Err(task("power_off", "VM is already powered off"));
        }
        sim.power = PowerState::PoweredOff;
        sim.ip_at = None;
        sim.off_at = None;
        Ok(())
    }

    async fn power_state(&self, vm: &VmRef) -> Result<PowerState, DriverError> {
        let now = Instant::now();
        let mut inner = self.enter("power_state", &vm.name)?;
        let sim = inner.vm_mut(vm)?;
        sim.settle(now);
        Ok(sim.power)
    }

    async fn guest_ip(&self, vm: &VmRef) -> Result<Option<IpAddr>, DriverError> {
        let now = Instant::now();
        let ip = self.config.guest_ip;
        let mut inner = self.enter("guest_ip", &vm.name)?;
        let sim = inner.vm_mut(vm)?;
        sim.settle(now);
        Ok(sim.ip(now, ip))
    }

    async fn shutdown_guest(&self, vm: &VmRef) -> Result<(), DriverError> {
        let now = Instant::now();
        let ip = self.config.guest_ip;
        let delay = self.config.shutdown_delay;
        let mut inner = self.enter("shutdown_guest", &vm.name)?;
        let sim = inner.vm_mut(vm)?;
        sim.settle(now);
        if sim.ip(now, ip).is_none() {
            return Err(task("shutdown_guest", "guest tools are not running"));
        }
        if sim.off_at.is_none() {
            sim.off_at = Some(now + delay);
        }
        Ok(())
    }

    async fn type_keys(
        &self,
        vm: &VmRef,
        keys: &[KeyStroke],
    ) -> Result<(), DriverError> {
        let mut inner = self.enter("type_keys", &vm.name)?;
        let sim = inner.vm_mut(vm)?;
        if sim.power != PowerState::PoweredOn {
            return Err(task("type_keys", "VM is not powered on"));
        }
        sim.typed.extend_from_slice(keys);
        Ok(())
    }

    async fn create_snapshot(
        &self,
        vm: &VmRef,
        name: &str,
    ) -> Result<(), DriverError> {
        let mut inner = self.enter("create_snapshot", &vm.name)?;
        inner.vm_mut(vm)?.snapshots.push(name.to_owned());
        Ok(())
    }

    async fn convert_to_template(&self, vm: &VmRef) -> Result<(), DriverError> {
        let now = Instant::now();
        let mut inner = self.enter("convert_to_template", &vm.name)?;
        let sim = inner.vm_mut(vm)?;
        sim.settle(now);
        if sim.power != PowerState::PoweredOff {
            return Err(task("convert_to_template", "VM must be powered off"));
        }
        sim.template = true;
        Ok(())
    }

    async fn destroy_vm(&self, vm: &VmRef) -> Result<(), DriverError> {
        let now = Instant::now();
        let mut inner = self.enter("destroy_vm", &vm.name)?;
        let sim = inner.vm_mut(vm)?;
        sim.settle(now);
        if sim.power == PowerState::PoweredOn {
            return Err(task("destroy_vm", "VM is powered on"));
        }
        inner.vms.remove(&vm.id);
        Ok(())
    }

    async fn upload_file(
        &self,
        local: &Utf8Path,
        datastore: &str,
        remote_path: &str,
    ) -> Result<String, DriverError> {
        if tokio::fs::metadata(local).await.is_err() {
            return Err(task("upload_file", format!("{local} does not exist")));
        }
        let path = format!("[{datastore}] {remote_path}");
        let mut inner = self.enter("upload_file", &path)?;
        inner.files.insert(path.clone());
        Ok(path)
    }

    async fn delete_file(&self, datastore_path: &str) -> Result<(), DriverError> {
        let mut inner = self.enter("delete_file", datastore_path)?;
        if !inner.files.remove(datastore_path) {
            return Err(DriverError::NotFound {
                kind: "file",
                name: datastore_path.to_owned(),
            });
        }
        Ok(())
    }

    async fn export_vm(
        &self,
        vm: &VmRef,
        spec: &ExportSpec,
    ) -> Result<Vec<Utf8PathBuf>, DriverError> {
        let now = Instant::now();
        let disks = {
            let mut inner = self.enter("export_vm", &vm.name)?;
            let sim = inner.vm_mut(vm)?;
            sim.settle(now);
            if sim.power != PowerState::PoweredOff {
                return Err(task("export_vm", "VM must be powered off"));
            }
            sim.devices
                .values()
                .filter(|d| matches!(d, Device::Disk(_)))
                .count()
        };

        let dir = &spec.output_directory;
        let mut files: Vec<(Utf8PathBuf, String)> = Vec::new();
        match spec.format {
            ExportFormat::Ovf => {
                files.push((
                    dir.join(format!("{}.ovf", spec.name)),
                    format!("<Envelope><VirtualSystem ovf:id=\"{}\"/></Envelope>", spec.name),
                ));
                for i in 0..disks {
                    files.push((
                        dir.join(format!("{}-disk-{i}.vmdk", spec.name)),
                        format!("disk {i} of {}", vm.name),
                    ));
                }
            }
            ExportFormat::Ova => {
                files.push((
                    dir.join(format!("{}.ova", spec.name)),
                    format!("ova of {} with {disks} disks", vm.name),
                ));
            }
        }

        for (path, contents) in &files {
            if !spec.force && tokio::fs::metadata(path).await.is_ok() {
                return Err(task("export_vm", format!("{path} already exists")));
            }
            tokio::fs::write(path, contents)
                .await
                .map_err(|e| task("export_vm", format!("writing {path}: {e}")))?;
        }
        Ok(files.into_iter().map(|(p, _)| p).collect())
    }

    async fn import_to_content_library(
        &self,
        vm: &VmRef,
        spec: &LibraryImportSpec,
    ) -> Result<String, DriverError> {
        let mut inner = self.enter("import_to_content_library", &vm.name)?;
        inner.vm_mut(vm)?;
        if inner.library_items.values().any(|n| *n == spec.name) {
            return Err(DriverError::AlreadyExists {
                kind: "library item",
                name: spec.name.clone(),
            });
        }
        let id = uuid::Uuid::new_v4().to_string();
        inner.library_items.insert(id.clone(), spec.name.clone());
        Ok(id)
    }

    async fn logout(&self) -> Result<(), DriverError> {
        let mut inner = self.enter("logout", "")?;
        inner.logouts += 1;
        Ok(())
    }
}

#[async_trait]
impl Connector for SimVsphere {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn Vsphere>, DriverError> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(format!("connect {}", config.vcenter_server));
            if let Some(message) = inner.faults.get("connect") {
                return Err(DriverError::Connect {
                    server: config.vcenter_server.clone(),
                    message: message.clone(),
                });
            }
        }
        Ok(Arc::new(self.clone()))
    }
}
