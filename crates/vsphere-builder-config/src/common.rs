// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration sections shared by the builders.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde_derive::{Deserialize, Serialize};

use crate::Problems;

/// How to reach vCenter.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub vcenter_server: String,
    pub username: String,
    pub password: String,

    #[serde(default)]
    pub insecure_connection: bool,

    pub datacenter: Option<String>,
}

impl ConnectionConfig {
    pub(crate) fn validate(&self, p: &mut Problems) {
        p.require("connection.vcenter_server", &self.vcenter_server);
        p.require("connection.username", &self.username);
        p.require("connection.password", &self.password);
    }
}

/// Where the VM lives in the inventory.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct LocationConfig {
    pub vm_name: String,
    pub folder: Option<String>,
    pub cluster: Option<String>,
    pub host: Option<String>,
    pub resource_pool: Option<String>,
    pub datastore: Option<String>,
}

impl LocationConfig {
    pub(crate) fn validate(&self, p: &mut Problems) {
        p.require("location.vm_name", &self.vm_name);
        if self.cluster.is_none() && self.host.is_none() {
            p.push("location", "one of cluster or host must be set");
        }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Firmware {
    #[default]
    Bios,
    Efi,
    EfiSecure,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct DiskConfig {
    pub size_mb: u64,

    #[serde(default)]
    pub thin_provisioned: bool,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct NicConfig {
    pub network: String,

    #[serde(default = "default_adapter")]
    pub adapter_type: String,
}

fn default_adapter() -> String {
    "vmxnet3".to_string()
}

/// Virtual hardware. Unset fields keep whatever the VM was created or cloned
/// with.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct HardwareConfig {
    pub cpus: Option<u32>,
    pub cores_per_socket: Option<u32>,
    pub memory_mb: Option<u64>,
    pub cpu_reservation_mhz: Option<u64>,
    pub memory_reservation_mb: Option<u64>,

    #[serde(default)]
    pub nested_hv: bool,

    #[serde(default)]
    pub firmware: Firmware,

    pub guest_os_type: Option<String>,

    #[serde(default, rename = "disk")]
    pub disks: Vec<DiskConfig>,

    #[serde(default, rename = "network")]
    pub networks: Vec<NicConfig>,
}

impl HardwareConfig {
    pub(crate) fn validate(&self, p: &mut Problems) {
        if self.cpus == Some(0) {
            p.push("hardware.cpus", "must be at least 1");
        }
        if self.memory_mb == Some(0) {
            p.push("hardware.memory_mb", "must be at least 1");
        }
        if let (Some(cpus), Some(cores)) = (self.cpus, self.cores_per_socket) {
            if cores == 0 || cpus % cores != 0 {
                p.push(
                    "hardware.cores_per_socket",
                    format!("must divide cpus ({cpus})"),
                );
            }
        }
        for (i, disk) in self.disks.iter().enumerate() {
            if disk.size_mb == 0 {
                p.push(format!("hardware.disk[{i}].size_mb"), "must be non-zero");
            }
        }
        for (i, nic) in self.networks.iter().enumerate() {
            p.require(format!("hardware.network[{i}].network"), &nic.network);
        }
    }

    /// True if any field would change an existing VM.
    pub fn has_overrides(&self) -> bool {
        self.cpus.is_some()
            || self.cores_per_socket.is_some()
            || self.memory_mb.is_some()
            || self.cpu_reservation_mhz.is_some()
            || self.memory_reservation_mb.is_some()
            || self.nested_hv
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CdromType {
    #[default]
    Ide,
    Sata,
}

/// A local ISO image uploaded to the datastore before it is attached.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct IsoFile {
    pub path: Utf8PathBuf,

    /// Expected SHA-256 of the file, hex encoded, optionally prefixed with
    /// `sha256:`.
    pub checksum: Option<String>,
}

impl IsoFile {
    /// The expected digest with any `sha256:` prefix removed.
    pub fn expected_sha256(&self) -> Option<&str> {
        self.checksum
            .as_deref()
            .map(|c| c.strip_prefix("sha256:").unwrap_or(c))
    }
}

/// Optical media attached to the VM.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct CdromConfig {
    /// Images already on a datastore, e.g. `"[datastore1] iso/os.iso"`.
    #[serde(default)]
    pub iso_paths: Vec<String>,

    #[serde(default, rename = "iso_file")]
    pub iso_files: Vec<IsoFile>,

    #[serde(default)]
    pub cdrom_type: CdromType,

    /// Detach the drives before the VM is shut down for good.
    #[serde(default)]
    pub remove_cdrom: bool,
}

impl CdromConfig {
    pub fn has_media(&self) -> bool {
        !self.iso_paths.is_empty() || !self.iso_files.is_empty()
    }

    pub(crate) fn validate(&self, p: &mut Problems) {
        for (i, iso) in self.iso_files.iter().enumerate() {
            let field = format!("cdrom.iso_file[{i}]");
            if !iso.path.is_file() {
                p.push(field.clone(), format!("{} does not exist", iso.path));
            }
            if let Some(sum) = iso.expected_sha256() {
                if sum.len() != 64 || !sum.bytes().all(|b| b.is_ascii_hexdigit())
                {
                    p.push(
                        format!("{field}.checksum"),
                        "must be a hex encoded SHA-256 digest",
                    );
                }
            }
        }
    }
}

/// Keystrokes typed into the VM console after power on.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct BootConfig {
    #[serde(with = "crate::duration", default = "default_boot_wait")]
    pub boot_wait: Duration,

    #[serde(default)]
    pub boot_command: Vec<String>,

    /// Comma-separated device list, e.g. `"disk,cdrom"`.
    pub boot_order: Option<String>,

    #[serde(with = "crate::duration", default = "default_key_interval")]
    pub boot_key_interval: Duration,
}

fn default_boot_wait() -> Duration {
    Duration::from_secs(10)
}

fn default_key_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            boot_wait: default_boot_wait(),
            boot_command: Vec::new(),
            boot_order: None,
            boot_key_interval: default_key_interval(),
        }
    }
}

impl BootConfig {
    pub(crate) fn validate(&self, p: &mut Problems) {
        if let Some(order) = &self.boot_order {
            for dev in order.split(',').map(str::trim) {
                if !matches!(dev, "disk" | "cdrom" | "ethernet" | "floppy") {
                    p.push(
                        "boot.boot_order",
                        format!("unknown boot device {dev:?}"),
                    );
                }
            }
        }
    }
}

/// The boot-file HTTP server.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct HttpConfig {
    pub http_directory: Option<Utf8PathBuf>,

    /// Inline files served alongside `http_directory`, keyed by URL path.
    #[serde(default)]
    pub http_content: BTreeMap<String, String>,

    #[serde(default = "default_port_min")]
    pub http_port_min: u16,

    #[serde(default = "default_port_max")]
    pub http_port_max: u16,

    pub http_bind_address: Option<IpAddr>,
    pub http_interface: Option<String>,
}

fn default_port_min() -> u16 {
    8000
}

fn default_port_max() -> u16 {
    9000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            http_directory: None,
            http_content: BTreeMap::new(),
            http_port_min: default_port_min(),
            http_port_max: default_port_max(),
            http_bind_address: None,
            http_interface: None,
        }
    }
}

/// How the address advertised to the guest for the HTTP server is chosen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HttpAddressStrategy {
    BindAddress(IpAddr),
    Interface(String),
    Discover,
}

impl HttpConfig {
    pub fn is_enabled(&self) -> bool {
        self.http_directory.is_some() || !self.http_content.is_empty()
    }

    pub fn address_strategy(&self) -> HttpAddressStrategy {
        match (&self.http_bind_address, &self.http_interface) {
            (Some(addr), _) => HttpAddressStrategy::BindAddress(*addr),
            (None, Some(iface)) => HttpAddressStrategy::Interface(iface.clone()),
            (None, None) => HttpAddressStrategy::Discover,
        }
    }

    pub(crate) fn validate(&self, p: &mut Problems) {
        if self.http_port_min > self.http_port_max {
            p.push("http.http_port_min", "must not exceed http_port_max");
        }
        if self.http_bind_address.is_some() && self.http_interface.is_some() {
            p.push(
                "http",
                "http_bind_address and http_interface are mutually exclusive",
            );
        }
        if let Some(dir) = &self.http_directory {
            if !dir.is_dir() {
                p.push("http.http_directory", format!("{dir} is not a directory"));
            }
        }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommunicatorKind {
    #[default]
    Ssh,
    Winrm,
    None,
}

impl fmt::Display for CommunicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommunicatorKind::Ssh => "ssh",
            CommunicatorKind::Winrm => "winrm",
            CommunicatorKind::None => "none",
        })
    }
}

/// How to reach the guest once it has booted.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct CommunicatorConfig {
    #[serde(rename = "type", default)]
    pub kind: CommunicatorKind,

    /// Overrides the discovered guest address.
    pub host: Option<String>,

    /// Defaults to 22 for ssh and 5985 for winrm.
    pub port: Option<u16>,

    #[serde(default)]
    pub username: String,

    pub password: Option<String>,
    pub private_key_file: Option<Utf8PathBuf>,

    #[serde(with = "crate::duration", default = "default_comm_timeout")]
    pub timeout: Duration,
}

fn default_comm_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            kind: CommunicatorKind::default(),
            host: None,
            port: None,
            username: String::new(),
            password: None,
            private_key_file: None,
            timeout: default_comm_timeout(),
        }
    }
}

impl CommunicatorConfig {
    pub fn is_enabled(&self) -> bool {
        self.kind != CommunicatorKind::None
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(match self.kind {
            CommunicatorKind::Winrm => 5985,
            _ => 22,
        })
    }

    pub(crate) fn prepare(&mut self, p: &mut Problems) {
        if !self.is_enabled() {
            return;
        }
        self.port = Some(self.effective_port());
        p.require("communicator.username", &self.username);
        if self.password.is_none() && self.private_key_file.is_none() {
            p.push(
                "communicator",
                "one of password or private_key_file must be set",
            );
        }
        if let Some(key) = &self.private_key_file {
            if !key.is_file() {
                p.push(
                    "communicator.private_key_file",
                    format!("{key} does not exist"),
                );
            }
        }
    }
}

/// An IP network in CIDR notation, such as `10.0.0.0/8`.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct IpCidr {
    addr: IpAddr,
    prefix: u8,
}

impl IpCidr {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix))
                    .unwrap_or(0);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix))
                    .unwrap_or(0);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpCidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) =
            s.split_once('/').ok_or_else(|| format!("{s:?} is not a CIDR"))?;
        let addr: IpAddr =
            addr.parse().map_err(|_| format!("bad address in {s:?}"))?;
        let prefix: u8 =
            prefix.parse().map_err(|_| format!("bad prefix in {s:?}"))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(format!("prefix in {s:?} exceeds {max}"));
        }
        Ok(Self { addr, prefix })
    }
}

impl TryFrom<String> for IpCidr {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpCidr> for String {
    fn from(c: IpCidr) -> String {
        c.to_string()
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Waiting for the guest to report an address.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct WaitIpConfig {
    #[serde(with = "crate::duration", default = "default_ip_wait")]
    pub ip_wait_timeout: Duration,

    /// How long the address must stay unchanged before it is accepted.
    #[serde(with = "crate::duration", default = "default_ip_settle")]
    pub ip_settle_timeout: Duration,

    /// Only accept addresses inside this network.
    pub ip_wait_address: Option<IpCidr>,
}

fn default_ip_wait() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_ip_settle() -> Duration {
    Duration::from_secs(5)
}

impl Default for WaitIpConfig {
    fn default() -> Self {
        Self {
            ip_wait_timeout: default_ip_wait(),
            ip_settle_timeout: default_ip_settle(),
            ip_wait_address: None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ShutdownConfig {
    /// Run through the communicator. When unset, the guest tools are asked
    /// to shut the guest down.
    pub shutdown_command: Option<String>,

    #[serde(with = "crate::duration", default = "default_shutdown")]
    pub shutdown_timeout: Duration,

    /// Wait for the guest to power itself off instead of asking it to.
    #[serde(default)]
    pub disable_shutdown: bool,
}

fn default_shutdown() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            shutdown_command: None,
            shutdown_timeout: default_shutdown(),
            disable_shutdown: false,
        }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Ovf,
    Ova,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    None,
    #[default]
    Sha256,
}

/// Export of the finished VM to local files.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ExportConfig {
    pub output_directory: Utf8PathBuf,

    /// Base name of the exported files; defaults to the VM name.
    pub name: Option<String>,

    #[serde(default)]
    pub format: ExportFormat,

    #[serde(default)]
    pub manifest: ManifestKind,

    /// Replace existing files in `output_directory`.
    #[serde(default)]
    pub force: bool,
}

impl ExportConfig {
    pub(crate) fn validate(&self, p: &mut Problems) {
        if self.output_directory.as_str().is_empty() {
            p.push("export.output_directory", "must be set");
        } else if self.output_directory.is_file() {
            p.push(
                "export.output_directory",
                format!("{} is a file", self.output_directory),
            );
        }
    }
}

/// Import of the finished VM into a content library.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ContentLibraryConfig {
    pub library: String,
    pub name: Option<String>,
    pub description: Option<String>,

    /// Import as an OVF template rather than a VM template.
    #[serde(default)]
    pub ovf: bool,

    /// Destroy the source VM once it has been imported.
    #[serde(default)]
    pub destroy: bool,
}

impl ContentLibraryConfig {
    pub(crate) fn validate(&self, p: &mut Problems) {
        p.require("content_library.library", &self.library);
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProvisionerConfig {
    Shell {
        inline: Vec<String>,

        #[serde(default)]
        environment: BTreeMap<String, String>,
    },
    File {
        source: Utf8PathBuf,
        destination: String,
    },
}

impl ProvisionerConfig {
    pub(crate) fn validate(&self, idx: usize, p: &mut Problems) {
        let field = format!("provisioner[{idx}]");
        match self {
            ProvisionerConfig::Shell { inline, .. } => {
                if inline.is_empty() {
                    p.push(field, "shell provisioner has no inline commands");
                }
            }
            ProvisionerConfig::File { source, destination } => {
                if !source.exists() {
                    p.push(field.clone(), format!("{source} does not exist"));
                }
                p.require(format!("{field}.destination"), destination);
            }
        }
    }
}

/// Everything the ISO and clone builders have in common: a vSphere VM that
/// is booted, provisioned, shut down and then optionally exported.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct VmConfig {
    pub connection: ConnectionConfig,
    pub location: LocationConfig,

    #[serde(default)]
    pub hardware: HardwareConfig,

    #[serde(default)]
    pub cdrom: CdromConfig,

    #[serde(default)]
    pub boot: BootConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub communicator: CommunicatorConfig,

    #[serde(default)]
    pub wait_ip: WaitIpConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default, rename = "provisioner")]
    pub provisioners: Vec<ProvisionerConfig>,

    pub export: Option<ExportConfig>,
    pub content_library: Option<ContentLibraryConfig>,

    #[serde(default)]
    pub create_snapshot: bool,

    pub snapshot_name: Option<String>,

    #[serde(default)]
    pub convert_to_template: bool,

    /// Destroy the VM at the end of the build, even when it succeeds.
    #[serde(default)]
    pub destroy: bool,
}

impl VmConfig {
    pub(crate) fn prepare(&mut self, p: &mut Problems) {
        self.connection.validate(p);
        self.location.validate(p);
        self.hardware.validate(p);
        self.cdrom.validate(p);
        self.boot.validate(p);
        self.http.validate(p);
        self.communicator.prepare(p);
        for (i, prov) in self.provisioners.iter().enumerate() {
            prov.validate(i, p);
        }
        if !self.provisioners.is_empty() && !self.communicator.is_enabled() {
            p.push("provisioner", "provisioners require a communicator");
        }
        if let Some(export) = &self.export {
            export.validate(p);
        }
        if let Some(cl) = &self.content_library {
            cl.validate(p);
            if self.convert_to_template && !cl.ovf {
                p.push(
                    "content_library",
                    "a VM template import is incompatible with convert_to_template",
                );
            }
            if cl.destroy && self.export.is_some() {
                p.push(
                    "content_library.destroy",
                    "the VM is destroyed before it can be exported",
                );
            }
        }
        if self.destroy && self.convert_to_template {
            p.push("destroy", "cannot destroy a VM converted to a template");
        }
        if self.create_snapshot && self.snapshot_name.is_none() {
            self.snapshot_name = Some("Created by vsphere-builder".to_string());
        }
    }
}
