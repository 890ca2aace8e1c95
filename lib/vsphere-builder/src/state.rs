// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The state threaded through a build's steps.
//!
//! Handles and intermediate results that steps hand to each other live in
//! typed fields. Each field is written by exactly one step and is `None` (or
//! empty) until that step has done its work, which is what cleanups consult
//! to find out what actually happened.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use camino::Utf8PathBuf;
use multistep::{StateBag, StateError, StepState};

use crate::communicator::Session;
use crate::http::BootFileServer;
use crate::store::ObjectStore;
use crate::vsphere::{DeviceKey, VmRef, Vsphere};

/// Objects declared on a Supervisor cluster for the source VM.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceObjects {
    pub name: String,
    pub vm: bool,
    pub service: bool,
    pub secret: bool,
}

#[derive(Default)]
pub struct BuildState {
    bag: StateBag,

    pub vsphere: Option<Arc<dyn Vsphere>>,
    pub vm: Option<VmRef>,

    /// Datastore paths uploaded by this build.
    pub uploaded_media: Vec<String>,
    pub cdrom_devices: Vec<DeviceKey>,

    /// Address the HTTP server is advertised on, once discovered.
    pub http_ip: Option<IpAddr>,
    pub http_server: Option<BootFileServer>,

    /// Address advertised to the guest for the boot-file server.
    pub http_endpoint: Option<SocketAddr>,

    pub guest_ip: Option<IpAddr>,
    pub session: Option<Box<dyn Session>>,

    pub snapshot: Option<String>,
    pub template: bool,
    pub content_library_item: Option<String>,
    pub exported_files: Vec<Utf8PathBuf>,

    /// Set once the VM has been destroyed by this build.
    pub destroyed: bool,

    pub store: Option<Arc<dyn ObjectStore>>,
    pub namespace: Option<String>,
    pub imported_image: Option<String>,
    pub source: Option<SourceObjects>,
    pub published_image: Option<String>,
}

impl BuildState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vsphere(&self) -> Result<&Arc<dyn Vsphere>, StateError> {
        self.vsphere.as_ref().ok_or_else(|| missing("vsphere"))
    }

    pub fn vm(&self) -> Result<&VmRef, StateError> {
        self.vm.as_ref().ok_or_else(|| missing("vm"))
    }

    pub fn store(&self) -> Result<&Arc<dyn ObjectStore>, StateError> {
        self.store.as_ref().ok_or_else(|| missing("store"))
    }

    pub fn namespace(&self) -> Result<&str, StateError> {
        self.namespace.as_deref().ok_or_else(|| missing("namespace"))
    }

    pub fn guest_ip(&self) -> Result<IpAddr, StateError> {
        self.guest_ip.ok_or_else(|| missing("guest_ip"))
    }

    pub fn session(&self) -> Result<&dyn Session, StateError> {
        self.session.as_deref().ok_or_else(|| missing("session"))
    }

    pub fn source(&self) -> Result<&SourceObjects, StateError> {
        self.source.as_ref().ok_or_else(|| missing("source"))
    }

    /// True when the build is unwinding after a halt or cancellation.
    pub fn failed(&self) -> bool {
        self.is_halted() || self.is_cancelled()
    }
}

fn missing(key: &str) -> StateError {
    StateError::MissingKey(key.to_owned())
}

impl StepState for BuildState {
    fn bag(&self) -> &StateBag {
        &self.bag
    }

    fn bag_mut(&mut self) -> &mut StateBag {
        &mut self.bag
    }
}
