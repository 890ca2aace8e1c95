// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boundary to a Supervisor cluster: a declarative object store with
//! watch support.
//!
//! Objects are declared by the builder and reconciled by the cluster, which
//! reports progress through each object's status. [`ObjectStore`] is
//! deliberately untyped so it can be used as a trait object; the free
//! functions at the bottom of this module layer typed access on top.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8Path;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use multistep::Observation;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use vsphere_builder_config::{BootstrapProvider, ImageType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    VirtualMachine,
    VirtualMachineService,
    Secret,
    VirtualMachinePublishRequest,
    ContentLibraryItemImportRequest,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound { kind: Kind, namespace: String, name: String },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists { kind: Kind, namespace: String, name: String },

    /// An update was based on a stale generation of the object.
    #[error("{kind} {namespace}/{name} was modified concurrently")]
    Conflict { kind: Kind, namespace: String, name: String },

    #[error("expected a {expected}, got a {actual}")]
    WrongKind { expected: Kind, actual: Kind },

    #[error("cluster request failed: {0}")]
    Backend(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Bumped by the store on every change.
    #[serde(default)]
    pub generation: u64,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmPowerState {
    PoweredOn,
    PoweredOff,
}

impl fmt::Display for VmPowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmNetwork {
    pub network_type: String,
    pub network_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmBootstrap {
    pub provider: BootstrapProvider,
    pub secret_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineSpec {
    pub class_name: String,
    pub image_name: String,
    pub storage_class: String,
    pub power_state: VmPowerState,
    pub network: Option<VmNetwork>,
    pub bootstrap: Option<VmBootstrap>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineStatus {
    pub power_state: Option<VmPowerState>,
    pub vm_ip: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub metadata: ObjectMeta,
    pub spec: VirtualMachineSpec,

    #[serde(default)]
    pub status: VirtualMachineStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
    pub target_port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineServiceSpec {
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<ServicePort>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineServiceStatus {
    pub ingress_ip: Option<String>,
}

/// A load balancer in front of the source VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineService {
    pub metadata: ObjectMeta,
    pub spec: VirtualMachineServiceSpec,

    #[serde(default)]
    pub status: VirtualMachineServiceStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub metadata: ObjectMeta,
    pub string_data: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequestSpec {
    pub source_name: String,
    pub target_item_name: String,
    pub target_location_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequestStatus {
    pub completed: bool,
    pub ready: bool,
    pub image_name: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachinePublishRequest {
    pub metadata: ObjectMeta,
    pub spec: PublishRequestSpec,

    #[serde(default)]
    pub status: PublishRequestStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRequestSpec {
    pub source_url: String,
    pub target_library: String,
    pub item_type: ImageType,
    pub item_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRequestStatus {
    pub completed: bool,

    /// Content library item created by the import, e.g. `clitem-abc123`.
    pub item_name: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentLibraryItemImportRequest {
    pub metadata: ObjectMeta,
    pub spec: ImportRequestSpec,

    #[serde(default)]
    pub status: ImportRequestStatus,
}

/// Any object the builder declares.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resource {
    VirtualMachine(VirtualMachine),
    VirtualMachineService(VirtualMachineService),
    Secret(Secret),
    VirtualMachinePublishRequest(VirtualMachinePublishRequest),
    ContentLibraryItemImportRequest(ContentLibraryItemImportRequest),
}

impl Resource {
    pub fn kind(&self) -> Kind {
        match self {
            Resource::VirtualMachine(_) => Kind::VirtualMachine,
            Resource::VirtualMachineService(_) => Kind::VirtualMachineService,
            Resource::Secret(_) => Kind::Secret,
            Resource::VirtualMachinePublishRequest(_) => {
                Kind::VirtualMachinePublishRequest
            }
            Resource::ContentLibraryItemImportRequest(_) => {
                Kind::ContentLibraryItemImportRequest
            }
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Resource::VirtualMachine(o) => &o.metadata,
            Resource::VirtualMachineService(o) => &o.metadata,
            Resource::Secret(o) => &o.metadata,
            Resource::VirtualMachinePublishRequest(o) => &o.metadata,
            Resource::ContentLibraryItemImportRequest(o) => &o.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Resource::VirtualMachine(o) => &mut o.metadata,
            Resource::VirtualMachineService(o) => &mut o.metadata,
            Resource::Secret(o) => &mut o.metadata,
            Resource::VirtualMachinePublishRequest(o) => &mut o.metadata,
            Resource::ContentLibraryItemImportRequest(o) => &mut o.metadata,
        }
    }
}

/// A typed view of one [`Resource`] variant.
pub trait Typed: Sized + Into<Resource> + Send + 'static {
    const KIND: Kind;

    fn from_resource(r: Resource) -> Result<Self, StoreError>;
}

macro_rules! typed_resource {
    ($ty:ident) => {
        impl From<$ty> for Resource {
            fn from(o: $ty) -> Self {
                Resource::$ty(o)
            }
        }

        impl Typed for $ty {
            const KIND: Kind = Kind::$ty;

            fn from_resource(r: Resource) -> Result<Self, StoreError> {
                match r {
                    Resource::$ty(o) => Ok(o),
                    other => Err(StoreError::WrongKind {
                        expected: Kind::$ty,
                        actual: other.kind(),
                    }),
                }
            }
        }
    };
}

typed_resource!(VirtualMachine);
typed_resource!(VirtualMachineService);
typed_resource!(Secret);
typed_resource!(VirtualMachinePublishRequest);
typed_resource!(ContentLibraryItemImportRequest);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Added(Resource),
    Modified(Resource),
    Deleted(Resource),
    Error(String),
}

/// A namespace-scoped declarative object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Creates `obj` in the namespace named by its metadata.
    async fn create(&self, obj: Resource) -> Result<Resource, StoreError>;

    async fn get(
        &self,
        namespace: &str,
        kind: Kind,
        name: &str,
    ) -> Result<Resource, StoreError>;

    /// Replaces an existing object. A nonzero generation in `obj` must match
    /// the stored one.
    async fn update(&self, obj: Resource) -> Result<Resource, StoreError>;

    async fn delete(
        &self,
        namespace: &str,
        kind: Kind,
        name: &str,
    ) -> Result<(), StoreError>;

    /// Subscribes to changes of one object. If the object exists, the first
    /// event is an `Added` carrying its current state. Dropping the stream
    /// ends the subscription.
    async fn watch(
        &self,
        namespace: &str,
        kind: Kind,
        name: &str,
    ) -> Result<BoxStream<'static, WatchEvent>, StoreError>;
}

/// Opens a connection to a Supervisor cluster.
#[async_trait]
pub trait KubeConnector: Send + Sync {
    async fn connect(
        &self,
        kubeconfig: Option<&Utf8Path>,
        namespace: &str,
    ) -> Result<Arc<dyn ObjectStore>, StoreError>;
}

pub async fn create<T: Typed>(
    store: &dyn ObjectStore,
    obj: T,
) -> Result<T, StoreError> {
    T::from_resource(store.create(obj.into()).await?)
}

pub async fn get<T: Typed>(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
) -> Result<T, StoreError> {
    T::from_resource(store.get(namespace, T::KIND, name).await?)
}

pub async fn delete<T: Typed>(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
) -> Result<(), StoreError> {
    store.delete(namespace, T::KIND, name).await
}

/// Watches one object and converts its events into observations for
/// [`multistep::Watch`].
pub async fn watch<T: Typed>(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
) -> Result<impl Stream<Item = Observation<T>> + Send + 'static, StoreError> {
    let events = store.watch(namespace, T::KIND, name).await?;
    Ok(events.map(|event| match event {
        WatchEvent::Added(r) | WatchEvent::Modified(r) => {
            match T::from_resource(r) {
                Ok(obj) => Observation::Object(obj),
                Err(e) => Observation::Error(e.to_string()),
            }
        }
        WatchEvent::Deleted(_) => Observation::Deleted,
        WatchEvent::Error(message) => Observation::Error(message),
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    fn secret() -> Secret {
        Secret {
            metadata: ObjectMeta::new("ns", "s"),
            string_data: BTreeMap::new(),
        }
    }

    #[test]
    fn typed_round_trip_through_resource() {
        let r: Resource = secret().into();
        assert_eq!(r.kind(), Kind::Secret);
        assert_eq!(r.metadata().name, "s");
        assert_eq!(Secret::from_resource(r).unwrap(), secret());
    }

    #[test]
    fn wrong_kind_is_reported() {
        let r: Resource = secret().into();
        assert_eq!(
            VirtualMachine::from_resource(r).unwrap_err(),
            StoreError::WrongKind {
                expected: Kind::VirtualMachine,
                actual: Kind::Secret,
            }
        );
    }
}
