// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Steps of the Supervisor builder. The source VM and everything around it
//! are declared as objects on the cluster, and progress is followed by
//! watching those objects.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use multistep::{
    poll_stream, CleanupPolicy, Readiness, ResourceId, Step, StepContext,
    StepOutcome, StepState, Watch, WatchObserver,
};
use tracing::{info, warn};
use vsphere_builder_config::{
    BootstrapProvider, ImportConfig, PublishConfig, SupervisorConfig,
};

use super::POLL_INTERVAL;
use crate::state::{BuildState, SourceObjects};
use crate::store::{
    self, ContentLibraryItemImportRequest, ImportRequestSpec, KubeConnector,
    ObjectMeta, ObjectStore, PublishRequestSpec, Secret, ServicePort,
    StoreError, Typed, VirtualMachine, VirtualMachinePublishRequest,
    VirtualMachineService, VirtualMachineServiceSpec, VirtualMachineSpec,
    VmBootstrap, VmNetwork, VmPowerState,
};

/// Label put on every object declared for the source VM.
pub const SOURCE_LABEL: &str = "vsphere-builder/source";

/// State bag key holding the name of the pending import request.
pub const IMPORT_REQUEST_KEY: &str = "import_request";

/// State bag key holding the name of the pending publish request.
pub const PUBLISH_REQUEST_KEY: &str = "publish_request";

/// State bag key holding the source VM's own address.
pub const SOURCE_VM_IP_KEY: &str = "source_vm_ip";

const IMAGE_ITEM_PREFIX: &str = "clitem-";
const IMAGE_PREFIX: &str = "vmi-";

fn resource<T: Typed>(namespace: &str, name: &str) -> ResourceId {
    ResourceId::namespaced(T::KIND.to_string(), namespace, name)
}

/// Deletes an object, treating one that is already gone as deleted.
async fn delete_if_present<T: Typed>(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
) -> Result<(), StoreError> {
    match store::delete::<T>(store, namespace, name).await {
        Ok(()) | Err(StoreError::NotFound { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Maps a content library item name onto the VM image the cluster derives
/// from it.
fn image_for_item(item: &str) -> anyhow::Result<String> {
    item.strip_prefix(IMAGE_ITEM_PREFIX)
        .map(|id| format!("{IMAGE_PREFIX}{id}"))
        .ok_or_else(|| anyhow!("unexpected content library item name {item:?}"))
}

pub struct ConnectSupervisor {
    kubeconfig: Option<Utf8PathBuf>,
    namespace: String,
    connector: Arc<dyn KubeConnector>,
}

impl ConnectSupervisor {
    pub fn new(
        kubeconfig: Option<Utf8PathBuf>,
        namespace: String,
        connector: Arc<dyn KubeConnector>,
    ) -> Self {
        Self { kubeconfig, namespace, connector }
    }
}

#[async_trait]
impl Step<BuildState> for ConnectSupervisor {
    fn name(&self) -> &str {
        "connect-supervisor"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        ctx.ui.say(&format!(
            "Connecting to Supervisor namespace {}...",
            self.namespace
        ));
        match self
            .connector
            .connect(self.kubeconfig.as_deref(), &self.namespace)
            .await
            .context("connecting to the Supervisor cluster")
        {
            Ok(store) => {
                info!(namespace = %self.namespace, "connected to Supervisor");
                state.store = Some(store);
                state.namespace = Some(self.namespace.clone());
                StepOutcome::Continue
            }
            Err(e) => StepOutcome::Halt(e),
        }
    }
}

/// Imports an image from a URL into a content library and waits for the
/// cluster to make it available as a VM image.
pub struct ImportImage {
    config: ImportConfig,
    source_name: String,
    observer: Option<WatchObserver>,
}

impl ImportImage {
    pub fn new(config: ImportConfig, source_name: String) -> Self {
        Self { config, source_name, observer: None }
    }

    pub fn observer(mut self, observer: WatchObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn request_name(&self) -> String {
        self.config
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-image-import", self.source_name))
    }

    async fn import(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let store = state.store()?.clone();
        let ns = state.namespace()?.to_owned();
        let name = self.request_name();

        ctx.ui.say(&format!("Importing image from {}...", self.config.source_url));
        let request = ContentLibraryItemImportRequest {
            metadata: ObjectMeta::new(&ns, &name),
            spec: ImportRequestSpec {
                source_url: self.config.source_url.clone(),
                target_library: self.config.target_location_name.clone(),
                item_type: self.config.image_type,
                item_name: None,
            },
            status: Default::default(),
        };
        store::create(store.as_ref(), request)
            .await
            .with_context(|| format!("creating import request {name}"))?;
        state.bag_mut().put(IMPORT_REQUEST_KEY, name.clone());

        let events =
            store::watch::<ContentLibraryItemImportRequest>(store.as_ref(), &ns, &name)
                .await
                .with_context(|| format!("watching import request {name}"))?;
        let mut watch = Watch::new(
            resource::<ContentLibraryItemImportRequest>(&ns, &name),
            self.config.timeout,
        );
        if let Some(observer) = &self.observer {
            watch = watch.observer(observer.clone());
        }
        let item = watch
            .wait(events, &ctx.cancel, |req| {
                let status = &req.status;
                match (&status.error, &status.item_name) {
                    (Some(error), _) if status.completed => {
                        Readiness::Ready(Err(error.clone()))
                    }
                    (None, Some(item)) if status.completed => {
                        Readiness::Ready(Ok(item.clone()))
                    }
                    _ => Readiness::Pending("import has not completed".into()),
                }
            })
            .await
            .context("waiting for the image import")?
            .map_err(|e| anyhow!("image import {name} failed: {e}"))?;

        let image = image_for_item(&item)?;
        ctx.ui.say(&format!("Imported image {image}"));
        state.imported_image = Some(image);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for ImportImage {
    fn name(&self) -> &str {
        "import-image"
    }

    fn cleanup_policy(&self) -> CleanupPolicy {
        CleanupPolicy::Always
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.import(ctx, state).await.into()
    }

    async fn cleanup(
        &self,
        _ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let Ok(name) = state.bag().get_as::<String>(IMPORT_REQUEST_KEY) else {
            return Ok(());
        };
        state.bag_mut().remove(IMPORT_REQUEST_KEY);
        let store = state.store()?.clone();
        let ns = state.namespace()?.to_owned();
        delete_if_present::<ContentLibraryItemImportRequest>(store.as_ref(), &ns, &name)
            .await
            .with_context(|| format!("deleting import request {name}"))?;
        Ok(())
    }
}

/// Declares the source VM, its bootstrap secret and, when the guest is to be
/// reached over a communicator, a service exposing it.
pub struct CreateSource {
    config: SupervisorConfig,
    source_name: String,
}

impl CreateSource {
    pub fn new(config: SupervisorConfig, source_name: String) -> Self {
        Self { config, source_name }
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(SOURCE_LABEL.to_string(), self.source_name.clone())])
    }

    async fn create(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let store = state.store()?.clone();
        let ns = state.namespace()?.to_owned();
        let name = self.source_name.clone();
        let image = self
            .config
            .image_name
            .clone()
            .or_else(|| state.imported_image.clone())
            .ok_or_else(|| anyhow!("no image to deploy the source VM from"))?;
        state.source = Some(SourceObjects { name: name.clone(), ..Default::default() });

        let mut bootstrap = None;
        if let Some(file) = &self.config.bootstrap_data_file {
            let data = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("reading bootstrap data {file}"))?;
            let key = match self.config.bootstrap_provider {
                BootstrapProvider::CloudInit => "user-data",
                BootstrapProvider::Sysprep => "unattend",
            };
            let mut metadata = ObjectMeta::new(&ns, &name);
            metadata.labels = self.labels();
            let secret = Secret {
                metadata,
                string_data: BTreeMap::from([(key.to_string(), data)]),
            };
            ctx.ui.say(&format!("Creating bootstrap secret {name}..."));
            store::create(store.as_ref(), secret)
                .await
                .with_context(|| format!("creating secret {name}"))?;
            if let Some(source) = &mut state.source {
                source.secret = true;
            }
            bootstrap = Some(VmBootstrap {
                provider: self.config.bootstrap_provider,
                secret_name: name.clone(),
            });
        }

        let mut metadata = ObjectMeta::new(&ns, &name);
        metadata.labels = self.labels();
        let vm = VirtualMachine {
            metadata,
            spec: VirtualMachineSpec {
                class_name: self.config.class_name.clone(),
                image_name: image.clone(),
                storage_class: self.config.storage_class.clone(),
                power_state: VmPowerState::PoweredOn,
                network: self.config.network_type.clone().map(|network_type| {
                    VmNetwork {
                        network_type,
                        network_name: self.config.network_name.clone(),
                    }
                }),
                bootstrap,
            },
            status: Default::default(),
        };
        ctx.ui.say(&format!("Creating source VM {name} from image {image}..."));
        store::create(store.as_ref(), vm)
            .await
            .with_context(|| format!("creating VirtualMachine {name}"))?;
        if let Some(source) = &mut state.source {
            source.vm = true;
        }

        let comm = &self.config.communicator;
        if comm.is_enabled() {
            let port = comm.effective_port();
            let mut metadata = ObjectMeta::new(&ns, &name);
            metadata.labels = self.labels();
            let service = VirtualMachineService {
                metadata,
                spec: VirtualMachineServiceSpec {
                    selector: self.labels(),
                    ports: vec![ServicePort {
                        name: comm.kind.to_string(),
                        port,
                        target_port: port,
                    }],
                },
                status: Default::default(),
            };
            ctx.ui.say(&format!("Creating service {name} for {}...", comm.kind));
            store::create(store.as_ref(), service)
                .await
                .with_context(|| format!("creating VirtualMachineService {name}"))?;
            if let Some(source) = &mut state.source {
                source.service = true;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for CreateSource {
    fn name(&self) -> &str {
        "create-source"
    }

    fn cleanup_policy(&self) -> CleanupPolicy {
        CleanupPolicy::Always
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.create(ctx, state).await.into()
    }

    async fn cleanup(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let Some(source) = state.source.clone() else {
            return Ok(());
        };
        if self.config.keep_input_artifact && !state.failed() {
            ctx.ui.say(&format!("Keeping source objects {}", source.name));
            return Ok(());
        }
        let store = state.store()?.clone();
        let ns = state.namespace()?.to_owned();
        let name = &source.name;

        ctx.ui.say(&format!("Deleting source objects {name}..."));
        let mut first_error = None;
        let mut record = |res: Result<(), StoreError>| {
            if let Err(e) = res {
                warn!(error = %e, "could not delete source object");
                first_error.get_or_insert(e);
            }
        };
        if source.service {
            record(
                delete_if_present::<VirtualMachineService>(store.as_ref(), &ns, name)
                    .await,
            );
        }
        if source.vm {
            record(delete_if_present::<VirtualMachine>(store.as_ref(), &ns, name).await);
        }
        if source.secret {
            record(delete_if_present::<Secret>(store.as_ref(), &ns, name).await);
        }
        state.source = None;
        match first_error {
            Some(e) => Err(e).context("deleting source objects"),
            None => Ok(()),
        }
    }
}

/// Readiness of the source VM: powered on first, then an IPv4 address.
fn source_readiness(vm: &VirtualMachine) -> Readiness<Ipv4Addr> {
    match vm.status.power_state {
        None => Readiness::Pending("VM has not reported a power state yet".into()),
        Some(VmPowerState::PoweredOff) => {
            Readiness::Pending("VM is not powered on yet".into())
        }
        Some(VmPowerState::PoweredOn) => {
            match vm.status.vm_ip.as_deref().map(str::parse::<Ipv4Addr>) {
                Some(Ok(ip)) if !ip.is_unspecified() => Readiness::Ready(ip),
                Some(_) => Readiness::Pending(format!(
                    "VM is powered on but its address {:?} is not a valid IPv4 address",
                    vm.status.vm_ip.as_deref().unwrap_or_default()
                )),
                None => Readiness::Pending(
                    "VM is powered on but has no IP address yet".into(),
                ),
            }
        }
    }
}

/// Watches the source VM until it is powered on and has an address.
pub struct WatchSource {
    timeout: Duration,
    observer: Option<WatchObserver>,
}

impl WatchSource {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, observer: None }
    }

    pub fn observer(mut self, observer: WatchObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    async fn watch(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let store = state.store()?.clone();
        let ns = state.namespace()?.to_owned();
        let name = state.source()?.name.clone();

        ctx.ui.say(&format!("Waiting for source VM {name} to be ready..."));
        let events = store::watch::<VirtualMachine>(store.as_ref(), &ns, &name)
            .await
            .with_context(|| format!("watching VirtualMachine {name}"))?;
        let mut watch =
            Watch::new(resource::<VirtualMachine>(&ns, &name), self.timeout);
        if let Some(observer) = &self.observer {
            watch = watch.observer(observer.clone());
        }
        let ip = watch
            .wait(events, &ctx.cancel, source_readiness)
            .await
            .context("waiting for the source VM")?;

        ctx.ui.say(&format!("Source VM is ready at {ip}"));
        let ip = IpAddr::V4(ip);
        state.bag_mut().put(SOURCE_VM_IP_KEY, ip);
        state.guest_ip = Some(ip);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for WatchSource {
    fn name(&self) -> &str {
        "watch-source"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.watch(ctx, state).await.into()
    }
}

/// Polls the source VM's service until it has an ingress address, which is
/// then used to reach the guest. Services are polled rather than watched.
pub struct WaitForServiceIp {
    timeout: Duration,
}

impl WaitForServiceIp {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn wait(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let store = state.store()?.clone();
        let ns = state.namespace()?.to_owned();
        let name = state.source()?.name.clone();

        ctx.ui.say(&format!("Waiting for service {name} to get an address..."));
        let events = {
            let (ns, name) = (ns.clone(), name.clone());
            poll_stream(POLL_INTERVAL, move || {
                let store = store.clone();
                let (ns, name) = (ns.clone(), name.clone());
                async move {
                    Ok::<_, anyhow::Error>(
                        store::get::<VirtualMachineService>(store.as_ref(), &ns, &name)
                            .await?,
                    )
                }
            })
        };
        let ip = Watch::new(resource::<VirtualMachineService>(&ns, &name), self.timeout)
            .wait(events, &ctx.cancel, |svc| {
                match svc.status.ingress_ip.as_deref().map(str::parse::<IpAddr>) {
                    Some(Ok(ip)) => Readiness::Ready(ip),
                    Some(Err(_)) | None => {
                        Readiness::Pending("service has no ingress address yet".into())
                    }
                }
            })
            .await
            .context("waiting for the source service address")?;

        ctx.ui.say(&format!("IP address: {ip}"));
        state.guest_ip = Some(ip);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for WaitForServiceIp {
    fn name(&self) -> &str {
        "wait-for-ip"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.wait(ctx, state).await.into()
    }
}

/// Publishes the source VM as an image and waits for the result.
pub struct PublishSource {
    config: PublishConfig,
    source_name: String,
    observer: Option<WatchObserver>,
}

impl PublishSource {
    pub fn new(config: PublishConfig, source_name: String) -> Self {
        Self { config, source_name, observer: None }
    }

    pub fn observer(mut self, observer: WatchObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    async fn publish(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let store = state.store()?.clone();
        let ns = state.namespace()?.to_owned();
        let name = self.source_name.clone();
        let target = self.config.image_name.clone().unwrap_or_else(|| name.clone());

        ctx.ui.say(&format!(
            "Publishing {name} as {target} to {}...",
            self.config.location_name
        ));
        let request = VirtualMachinePublishRequest {
            metadata: ObjectMeta::new(&ns, &name),
            spec: PublishRequestSpec {
                source_name: name.clone(),
                target_item_name: target,
                target_location_name: self.config.location_name.clone(),
            },
            status: Default::default(),
        };
        store::create(store.as_ref(), request)
            .await
            .with_context(|| format!("creating publish request {name}"))?;
        state.bag_mut().put(PUBLISH_REQUEST_KEY, name.clone());

        let events =
            store::watch::<VirtualMachinePublishRequest>(store.as_ref(), &ns, &name)
                .await
                .with_context(|| format!("watching publish request {name}"))?;
        let mut watch = Watch::new(
            resource::<VirtualMachinePublishRequest>(&ns, &name),
            self.config.timeout,
        );
        if let Some(observer) = &self.observer {
            watch = watch.observer(observer.clone());
        }
        let image = watch
            .wait(events, &ctx.cancel, |req| {
                let status = &req.status;
                if let (true, Some(error)) = (status.completed, &status.error) {
                    return Readiness::Ready(Err(error.clone()));
                }
                match (&status.image_name, status.ready) {
                    (Some(image), true) => Readiness::Ready(Ok(image.clone())),
                    _ => Readiness::Pending(format!(
                        "publish in progress (completed: {}, ready: {})",
                        status.completed, status.ready
                    )),
                }
            })
            .await
            .context("waiting for the publish request")?
            .map_err(|e| anyhow!("publishing {name} failed: {e}"))?;

        ctx.ui.say(&format!("Published image {image}"));
        state.published_image = Some(image);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for PublishSource {
    fn name(&self) -> &str {
        "publish-source"
    }

    fn cleanup_policy(&self) -> CleanupPolicy {
        CleanupPolicy::Always
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.publish(ctx, state).await.into()
    }

    async fn cleanup(
        &self,
        _ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let Ok(name) = state.bag().get_as::<String>(PUBLISH_REQUEST_KEY) else {
            return Ok(());
        };
        state.bag_mut().remove(PUBLISH_REQUEST_KEY);
        let store = state.store()?.clone();
        let ns = state.namespace()?.to_owned();
        delete_if_present::<VirtualMachinePublishRequest>(store.as_ref(), &ns, &name)
            .await
            .with_context(|| format!("deleting publish request {name}"))?;
        Ok(())
    }
}

/// Name for the source VM when none is configured.
pub fn generated_source_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("source-{}", &id[..8])
}

#[cfg(test)]
mod test {
    use vsphere_builder_config::{CommunicatorKind, ImageType};

    use super::*;
    use crate::sim::{SimCluster, SimClusterConfig};
    use crate::store::Kind;
    use crate::steps::testutil::{ctx, supervisor_config as config, NS};

    async fn connected(cluster: &SimCluster) -> BuildState {
        let mut state = BuildState::new();
        let (ctx, _) = ctx();
        let step =
            ConnectSupervisor::new(None, NS.into(), Arc::new(cluster.clone()));
        assert!(step.run(&ctx, &mut state).await.is_continue());
        state
    }

    #[test]
    fn item_names_map_to_images() {
        assert_eq!(image_for_item("clitem-0000002a").unwrap(), "vmi-0000002a");
        assert!(image_for_item("lib-item").is_err());
    }

    #[test]
    fn generated_names_are_short_and_distinct() {
        let a = generated_source_name();
        assert!(a.starts_with("source-"));
        assert_eq!(a.len(), "source-".len() + 8);
        assert_ne!(a, generated_source_name());
    }

    #[test]
    fn source_readiness_distinguishes_power_and_address() {
        let mut vm = VirtualMachine {
            metadata: ObjectMeta::new(NS, "src"),
            spec: VirtualMachineSpec {
                class_name: "c".into(),
                image_name: "i".into(),
                storage_class: "s".into(),
                power_state: VmPowerState::PoweredOn,
                network: None,
                bootstrap: None,
            },
            status: Default::default(),
        };
        let reason = |vm: &VirtualMachine| match source_readiness(vm) {
            Readiness::Pending(r) => r,
            Readiness::Ready(ip) => panic!("unexpectedly ready at {ip}"),
        };
        assert!(reason(&vm).contains("power state"));
        vm.status.power_state = Some(VmPowerState::PoweredOff);
        assert!(reason(&vm).contains("not powered on"));
        vm.status.power_state = Some(VmPowerState::PoweredOn);
        assert!(reason(&vm).contains("no IP address"));
        vm.status.vm_ip = Some("fe80::1".into());
        assert!(reason(&vm).contains("not a valid IPv4"));
        vm.status.vm_ip = Some("10.1.2.3".into());
        assert_eq!(
            source_readiness(&vm),
            Readiness::Ready(Ipv4Addr::new(10, 1, 2, 3))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn source_objects_are_created_watched_and_removed() {
        let cluster = SimCluster::default();
        let dir = tempfile::tempdir().unwrap();
        let data = Utf8PathBuf::from_path_buf(dir.path().join("user-data")).unwrap();
        std::fs::write(&data, "#cloud-config\n").unwrap();

        let mut cfg = config();
        cfg.bootstrap_data_file = Some(data);
        let (ctx, _) = ctx();
        let mut state = connected(&cluster).await;

        let create = CreateSource::new(cfg.clone(), "src".into());
        assert!(create.run(&ctx, &mut state).await.is_continue());
        assert_eq!(
            state.source,
            Some(SourceObjects {
                name: "src".into(),
                vm: true,
                service: true,
                secret: true,
            })
        );

        let observer = WatchObserver::new();
        let watch = WatchSource::new(cfg.watch_source_timeout).observer(observer.clone());
        assert!(watch.run(&ctx, &mut state).await.is_continue());
        assert!(!observer.is_watching());
        assert_eq!(cluster.active_watches(), 0);
        assert_eq!(state.guest_ip, Some("10.20.0.10".parse().unwrap()));

        let service = WaitForServiceIp::new(Duration::from_secs(60));
        assert!(service.run(&ctx, &mut state).await.is_continue());
        assert_eq!(state.guest_ip, Some("192.168.100.5".parse().unwrap()));
        assert_eq!(
            state.bag().get_as::<IpAddr>(SOURCE_VM_IP_KEY).unwrap(),
            "10.20.0.10".parse::<IpAddr>().unwrap()
        );

        create.cleanup(&ctx, &mut state).await.unwrap();
        assert!(cluster.objects().is_empty());
        assert!(state.source.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn kept_source_survives_a_successful_build() {
        let cluster = SimCluster::default();
        let mut cfg = config();
        cfg.keep_input_artifact = true;
        let (ctx, _) = ctx();
        let mut state = connected(&cluster).await;

        let create = CreateSource::new(cfg, "src".into());
        assert!(create.run(&ctx, &mut state).await.is_continue());
        create.cleanup(&ctx, &mut state).await.unwrap();
        assert_eq!(
            cluster.objects(),
            vec![
                (Kind::VirtualMachine, "src".to_string()),
                (Kind::VirtualMachineService, "src".to_string()),
            ]
        );

        state.bag_mut().put(multistep::state::HALTED_KEY, true);
        create.cleanup(&ctx, &mut state).await.unwrap();
        assert!(cluster.objects().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_source_times_out() {
        let cluster = SimCluster::new(SimClusterConfig {
            ip_delay: Duration::from_secs(3600),
            ..Default::default()
        });
        let (ctx, _) = ctx();
        let mut state = connected(&cluster).await;
        let mut cfg = config();
        cfg.communicator.kind = CommunicatorKind::None;
        CreateSource::new(cfg, "src".into()).run(&ctx, &mut state).await;

        let start = tokio::time::Instant::now();
        let step = WatchSource::new(Duration::from_secs(60));
        let StepOutcome::Halt(e) = step.run(&ctx, &mut state).await else {
            panic!("expected a timeout");
        };
        assert!(matches!(
            e.downcast_ref::<multistep::WatchError>(),
            Some(multistep::WatchError::Timeout { .. })
        ));
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(cluster.active_watches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn import_resolves_the_image_name() {
        let cluster = SimCluster::default();
        let (ctx, _) = ctx();
        let mut state = connected(&cluster).await;
        let step = ImportImage::new(
            ImportConfig {
                source_url: "https://images.example.com/ubuntu.ova".into(),
                target_location_name: "images".into(),
                image_type: ImageType::Ovf,
                name: None,
                timeout: Duration::from_secs(600),
            },
            "src".into(),
        );

        assert!(step.run(&ctx, &mut state).await.is_continue());
        let image = state.imported_image.clone().unwrap();
        assert!(image.starts_with("vmi-"), "{image}");
        assert!(cluster
            .object(NS, Kind::ContentLibraryItemImportRequest, "src-image-import")
            .is_some());

        step.cleanup(&ctx, &mut state).await.unwrap();
        assert!(cluster.objects().is_empty());
        // A second cleanup has nothing left to do.
        step.cleanup(&ctx, &mut state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_publish_is_reported() {
        let cluster = SimCluster::default();
        cluster.fail_publish("location is full");
        let (ctx, _) = ctx();
        let mut state = connected(&cluster).await;
        let step = PublishSource::new(
            PublishConfig {
                location_name: "images".into(),
                image_name: None,
                timeout: Duration::from_secs(600),
            },
            "src".into(),
        );
        let StepOutcome::Halt(e) = step.run(&ctx, &mut state).await else {
            panic!("expected a halt");
        };
        assert!(format!("{e:#}").contains("location is full"));
        assert!(state.published_image.is_none());

        step.cleanup(&ctx, &mut state).await.unwrap();
        assert!(cluster.objects().is_empty());
    }

    /// A watched request that becomes ready after a couple of updates yields
    /// its image name before the timeout, and the watching flag is only set
    /// while the wait is in progress.
    #[tokio::test(start_paused = true)]
    async fn publish_watch_is_observable() {
        let cluster = SimCluster::new(SimClusterConfig {
            publish_delay: Duration::from_secs(20),
            ..Default::default()
        });
        let (ctx, _) = ctx();
        let mut state = connected(&cluster).await;
        let observer = WatchObserver::new();
        let step = PublishSource::new(
            PublishConfig {
                location_name: "images".into(),
                image_name: Some("golden".into()),
                timeout: Duration::from_secs(60),
            },
            "src".into(),
        )
        .observer(observer.clone());

        let seen_watching = {
            let observer = observer.clone();
            tokio::spawn(async move {
                observer.established().await;
                observer.is_watching()
            })
        };
        let start = tokio::time::Instant::now();
        assert!(step.run(&ctx, &mut state).await.is_continue());
        assert!(start.elapsed() < Duration::from_secs(60));
        assert!(seen_watching.await.unwrap());
        assert!(!observer.is_watching());

        let image = state.published_image.clone().unwrap();
        assert!(image.starts_with("vmi-"), "{image}");
        assert_eq!(cluster.active_watches(), 0);
    }
}
