// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory Supervisor cluster.
//!
//! Created objects are reconciled by background tasks that fill in their
//! status after configurable delays, and every change is pushed to the
//! object's watchers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8Path;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

use crate::store::{
    KubeConnector, Kind, ObjectStore, Resource, StoreError, VmPowerState,
    WatchEvent,
};

#[derive(Clone, Debug)]
pub struct SimClusterConfig {
    /// Time from VM creation until the requested power state is reached.
    pub power_on_delay: Duration,

    /// Time from power-on until the VM reports an address.
    pub ip_delay: Duration,
    pub ingress_delay: Duration,
    pub import_delay: Duration,
    pub publish_delay: Duration,

    pub vm_ip: String,
    pub ingress_ip: String,
}

impl Default for SimClusterConfig {
    fn default() -> Self {
        Self {
            power_on_delay: Duration::from_secs(5),
            ip_delay: Duration::from_secs(10),
            ingress_delay: Duration::from_secs(5),
            import_delay: Duration::from_secs(30),
            publish_delay: Duration::from_secs(30),
            vm_ip: "10.20.0.10".to_string(),
            ingress_ip: "192.168.100.5".to_string(),
        }
    }
}

type Key = (String, Kind, String);

fn key_of(r: &Resource) -> Key {
    let meta = r.metadata();
    (meta.namespace.clone(), r.kind(), meta.name.clone())
}

struct Watcher {
    key: Key,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Resource>,
    watchers: Vec<Watcher>,
    faults: BTreeMap<String, String>,
    publish_error: Option<String>,
    import_error: Option<String>,
    calls: Vec<String>,
    next_id: u32,
}

impl Inner {
    fn notify(&mut self, key: &Key, event: WatchEvent) {
        self.watchers.retain(|w| !w.tx.is_closed());
        for w in self.watchers.iter().filter(|w| w.key == *key) {
            let _ = w.tx.unbounded_send(event.clone());
        }
    }

    fn enter(&mut self, op: &str, subject: &str) -> Result<(), StoreError> {
        debug!(op, subject, "simulated cluster call");
        self.calls.push(format!("{op} {subject}"));
        match self.faults.get(op) {
            Some(message) => Err(StoreError::Backend(message.clone())),
            None => Ok(()),
        }
    }
}

fn not_found(namespace: &str, kind: Kind, name: &str) -> StoreError {
    StoreError::NotFound {
        kind,
        namespace: namespace.to_owned(),
        name: name.to_owned(),
    }
}

/// The simulated cluster. Clones share the same objects.
#[derive(Clone, Default)]
pub struct SimCluster {
    inner: Arc<Mutex<Inner>>,
    config: Arc<SimClusterConfig>,
}

impl SimCluster {
    pub fn new(config: SimClusterConfig) -> Self {
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

    /// Makes publish requests complete with an error.
    pub fn fail_publish(&self, message: &str) {
        self.inner.lock().unwrap().publish_error = Some(message.to_owned());
    }

    /// Makes import requests complete with an error.
    pub fn fail_import(&self, message: &str) {
        self.inner.lock().unwrap().import_error = Some(message.to_owned());
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn object(
        &self,
        namespace: &str,
        kind: Kind,
        name: &str,
    ) -> Option<Resource> {
        let key = (namespace.to_owned(), kind, name.to_owned());
        self.inner.lock().unwrap().objects.get(&key).cloned()
    }

    /// Kinds and names of every stored object.
    pub fn objects(&self) -> Vec<(Kind, String)> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .keys()
            .map(|(_, kind, name)| (*kind, name.clone()))
            .collect()
    }

    /// Number of watch streams that have not been dropped.
    pub fn active_watches(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }

    /// Applies `f` to a stored object and notifies its watchers. Returns
    /// false if the object no longer exists.
    fn modify(&self, key: &Key, f: impl FnOnce(&mut Resource)) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(obj) = inner.objects.get_mut(key) else {
            return false;
        };
        f(obj);
        obj.metadata_mut().generation += 1;
        let event = WatchEvent::Modified(obj.clone());
        inner.notify(key, event);
        true
    }

    fn reconcile(&self, obj: &Resource) {
        let cluster = self.clone();
        let cfg = Arc::clone(&self.config);
        let key = key_of(obj);

        match obj {
            Resource::VirtualMachine(vm) => {
                let desired = vm.spec.power_state;
                tokio::spawn(async move {
                    tokio::time::sleep(cfg.power_on_delay).await;
                    let present = cluster.modify(&key, |r| {
                        if let Resource::VirtualMachine(vm) = r {
                            vm.status.power_state = Some(desired);
                        }
                    });
                    if !present || desired != VmPowerState::PoweredOn {
                        return;
                    }
                    tokio::time::sleep(cfg.ip_delay).await;
                    cluster.modify(&key, |r| {
                        if let Resource::VirtualMachine(vm) = r {
                            vm.status.vm_ip = Some(cfg.vm_ip.clone());
                        }
                    });
                });
            }
            Resource::VirtualMachineService(_) => {
                tokio::spawn(async move {
                    tokio::time::sleep(cfg.ingress_delay).await;
                    cluster.modify(&key, |r| {
                        if let Resource::VirtualMachineService(svc) = r {
                            svc.status.ingress_ip = Some(cfg.ingress_ip.clone());
                        }
                    });
                });
            }
            Resource::VirtualMachinePublishRequest(_) => {
                tokio::spawn(async move {
                    tokio::time::sleep(cfg.publish_delay).await;
                    let (error, id) = cluster.outcome(|i| &i.publish_error);
                    cluster.modify(&key, |r| {
                        if let Resource::VirtualMachinePublishRequest(req) = r {
                            req.status.completed = true;
                            match error {
                                Some(e) => req.status.error = Some(e),
                                None => {
                                    req.status.ready = true;
                                    req.status.image_name =
                                        Some(format!("vmi-{id:08x}"));
                                }
                            }
                        }
                    });
                });
            }
            Resource::ContentLibraryItemImportRequest(_) => {
                tokio::spawn(async move {
                    tokio::time::sleep(cfg.import_delay).await;
                    let (error, id) = cluster.outcome(|i| &i.import_error);
                    cluster.modify(&key, |r| {
                        if let Resource::ContentLibraryItemImportRequest(req) = r
                        {
                            req.status.completed = true;
                            match error {
                                Some(e) => req.status.error = Some(e),
                                None => {
                                    req.status.item_name =
                                        Some(format!("clitem-{id:08x}"));
                                }
                            }
                        }
                    });
                });
            }
            Resource::Secret(_) => {}
        }
    }

    /// The injected error for a request kind, if any, and a fresh id.
    fn outcome(
        &self,
        error: impl Fn(&Inner) -> &Option<String>,
    ) -> (Option<String>, u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        (error(&*inner).clone(), inner.next_id)
    }
}

#[async_trait]
impl ObjectStore for SimCluster {
    async fn create(&self, mut obj: Resource) -> Result<Resource, StoreError> {
        let key = key_of(&obj);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.enter("create", &format!("{} {}", key.1, key.2))?;
            if inner.objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists {
                    kind: key.1,
                    namespace: key.0,
                    name: key.2,
                });
            }
            obj.metadata_mut().generation = 1;
            inner.objects.insert(key.clone(), obj.clone());
            inner.notify(&key, WatchEvent::Added(obj.clone()));
        }
        self.reconcile(&obj);
        Ok(obj)
    }

    async fn get(
        &self,
        namespace: &str,
        kind: Kind,
        name: &str,
    ) -> Result<Resource, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter("get", &format!("{kind} {name}"))?;
        let key = (namespace.to_owned(), kind, name.to_owned());
        inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found(namespace, kind, name))
    }

    async fn update(&self, mut obj: Resource) -> Result<Resource, StoreError> {
        let key = key_of(&obj);
        let mut inner = self.inner.lock().unwrap();
        inner.enter("update", &format!("{} {}", key.1, key.2))?;
        let Some(current) = inner.objects.get(&key) else {
            return Err(not_found(&key.0, key.1, &key.2));
        };
        let stored = current.metadata().generation;
        let offered = obj.metadata().generation;
        if offered != 0 && offered != stored {
            return Err(StoreError::Conflict {
                kind: key.1,
                namespace: key.0,
                name: key.2,
            });
        }
        obj.metadata_mut().generation = stored + 1;
        inner.objects.insert(key.clone(), obj.clone());
        inner.notify(&key, WatchEvent::Modified(obj.clone()));
        Ok(obj)
    }

    async fn delete(
        &self,
        namespace: &str,
        kind: Kind,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter("delete", &format!("{kind} {name}"))?;
        let key = (namespace.to_owned(), kind, name.to_owned());
        let obj = inner
            .objects
            .remove(&key)
            .ok_or_else(|| not_found(namespace, kind, name))?;
        inner.notify(&key, WatchEvent::Deleted(obj));
        Ok(())
    }

    async fn watch(
        &self,
        namespace: &str,
        kind: Kind,
        name: &str,
    ) -> Result<BoxStream<'static, WatchEvent>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter("watch", &format!("{kind} {name}"))?;
        let key = (namespace.to_owned(), kind, name.to_owned());
        let (tx, rx) = mpsc::unbounded();
        if let Some(obj) = inner.objects.get(&key) {
            let _ = tx.unbounded_send(WatchEvent::Added(obj.clone()));
        }
        inner.watchers.push(Watcher { key, tx });
        Ok(rx.boxed())
    }
}

#[async_trait]
impl KubeConnector for SimCluster {
    async fn connect(
        &self,
        _kubeconfig: Option<&Utf8Path>,
        namespace: &str,
    ) -> Result<Arc<dyn ObjectStore>, StoreError> {
        self.inner.lock().unwrap().enter("connect", namespace)?;
        Ok(Arc::new(self.clone()))
    }
}
