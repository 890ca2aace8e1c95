// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory control plane: a vCenter, a Supervisor cluster and guests
//! reachable over a communicator, with configurable delays and injectable
//! failures.

use std::sync::Arc;

use crate::builder::Backends;

mod cluster;
mod guests;
mod vsphere;

pub use cluster::{SimCluster, SimClusterConfig};
pub use guests::SimGuests;
pub use vsphere::{SimVsphere, SimVsphereConfig};

/// One simulated environment. Handles are shared with the backends it
/// hands out, so tests can inspect and perturb a running build.
#[derive(Clone)]
pub struct Simulation {
    pub vsphere: SimVsphere,
    pub cluster: SimCluster,
    pub guests: SimGuests,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new(SimVsphereConfig::default(), SimClusterConfig::default())
    }
}

impl Simulation {
    pub fn new(vsphere: SimVsphereConfig, cluster: SimClusterConfig) -> Self {
        let vsphere = SimVsphere::new(vsphere);
        let guests = SimGuests::new(Some(vsphere.clone()));
        Self { vsphere, cluster: SimCluster::new(cluster), guests }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            vsphere: Arc::new(self.vsphere.clone()),
            kube: Arc::new(self.cluster.clone()),
            communicator: Arc::new(self.guests.clone()),
        }
    }
}
