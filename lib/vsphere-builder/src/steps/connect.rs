// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use multistep::{CleanupPolicy, Step, StepContext, StepOutcome};
use tracing::info;
use vsphere_builder_config::ConnectionConfig;

use crate::state::BuildState;
use crate::vsphere::Connector;

/// Opens the vCenter session every later vSphere step uses, and logs out of
/// it once the build is over.
pub struct Connect {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
}

impl Connect {
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }
}

#[async_trait]
impl Step<BuildState> for Connect {
    fn name(&self) -> &str {
        "connect"
    }

    fn cleanup_policy(&self) -> CleanupPolicy {
        CleanupPolicy::Always
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        let server = &self.config.vcenter_server;
        ctx.ui.say(&format!("Connecting to vCenter {server}..."));
        match self
            .connector
            .connect(&self.config)
            .await
            .with_context(|| format!("connecting to vCenter {server}"))
        {
            Ok(vsphere) => {
                info!(%server, "connected to vCenter");
                state.vsphere = Some(vsphere);
                StepOutcome::Continue
            }
            Err(e) => StepOutcome::Halt(e),
        }
    }

    async fn cleanup(
        &self,
        _ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        if let Some(vsphere) = &state.vsphere {
            vsphere.logout().await.context("logging out of vCenter")?;
        }
        Ok(())
    }
}
