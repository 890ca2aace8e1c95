// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use multistep::{CleanupPolicy, Step, StepContext, StepOutcome};
use tracing::info;
use vsphere_builder_config::{HttpAddressStrategy, HttpConfig};

use crate::http::{discover_ip, interface_ip, BootFileServer, BootFiles};
use crate::state::BuildState;

/// Works out which local address a guest can reach the boot-file server on.
pub struct HttpIpDiscover {
    vcenter_server: String,
}

impl HttpIpDiscover {
    pub fn new(vcenter_server: String) -> Self {
        Self { vcenter_server }
    }
}

#[async_trait]
impl Step<BuildState> for HttpIpDiscover {
    fn name(&self) -> &str {
        "http-ip-discover"
    }

    async fn run(&self, _ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        match discover_ip(&self.vcenter_server)
            .await
            .context("discovering the address to serve boot files on")
        {
            Ok(ip) => {
                info!(%ip, "discovered HTTP address");
                state.http_ip = Some(ip);
                StepOutcome::Continue
            }
            Err(e) => StepOutcome::Halt(e),
        }
    }
}

/// Serves `http_directory` and `http_content` to the guest for the rest of
/// the build.
pub struct HttpServer {
    config: HttpConfig,
}

impl HttpServer {
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }

    /// Returns the address to bind and the address to advertise.
    fn addresses(&self, state: &BuildState) -> anyhow::Result<(IpAddr, IpAddr)> {
        match self.config.address_strategy() {
            HttpAddressStrategy::BindAddress(ip) => Ok((ip, ip)),
            HttpAddressStrategy::Interface(name) => {
                let ip = interface_ip(&name)?;
                Ok((ip, ip))
            }
            HttpAddressStrategy::Discover => {
                let ip = state
                    .http_ip
                    .ok_or_else(|| anyhow!("no HTTP address was discovered"))?;
                Ok((IpAddr::V4(Ipv4Addr::UNSPECIFIED), ip))
            }
        }
    }

    fn start(&self, ctx: &StepContext, state: &mut BuildState) -> anyhow::Result<()> {
        let (bind_ip, advertised) = self.addresses(state)?;
        let files = BootFiles::new(
            self.config.http_directory.clone(),
            &self.config.http_content,
        );
        let server = BootFileServer::start(
            files,
            bind_ip,
            self.config.http_port_min,
            self.config.http_port_max,
        )?;
        let endpoint = SocketAddr::new(advertised, server.local_addr().port());
        ctx.ui.say(&format!("Serving HTTP requests at http://{endpoint}/"));
        state.http_endpoint = Some(endpoint);
        state.http_server = Some(server);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for HttpServer {
    fn name(&self) -> &str {
        "http-server"
    }

    fn cleanup_policy(&self) -> CleanupPolicy {
        CleanupPolicy::Always
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.start(ctx, state).into()
    }

    async fn cleanup(
        &self,
        _ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        if let Some(server) = state.http_server.take() {
            info!(address = %server.local_addr(), "stopping boot file server");
            server.close().await?;
        }
        Ok(())
    }
}
