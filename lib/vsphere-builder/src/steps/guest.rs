// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Steps that talk to the booted guest: finding its address, opening a
//! communicator session and running provisioners over it.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use multistep::{
    poll_stream, Cancelled, CleanupPolicy, Readiness, ResourceId, Step,
    StepContext, StepOutcome, Watch,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument};
use vsphere_builder_config::{
    CommunicatorConfig, ProvisionerConfig, WaitIpConfig,
};

use super::POLL_INTERVAL;
use crate::communicator::{Connector, Credentials};
use crate::state::BuildState;
use crate::vsphere::PowerState;

/// Decides when a reported guest address is usable: it has to fall inside
/// the configured network and stay the same for the settle period.
struct IpSettle {
    config: WaitIpConfig,
    candidate: Option<(IpAddr, Instant)>,
}

impl IpSettle {
    fn new(config: WaitIpConfig) -> Self {
        Self { config, candidate: None }
    }

    fn observe(
        &mut self,
        power: PowerState,
        ip: Option<IpAddr>,
        now: Instant,
    ) -> Readiness<IpAddr> {
        let ip = match (power, ip) {
            (PowerState::PoweredOff, _) => {
                self.candidate = None;
                return Readiness::Pending("VM is powered off".to_string());
            }
            (PowerState::Suspended, _) => {
                self.candidate = None;
                return Readiness::Pending("VM is suspended".to_string());
            }
            (PowerState::PoweredOn, None) => {
                self.candidate = None;
                return Readiness::Pending(
                    "VM is powered on but has no IP address yet".to_string(),
                );
            }
            (PowerState::PoweredOn, Some(ip)) => ip,
        };

        if let Some(net) = &self.config.ip_wait_address {
            if !net.contains(&ip) {
                self.candidate = None;
                return Readiness::Pending(format!(
                    "address {ip} is outside {net}"
                ));
            }
        }

        let since = match self.candidate {
            Some((prev, since)) if prev == ip => since,
            _ => {
                self.candidate = Some((ip, now));
                now
            }
        };
        let stable = now.duration_since(since);
        if stable >= self.config.ip_settle_timeout {
            Readiness::Ready(ip)
        } else {
            Readiness::Pending(format!(
                "address {ip} has been stable for {stable:?}"
            ))
        }
    }
}

/// Polls the guest tools until the VM reports a settled address.
pub struct WaitForIp {
    config: WaitIpConfig,
}

impl WaitForIp {
    pub fn new(config: WaitIpConfig) -> Self {
        Self { config }
    }

    #[instrument(skip_all)]
    async fn wait(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let vsphere = state.vsphere()?.clone();
        let vm = state.vm()?.clone();
        let resource = ResourceId::new("VirtualMachine", &vm.name);

        ctx.ui.say("Waiting for IP...");
        let events = poll_stream(POLL_INTERVAL, move || {
            let vsphere = vsphere.clone();
            let vm = vm.clone();
            async move {
                let power = vsphere.power_state(&vm).await?;
                let ip = vsphere.guest_ip(&vm).await?;
                Ok::<_, anyhow::Error>((power, ip))
            }
        });
        let mut settle = IpSettle::new(self.config.clone());
        let ip = Watch::new(resource, self.config.ip_wait_timeout)
            .wait(events, &ctx.cancel, |(power, ip)| {
                settle.observe(*power, *ip, Instant::now())
            })
            .await
            .context("waiting for the guest IP address")?;

        ctx.ui.say(&format!("IP address: {ip}"));
        state.guest_ip = Some(ip);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for WaitForIp {
    fn name(&self) -> &str {
        "wait-for-ip"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.wait(ctx, state).await.into()
    }
}

/// Opens the communicator session, retrying with exponential backoff until
/// the communicator timeout. The session is closed at the end of the build.
pub struct ConnectCommunicator {
    config: CommunicatorConfig,
    connector: Arc<dyn Connector>,
}

impl ConnectCommunicator {
    pub fn new(config: CommunicatorConfig, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    async fn address(&self, state: &BuildState) -> anyhow::Result<SocketAddr> {
        let port = self.config.effective_port();
        let Some(host) = &self.config.host else {
            return Ok(SocketAddr::new(state.guest_ip()?, port));
        };
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        tokio::net::lookup_host((host.as_str(), port))
            .await
            .with_context(|| format!("resolving {host}"))?
            .next()
            .ok_or_else(|| anyhow!("{host} did not resolve to any address"))
    }

    #[instrument(skip_all)]
    async fn connect(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let addr = self.address(state).await?;
        let kind = self.config.kind;
        let credentials = Credentials::from(&self.config);
        ctx.ui.say(&format!("Connecting to {kind} at {addr}..."));

        let attempt = || async {
            self.connector.connect(kind, addr, &credentials).await.map_err(|e| {
                debug!(%addr, error = %format!("{e:#}"), "communicator not ready");
                backoff::Error::transient(e)
            })
        };
        let retry = backoff::future::retry(
            backoff::ExponentialBackoff {
                initial_interval: Duration::from_secs(1),
                max_interval: Duration::from_secs(30),
                max_elapsed_time: None,
                ..Default::default()
            },
            attempt,
        );

        let timeout = self.config.timeout;
        let session = tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => return Err(Cancelled.into()),
            res = tokio::time::timeout(timeout, retry) => match res {
                Ok(session) => session?,
                Err(_) => bail!("timed out after {timeout:?} waiting for {kind} on {addr}"),
            },
        };

        info!(%addr, %kind, "communicator connected");
        ctx.ui.say(&format!("Connected to {kind}"));
        state.session = Some(session);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for ConnectCommunicator {
    fn name(&self) -> &str {
        "connect-communicator"
    }

    fn cleanup_policy(&self) -> CleanupPolicy {
        CleanupPolicy::Always
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.connect(ctx, state).await.into()
    }

    async fn cleanup(
        &self,
        _ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        if let Some(session) = state.session.take() {
            session.close().await;
        }
        Ok(())
    }
}

/// Runs the configured provisioners, in order, over the session.
pub struct Provision {
    provisioners: Vec<ProvisionerConfig>,
}

impl Provision {
    pub fn new(provisioners: Vec<ProvisionerConfig>) -> Self {
        Self { provisioners }
    }

    #[instrument(skip_all)]
    async fn provision(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let session = state.session()?;
        for (idx, provisioner) in self.provisioners.iter().enumerate() {
            ctx.cancel.check()?;
            match provisioner {
                ProvisionerConfig::Shell { inline, environment } => {
                    for command in inline {
                        ctx.ui.say(&format!("Running: {command}"));
                        let out = session
                            .run(command, environment)
                            .await
                            .with_context(|| format!("provisioner {idx}: running {command:?}"))?;
                        if !out.success() {
                            bail!(
                                "provisioner {idx}: {command:?} exited with status {}: {}",
                                out.exit_status,
                                out.stderr.trim()
                            );
                        }
                    }
                }
                ProvisionerConfig::File { source, destination } => {
                    ctx.ui.say(&format!("Uploading {source} => {destination}"));
                    session.upload(source, destination).await.with_context(
                        || format!("provisioner {idx}: uploading {source}"),
                    )?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for Provision {
    fn name(&self) -> &str {
        "provision"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.provision(ctx, state).await.into()
    }
}
