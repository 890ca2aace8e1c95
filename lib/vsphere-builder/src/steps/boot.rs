// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::Context;
use async_trait::async_trait;
use multistep::{sleep_or_cancel, Step, StepContext, StepOutcome};
use tracing::debug;
use vsphere_builder_config::BootConfig;

use crate::bootcommand::{self, BootAction, TemplateVars};
use crate::state::BuildState;

/// Waits `boot_wait` after power on, then types the boot command into the
/// console one keystroke at a time.
pub struct BootCommand {
    boot: BootConfig,
    vm_name: String,
}

impl BootCommand {
    pub fn new(boot: BootConfig, vm_name: String) -> Self {
        Self { boot, vm_name }
    }

    fn actions(&self, state: &BuildState) -> anyhow::Result<Vec<BootAction>> {
        let vars = TemplateVars {
            http_ip: state.http_endpoint.map(|e| e.ip().to_string()),
            http_port: state.http_endpoint.map(|e| e.port()),
            name: self.vm_name.clone(),
        };
        let command = bootcommand::render(&self.boot.boot_command.concat(), &vars)
            .context("rendering boot command")?;
        Ok(bootcommand::parse(&command).context("parsing boot command")?)
    }

    async fn type_command(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        // Render before waiting so template mistakes fail fast.
        let actions = self.actions(state)?;
        let vsphere = state.vsphere()?.clone();
        let vm = state.vm()?.clone();

        ctx.ui.say(&format!("Waiting {:?} for boot...", self.boot.boot_wait));
        sleep_or_cancel(self.boot.boot_wait, &ctx.cancel).await?;

        ctx.ui.say("Typing boot command...");
        for action in actions {
            match action {
                BootAction::Type(keys) => {
                    for key in keys {
                        vsphere
                            .type_keys(&vm, &[key])
                            .await
                            .with_context(|| format!("typing into {vm}"))?;
                        sleep_or_cancel(self.boot.boot_key_interval, &ctx.cancel)
                            .await?;
                    }
                }
                BootAction::Wait(d) => {
                    debug!(wait = ?d, "boot command pause");
                    sleep_or_cancel(d, &ctx.cancel).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for BootCommand {
    fn name(&self) -> &str {
        "boot-command"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.type_command(ctx, state).await.into()
    }
}
