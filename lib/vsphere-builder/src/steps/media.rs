// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Installation media: uploading local ISOs to a datastore and attaching
//! them as CD-ROMs.

use anyhow::{bail, Context};
use async_trait::async_trait;
use multistep::{CleanupPolicy, Step, StepContext, StepOutcome};
use tracing::info;
use vsphere_builder_config::{CdromType, IsoFile};

use super::sha256_file_async;
use crate::state::BuildState;
use crate::vsphere::{Device, DriverError};

/// Verifies local ISOs against their checksums and uploads them.
pub struct UploadMedia {
    files: Vec<IsoFile>,
    datastore: String,
    vm_name: String,
    remove_cdrom: bool,
}

impl UploadMedia {
    pub fn new(
        files: Vec<IsoFile>,
        datastore: String,
        vm_name: String,
        remove_cdrom: bool,
    ) -> Self {
        Self { files, datastore, vm_name, remove_cdrom }
    }

    async fn upload(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let vsphere = state.vsphere()?.clone();
        for iso in &self.files {
            if let Some(expected) = iso.expected_sha256() {
                ctx.ui.say(&format!("Verifying checksum of {}...", iso.path));
                let actual = sha256_file_async(&iso.path).await?;
                if !actual.eq_ignore_ascii_case(expected) {
                    bail!(
                        "checksum mismatch for {}: expected {expected}, got {actual}",
                        iso.path
                    );
                }
            }

            ctx.cancel.check()?;

            let file_name = iso.path.file_name().unwrap_or(iso.path.as_str());
            let remote = format!("vsphere-builder/{}/{file_name}", self.vm_name);
            ctx.ui.say(&format!("Uploading {file_name} to {}...", self.datastore));
            let path = vsphere
                .upload_file(&iso.path, &self.datastore, &remote)
                .await
                .with_context(|| format!("uploading {}", iso.path))?;
            info!(%path, "uploaded media");
            state.uploaded_media.push(path);
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for UploadMedia {
    fn name(&self) -> &str {
        "upload-media"
    }

    fn cleanup_policy(&self) -> CleanupPolicy {
        if self.remove_cdrom {
            CleanupPolicy::Always
        } else {
            CleanupPolicy::OnFailure
        }
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.upload(ctx, state).await.into()
    }

    async fn cleanup(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        if state.uploaded_media.is_empty() {
            return Ok(());
        }
        let vsphere = state.vsphere()?.clone();
        for path in std::mem::take(&mut state.uploaded_media) {
            ctx.ui.say(&format!("Deleting {path}..."));
            match vsphere.delete_file(&path).await {
                Ok(()) | Err(DriverError::NotFound { .. }) => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("deleting {path}"))
                }
            }
        }
        Ok(())
    }
}

/// Attaches one CD-ROM per ISO: datastore paths from the template first,
/// then whatever this build uploaded.
pub struct AddCdrom {
    iso_paths: Vec<String>,
    kind: CdromType,
}

impl AddCdrom {
    pub fn new(iso_paths: Vec<String>, kind: CdromType) -> Self {
        Self { iso_paths, kind }
    }

    async fn attach(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let vsphere = state.vsphere()?.clone();
        let vm = state.vm()?.clone();
        let paths: Vec<String> = self
            .iso_paths
            .iter()
            .chain(state.uploaded_media.iter())
            .cloned()
            .collect();
        for iso_path in paths {
            ctx.ui.say(&format!("Mounting ISO {iso_path}..."));
            let device = Device::Cdrom { iso_path, kind: self.kind };
            let key = vsphere
                .add_device(&vm, &device)
                .await
                .with_context(|| format!("adding a CD-ROM to {vm}"))?;
            state.cdrom_devices.push(key);
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for AddCdrom {
    fn name(&self) -> &str {
        "add-cdrom"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.attach(ctx, state).await.into()
    }
}

/// Detaches the CD-ROMs added by [`AddCdrom`] once the VM is off.
pub struct RemoveCdrom;

impl RemoveCdrom {
    async fn detach(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        if state.cdrom_devices.is_empty() {
            return Ok(());
        }
        let vsphere = state.vsphere()?.clone();
        let vm = state.vm()?.clone();
        ctx.ui.say("Removing CD-ROM devices...");
        vsphere
            .remove_devices(&vm, &state.cdrom_devices)
            .await
            .with_context(|| format!("removing CD-ROMs from {vm}"))?;
        state.cdrom_devices.clear();
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for RemoveCdrom {
    fn name(&self) -> &str {
        "remove-cdrom"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.detach(ctx, state).await.into()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use camino::Utf8PathBuf;
    use multistep::StepState;

    use super::*;
    use crate::sim::SimVsphere;
    use crate::steps::testutil::{ctx, vm_config};
    use crate::steps::vm::CreateVm;
    use crate::vsphere::Vsphere;

    const ABC_SHA256: &str =
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn iso(dir: &tempfile::TempDir, checksum: Option<&str>) -> IsoFile {
        let path =
            Utf8PathBuf::from_path_buf(dir.path().join("install.iso")).unwrap();
        std::fs::write(&path, b"abc").unwrap();
        IsoFile { path, checksum: checksum.map(str::to_owned) }
    }

    fn state_with(sim: &SimVsphere) -> BuildState {
        let mut state = BuildState::new();
        state.vsphere = Some(Arc::new(sim.clone()));
        state
    }

    #[tokio::test]
    async fn verified_upload_is_removed_at_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimVsphere::default();
        let step = UploadMedia::new(
            vec![iso(&dir, Some(&format!("sha256:{ABC_SHA256}")))],
            "ds1".into(),
            "vm1".into(),
            true,
        );
        let (ctx, ui) = ctx();
        let mut state = state_with(&sim);

        assert!(step.run(&ctx, &mut state).await.is_continue());
        let expected = "[ds1] vsphere-builder/vm1/install.iso";
        assert_eq!(state.uploaded_media, vec![expected.to_string()]);
        assert_eq!(sim.files(), vec![expected.to_string()]);
        assert!(ui.contains("Verifying checksum"));

        step.cleanup(&ctx, &mut state).await.unwrap();
        assert!(sim.files().is_empty());
        assert!(state.uploaded_media.is_empty());
    }

    #[tokio::test]
    async fn checksum_mismatch_halts_before_upload() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimVsphere::default();
        let step = UploadMedia::new(
            vec![iso(&dir, Some(&format!("sha256:{}", "0".repeat(64))))],
            "ds1".into(),
            "vm1".into(),
            false,
        );
        let (ctx, _) = ctx();
        let mut state = state_with(&sim);

        let StepOutcome::Halt(e) = step.run(&ctx, &mut state).await else {
            panic!("expected a halt");
        };
        assert!(format!("{e:#}").contains("checksum mismatch"));
        assert!(sim.files().is_empty());
    }

    #[tokio::test]
    async fn cdroms_are_attached_and_removed() {
        let sim = SimVsphere::default();
        let (ctx, _) = ctx();
        let mut state = state_with(&sim);
        let config = vm_config("vm1");
        CreateVm::new(config.location, config.hardware, false)
            .run(&ctx, &mut state)
            .await;
        state.uploaded_media.push("[ds1] uploaded.iso".into());

        let add = AddCdrom::new(vec!["[ds1] iso/base.iso".into()], CdromType::Sata);
        assert!(add.run(&ctx, &mut state).await.is_continue());
        assert_eq!(state.cdrom_devices.len(), 2);
        let devices = sim.devices("vm1");
        assert_eq!(devices.len(), 2);
        assert!(matches!(
            &devices[0],
            Device::Cdrom { iso_path, kind: CdromType::Sata } if iso_path == "[ds1] iso/base.iso"
        ));

        assert!(RemoveCdrom.run(&ctx, &mut state).await.is_continue());
        assert!(sim.devices("vm1").is_empty());
        assert!(state.cdrom_devices.is_empty());
    }

    #[tokio::test]
    async fn cleanup_tolerates_already_deleted_media() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimVsphere::default();
        let step =
            UploadMedia::new(vec![iso(&dir, None)], "ds1".into(), "vm1".into(), false);
        let (ctx, _) = ctx();
        let mut state = state_with(&sim);
        assert!(step.run(&ctx, &mut state).await.is_continue());

        let path = state.uploaded_media[0].clone();
        sim.delete_file(&path).await.unwrap();
        state.bag_mut().put(multistep::state::HALTED_KEY, true);
        step.cleanup(&ctx, &mut state).await.unwrap();
    }
}
