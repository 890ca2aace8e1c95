// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Steps that turn the powered-off VM into the build's output.

use std::fmt::Write as _;

use anyhow::Context;
use async_trait::async_trait;
use camino::Utf8PathBuf;
use multistep::{Step, StepContext, StepOutcome};
use tracing::{info, instrument, warn};
use vsphere_builder_config::{
    ContentLibraryConfig, ExportConfig, ManifestKind,
};

use super::sha256_file_async;
use super::vm::destroy;
use crate::state::BuildState;
use crate::vsphere::{ExportSpec, LibraryImportSpec};

pub struct CreateSnapshot {
    name: String,
}

impl CreateSnapshot {
    pub fn new(name: String) -> Self {
        Self { name }
    }

    async fn snapshot(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let vsphere = state.vsphere()?;
        let vm = state.vm()?;
        ctx.ui.say(&format!("Creating snapshot {:?}...", self.name));
        vsphere
            .create_snapshot(vm, &self.name)
            .await
            .with_context(|| format!("creating snapshot of {vm}"))?;
        state.snapshot = Some(self.name.clone());
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for CreateSnapshot {
    fn name(&self) -> &str {
        "create-snapshot"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.snapshot(ctx, state).await.into()
    }
}

pub struct ConvertToTemplate;

impl ConvertToTemplate {
    async fn convert(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let vsphere = state.vsphere()?;
        let vm = state.vm()?;
        ctx.ui.say("Converting VM to template...");
        vsphere
            .convert_to_template(vm)
            .await
            .with_context(|| format!("converting {vm} to a template"))?;
        state.template = true;
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for ConvertToTemplate {
    fn name(&self) -> &str {
        "convert-to-template"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.convert(ctx, state).await.into()
    }
}

/// Imports the VM into a content library, optionally as an OVF template,
/// and destroys the source VM afterwards when asked to.
pub struct ContentLibrary {
    config: ContentLibraryConfig,
    vm_name: String,
}

impl ContentLibrary {
    pub fn new(config: ContentLibraryConfig, vm_name: String) -> Self {
        Self { config, vm_name }
    }

    async fn import(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let vsphere = state.vsphere()?.clone();
        let vm = state.vm()?.clone();
        let spec = LibraryImportSpec {
            library: self.config.library.clone(),
            name: self.config.name.clone().unwrap_or_else(|| self.vm_name.clone()),
            description: self.config.description.clone(),
            ovf: self.config.ovf,
        };
        ctx.ui.say(&format!(
            "Importing {} into content library {}...",
            spec.name, spec.library
        ));
        let item = vsphere
            .import_to_content_library(&vm, &spec)
            .await
            .with_context(|| {
                format!("importing {vm} into library {}", spec.library)
            })?;
        info!(%item, library = %spec.library, "imported into content library");
        state.content_library_item = Some(item);

        if self.config.destroy {
            destroy(ctx, vsphere.as_ref(), &vm).await?;
            state.destroyed = true;
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for ContentLibrary {
    fn name(&self) -> &str {
        "content-library"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.import(ctx, state).await.into()
    }
}

/// Exports the VM to local OVF or OVA files, with a SHA-256 manifest unless
/// disabled. Partial output is removed if the build fails.
pub struct Export {
    config: ExportConfig,
    vm_name: String,
}

impl Export {
    pub fn new(config: ExportConfig, vm_name: String) -> Self {
        Self { config, vm_name }
    }

    fn base_name(&self) -> String {
        self.config.name.clone().unwrap_or_else(|| self.vm_name.clone())
    }

    async fn write_manifest(
        &self,
        files: &[Utf8PathBuf],
    ) -> anyhow::Result<Utf8PathBuf> {
        let mut manifest = String::new();
        for file in files {
            let digest = sha256_file_async(file).await?;
            let name = file.file_name().unwrap_or(file.as_str());
            writeln!(manifest, "SHA256({name})= {digest}")?;
        }
        let path = self
            .config
            .output_directory
            .join(format!("{}.mf", self.base_name()));
        tokio::fs::write(&path, manifest)
            .await
            .with_context(|| format!("writing manifest {path}"))?;
        Ok(path)
    }

    #[instrument(skip_all)]
    async fn export(
        &self,
        ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        let vsphere = state.vsphere()?.clone();
        let vm = state.vm()?.clone();
        let dir = &self.config.output_directory;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {dir}"))?;

        let spec = ExportSpec {
            name: self.base_name(),
            format: self.config.format,
            output_directory: dir.clone(),
            force: self.config.force,
        };
        ctx.ui.say(&format!("Exporting {vm} to {dir}..."));
        let files = vsphere
            .export_vm(&vm, &spec)
            .await
            .with_context(|| format!("exporting {vm}"))?;
        state.exported_files.extend(files.iter().cloned());

        if self.config.manifest == ManifestKind::Sha256 {
            let manifest = self.write_manifest(&files).await?;
            state.exported_files.push(manifest);
        }
        for file in &state.exported_files {
            info!(%file, "exported");
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for Export {
    fn name(&self) -> &str {
        "export"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> StepOutcome {
        self.export(ctx, state).await.into()
    }

    async fn cleanup(
        &self,
        _ctx: &StepContext,
        state: &mut BuildState,
    ) -> anyhow::Result<()> {
        for file in std::mem::take(&mut state.exported_files) {
            if let Err(e) = tokio::fs::remove_file(&file).await {
                warn!(%file, error = %e, "could not remove exported file");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use vsphere_builder_config::{DiskConfig, ExportFormat};

    use super::*;
    use crate::sim::SimVsphere;
    use crate::steps::sha256_file;
    use crate::steps::testutil::{ctx, vm_config};
    use crate::steps::vm::CreateVm;

    async fn powered_off_vm(sim: &SimVsphere, ctx: &StepContext) -> BuildState {
        let mut state = BuildState::new();
        state.vsphere = Some(Arc::new(sim.clone()));
        let mut config = vm_config("vm1");
        config.hardware.disks = vec![
            DiskConfig { size_mb: 1024, thin_provisioned: true },
            DiskConfig { size_mb: 2048, thin_provisioned: true },
        ];
        CreateVm::new(config.location, config.hardware, false)
            .run(ctx, &mut state)
            .await;
        state
    }

    fn export_config(dir: &tempfile::TempDir, format: ExportFormat) -> ExportConfig {
        ExportConfig {
            output_directory: Utf8PathBuf::from_path_buf(dir.path().join("out"))
                .unwrap(),
            name: None,
            format,
            manifest: ManifestKind::Sha256,
            force: false,
        }
    }

    #[tokio::test]
    async fn ovf_export_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimVsphere::default();
        let (ctx, _) = ctx();
        let mut state = powered_off_vm(&sim, &ctx).await;

        let config = export_config(&dir, ExportFormat::Ovf);
        let out = config.output_directory.clone();
        let step = Export::new(config, "vm1".into());
        assert!(step.run(&ctx, &mut state).await.is_continue());

        let names: Vec<&str> = state
            .exported_files
            .iter()
            .filter_map(|f| f.file_name())
            .collect();
        assert_eq!(
            names,
            vec!["vm1.ovf", "vm1-disk-0.vmdk", "vm1-disk-1.vmdk", "vm1.mf"]
        );

        let manifest = std::fs::read_to_string(out.join("vm1.mf")).unwrap();
        let ovf_sum = sha256_file(&out.join("vm1.ovf")).unwrap();
        assert_eq!(manifest.lines().count(), 3);
        assert!(manifest.contains(&format!("SHA256(vm1.ovf)= {ovf_sum}")));
    }

    #[tokio::test]
    async fn failed_build_removes_exported_files() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimVsphere::default();
        let (ctx, _) = ctx();
        let mut state = powered_off_vm(&sim, &ctx).await;

        let mut config = export_config(&dir, ExportFormat::Ova);
        config.manifest = ManifestKind::None;
        config.name = Some("golden".into());
        let out = config.output_directory.clone();
        let step = Export::new(config, "vm1".into());
        assert!(step.run(&ctx, &mut state).await.is_continue());
        assert!(out.join("golden.ova").exists());

        step.cleanup(&ctx, &mut state).await.unwrap();
        assert!(!out.join("golden.ova").exists());
        assert!(state.exported_files.is_empty());
    }

    #[tokio::test]
    async fn existing_output_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimVsphere::default();
        let (ctx, _) = ctx();
        let mut state = powered_off_vm(&sim, &ctx).await;

        let config = export_config(&dir, ExportFormat::Ova);
        std::fs::create_dir_all(&config.output_directory).unwrap();
        std::fs::write(config.output_directory.join("vm1.ova"), "old").unwrap();

        let step = Export::new(config.clone(), "vm1".into());
        let StepOutcome::Halt(e) = step.run(&ctx, &mut state).await else {
            panic!("expected a halt");
        };
        assert!(format!("{e:#}").contains("already exists"));

        let step = Export::new(ExportConfig { force: true, ..config }, "vm1".into());
        assert!(step.run(&ctx, &mut state).await.is_continue());
    }

    #[tokio::test]
    async fn snapshot_template_and_library() {
        let sim = SimVsphere::default();
        let (ctx, _) = ctx();
        let mut state = powered_off_vm(&sim, &ctx).await;

        let snapshot = CreateSnapshot::new("base".into());
        assert!(snapshot.run(&ctx, &mut state).await.is_continue());
        assert_eq!(sim.snapshots("vm1"), vec!["base".to_string()]);
        assert_eq!(state.snapshot.as_deref(), Some("base"));

        let library = ContentLibrary::new(
            ContentLibraryConfig {
                library: "images".into(),
                name: None,
                description: None,
                ovf: true,
                destroy: true,
            },
            "vm1".into(),
        );
        assert!(library.run(&ctx, &mut state).await.is_continue());
        let item = state.content_library_item.clone().unwrap();
        assert_eq!(sim.library_items().get(&item).map(String::as_str), Some("vm1"));
        assert!(state.destroyed);
        assert!(!sim.exists("vm1"));
    }

    #[tokio::test]
    async fn template_conversion_needs_a_powered_off_vm() {
        let sim = SimVsphere::default();
        let (ctx, _) = ctx();
        let mut state = powered_off_vm(&sim, &ctx).await;
        assert!(ConvertToTemplate.run(&ctx, &mut state).await.is_continue());
        assert!(sim.is_template("vm1"));
        assert!(state.template);
    }
}
