// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod config;

use std::io::BufRead;
use std::sync::Arc;

use anyhow::{bail, Context};
use camino::Utf8Path;
use clap::Parser;
use config::{BuildArgs, Command, ProcessArgs};
use futures::FutureExt;
use multistep::{Cancellation, CancellationSource, PauseHook, StepContext, TracingUi};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};
use vsphere_builder::sim::Simulation;
use vsphere_builder::{builder_for, BuildError, RunOptions};
use vsphere_builder_config::BuildConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ProcessArgs::parse();
    set_tracing_subscriber(&args);

    match &args.command {
        Command::Validate(opts) => {
            let cfg = load(&opts.template)?;
            println!("{}: valid {} template", opts.template, cfg.kind());
        }
        Command::Inspect(opts) => {
            let cfg = load(&opts.template)?;
            let sim = Simulation::default();
            let builder = builder_for(cfg, &sim.backends())?;
            println!("{} ({})", builder.name(), builder.id());
            for (i, step) in builder.steps().iter().enumerate() {
                println!("  {:>2}. {}", i + 1, step.name());
            }
        }
        Command::Build(opts) => build(opts).await?,
    }

    Ok(())
}

fn set_tracing_subscriber(args: &ProcessArgs) {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into());
    let subscriber = Registry::default().with(filter.from_env_lossy());
    if args.emit_bunyan {
        let bunyan_layer = BunyanFormattingLayer::new(
            "vsphere-builder".into(),
            std::io::stdout,
        );
        let subscriber = subscriber.with(JsonStorageLayer).with(bunyan_layer);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    } else {
        let stdout_log = tracing_subscriber::fmt::layer()
            .with_line_number(true)
            .with_ansi(!args.disable_ansi);
        let subscriber = subscriber.with(stdout_log);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    }
}

fn load(path: &Utf8Path) -> anyhow::Result<BuildConfig> {
    vsphere_builder_config::load(path)
        .with_context(|| format!("loading template {path}"))
}

async fn build(opts: &BuildArgs) -> anyhow::Result<()> {
    let cfg = load(&opts.template.template)?;

    let sim = Simulation::default();
    for template in &opts.sim_templates {
        sim.vsphere.add_template(template);
    }
    let builder = builder_for(cfg, &sim.backends())?;

    let pause = if opts.debug {
        if !atty::is(atty::Stream::Stdin) {
            bail!("--debug needs an interactive terminal");
        }
        Some(pause_hook())
    } else {
        None
    };

    let ctx = StepContext::new(
        builder.name(),
        Arc::new(TracingUi::new(builder.name())),
        set_sigint_handler()?,
    );
    let run_opts = RunOptions { pause, on_error: opts.on_error.into() };

    info!(builder = builder.id(), name = builder.name(), "starting build");
    match vsphere_builder::run(builder.as_ref(), &ctx, run_opts).await {
        Ok(Some(artifact)) => {
            println!("{artifact}");
            Ok(())
        }
        Ok(None) => {
            info!("build finished without an artifact");
            Ok(())
        }
        Err(e @ BuildError::Cancelled { .. }) => {
            warn!(error = %e, "build cancelled");
            std::process::exit(130);
        }
        Err(e) => {
            error!(error = %e, "build failed");
            Err(e.into())
        }
    }
}

/// Blocks before each step until a line is read from stdin.
fn pause_hook() -> PauseHook {
    Arc::new(|step: &str| {
        let step = step.to_owned();
        async move {
            println!("Next step: {step}. Press Enter to continue.");
            let _ = tokio::task::spawn_blocking(|| {
                let mut line = String::new();
                std::io::stdin().lock().read_line(&mut line)
            })
            .await;
        }
        .boxed()
    })
}

/// The first SIGINT cancels the build and lets it unwind; a second one exits
/// without cleaning up.
fn set_sigint_handler() -> anyhow::Result<Cancellation> {
    let mut sigint = signal(SignalKind::interrupt())
        .context("failed to set SIGINT handler")?;

    let source = CancellationSource::new();
    let token = source.token();
    tokio::spawn(async move {
        loop {
            sigint.recv().await;

            if !source.cancel() {
                error!("SIGINT received while cleaning up, exiting now");
                error!("some VMs and files may have been leaked!");
                std::process::exit(130);
            }

            warn!("SIGINT received, cancelling the build");
        }
    });

    Ok(token)
}
