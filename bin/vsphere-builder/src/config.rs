// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Parse and validate a template without building it.
    Validate(TemplateArgs),

    /// Print the steps a template would run.
    Inspect(TemplateArgs),

    /// Run a build.
    Build(BuildArgs),
}

/// Builds VM images on vSphere from a TOML template.
#[derive(Debug, Parser)]
#[clap(verbatim_doc_comment)]
pub struct ProcessArgs {
    #[clap(subcommand)]
    pub command: Command,

    /// Suppress emission of terminal control codes in log output.
    #[clap(long, conflicts_with = "emit_bunyan")]
    pub disable_ansi: bool,

    /// Emit Bunyan-formatted logs.
    #[clap(long)]
    pub emit_bunyan: bool,
}

#[derive(Args, Debug)]
pub struct TemplateArgs {
    /// Path to the build template.
    #[clap(long = "config", short = 'c', value_name = "PATH", value_parser)]
    pub template: Utf8PathBuf,
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct BuildArgs {
    #[clap(flatten)]
    pub template: TemplateArgs,

    /// Pause before each step until Enter is pressed.
    #[clap(long)]
    pub debug: bool,

    /// What to do with partially built resources when a step fails.
    #[clap(long, value_enum, default_value_t = OnErrorArg::Cleanup)]
    pub on_error: OnErrorArg,

    /// VM templates to seed the simulated vCenter with, for clone builds.
    #[clap(long = "sim-template", value_name = "NAME")]
    pub sim_templates: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OnErrorArg {
    /// Unwind every step that ran.
    Cleanup,
    /// Leave everything in place for inspection.
    Abort,
}

impl From<OnErrorArg> for multistep::OnError {
    fn from(arg: OnErrorArg) -> Self {
        match arg {
            OnErrorArg::Cleanup => multistep::OnError::Cleanup,
            OnErrorArg::Abort => multistep::OnError::Abort,
        }
    }
}
