// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builders that produce VM images on vSphere.
//!
//! Each builder turns a validated [`vsphere_builder_config::BuildConfig`]
//! into a pipeline of [`multistep`] steps run against a [`state::BuildState`].
//! The remote systems a build talks to sit behind the traits in [`vsphere`],
//! [`store`] and [`communicator`]; [`sim`] implements all three in memory.

pub mod artifact;
pub mod bootcommand;
pub mod builder;
pub mod communicator;
pub mod http;
pub mod sim;
pub mod state;
pub mod steps;
pub mod store;
pub mod vsphere;

pub use artifact::Artifact;
pub use builder::{
    builder_for, run, Backends, BuildError, Builder, RunOptions,
};
pub use state::BuildState;
