// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The steps builders assemble into pipelines.

use std::fs::File;
use std::io::{BufReader, Read};
use std::time::Duration;

use anyhow::Context;
use camino::Utf8Path;
use multistep::Step;
use ring::digest::{Context as DigestContext, SHA256};
use vsphere_builder_config::LocationConfig;

use crate::state::BuildState;
use crate::vsphere::Placement;

pub mod boot;
pub mod connect;
pub mod finalize;
pub mod guest;
pub mod http;
pub mod media;
pub mod supervisor;
pub mod vm;

pub type BoxedStep = Box<dyn Step<BuildState>>;

/// How often remote state is polled when the backend can't push changes.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) fn placement(loc: &LocationConfig) -> Placement {
    Placement {
        folder: loc.folder.clone(),
        cluster: loc.cluster.clone(),
        host: loc.host.clone(),
        resource_pool: loc.resource_pool.clone(),
        datastore: loc.datastore.clone(),
    }
}

/// Hex-encoded SHA-256 of a file's contents.
pub(crate) fn sha256_file(path: &Utf8Path) -> anyhow::Result<String> {
    let file =
        File::open(path).with_context(|| format!("opening {path} to hash it"))?;
    let mut reader = BufReader::new(file);
    let mut context = DigestContext::new(&SHA256);
    let mut buffer = [0; 1024];

    loop {
        let count = reader
            .read(&mut buffer)
            .with_context(|| format!("reading {path} to hash it"))?;
        if count == 0 {
            break;
        }
        context.update(&buffer[..count]);
    }

    Ok(hex::encode(context.finish().as_ref()))
}

/// Hashes a file on the blocking pool.
pub(crate) async fn sha256_file_async(
    path: &Utf8Path,
) -> anyhow::Result<String> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .context("hashing task failed")?
}
