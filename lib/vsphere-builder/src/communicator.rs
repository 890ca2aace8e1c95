// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boundary to a booted guest: remote command execution and file
//! transfer over SSH or WinRM.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use vsphere_builder_config::{CommunicatorConfig, CommunicatorKind};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    pub private_key_file: Option<Utf8PathBuf>,
}

impl From<&CommunicatorConfig> for Credentials {
    fn from(cfg: &CommunicatorConfig) -> Self {
        Self {
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            private_key_file: cfg.private_key_file.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// An open connection to a guest.
#[async_trait]
pub trait Session: Send + Sync {
    async fn run(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> anyhow::Result<CommandOutput>;

    async fn upload(
        &self,
        source: &Utf8Path,
        destination: &str,
    ) -> anyhow::Result<()>;

    async fn close(&self);
}

/// Opens guest sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        kind: CommunicatorKind,
        addr: SocketAddr,
        credentials: &Credentials,
    ) -> anyhow::Result<Box<dyn Session>>;
}
