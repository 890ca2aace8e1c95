// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated guest sessions.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use vsphere_builder_config::CommunicatorKind;

use super::vsphere::SimVsphere;
use crate::communicator::{CommandOutput, Connector, Credentials, Session};

#[derive(Default)]
struct Inner {
    refusals: u32,
    attempts: u32,
    open_sessions: usize,
    commands: Vec<String>,
    uploads: Vec<(Utf8PathBuf, String)>,
    failing: BTreeMap<String, i32>,
}

/// Accepts communicator connections to any address. Commands that mention
/// `shutdown` or `poweroff` shut the simulated VM at that address down.
#[derive(Clone, Default)]
pub struct SimGuests {
    inner: Arc<Mutex<Inner>>,
    vsphere: Option<SimVsphere>,
}

impl SimGuests {
    pub fn new(vsphere: Option<SimVsphere>) -> Self {
        Self { inner: Arc::default(), vsphere }
    }

    /// Refuses the next `n` connection attempts.
    pub fn refuse_connections(&self, n: u32) {
        self.inner.lock().unwrap().refusals = n;
    }

    /// Commands containing `pattern` exit with `status`.
    pub fn fail_command(&self, pattern: &str, status: i32) {
        self.inner.lock().unwrap().failing.insert(pattern.to_owned(), status);
    }

    pub fn attempts(&self) -> u32 {
        self.inner.lock().unwrap().attempts
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.lock().unwrap().open_sessions
    }

    pub fn commands(&self) -> Vec<String> {
        self.inner.lock().unwrap().commands.clone()
    }

    pub fn uploads(&self) -> Vec<(Utf8PathBuf, String)> {
        self.inner.lock().unwrap().uploads.clone()
    }
}

#[async_trait]
impl Connector for SimGuests {
    async fn connect(
        &self,
        kind: CommunicatorKind,
        addr: SocketAddr,
        credentials: &Credentials,
    ) -> anyhow::Result<Box<dyn Session>> {
        let mut inner = self.inner.lock().unwrap();
        inner.attempts += 1;
        if inner.refusals > 0 {
            inner.refusals -= 1;
            bail!("{kind} connection to {addr} refused");
        }
        if credentials.password.is_none()
            && credentials.private_key_file.is_none()
        {
            bail!("{kind} authentication failed for {}", credentials.username);
        }
        inner.open_sessions += 1;
        Ok(Box::new(SimSession { addr, guests: self.clone() }))
    }
}

struct SimSession {
    addr: SocketAddr,
    guests: SimGuests,
}

#[async_trait]
impl Session for SimSession {
    async fn run(
        &self,
        command: &str,
        _env: &BTreeMap<String, String>,
    ) -> anyhow::Result<CommandOutput> {
        let exit_status = {
            let mut inner = self.guests.inner.lock().unwrap();
            inner.commands.push(command.to_owned());
            inner
                .failing
                .iter()
                .find(|(pattern, _)| command.contains(pattern.as_str()))
                .map_or(0, |(_, status)| *status)
        };

        if exit_status == 0
            && (command.contains("shutdown") || command.contains("poweroff"))
        {
            if let Some(vsphere) = &self.guests.vsphere {
                vsphere.guest_shutdown(self.addr.ip());
            }
        }

        let stderr = if exit_status == 0 {
            String::new()
        } else {
            format!("{command}: failed")
        };
        Ok(CommandOutput { exit_status, stdout: String::new(), stderr })
    }

    async fn upload(
        &self,
        source: &Utf8Path,
        destination: &str,
    ) -> anyhow::Result<()> {
        if tokio::fs::metadata(source).await.is_err() {
            bail!("{source} does not exist");
        }
        self.guests
            .inner
            .lock()
            .unwrap()
            .uploads
            .push((source.to_owned(), destination.to_owned()));
        Ok(())
    }

    async fn close(&self) {
        let mut inner = self.guests.inner.lock().unwrap();
        inner.open_sessions = inner.open_sessions.saturating_sub(1);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            username: "ubuntu".into(),
            password: Some("ubuntu".into()),
            private_key_file: None,
        }
    }

    #[tokio::test]
    async fn refusals_then_session() {
        let guests = SimGuests::default();
        guests.refuse_connections(2);
        let addr: SocketAddr = "10.0.0.50:22".parse().unwrap();

        for _ in 0..2 {
            assert!(guests
                .connect(CommunicatorKind::Ssh, addr, &creds())
                .await
                .is_err());
        }
        let session =
            guests.connect(CommunicatorKind::Ssh, addr, &creds()).await.unwrap();
        assert_eq!(guests.attempts(), 3);
        assert_eq!(guests.open_sessions(), 1);

        guests.fail_command("apt-get", 100);
        let out = session.run("sudo apt-get update", &BTreeMap::new()).await;
        assert_eq!(out.unwrap().exit_status, 100);
        assert!(session.run("true", &BTreeMap::new()).await.unwrap().success());

        session.close().await;
        assert_eq!(guests.open_sessions(), 0);
        assert_eq!(guests.commands(), vec!["sudo apt-get update", "true"]);
    }
}
