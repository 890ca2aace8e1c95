// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boot-file HTTP server that installers fetch kickstart/preseed files
//! from, and the ways of choosing the address it is advertised on.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use dropshot::{
    endpoint, ApiDescription, Body, ConfigDropshot, HttpError, HttpServer,
    HttpServerStarter, Path, RequestContext,
};
use http::header::CONTENT_TYPE;
use http::{Response, StatusCode};
use rand::Rng;
use schemars::JsonSchema;
use serde_derive::Deserialize;
use slog::Drain;
use tracing::{debug, info};

/// The files a [`BootFileServer`] serves: inline content first, then the
/// contents of an optional directory.
#[derive(Clone, Debug, Default)]
pub struct BootFiles {
    directory: Option<Utf8PathBuf>,
    content: BTreeMap<String, String>,
}

impl BootFiles {
    pub fn new(
        directory: Option<Utf8PathBuf>,
        content: &BTreeMap<String, String>,
    ) -> Self {
        let content = content
            .iter()
            .map(|(k, v)| (k.trim_start_matches('/').to_owned(), v.clone()))
            .collect();
        Self { directory, content }
    }

    /// Maps a request path onto a file in the served directory. Paths that
    /// would escape the directory resolve to nothing.
    fn resolve(&self, path: &str) -> Option<Utf8PathBuf> {
        let dir = self.directory.as_ref()?;
        let rel = Utf8Path::new(path);
        if rel.as_str().is_empty()
            || !rel.components().all(|c| matches!(c, Utf8Component::Normal(_)))
        {
            return None;
        }
        Some(dir.join(rel))
    }

    async fn read(&self, path: &str) -> Option<Vec<u8>> {
        if let Some(inline) = self.content.get(path) {
            return Some(inline.clone().into_bytes());
        }
        let file = self.resolve(path)?;
        tokio::fs::read(&file).await.ok()
    }
}

fn content_type(path: &str) -> &'static str {
    match Utf8Path::new(path).extension() {
        Some("cfg" | "txt" | "ks" | "seed" | "sh") => "text/plain",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("yaml" | "yml") => "application/yaml",
        _ => "application/octet-stream",
    }
}

#[derive(Deserialize, JsonSchema)]
struct FilePath {
    path: Vec<String>,
}

#[endpoint {
    method = GET,
    path = "/{path:.*}",
    unpublished = true,
}]
async fn serve_file(
    rqctx: RequestContext<Arc<BootFiles>>,
    path: Path<FilePath>,
) -> Result<Response<Body>, HttpError> {
    let rel = path.into_inner().path.join("/");
    let Some(bytes) = rqctx.context().read(&rel).await else {
        debug!(path = %rel, "boot file not found");
        return Err(HttpError::for_not_found(None, format!("{rel} not found")));
    };
    info!(path = %rel, size = bytes.len(), "serving boot file");
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type(&rel))
        .body(Body::from(bytes))
        .map_err(|e| HttpError::for_internal_error(e.to_string()))
}

fn api() -> anyhow::Result<ApiDescription<Arc<BootFiles>>> {
    let mut api = ApiDescription::new();
    api.register(serve_file)
        .map_err(|e| anyhow!("registering boot file endpoint: {e}"))?;
    Ok(api)
}

fn server_logger() -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, slog::Level::Warning).fuse();
    slog::Logger::root(drain, slog::o!("component" => "boot-file-server"))
}

/// A running boot-file server.
pub struct BootFileServer {
    server: HttpServer<Arc<BootFiles>>,
}

impl BootFileServer {
    /// Starts serving `files` on `bind_ip`, on the first free port found by
    /// walking `port_min..=port_max` from a random starting point.
    pub fn start(
        files: BootFiles,
        bind_ip: IpAddr,
        port_min: u16,
        port_max: u16,
    ) -> anyhow::Result<Self> {
        let files = Arc::new(files);
        let log = server_logger();
        let span = u32::from(port_max - port_min) + 1;
        let first = rand::thread_rng().gen_range(0..span);

        for offset in 0..span {
            let port = port_min + ((first + offset) % span) as u16;
            let config = ConfigDropshot {
                bind_address: SocketAddr::new(bind_ip, port),
                ..Default::default()
            };
            match HttpServerStarter::new(&config, api()?, files.clone(), &log) {
                Ok(starter) => {
                    let server = starter.start();
                    info!(address = %server.local_addr(), "boot file server started");
                    return Ok(Self { server });
                }
                Err(e) => debug!(port, error = %e, "port unavailable"),
            }
        }

        bail!("no free port for the boot file server in {port_min}-{port_max}")
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub async fn close(self) -> anyhow::Result<()> {
        self.server
            .close()
            .await
            .map_err(|e| anyhow!("stopping boot file server: {e}"))
    }
}

/// Strips any scheme, path and port from a vCenter server setting.
fn vcenter_host(server: &str) -> &str {
    let s = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("http://"))
        .unwrap_or(server);
    let s = s.split('/').next().unwrap_or(s);
    if s.starts_with('[') {
        return s
            .split(']')
            .next()
            .map(|h| h.trim_start_matches('['))
            .unwrap_or(s);
    }
    match s.rsplit_once(':') {
        Some((host, port))
            if !host.contains(':') && port.parse::<u16>().is_ok() =>
        {
            host
        }
        _ => s,
    }
}

/// Finds the local address the host would use to reach vCenter, which is the
/// address a guest on the vCenter network is most likely able to reach. No
/// packets are sent.
pub async fn discover_ip(vcenter_server: &str) -> anyhow::Result<IpAddr> {
    let host = vcenter_host(vcenter_server);
    let bind: SocketAddr = match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => "[::]:0".parse()?,
        _ => "0.0.0.0:0".parse()?,
    };
    let socket = tokio::net::UdpSocket::bind(bind)
        .await
        .context("binding discovery socket")?;
    socket
        .connect((host, 443))
        .await
        .with_context(|| format!("routing to {host}"))?;
    Ok(socket.local_addr()?.ip())
}

/// Returns the first IPv4 address of a local network interface.
#[cfg(unix)]
pub fn interface_ip(name: &str) -> anyhow::Result<IpAddr> {
    use std::net::Ipv4Addr;

    let addrs =
        nix::ifaddrs::getifaddrs().context("listing network interfaces")?;
    let mut found = false;
    for ifa in addrs.filter(|ifa| ifa.interface_name == name) {
        found = true;
        if let Some(sin) = ifa.address.as_ref().and_then(|a| a.as_sockaddr_in())
        {
            return Ok(IpAddr::V4(Ipv4Addr::from(sin.ip())));
        }
    }
    if found {
        bail!("interface {name} has no IPv4 address")
    }
    bail!("no such interface {name}")
}

#[cfg(not(unix))]
pub fn interface_ip(name: &str) -> anyhow::Result<IpAddr> {
    bail!("looking up interface {name} is not supported on this platform")
}
