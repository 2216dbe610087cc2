//! PPP Daemon Plumbing
//!
//! Peer files and the pppd process. Each tunnel gets its own peer file
//! and its own `unit N`, so the interface name (`pppN`) is fixed before
//! the daemon starts.
//!
//! # Peer File
//!
//! ```text
//! pty "/usr/sbin/pptp 198.51.100.7 --nolaunchpppd"
//! name "login"
//! password "secret"
//! unit 3
//! noauth
//! refuse-pap
//! ...
//! nodefaultroute
//! ```
//!
//! `nodefaultroute` keeps every tunnel off the host's default gateway.
//! Routing into a tunnel happens only through policy rules.

use async_trait::async_trait;
use pfleet_node::NodeId;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Options every generated peer file carries after the per-node lines
const PEER_OPTIONS: &[&str] = &[
    "noauth",
    "refuse-pap",
    "refuse-eap",
    "refuse-chap",
    "refuse-mschap",
    "nobsdcomp",
    "nodeflate",
    "nodefaultroute",
    "noipdefault",
    "maxfail 1",
];

/// Prefix of generated peer files
pub const PEER_FILE_PREFIX: &str = "pfleet-";

/// Inputs for one peer file
#[derive(Debug, Clone)]
pub struct PeerFile {
    pub node_id: NodeId,
    pub ip: IpAddr,
    pub login: String,
    pub password: String,
    pub unit: u32,
}

impl PeerFile {
    /// Path of this node's peer file under `dir`
    pub fn path_in(dir: &Path, node_id: NodeId) -> PathBuf {
        dir.join(format!("{}{}", PEER_FILE_PREFIX, node_id))
    }

    /// Render the file body
    pub fn render(&self, pptp_path: &Path) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "pty \"{} {} --nolaunchpppd\"\n",
            pptp_path.display(),
            self.ip
        ));
        out.push_str(&format!("name {}\n", quote(&self.login)));
        out.push_str(&format!("password {}\n", quote(&self.password)));
        out.push_str(&format!("unit {}\n", self.unit));
        for option in PEER_OPTIONS {
            out.push_str(option);
            out.push('\n');
        }
        out
    }

    /// Write atomically: temp file, then rename
    pub async fn write(&self, dir: &Path, pptp_path: &Path) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;

        let path = Self::path_in(dir, self.node_id);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, self.render(pptp_path)).await?;
        restrict_permissions(&tmp).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        debug!(node_id = self.node_id, path = %path.display(), "Wrote peer file");
        Ok(path)
    }
}

/// pppd option quoting: wrap in double quotes, escape `\` and `"`
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Remove a peer file; a missing file is not an error
pub async fn remove_peer_file(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Node id encoded in a generated peer file name
pub fn peer_file_node_id(path: &Path) -> Option<NodeId> {
    path.file_name()?
        .to_str()?
        .strip_prefix(PEER_FILE_PREFIX)?
        .parse()
        .ok()
}

/// Starts the PPP daemon for a peer file
#[async_trait]
pub trait PppSpawner: Send + Sync {
    /// Spawn the daemon in the foreground; stderr must be piped
    async fn spawn(&self, peer_file: &Path) -> io::Result<Child>;
}

/// Runs `pppd file <peer> nodetach`
#[derive(Debug, Clone)]
pub struct PppdSpawner {
    pppd_path: PathBuf,
}

impl PppdSpawner {
    pub fn new(pppd_path: impl Into<PathBuf>) -> Self {
        Self {
            pppd_path: pppd_path.into(),
        }
    }
}

#[async_trait]
impl PppSpawner for PppdSpawner {
    async fn spawn(&self, peer_file: &Path) -> io::Result<Child> {
        Command::new(&self.pppd_path)
            .arg("file")
            .arg(peer_file)
            .arg("nodetach")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}
