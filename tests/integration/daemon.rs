//! End-to-end tests against a running `emberd`.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use ember_core::cipher::CipherContext;
use ember_core::message::NodeKind;
use ember_services::protocol::ask_network;
use ember_services::{Session, SessionError, SessionOptions, SessionState};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use tokio::net::TcpStream;

use crate::*;

const DAEMON_MAC: &str = "da:da:da:da:da:da";

/// Built `emberd`, if any.
fn emberd_binary() -> Option<PathBuf> {
    let target = std::env::var("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target"));
    ["debug", "release"]
        .iter()
        .map(|profile| target.join(profile).join("emberd"))
        .find(|path| path.exists())
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Kills the daemon when the test ends, pass or fail.
struct Daemon {
    child: Child,
    addr: SocketAddr,
    ledger: PathBuf,
    _dir: tempfile::TempDir,
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}

fn spawn_daemon(binary: &Path, password: Option<&str>) -> Result<Daemon> {
    let dir = tempfile::tempdir()?;
    let key_path = dir.path().join("node.pem");
    let pem = private_key(1)
        .to_pkcs8_pem(LineEnding::LF)
        .context("failed to encode test key")?;
    std::fs::write(&key_path, pem.as_bytes())?;

    let ledger = dir.path().join("peers.jsonl");
    let config = format!(
        r#"
[identity]
private_key_path = "{key}"
hostname = "daemon"
mac = "{DAEMON_MAC}"
node_kind = "server"

[network]
welcome = "hello from emberd"

[lease]
dir = "{leases}"
poll_ms = 5
settle_ms = 20

[ledger]
path = "{ledger}"
"#,
        key = key_path.display(),
        leases = dir.path().join("leases").display(),
        ledger = ledger.display(),
    );
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, config)?;

    let addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse()?;
    let mut command = Command::new(binary);
    command
        .env("EMBER_CONFIG", &config_path)
        .env("EMBER_NETWORK__LISTEN", addr.to_string())
        .env("EMBER_SECURITY__PASSWORD", password.unwrap_or(""))
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let child = command.spawn().with_context(|| format!("failed to spawn {}", binary.display()))?;

    Ok(Daemon {
        child,
        addr,
        ledger,
        _dir: dir,
    })
}

/// Connect once the daemon is listening.
async fn connect(daemon: &Daemon, envelope: CipherContext) -> Result<Result<Session, SessionError>> {
    let deadline = Instant::now() + Duration::from_secs(20);
    let stream = loop {
        match TcpStream::connect(daemon.addr).await {
            Ok(stream) => break stream,
            Err(_) if Instant::now() < deadline => tokio::time::sleep(Duration::from_millis(100)).await,
            Err(e) => bail!("emberd never listened on {}: {e}", daemon.addr),
        }
    };
    let options = SessionOptions::new(daemon.addr.to_string()).with_envelope(envelope);
    Ok(tokio::time::timeout(Duration::from_secs(30), Session::connect(stream, client_node(), options)).await?)
}

async fn wait_for_ledger(path: &Path, lines: usize) -> Result<Vec<serde_json::Value>> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let text = std::fs::read_to_string(path).unwrap_or_default();
        let parsed: Vec<serde_json::Value> = text
            .lines()
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?;
        if parsed.len() >= lines {
            return Ok(parsed);
        }
        if Instant::now() >= deadline {
            bail!("ledger has {} lines, wanted {lines}", parsed.len());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn skip_unless_built() -> Option<PathBuf> {
    let binary = emberd_binary();
    if binary.is_none() {
        println!("SKIP: emberd is not built (cargo build -p emberd)");
    }
    binary
}

/// The daemon admits a genuine client and records it in the ledger.
#[tokio::test]
async fn test_daemon_admits_and_records() {
    let Some(binary) = skip_unless_built() else {
        return;
    };
    let daemon = spawn_daemon(&binary, None).unwrap();

    let session = connect(&daemon, CipherContext::Plain).await.unwrap().unwrap();
    assert_eq!(session.state(), SessionState::Ready);

    let lines = wait_for_ledger(&daemon.ledger, 1).await.unwrap();
    assert_eq!(lines[0]["mac"], CLIENT_MAC);
    assert_eq!(lines[0]["kind"], "client");
    assert_eq!(lines[0]["identity"]["hostname"], "laptop");

    // The daemon lists itself first, then us.
    let network = ask_network(&session).await;
    assert_eq!(network[0].kind, NodeKind::Server);
    assert!(network.iter().any(|n| n.kind == NodeKind::Client));

    session.close().await;
}

/// With a password configured, only clients sealing with it get in.
#[tokio::test]
async fn test_daemon_requires_password() {
    let Some(binary) = skip_unless_built() else {
        return;
    };
    let daemon = spawn_daemon(&binary, Some("s3cret")).unwrap();

    let refused = connect(&daemon, CipherContext::salted("wrong")).await.unwrap();
    assert!(refused.is_err());

    let admitted = connect(&daemon, CipherContext::salted("s3cret")).await.unwrap().unwrap();
    assert_eq!(admitted.state(), SessionState::Ready);
    admitted.close().await;
}
