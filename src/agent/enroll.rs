//! One-time enrollment against the relay.

use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::connection::{EndpointCredentials, ENDPOINT_SECRET_HEADER};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub enrollment_token: String,
    pub machine_id: String,
    pub hostname: String,
    pub os_version: String,
}

#[derive(Debug, Clone, Deserialize)]
struct EnrollResponse {
    endpoint_id: String,
    endpoint_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EnrollmentStatus {
    pub enrolled: bool,
    pub authenticated: bool,
}

fn build_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("failed to build HTTP client")
}

fn api_url(server_url: &str, path: &str) -> String {
    format!("{}{}", server_url.trim().trim_end_matches('/'), path)
}

/// Exchange a one-time enrollment token for endpoint credentials.
pub async fn enroll(server_url: &str, enrollment_token: &str) -> anyhow::Result<EndpointCredentials> {
    let request = EnrollRequest {
        enrollment_token: enrollment_token.trim().to_string(),
        machine_id: machine_id(),
        hostname: local_hostname(),
        os_version: os_version(),
    };
    let url = api_url(server_url, "/api/enroll");
    tracing::info!(url = %url, machine_id = %request.machine_id, "enrolling endpoint");

    let resp = build_client()?
        .post(&url)
        .json(&request)
        .send()
        .await
        .with_context(|| format!("cannot reach relay at {url}"))?;
    let status = resp.status();
    if !status.is_success() {
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        let message = body["error"]["message"].as_str().unwrap_or("enrollment failed");
        bail!("relay refused enrollment ({status}): {message}");
    }
    let grant: EnrollResponse = resp.json().await.context("invalid enrollment response")?;
    Ok(EndpointCredentials {
        endpoint_id: grant.endpoint_id,
        endpoint_secret: grant.endpoint_secret,
    })
}

/// Ask the relay whether this machine is enrolled and `secret` still valid.
pub async fn status(server_url: &str, secret: Option<&str>) -> anyhow::Result<EnrollmentStatus> {
    let url = api_url(server_url, &format!("/api/enroll/status/{}", machine_id()));
    let mut req = build_client()?.get(&url);
    if let Some(secret) = secret {
        req = req.header(ENDPOINT_SECRET_HEADER, secret);
    }
    let resp = req
        .send()
        .await
        .with_context(|| format!("cannot reach relay at {url}"))?
        .error_for_status()?;
    resp.json().await.context("invalid status response")
}

pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn os_version() -> String {
    let base = format!("{} {}", std::env::consts::OS, std::env::consts::ARCH);
    match pretty_os_name() {
        Some(name) => format!("{name} ({base})"),
        None => base,
    }
}

#[cfg(target_os = "linux")]
fn pretty_os_name() -> Option<String> {
    let release = std::fs::read_to_string("/etc/os-release").ok()?;
    release.lines().find_map(|line| {
        line.strip_prefix("PRETTY_NAME=")
            .map(|v| v.trim_matches('"').to_string())
    })
}

#[cfg(not(target_os = "linux"))]
fn pretty_os_name() -> Option<String> {
    None
}

/// Stable fingerprint for this machine.
///
/// Uses the OS machine id where one exists, hashed so the raw value never
/// leaves the host. Falls back to a hash of the hostname.
pub fn machine_id() -> String {
    let raw = platform_machine_id().unwrap_or_else(local_hostname);
    fingerprint(&raw)
}

fn fingerprint(raw: &str) -> String {
    let digest = Sha256::digest(raw.trim().as_bytes());
    hex::encode(&digest[..16])
}

#[cfg(target_os = "linux")]
fn platform_machine_id() -> Option<String> {
    ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
}

#[cfg(windows)]
fn platform_machine_id() -> Option<String> {
    let out = std::process::Command::new("reg")
        .args([
            "query",
            r"HKLM\SOFTWARE\Microsoft\Cryptography",
            "/v",
            "MachineGuid",
        ])
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&out.stdout);
    text.lines()
        .find(|l| l.contains("MachineGuid"))
        .and_then(|l| l.split_whitespace().last())
        .map(str::to_string)
}

#[cfg(not(any(target_os = "linux", windows)))]
fn platform_machine_id() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_is_stable_hex() {
        let a = machine_id();
        assert_eq!(a, machine_id());
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_ignores_whitespace() {
        assert_eq!(fingerprint("abc\n"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
    }

    #[test]
    fn api_url_joins_cleanly() {
        assert_eq!(api_url("http://relay:8080/", "/api/enroll"), "http://relay:8080/api/enroll");
    }

    #[tokio::test]
    async fn unreachable_relay_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = enroll(&format!("http://{addr}"), "tok").await.unwrap_err();
        assert!(err.to_string().contains("cannot reach relay"));
    }
}
