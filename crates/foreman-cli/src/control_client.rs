//! Thin HTTP client for the daemon's local control surface.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;

pub(crate) struct ControlClient {
    http: reqwest::Client,
    base_url: String,
}

impl ControlClient {
    pub(crate) fn new(bind: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to create control client")?;
        Ok(Self {
            http,
            base_url: control_base_url(bind)?,
        })
    }

    pub(crate) async fn get(&self, path: &str) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("control surface unreachable at {url}; is the daemon running?"))?;
        decode_response(response, path).await
    }

    pub(crate) async fn post(&self, path: &str) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .with_context(|| format!("control surface unreachable at {url}; is the daemon running?"))?;
        decode_response(response, path).await
    }
}

async fn decode_response(response: reqwest::Response, path: &str) -> Result<Value> {
    let status = response.status();
    let body = response
        .json::<Value>()
        .await
        .with_context(|| format!("failed to decode control response for {path}"))?;
    if !status.is_success() {
        let reason = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("request_failed");
        bail!("control request {path} failed with status {status}: {reason}");
    }
    Ok(body)
}

/// An unspecified bind address (`0.0.0.0`, `::`) is reached via loopback.
pub(crate) fn control_base_url(bind: &str) -> Result<String> {
    let mut addr = bind
        .trim()
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid control bind address '{bind}'"))?;
    if addr.ip().is_unspecified() {
        let loopback = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        addr.set_ip(loopback);
    }
    Ok(format!("http://{addr}"))
}
