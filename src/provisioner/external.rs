//! External endpoint provisioner.
//!
//! Used when a kind is switched to `use_external`: the address comes from the
//! environment or configuration and is checked with a single TCP connect.
//! Nothing is started and nothing is stopped.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use super::{Instance, InstanceOrigin, Provisioner, ProvisionerError, ProvisionerResult};
use crate::artifact::InitArtifact;

/// Provisioner for a pre-existing endpoint.
pub struct ExternalProvisioner {
    address: String,
    connect_timeout: Duration,
}

impl ExternalProvisioner {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Provisioner for ExternalProvisioner {
    async fn start(&self, _artifacts: &[InitArtifact]) -> ProvisionerResult<Instance> {
        if self.address.trim().is_empty() {
            return Err(ProvisionerError::Config(
                "external endpoint has no address".to_string(),
            ));
        }

        match probe_target(&self.address)? {
            Some((host, port)) => {
                let connect = TcpStream::connect((host.as_str(), port));
                match tokio::time::timeout(self.connect_timeout, connect).await {
                    Ok(Ok(_)) => debug!("External endpoint {}:{} is reachable", host, port),
                    Ok(Err(e)) => {
                        return Err(ProvisionerError::Unreachable(format!(
                            "{}:{}: {}",
                            host, port, e
                        )));
                    }
                    Err(_) => {
                        return Err(ProvisionerError::Unreachable(format!(
                            "{}:{}: no answer within {}s",
                            host,
                            port,
                            self.connect_timeout.as_secs()
                        )));
                    }
                }
            }
            None => debug!("Skipping TCP probe for {}", self.address),
        }

        Ok(Instance::new(
            self.address.clone(),
            self.address.clone(),
            InstanceOrigin::External,
        ))
    }

    async fn stop(&self, _instance: &Instance) -> ProvisionerResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "external"
    }
}

/// Host and port to probe for an address.
///
/// Returns `None` for addresses that resolve through DNS records rather than
/// a fixed port (`mongodb+srv://`). Multi-host document store URLs probe
/// their first host.
fn probe_target(address: &str) -> ProvisionerResult<Option<(String, u16)>> {
    let (scheme, rest) = match address.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => (String::new(), address),
    };
    if scheme == "mongodb+srv" {
        return Ok(None);
    }

    // Multi-host lists are not valid URL authorities; keep the first host.
    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or_default();
    let first_host = authority.split(',').next().unwrap_or_default();

    let parsed = url::Url::parse(&format!("probe://{}", first_host))
        .map_err(|e| ProvisionerError::Config(format!("bad address {:?}: {}", address, e)))?;
    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProvisionerError::Config(format!("no host in {:?}", address)))?
        .trim_matches(['[', ']'])
        .to_string();
    let port = match parsed.port() {
        Some(port) => port,
        None => default_port(&scheme).ok_or_else(|| {
            ProvisionerError::Config(format!("no port in {:?}", address))
        })?,
    };

    Ok(Some((host, port)))
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        "mongodb" => Some(27017),
        "postgres" | "postgresql" => Some(5432),
        _ => None,
    }
}
