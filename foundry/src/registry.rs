//! Service registry: logical service names → network endpoints.
//!
//! Built once at process start from a `FOUNDRY_SVC_*` environment snapshot and
//! immutable afterwards. Resolution is total: an unknown name is a
//! configuration error, never a localhost fallback.

use std::collections::HashMap;

use thiserror::Error;

/// Environment prefix: `FOUNDRY_SVC_SECRET_STORE=vault.internal:8200` registers
/// the logical name `secret_store`.
pub const ENV_PREFIX: &str = "FOUNDRY_SVC_";

/// Resolved network endpoint of one service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("invalid endpoint for '{name}': '{value}'")]
    InvalidEndpoint { name: String, value: String },
}

/// Fixed internal port per service role, used when the environment value names
/// only a host. External ports never appear on runtime code paths.
fn internal_port(name: &str) -> Option<u16> {
    match name {
        "secret_store" => Some(8200),
        "authz" => Some(8201),
        "tool_gateway" => Some(8202),
        "audit_store" => Some(8203),
        _ => None,
    }
}

/// Immutable name → endpoint map.
///
/// **Interaction**: constructed at boot (after `config::load_and_apply`),
/// injected into [`crate::runtime::Resources`]; HTTP backends resolve their
/// bases through it.
#[derive(Clone, Debug, Default)]
pub struct ServiceRegistry {
    endpoints: HashMap<String, Endpoint>,
}

impl ServiceRegistry {
    /// Snapshot the process environment. Keys are lowercased with the prefix
    /// stripped; values are `host:port` or a bare host for roles with a fixed
    /// internal port.
    pub fn from_env() -> Result<Self, RegistryError> {
        Self::from_entries(std::env::vars().filter_map(|(k, v)| {
            k.strip_prefix(ENV_PREFIX)
                .map(|name| (name.to_ascii_lowercase(), v))
        }))
    }

    pub fn from_entries<I, K, V>(entries: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut endpoints = HashMap::new();
        for (name, value) in entries {
            let name = name.into();
            let value = value.into();
            let endpoint = parse_endpoint(&name, &value)?;
            endpoints.insert(name, endpoint);
        }
        Ok(Self { endpoints })
    }

    /// Total resolution: `Err(UnknownService)` for names not in the snapshot.
    pub fn resolve(&self, name: &str) -> Result<Endpoint, RegistryError> {
        self.endpoints
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownService(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }
}

fn parse_endpoint(name: &str, value: &str) -> Result<Endpoint, RegistryError> {
    let invalid = || RegistryError::InvalidEndpoint {
        name: name.to_string(),
        value: value.to_string(),
    };
    if value.is_empty() {
        return Err(invalid());
    }
    match value.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            Ok(Endpoint {
                host: host.to_string(),
                port,
            })
        }
        Some(_) => Err(invalid()),
        None => match internal_port(name) {
            Some(port) => Ok(Endpoint {
                host: value.to_string(),
                port,
            }),
            None => Err(invalid()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: host:port entries resolve verbatim.
    #[test]
    fn resolve_explicit_port() {
        let reg =
            ServiceRegistry::from_entries([("tool_gateway", "tools.internal:9000")]).unwrap();
        assert_eq!(
            reg.resolve("tool_gateway").unwrap(),
            Endpoint {
                host: "tools.internal".into(),
                port: 9000
            }
        );
    }

    /// **Scenario**: A bare host takes the fixed internal port for its role.
    #[test]
    fn bare_host_uses_internal_port() {
        let reg = ServiceRegistry::from_entries([("secret_store", "vault.internal")]).unwrap();
        assert_eq!(reg.resolve("secret_store").unwrap().port, 8200);
    }

    /// **Scenario**: Unknown names fail; no localhost default.
    #[test]
    fn unknown_service_fails() {
        let reg = ServiceRegistry::from_entries([("authz", "authz.internal:7000")]).unwrap();
        assert_eq!(
            reg.resolve("metrics").unwrap_err(),
            RegistryError::UnknownService("metrics".into())
        );
    }

    /// **Scenario**: A bare host with no fixed role port is invalid configuration.
    #[test]
    fn bare_host_without_role_port_is_invalid() {
        let err = ServiceRegistry::from_entries([("custom_svc", "somewhere")]).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidEndpoint { .. }));
    }
}
