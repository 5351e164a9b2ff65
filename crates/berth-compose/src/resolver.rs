//! Service bindings and environment auto-wiring.
//!
//! When a job or service depends on another service, the dependency's
//! network alias is bound into the dependent container and two variables
//! are generated for it:
//! - `<NAME>_HOST` set to the alias.
//! - `<NAME>_PORT` set to the dependency's lowest exposed port (if any).
//!
//! Explicitly declared variables always win over generated ones.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::spec::ServiceSpec;

/// A dependency made reachable from a dependent container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceBinding {
    /// Service name.
    pub name: String,
    /// Network alias under which the dependent reaches the service.
    pub alias: String,
    /// Port advertised through `<NAME>_PORT`.
    pub port: Option<u16>,
}

impl ServiceBinding {
    /// Binds `spec` under its own name.
    #[must_use]
    pub fn for_service(spec: &ServiceSpec) -> Self {
        Self {
            name: spec.name().to_string(),
            alias: spec.name().to_string(),
            port: spec.primary_port(),
        }
    }
}

/// Upper-cased variable prefix for a service name (`my-db` → `MY_DB`).
#[must_use]
pub fn env_prefix(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Merges declared variables with those generated from `bindings`.
///
/// Declared variables come first in key order, followed by generated ones
/// in binding order. A generated variable whose key is already declared is
/// skipped.
#[must_use]
pub fn wire_environment(
    declared: &BTreeMap<String, String>,
    bindings: &[ServiceBinding],
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = declared
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for binding in bindings {
        let prefix = env_prefix(&binding.name);
        push_generated(&mut env, declared, format!("{prefix}_HOST"), binding.alias.clone());
        if let Some(port) = binding.port {
            push_generated(&mut env, declared, format!("{prefix}_PORT"), port.to_string());
        }
    }
    env
}

fn push_generated(
    env: &mut Vec<(String, String)>,
    declared: &BTreeMap<String, String>,
    key: String,
    value: String,
) {
    if declared.contains_key(&key) {
        tracing::debug!(key, "declared variable overrides generated binding");
        return;
    }
    env.push((key, value));
}
