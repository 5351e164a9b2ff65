//! Static validation of names and of a run's descriptors as a whole.
//!
//! Per-descriptor rules live in the builders; this module covers what
//! only becomes checkable once all descriptors of a run are known.

use std::collections::HashSet;

use berth_common::error::{BerthError, Result};

use crate::spec::{JobSpec, ServiceSpec};

/// Checks that `name` can be used as a container network alias.
///
/// Accepts ASCII alphanumerics, `-` and `_`, starting with an alphanumeric.
///
/// # Errors
///
/// Returns [`BerthError::InvalidSpec`] naming the offending `kind`.
pub fn check_alias(kind: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(BerthError::invalid_spec(format!("{kind} name is empty")));
    };
    if !first.is_ascii_alphanumeric()
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(BerthError::invalid_spec(format!(
            "{kind} name \"{name}\" is not a valid network alias"
        )));
    }
    Ok(())
}

/// Validates a run's descriptors for semantic correctness.
///
/// # Checks performed
///
/// 1. No duplicate service names.
/// 2. The job name does not collide with a service name.
///
/// Dependency resolution is left to the graph builder.
///
/// # Errors
///
/// Returns [`BerthError::InvalidSpec`] if any check fails.
pub fn validate_run(job: &JobSpec, services: &[ServiceSpec]) -> Result<()> {
    tracing::debug!(services = services.len(), job = job.name(), "validating run");
    check_duplicate_services(services)?;
    check_job_name(job, services)?;
    Ok(())
}

fn check_duplicate_services(services: &[ServiceSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for svc in services {
        if !seen.insert(svc.name()) {
            return Err(BerthError::invalid_spec(format!(
                "duplicate service name: \"{}\"",
                svc.name()
            )));
        }
    }
    Ok(())
}

fn check_job_name(job: &JobSpec, services: &[ServiceSpec]) -> Result<()> {
    if services.iter().any(|s| s.name() == job.name()) {
        return Err(BerthError::invalid_spec(format!(
            "job name \"{}\" collides with a service name",
            job.name()
        )));
    }
    Ok(())
}
