//! Tenant name policy.
//!
//! Tenant names are interpolated into shell argument vectors, unit file paths and literal SQL
//! text for the catalog existence checks, so every component that externalizes a name calls
//! [`validate_tenant_name`] first rather than relying on the CLI entry point having done it.

use crate::errors::{Error, Result};

/// Check a tenant name against `^[a-z0-9_-]+$`.
pub fn validate_tenant_name(name: &str) -> Result<()> {
    validate_name("tenant name", name)
}

/// Apply the tenant name policy to any other identifier that ends up in a path or URL.
pub fn validate_name(field: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid(field, name, "must not be empty".to_string()));
    }

    for (i, ch) in name.chars().enumerate() {
        if !(ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_') {
            return Err(invalid(
                field,
                name,
                format!("invalid character '{ch}' at position {i}; only a-z, 0-9, '-' and '_' are allowed"),
            ));
        }
    }

    Ok(())
}

fn invalid(field: &str, name: &str, reason: String) -> Error {
    Error::Validation {
        field: field.to_string(),
        value: name.to_string(),
        reason,
    }
}
