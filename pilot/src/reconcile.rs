//! Idempotent create-or-update of external resources.
//!
//! Every provisioning step that owns a named external object (a PostgreSQL role, a database, a
//! Caddy route) follows the same shape:
//!
//! 1. ask the external system whether the object exists,
//! 2. if it does, update it in place (or do nothing, if there is nothing to update),
//! 3. if it does not, create it; if creating fails and the resource knows how to bootstrap its
//!    parent (e.g. the Caddy server that holds the route list), bootstrap once and retry the
//!    create exactly once.
//!
//! Bootstrapping is never pre-emptive: in the common case an absent object costs one existence
//! check plus one create. A failed bootstrap or a failed retry is fatal and is surfaced
//! verbatim rather than retried again.
//!
//! The check and the act are not transactional. Two concurrent runs for the same resource can
//! both see "absent" and both try to create it; callers serialize runs externally.

use async_trait::async_trait;
use std::fmt;
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};

/// Capability interface for one reconcilable external object.
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Short description for logs, e.g. `caddy route tenant-acme`
    fn describe(&self) -> String;

    /// Whether the object exists. Errors here are hard errors; nothing is created.
    async fn exists(&self) -> Result<bool>;

    /// Create the object. A failure of the create call itself should be reported as
    /// [`Error::TransientExternal`] so that [`reconcile`] may bootstrap and retry.
    async fn create(&self) -> Result<()>;

    /// Bring an existing object in line with the desired state.
    async fn update(&self) -> Result<()> {
        Ok(())
    }

    /// Whether [`Reconcile::bootstrap`] does anything
    fn supports_bootstrap(&self) -> bool {
        false
    }

    /// Create whatever the object's parent needs for `create` to succeed.
    async fn bootstrap(&self) -> Result<()> {
        Ok(())
    }
}

/// What [`reconcile`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The object existed and was updated in place (or left alone)
    Existing,
    Created,
    /// The first create failed; the parent was bootstrapped and the retry succeeded
    CreatedAfterBootstrap,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Existing => write!(f, "already present"),
            Outcome::Created => write!(f, "created"),
            Outcome::CreatedAfterBootstrap => write!(f, "created after bootstrap"),
        }
    }
}

/// Converge one resource: exists → update, else create with a single bootstrap-and-retry.
pub async fn reconcile<R: Reconcile + ?Sized>(resource: &R) -> Result<Outcome> {
    let what = resource.describe();

    if resource.exists().await? {
        debug!(resource = %what, "Resource exists, updating in place");
        resource.update().await?;
        return Ok(Outcome::Existing);
    }

    info!(resource = %what, "Resource absent, creating");
    let err = match resource.create().await {
        Ok(()) => return Ok(Outcome::Created),
        Err(err) => err,
    };

    if !(err.is_transient() && resource.supports_bootstrap()) {
        return Err(err.into_fatal());
    }

    warn!(resource = %what, error = %err, "Create failed, bootstrapping once and retrying");
    resource.bootstrap().await.map_err(Error::into_fatal)?;

    info!(resource = %what, "Retrying create after bootstrap");
    resource.create().await.map_err(Error::into_fatal)?;

    Ok(Outcome::CreatedAfterBootstrap)
}
