//! # pilot: Tenant Provisioning for Socket-Activated Backends
//!
//! `pilot` provisions tenants on a single Linux host. A tenant is a named customer environment
//! that maps one-to-one onto an OS user, and provisioning one means bringing four external
//! systems into agreement about it: the host's user database, PostgreSQL, the tenant's systemd
//! user manager, and Caddy.
//!
//! ## Overview
//!
//! Each tenant runs an identical backend that is started on demand. Caddy routes the tenant's
//! hostname to a unix socket owned by the tenant's systemd user manager; the first connection
//! starts `systemd-socket-proxyd`, which in turn starts the backend on a loopback port derived
//! from the tenant's uid. When traffic stops, the proxy exits after an idle interval and takes
//! the backend down with it. The backend talks to its own PostgreSQL database using peer
//! authentication as the tenant's OS user.
//!
//! ### What It Does
//!
//! For one tenant, `pilot create-tenant --name acme` will:
//!
//! 1. create the `acme` account with lingering enabled and wait for its user manager,
//! 2. create the `acme` PostgreSQL role and the `acme` database owned by it,
//! 3. render `rest-api.socket`, `rest-api-proxy.service` and `rest-api.service` into
//!    `~acme/.config/systemd/user`, then enable the socket,
//! 4. add (or replace) the Caddy route `tenant-acme` from `acme.localhost` to
//!    `/run/pilot/acme.sock`.
//!
//! ## Architecture
//!
//! Every step that owns a named external object is written as a [`reconcile::Reconcile`]
//! implementation: ask whether the object exists, update it if so, otherwise create it, and if
//! creation fails for a resource that knows how to bootstrap its parent, bootstrap once and
//! retry once. [`reconcile::reconcile`] is the only place that control flow lives. Re-running any
//! command converges instead of failing on "already exists", which makes a re-run the recovery
//! path for a half-provisioned tenant. There is no rollback.
//!
//! External effects go through two seams so they can be replaced in tests:
//!
//! - [`exec::CommandRunner`] runs host commands (`useradd`, `psql`, `systemctl`, ...), either as
//!   root or inside the tenant's security context via `runuser`.
//! - [`identity::UserDirectory`] reads the passwd database.
//!
//! Caddy is reached over HTTP through [`route::CaddyClient`].
//!
//! ### Core Components
//!
//! The **identity** module ([`identity`]) resolves tenant names to uid, gid and home directory.
//! The **database** module ([`database`]) reconciles the role and database independently. The
//! **units** module ([`units`]) renders the unit files and derives the backend port; the
//! **installer** ([`installer`]) writes them with the tenant's ownership and activates the
//! socket. The **route** module ([`route`]) reconciles the Caddy route, bootstrapping the HTTP
//! server on a fresh Caddy. The **pipeline** ([`pipeline`]) runs those stages in order and stops
//! at the first failure, reporting the stage that failed.
//!
//! Tenant names are validated ([`validation`]) by every component that puts a name into a
//! command line, a path, a SQL literal or a URL, not just at the CLI.
//!
//! ## Configuration
//!
//! See [`config`]: a YAML file plus `PILOT_`-prefixed environment overrides.

pub mod config;
pub mod database;
pub mod diagnostics;
pub mod errors;
pub mod exec;
pub mod identity;
pub mod installer;
pub mod pipeline;
pub mod reconcile;
pub mod route;
pub mod telemetry;
pub mod units;
pub mod users;
pub mod validation;

#[cfg(test)]
mod test_utils;

#[cfg(test)]
mod test;

pub use config::Config;
pub use errors::{Error, Result};
pub use pipeline::{Pipeline, ProvisionRequest, StageError};
