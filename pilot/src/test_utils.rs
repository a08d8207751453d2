//! Test doubles for the host collaborators.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::errors::Result;
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::identity::{TenantIdentity, UserDirectory};

/// Identity with a conventional `/home/<name>` home directory
pub fn identity(name: &str, uid: u32) -> TenantIdentity {
    TenantIdentity {
        name: name.to_string(),
        uid,
        gid: uid,
        home_dir: PathBuf::from(format!("/home/{name}")),
    }
}

/// Identity owned by the user running the tests, so chown in installer tests succeeds.
pub fn current_identity(name: &str, home_dir: PathBuf) -> TenantIdentity {
    TenantIdentity {
        name: name.to_string(),
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
        home_dir,
    }
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        status: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn failed(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        status: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

struct Rule {
    needle: String,
    output: CommandOutput,
    once: bool,
}

/// [`CommandRunner`] that records every command and answers from scripted rules.
///
/// Rules match when the rendered command line contains their needle and are tried in the order
/// they were added. `respond_once` rules are consumed by their first match. Commands matching
/// no rule succeed with empty output.
#[derive(Clone, Default)]
pub struct RecordingRunner {
    rules: Arc<Mutex<Vec<Rule>>>,
    calls: Arc<Mutex<Vec<CommandSpec>>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, needle: &str, output: CommandOutput) -> &Self {
        self.push(needle, output, false)
    }

    pub fn respond_once(&self, needle: &str, output: CommandOutput) -> &Self {
        self.push(needle, output, true)
    }

    fn push(&self, needle: &str, output: CommandOutput, once: bool) -> &Self {
        self.rules.lock().push(Rule {
            needle: needle.to_string(),
            output,
            once,
        });
        self
    }

    /// Every command line run so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(ToString::to_string).collect()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|call| call.contains(needle)).count()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().push(command.clone());

        let line = command.to_string();
        let mut rules = self.rules.lock();
        let Some(index) = rules.iter().position(|rule| line.contains(&rule.needle)) else {
            return Ok(ok(""));
        };

        if rules[index].once {
            Ok(rules.remove(index).output)
        } else {
            Ok(rules[index].output.clone())
        }
    }
}

/// In-memory [`UserDirectory`] that counts lookups.
#[derive(Default)]
pub struct StaticUserDirectory {
    users: Mutex<Vec<TenantIdentity>>,
    lookups: AtomicUsize,
}

impl StaticUserDirectory {
    pub fn new(users: impl IntoIterator<Item = TenantIdentity>) -> Self {
        Self {
            users: Mutex::new(users.into_iter().collect()),
            lookups: AtomicUsize::new(0),
        }
    }

    /// Add a user, as `useradd` would
    pub fn insert(&self, identity: TenantIdentity) {
        self.users.lock().push(identity);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl UserDirectory for StaticUserDirectory {
    fn lookup(&self, name: &str) -> Result<Option<TenantIdentity>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.users.lock().iter().find(|user| user.name == name).cloned())
    }

    fn lookup_uid(&self, uid: u32) -> Result<Option<TenantIdentity>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.users.lock().iter().find(|user| user.uid == uid).cloned())
    }
}
