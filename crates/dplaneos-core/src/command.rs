//! Allow-listed command execution (C1).
//!
//! Every external tool invocation goes through [`CommandExecutor`]: a fixed
//! table of logical name to absolute path plus per-positional-argument
//! validators. Arguments are passed as an array straight to
//! [`tokio::process::Command`] — there is no shell in the loop, so `;`, `|`,
//! backticks, and `$(...)` are just literal bytes in an argument, not
//! control characters.

use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::audit::{AuditRecord, AuditSink};
use crate::error::CommandError;

/// Output captured from a finished command, capped at [`MAX_OUTPUT_BYTES`]
/// per stream.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Short,
    Standard,
    Long,
}

impl Deadline {
    fn duration(self) -> Duration {
        match self {
            Deadline::Short => Duration::from_secs(5),
            Deadline::Standard => Duration::from_secs(30),
            Deadline::Long => Duration::from_secs(120),
        }
    }
}

/// A validator applied to one positional argument before the command runs.
pub type ArgValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct CommandSpec {
    pub path: &'static str,
    pub validators: Vec<ArgValidator>,
    pub deadline: Deadline,
}

/// Output of a finished, allow-listed command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

pub struct CommandExecutor {
    commands: HashMap<&'static str, CommandSpec>,
    audit: Option<AuditSink>,
}

impl CommandExecutor {
    #[must_use]
    pub fn new() -> Self {
        let mut commands = HashMap::new();
        register_default_commands(&mut commands);
        Self { commands, audit: None }
    }

    /// Attaches an audit sink: every invocation of [`Self::run`] from this
    /// point on, successful or not, is recorded to the audit chain.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Runs `name` with `args`, validating each argument against the
    /// registered command's validators before spawning anything, and
    /// recording the invocation and its outcome to the audit chain if one
    /// is attached.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::UnknownCommand`] if `name` isn't registered,
    /// [`CommandError::InvalidArgument`] if validation fails,
    /// [`CommandError::Timeout`] if the deadline elapses, and
    /// [`CommandError::NonZeroExit`] if the process exits with a non-zero
    /// status.
    pub async fn run(&self, name: &str, args: &[String], background: bool) -> Result<CommandOutput, CommandError> {
        let result = self.run_inner(name, args, background).await;
        self.record_invocation(name, args, &result).await;
        result
    }

    async fn record_invocation(&self, name: &str, args: &[String], result: &Result<CommandOutput, CommandError>) {
        let Some(audit) = &self.audit else { return };
        let outcome = if result.is_ok() { "success" } else { "failure" };
        let detail = result.as_ref().err().map(ToString::to_string);
        let _ = audit
            .record(AuditRecord {
                actor: None,
                source_ip: None,
                action: format!("command.{name}"),
                resource: Some(args.join(" ")),
                outcome: outcome.to_string(),
                detail,
            })
            .await;
    }

    async fn run_inner(&self, name: &str, args: &[String], background: bool) -> Result<CommandOutput, CommandError> {
        let spec = self
            .commands
            .get(name)
            .ok_or_else(|| CommandError::UnknownCommand { name: name.to_string() })?;

        for (index, (arg, validator)) in args.iter().zip(spec.validators.iter()).enumerate() {
            if !validator(arg) {
                return Err(CommandError::InvalidArgument {
                    name: name.to_string(),
                    index,
                    reason: "argument failed allow-list validation".to_string(),
                });
            }
        }
        if args.len() > spec.validators.len() {
            return Err(CommandError::InvalidArgument {
                name: name.to_string(),
                index: spec.validators.len(),
                reason: "too many arguments for this command".to_string(),
            });
        }

        let mut cmd = TokioCommand::new(spec.path);
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        #[cfg(unix)]
        if background {
            lower_priority(&mut cmd);
        }
        #[cfg(not(unix))]
        let _ = background;

        let mut child = cmd.spawn().map_err(|err| CommandError::Spawn {
            name: name.to_string(),
            reason: err.to_string(),
        })?;

        let run = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(mut out) = child.stdout.take() {
                let _ = out.read_to_end(&mut stdout).await;
            }
            if let Some(mut err) = child.stderr.take() {
                let _ = err.read_to_end(&mut stderr).await;
            }
            let status = child.wait().await;
            (status, stdout, stderr)
        };

        let (status, mut stdout, mut stderr) = timeout(spec.deadline.duration(), run)
            .await
            .map_err(|_| CommandError::Timeout {
                name: name.to_string(),
                timeout_secs: spec.deadline.duration().as_secs(),
            })?;

        stdout.truncate(MAX_OUTPUT_BYTES);
        stderr.truncate(MAX_OUTPUT_BYTES);
        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        let status = status.map_err(|err| CommandError::Spawn {
            name: name.to_string(),
            reason: err.to_string(),
        })?;
        let code = status.code().unwrap_or(-1);

        if code != 0 {
            warn!(command = name, code, "command exited non-zero");
            return Err(CommandError::NonZeroExit {
                name: name.to_string(),
                code,
                stderr,
            });
        }

        info!(command = name, "command completed");
        Ok(CommandOutput { status: code, stdout, stderr })
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn lower_priority(cmd: &mut TokioCommand) {
    // SAFETY: `pre_exec` runs the closure after fork and before exec, in
    // the child only; `setpriority` with `PRIO_PROCESS, 0` affects only the
    // calling (child) process and cannot fail in a way that corrupts state.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpriority(libc::PRIO_PROCESS, 0, 10);
            Ok(())
        });
    }
}

fn register_default_commands(commands: &mut HashMap<&'static str, CommandSpec>) {
    let pool_name = validator(r"^[a-zA-Z][a-zA-Z0-9_.:-]{0,63}$");
    let dataset_name = validator(r"^[a-zA-Z][a-zA-Z0-9_./:-]{0,255}$");
    let snapshot_name = validator(r"^[a-zA-Z0-9_./:-]+@[a-zA-Z0-9_.:-]{1,255}$");
    let mount_point = validator(r"^/[a-zA-Z0-9_./-]*$");
    let container_name = validator(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,127}$");
    let device_path = validator(r"^/dev/[a-zA-Z0-9_/-]{1,127}$");
    let interface_name = validator(r"^[a-zA-Z][a-zA-Z0-9_-]{0,14}$");
    let ip_literal = ip_literal_validator();
    let confined_path = confined_path_validator();

    commands.insert(
        "zpool-status",
        CommandSpec { path: "/sbin/zpool", validators: vec![pool_name.clone()], deadline: Deadline::Short },
    );
    commands.insert(
        "zfs-snapshot",
        CommandSpec {
            path: "/sbin/zfs",
            validators: vec![snapshot_name.clone()],
            deadline: Deadline::Standard,
        },
    );
    commands.insert(
        "zfs-list",
        CommandSpec { path: "/sbin/zfs", validators: vec![dataset_name.clone()], deadline: Deadline::Short },
    );
    commands.insert(
        "zfs-mount",
        CommandSpec { path: "/sbin/zfs", validators: vec![mount_point], deadline: Deadline::Standard },
    );
    commands.insert(
        "zfs-destroy",
        CommandSpec { path: "/sbin/zfs", validators: vec![snapshot_name.clone()], deadline: Deadline::Standard },
    );
    commands.insert(
        "zfs-rollback",
        CommandSpec { path: "/sbin/zfs", validators: vec![snapshot_name], deadline: Deadline::Standard },
    );
    commands.insert(
        "container-inspect",
        CommandSpec {
            path: "/usr/bin/docker",
            validators: vec![container_name.clone()],
            deadline: Deadline::Short,
        },
    );
    commands.insert(
        "container-restart",
        CommandSpec { path: "/usr/bin/docker", validators: vec![container_name], deadline: Deadline::Long },
    );
    commands.insert(
        "zpool-replace",
        CommandSpec { path: "/sbin/zpool", validators: vec![pool_name, device_path], deadline: Deadline::Long },
    );
    commands.insert(
        "net-addr-set",
        CommandSpec {
            path: "/sbin/ip",
            validators: vec![interface_name.clone(), ip_literal],
            deadline: Deadline::Standard,
        },
    );
    commands.insert(
        "net-addr-show",
        CommandSpec { path: "/sbin/ip", validators: vec![interface_name], deadline: Deadline::Short },
    );
    commands.insert(
        "share-path-remove",
        CommandSpec { path: "/bin/rm", validators: vec![exact("-rf"), confined_path], deadline: Deadline::Standard },
    );
    commands.insert(
        "container-runtime-stop",
        CommandSpec {
            path: "/usr/bin/systemctl",
            validators: vec![exact("stop"), exact("docker")],
            deadline: Deadline::Standard,
        },
    );
}

fn validator(pattern: &str) -> ArgValidator {
    #[allow(clippy::expect_used)]
    let regex = Regex::new(pattern).expect("command validator pattern must compile");
    Arc::new(move |value: &str| regex.is_match(value))
}

/// A validator that accepts only one exact, hardcoded literal. Used for
/// command-line flags and subcommand names that the caller never actually
/// chooses — keeping them behind a validator rather than baked into
/// `CommandSpec::path` means every token the child process sees, including
/// the fixed ones, passes through the same allow-list mechanism.
fn exact(literal: &'static str) -> ArgValidator {
    Arc::new(move |value: &str| value == literal)
}

/// Accepts a bare IPv4/IPv6 literal, optionally with a `/prefix` CIDR
/// suffix whose bit length is valid for the address family.
fn ip_literal_validator() -> ArgValidator {
    Arc::new(|value: &str| {
        let (addr, prefix) = match value.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (value, None),
        };
        let Ok(parsed) = addr.parse::<IpAddr>() else { return false };
        match prefix {
            None => true,
            Some(p) => p.parse::<u8>().is_ok_and(|bits| match parsed {
                IpAddr::V4(_) => bits <= 32,
                IpAddr::V6(_) => bits <= 128,
            }),
        }
    })
}

/// Base directory every share export path must resolve inside of. A
/// canonicalised value that escapes this tree, whether via `..` or a
/// symlink, is rejected.
const SHARE_BASE_DIR: &str = "/srv/dplaneos/shares";

/// Rejects `..` outright, then canonicalises both the candidate path and
/// the confinement base and checks containment — catching a symlink
/// planted inside the base that points back outside it, which a purely
/// lexical check would miss.
fn confined_path_validator() -> ArgValidator {
    Arc::new(|value: &str| {
        if !value.starts_with('/') || value.split('/').any(|segment| segment == "..") {
            return false;
        }
        let Ok(base) = std::fs::canonicalize(SHARE_BASE_DIR) else { return false };
        match std::fs::canonicalize(value) {
            Ok(resolved) => resolved.starts_with(&base),
            Err(_) => false,
        }
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn pool_name_rejects_shell_metacharacters() {
        let v = validator(r"^[a-zA-Z][a-zA-Z0-9_.:-]{0,63}$");
        for bad in ["tank; rm -rf /", "tank|cat", "tank`id`", "tank$(id)", "../tank", "-tank"] {
            assert!(!v(bad), "expected {bad:?} to be rejected");
        }
        assert!(v("tank"));
        assert!(v("tank/data-01"));
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let executor = CommandExecutor::new();
        let err = executor.run("does-not-exist", &[], false).await.unwrap_err();
        assert!(matches!(err, CommandError::UnknownCommand { .. }));
    }

    #[tokio::test]
    async fn invalid_argument_is_rejected_before_spawn() {
        let executor = CommandExecutor::new();
        let err = executor
            .run("zpool-status", &["tank; rm -rf /".to_string()], false)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument { .. }));
    }
}
