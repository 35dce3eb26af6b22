//! OS-level containment wrappers for tool-server processes.
//!
//! A sandboxed tool server keeps its launch command but runs inside a
//! filesystem jail: the sandbox directory is bound read-write, the rest of
//! the filesystem is read-only, all capabilities are dropped, and direct
//! networking is replaced by a single bound Unix socket. Linux uses
//! `bwrap` (bubblewrap); macOS uses `sandbox-exec` with a generated
//! profile.

use std::path::PathBuf;

use {anyhow::Result, tracing::debug};

/// What gets bound into the jail.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Agent-writable directory, bound read-write.
    pub sandbox_dir: PathBuf,
    /// Optional Unix socket for outbound network (connect proxy or MITM).
    pub network_socket: Option<PathBuf>,
    /// Per-server scratch directory for generated settings (profiles).
    pub scratch_dir: PathBuf,
}

/// A launch command rewritten to run inside the jail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedCommand {
    pub command: String,
    pub args: Vec<String>,
}

/// Result of the platform support probe.
#[derive(Debug, Clone)]
pub struct Preflight {
    pub supported: bool,
    pub platform: &'static str,
    /// Human-readable explanation when unsupported.
    pub reason: Option<String>,
}

/// Probe whether OS-level containment is available on this host.
pub fn preflight() -> Preflight {
    preflight_for(std::env::consts::OS)
}

fn preflight_for(os: &'static str) -> Preflight {
    match os {
        "linux" => match which::which("bwrap") {
            Ok(path) => {
                debug!(bwrap = %path.display(), "bubblewrap available");
                Preflight {
                    supported: true,
                    platform: "linux",
                    reason: None,
                }
            },
            Err(_) => Preflight {
                supported: false,
                platform: "linux",
                reason: Some("bwrap (bubblewrap) not found on PATH".into()),
            },
        },
        "macos" => match which::which("sandbox-exec") {
            Ok(_) => Preflight {
                supported: true,
                platform: "macos",
                reason: None,
            },
            Err(_) => Preflight {
                supported: false,
                platform: "macos",
                reason: Some("sandbox-exec not found on PATH".into()),
            },
        },
        other => Preflight {
            supported: false,
            platform: other,
            reason: Some(format!("no containment backend for '{other}'")),
        },
    }
}

/// Rewrite a tool-server launch command for the current platform.
pub fn wrap_command(command: &str, args: &[String], spec: &SandboxSpec) -> Result<WrappedCommand> {
    match std::env::consts::OS {
        "linux" => Ok(wrap_bwrap(command, args, spec)),
        "macos" => wrap_sandbox_exec(command, args, spec),
        other => anyhow::bail!("no containment backend for '{other}'"),
    }
}

/// Linux: bubblewrap jail.
fn wrap_bwrap(command: &str, args: &[String], spec: &SandboxSpec) -> WrappedCommand {
    let sandbox = spec.sandbox_dir.display().to_string();
    let mut wrapped = vec![
        "--ro-bind".into(),
        "/".into(),
        "/".into(),
        "--dev".into(),
        "/dev".into(),
        "--proc".into(),
        "/proc".into(),
        "--bind".into(),
        sandbox.clone(),
        sandbox,
        "--unshare-net".into(),
        "--cap-drop".into(),
        "ALL".into(),
        "--die-with-parent".into(),
        "--new-session".into(),
    ];
    if let Some(socket) = &spec.network_socket {
        let socket = socket.display().to_string();
        wrapped.extend(["--bind".into(), socket.clone(), socket]);
    }
    wrapped.push("--".into());
    wrapped.push(command.into());
    wrapped.extend(args.iter().cloned());
    WrappedCommand {
        command: "bwrap".into(),
        args: wrapped,
    }
}

/// macOS: sandbox-exec with a generated profile written into the scratch
/// directory.
fn wrap_sandbox_exec(command: &str, args: &[String], spec: &SandboxSpec) -> Result<WrappedCommand> {
    std::fs::create_dir_all(&spec.scratch_dir)?;
    let profile_path = spec.scratch_dir.join("sandbox.sb");
    std::fs::write(&profile_path, seatbelt_profile(spec))?;

    let mut wrapped = vec!["-f".to_string(), profile_path.display().to_string()];
    wrapped.push(command.into());
    wrapped.extend(args.iter().cloned());
    Ok(WrappedCommand {
        command: "sandbox-exec".into(),
        args: wrapped,
    })
}

/// Seatbelt profile: read-only world, writable sandbox, Unix-socket-only
/// network.
fn seatbelt_profile(spec: &SandboxSpec) -> String {
    let mut profile = String::from(
        "(version 1)\n\
         (deny default)\n\
         (allow process-exec)\n\
         (allow process-fork)\n\
         (allow file-read*)\n\
         (allow sysctl-read)\n\
         (allow signal (target same-sandbox))\n",
    );
    profile.push_str(&format!(
        "(allow file-write* (subpath \"{}\"))\n",
        spec.sandbox_dir.display()
    ));
    profile.push_str("(allow file-write* (subpath \"/tmp\") (subpath \"/private/tmp\"))\n");
    match &spec.network_socket {
        Some(socket) => {
            profile.push_str(&format!(
                "(allow network-outbound (literal \"{}\"))\n",
                socket.display()
            ));
        },
        None => {
            profile.push_str("(deny network*)\n");
        },
    }
    profile
}
