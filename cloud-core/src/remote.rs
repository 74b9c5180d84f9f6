//! Command execution on cluster nodes.
//!
//! Cluster nodes only listen on an internal network, so every command is run
//! through an ssh jump host. The executor shells out to the system `ssh`
//! client with `duct`, on the blocking pool so the async runtime keeps moving.

use crate::error::{CloudError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub command: String,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn describe(&self) -> String {
        let code = self
            .status
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let mut text = format!("`{}` exited with {}: {}", self.command, code, self.stderr.trim());
        if !self.stdout.trim().is_empty() {
            text.push_str(&format!(" (stdout: {})", self.stdout.trim()));
        }
        text
    }

    /// Turn a non-zero exit into `Unavailable`.
    pub fn check(self, what: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(CloudError::Unavailable(format!(
                "{what} failed: {}",
                self.describe()
            )))
        }
    }
}

/// Quote a value for inclusion in a POSIX shell command line.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` through a shell on `node`.
    async fn exec(&self, node: &str, command: &str) -> Result<CommandOutput>;

    /// Run `command` on `node` with `stdin` piped to it.
    async fn exec_with_stdin(
        &self,
        node: &str,
        command: &str,
        stdin: Vec<u8>,
    ) -> Result<CommandOutput>;

    /// Write `contents` to `path` on `node`.
    async fn push_file(&self, node: &str, path: &str, contents: &[u8]) -> Result<()> {
        let command = format!("cat > {}", shell_quote(path));
        self.exec_with_stdin(node, &command, contents.to_vec())
            .await?
            .check(&format!("writing {path} on {node}"))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub jump_host: String,
    pub jump_port: u16,
    pub jump_user: String,
    pub node_port: u16,
    pub node_user: String,
    pub identity_file: Option<PathBuf>,
    /// Appended to bare node names, e.g. `.cluster.internal`.
    pub node_domain: Option<String>,
}

impl SshTarget {
    fn node_host(&self, node: &str) -> String {
        match &self.node_domain {
            Some(domain) if !node.contains('.') => {
                format!("{}.{}", node, domain.trim_start_matches('.'))
            }
            _ => node.to_string(),
        }
    }

    /// Arguments passed to `ssh` for one command.
    pub fn ssh_args(&self, node: &str, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-J".to_string(),
            format!("{}@{}:{}", self.jump_user, self.jump_host, self.jump_port),
            "-p".to_string(),
            self.node_port.to_string(),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", self.node_user, self.node_host(node)));
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }
}

pub struct SshJumpExecutor {
    target: SshTarget,
}

impl SshJumpExecutor {
    pub fn new(target: SshTarget) -> Self {
        Self { target }
    }

    async fn run(&self, node: &str, command: &str, stdin: Option<Vec<u8>>) -> Result<CommandOutput> {
        let args = self.target.ssh_args(node, command);
        let command_text = command.to_string();
        let node_name = node.to_string();
        debug!(node = %node_name, command = %command_text, "running remote command");

        let output = tokio::task::spawn_blocking(move || {
            let mut expr = duct::cmd("ssh", &args)
                .stdout_capture()
                .stderr_capture()
                .unchecked();
            if let Some(bytes) = stdin {
                expr = expr.stdin_bytes(bytes);
            }
            expr.run()
        })
        .await
        .map_err(|e| CloudError::Unavailable(format!("remote command task failed: {e}")))?
        .map_err(|e| CloudError::Unavailable(format!("failed to spawn ssh: {e}")))?;

        let result = CommandOutput {
            command: command_text,
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        // ssh itself exits 255 when the connection cannot be made
        if result.status == Some(255) {
            warn!(node = %node_name, stderr = %result.stderr.trim(), "ssh connection failed");
            return Err(CloudError::Unavailable(format!(
                "cannot reach node {node_name}: {}",
                result.stderr.trim()
            )));
        }
        Ok(result)
    }
}

#[async_trait]
impl RemoteShell for SshJumpExecutor {
    async fn exec(&self, node: &str, command: &str) -> Result<CommandOutput> {
        self.run(node, command, None).await
    }

    async fn exec_with_stdin(
        &self,
        node: &str,
        command: &str,
        stdin: Vec<u8>,
    ) -> Result<CommandOutput> {
        self.run(node, command, Some(stdin)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            jump_host: "gate.example.org".into(),
            jump_port: 2222,
            jump_user: "jump".into(),
            node_port: 22,
            node_user: "root".into(),
            identity_file: Some(PathBuf::from("/etc/cloud/id_ed25519")),
            node_domain: Some("cluster.internal".into()),
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/var/lib/vz/a.qcow2"), "/var/lib/vz/a.qcow2");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_ssh_args_route_through_jump_host() {
        let args = target().ssh_args("pve1", "uptime");
        let joined = args.join(" ");
        assert!(joined.contains("-J jump@gate.example.org:2222"));
        assert!(joined.contains("-i /etc/cloud/id_ed25519"));
        assert!(joined.ends_with("root@pve1.cluster.internal -- uptime"));
    }

    #[test]
    fn test_fully_qualified_node_kept() {
        let args = target().ssh_args("pve2.other.net", "true");
        assert!(args.contains(&"root@pve2.other.net".to_string()));
    }

    #[test]
    fn test_check_reports_failure() {
        let out = CommandOutput {
            command: "sha256sum x".into(),
            status: Some(1),
            stdout: String::new(),
            stderr: "No such file\n".into(),
        };
        let err = out.check("hashing").unwrap_err();
        assert_eq!(
            err,
            CloudError::Unavailable("hashing failed: `sha256sum x` exited with 1: No such file".into())
        );
    }
}
