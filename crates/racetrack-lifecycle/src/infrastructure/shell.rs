//! Running infrastructure commands.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{LifecycleError, LifecycleResult};

/// Executes infrastructure management commands such as `docker ps`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command and return its output, standard error following
    /// standard output.
    ///
    /// A non-zero exit status is an error carrying the command output.
    async fn run(&self, args: &[String]) -> LifecycleResult<String>;
}

/// Runs commands as local child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalShell;

#[async_trait]
impl CommandRunner for LocalShell {
    async fn run(&self, args: &[String]) -> LifecycleResult<String> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| LifecycleError::internal("empty command"))?;

        debug!(command = %render_command(args), "running command");
        let output = Command::new(program)
            .args(rest)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LifecycleError::infrastructure(format!("failed to run {program}: {e}")))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(LifecycleError::infrastructure(format!(
                "command failed ({}): {}: {}",
                output.status,
                render_command(args),
                combined.trim()
            )));
        }
        Ok(combined)
    }
}

/// Render arguments as a single POSIX shell command line.
#[must_use]
pub fn render_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c));
    if plain {
        arg.to_owned()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn plain_arguments_stay_unquoted() {
        assert_eq!(
            render_command(&args(&["docker", "rm", "-f", "job-adder-v-1"])),
            "docker rm -f job-adder-v-1"
        );
    }

    #[test]
    fn special_arguments_are_quoted() {
        assert_eq!(
            render_command(&args(&["docker", "ps", "--format", "{{.Names}} {{.Ports}}"])),
            "docker ps --format '{{.Names}} {{.Ports}}'"
        );
        assert_eq!(render_command(&args(&["echo", "it's"])), r"echo 'it'\''s'");
        assert_eq!(render_command(&args(&["echo", ""])), "echo ''");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn local_shell_reports_failures() {
        let out = LocalShell.run(&args(&["sh", "-c", "echo hi"])).await.unwrap();
        assert_eq!(out.trim(), "hi");

        let err = LocalShell
            .run(&args(&["sh", "-c", "echo oops >&2; exit 3"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("oops"));
    }
}
