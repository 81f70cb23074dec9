//! Process helpers shared by the engine and the auxiliary process manager.

use std::time::Duration;
use thiserror::Error;
use tokio::process::Child;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,

    #[error("Cannot split command '{command}': {reason}")]
    Unbalanced { command: String, reason: String },
}

/// Split a command string into argv using POSIX shell quoting rules.
pub fn split_command(command: &str) -> Result<Vec<String>, CommandError> {
    let argv = shell_words::split(command).map_err(|e| CommandError::Unbalanced {
        command: command.to_string(),
        reason: e.to_string(),
    })?;
    if argv.is_empty() {
        return Err(CommandError::Empty);
    }
    Ok(argv)
}

/// Ask a child to exit with SIGTERM, then SIGKILL it if it is still alive
/// after `grace`. Always reaps the child.
pub async fn terminate_gracefully(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    if let Some(pid) = child.id() {
        let _ = tokio::process::Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            debug!("Process exited after SIGTERM: {:?}", status.as_ref().ok());
            status.map(|_| ())
        }
        Err(_) => {
            debug!("Process ignored SIGTERM for {:?}, killing", grace);
            child.kill().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command_quoting() {
        assert_eq!(
            split_command("./leak 291 'l m'").unwrap(),
            vec!["./leak", "291", "l m"]
        );
        assert_eq!(
            split_command(r#"sh -c "sleep 1; exit 3""#).unwrap(),
            vec!["sh", "-c", "sleep 1; exit 3"]
        );
    }

    #[test]
    fn test_split_command_errors() {
        assert!(matches!(split_command("   "), Err(CommandError::Empty)));
        assert!(matches!(
            split_command("echo 'oops"),
            Err(CommandError::Unbalanced { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_gracefully_stops_sleeper() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let started = std::time::Instant::now();
        terminate_gracefully(&mut child, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(child.try_wait().unwrap().is_some());
    }
}
