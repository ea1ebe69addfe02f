//! Whitelisted shell command execution.
//!
//! Only reachable after [`crate::modules::gate::AuthorizationGate::authorize`]
//! has admitted the caller; `execute` takes the admitted [`SessionView`] to
//! make that ordering explicit at every call site.

use crate::error::CommandError;
use crate::modules::crypto;
use crate::modules::secure_keys::KeyStore;
use crate::modules::session_store::{short_id, SessionView};
use log::{info, warn};
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Default execution timeout.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured result of a command that ran.
///
/// A non-zero exit is reported in `exit_error`, not as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_error: Option<String>,
}

/// Whitelist check plus execution.
///
/// Only the leading token of a command line is checked; the whole line is
/// handed to `sh -c`. A whitelist entry therefore also admits anything the
/// shell can chain after it (`echo a && id`, `ls; rm x`, pipes, command
/// substitution). Only whitelist commands for callers trusted with a shell.
pub struct CommandAuthority {
    allowed: HashSet<String>,
    payload_encryption: bool,
    exec_timeout: Duration,
    keys: Arc<KeyStore>,
}

impl CommandAuthority {
    pub fn new(
        allowed: HashSet<String>,
        payload_encryption: bool,
        exec_timeout: Duration,
        keys: Arc<KeyStore>,
    ) -> Self {
        Self {
            allowed,
            payload_encryption,
            exec_timeout,
            keys,
        }
    }

    pub fn payload_encryption(&self) -> bool {
        self.payload_encryption
    }

    /// Exact, case-sensitive whitelist membership. An empty whitelist admits
    /// nothing.
    pub fn is_allowed(&self, base_command: &str) -> bool {
        self.allowed.contains(base_command)
    }

    /// Run the command carried by `payload` for an admitted session.
    ///
    /// With payload encryption enabled, `payload` is base64 of an RSA
    /// ciphertext addressed to the server key; otherwise it is the command
    /// line itself.
    pub async fn execute(
        &self,
        session: &SessionView,
        payload: &str,
    ) -> Result<CommandOutcome, CommandError> {
        let command_line = self.decode_payload(payload)?;

        let base = base_command(&command_line).unwrap_or_default();
        if !self.is_allowed(base) {
            warn!(
                "Rejected command '{}' for session {}",
                base,
                short_id(&session.session_id)
            );
            return Err(CommandError::CommandNotAllowed(base.to_string()));
        }

        info!(
            "Executing '{}' for session {}",
            base,
            short_id(&session.session_id)
        );
        self.run(&command_line).await
    }

    fn decode_payload(&self, payload: &str) -> Result<String, CommandError> {
        if !self.payload_encryption {
            return Ok(payload.to_string());
        }
        let ciphertext =
            crypto::base64_decode(payload).map_err(|_| CommandError::DecryptionFailed)?;
        let plaintext = self
            .keys
            .decrypt(&ciphertext)
            .map_err(|_| CommandError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| CommandError::DecryptionFailed)
    }

    async fn run(&self, command_line: &str) -> Result<CommandOutcome, CommandError> {
        #[cfg(target_os = "windows")]
        let mut shell = std::process::Command::new("cmd");
        #[cfg(target_os = "windows")]
        shell.arg("/C").arg(command_line);

        #[cfg(not(target_os = "windows"))]
        let mut shell = std::process::Command::new("sh");
        #[cfg(not(target_os = "windows"))]
        shell.arg("-c").arg(command_line);

        // Own process group, so a timeout reaches everything the shell forks.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut shell, 0);

        let mut cmd = Command::from(shell);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| CommandError::SpawnFailed(e.to_string()))?;
        let pid = child.id();

        // On timeout the future holding the child is dropped, which kills the
        // shell; its descendants are killed through the process group.
        let output = match timeout(self.exec_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(CommandError::SpawnFailed(e.to_string())),
            Err(_) => {
                warn!("Command timed out after {:?}", self.exec_timeout);
                kill_process_group(pid);
                return Err(CommandError::TimedOut(self.exec_timeout.as_secs()));
            }
        };

        let exit_error = if output.status.success() {
            None
        } else {
            Some(output.status.to_string())
        };

        Ok(CommandOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_error,
        })
    }
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        // ESRCH: the whole group already exited
        if e != nix::errno::Errno::ESRCH {
            warn!("Failed to kill process group {}: {}", pgid, e);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Leading whitespace-delimited token of a command line (`"ls -la"` -> `"ls"`).
pub fn base_command(command_line: &str) -> Option<&str> {
    command_line.split_whitespace().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use once_cell::sync::Lazy;
    use rand_core::OsRng;
    use rsa::{RsaPrivateKey, RsaPublicKey};

    static SERVER_KEY: Lazy<RsaPrivateKey> =
        Lazy::new(|| RsaPrivateKey::new(&mut OsRng, 1024).unwrap());

    fn keys() -> Arc<KeyStore> {
        Arc::new(KeyStore::from_private_key(SERVER_KEY.clone()).unwrap())
    }

    fn authority(allowed: &[&str], encrypted: bool, exec_timeout: Duration) -> CommandAuthority {
        CommandAuthority::new(
            allowed.iter().map(|s| s.to_string()).collect(),
            encrypted,
            exec_timeout,
            keys(),
        )
    }

    fn session() -> SessionView {
        SessionView {
            session_id: "test-session-id".to_string(),
            peer_public_key: RsaPublicKey::from(&*SERVER_KEY),
            created_at: Utc::now(),
            challenge_issued: true,
            validated: true,
        }
    }

    #[test]
    fn test_base_command() {
        assert_eq!(base_command("ls -la /tmp"), Some("ls"));
        assert_eq!(base_command("  echo   hi"), Some("echo"));
        assert_eq!(base_command("   "), None);
        assert_eq!(base_command(""), None);
    }

    #[tokio::test]
    async fn test_empty_whitelist_denies_everything() {
        let authority = authority(&[], false, DEFAULT_EXEC_TIMEOUT);
        let result = authority.execute(&session(), "ls").await;
        assert!(matches!(result, Err(CommandError::CommandNotAllowed(cmd)) if cmd == "ls"));
    }

    #[tokio::test]
    async fn test_whitelist_is_case_sensitive() {
        let authority = authority(&["ls"], false, DEFAULT_EXEC_TIMEOUT);
        assert!(matches!(
            authority.execute(&session(), "LS").await,
            Err(CommandError::CommandNotAllowed(_))
        ));
        assert!(matches!(
            authority.execute(&session(), "").await,
            Err(CommandError::CommandNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn test_only_base_token_is_checked() {
        let authority = authority(&["echo"], false, DEFAULT_EXEC_TIMEOUT);
        let outcome = authority
            .execute(&session(), "echo hello world")
            .await
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "hello world");
        assert_eq!(outcome.stderr, "");
        assert_eq!(outcome.exit_error, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_a_result() {
        let authority = authority(&["ls"], false, DEFAULT_EXEC_TIMEOUT);
        let outcome = authority
            .execute(&session(), "ls /definitely/not/a/real/path")
            .await
            .unwrap();
        assert!(outcome.exit_error.is_some());
        assert!(!outcome.stderr.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_command() {
        let authority = authority(&["sleep"], false, Duration::from_millis(200));
        let result = authority.execute(&session(), "sleep 5").await;
        assert!(matches!(result, Err(CommandError::TimedOut(_))));
    }

    #[cfg(unix)]
    fn process_running(args: &str) -> bool {
        let ps = std::process::Command::new("ps")
            .args(["-eo", "args="])
            .output()
            .unwrap();
        String::from_utf8_lossy(&ps.stdout)
            .lines()
            .any(|line| line.trim() == args)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_forked_children() {
        let authority = authority(&["sleep"], false, Duration::from_millis(300));
        // The trailing `true` stops the shell from exec'ing sleep in place
        let result = authority.execute(&session(), "sleep 17.25; true").await;
        assert!(matches!(result, Err(CommandError::TimedOut(_))));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(
            !process_running("sleep 17.25"),
            "forked child outlived the timeout"
        );
    }

    #[tokio::test]
    async fn test_encrypted_payload() {
        let authority = authority(&["echo"], true, DEFAULT_EXEC_TIMEOUT);
        let server = RsaPublicKey::from(&*SERVER_KEY);
        let ciphertext = crypto::encrypt_with_public_key(b"echo sealed", &server).unwrap();

        let outcome = authority
            .execute(&session(), &crypto::base64_encode(&ciphertext))
            .await
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "sealed");

        // Plaintext is refused when encryption is required
        assert!(matches!(
            authority.execute(&session(), "echo sealed").await,
            Err(CommandError::DecryptionFailed)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_whitelisted_base_admits_shell_chaining() {
        let authority = authority(&["echo"], false, DEFAULT_EXEC_TIMEOUT);
        let outcome = authority
            .execute(&session(), "echo first && echo second")
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_encrypted_payload_is_whitelisted_after_decryption() {
        let authority = authority(&["echo"], true, DEFAULT_EXEC_TIMEOUT);
        let server = RsaPublicKey::from(&*SERVER_KEY);
        let ciphertext = crypto::encrypt_with_public_key(b"rm -rf /tmp/x", &server).unwrap();

        assert!(matches!(
            authority
                .execute(&session(), &crypto::base64_encode(&ciphertext))
                .await,
            Err(CommandError::CommandNotAllowed(cmd)) if cmd == "rm"
        ));
    }
}
