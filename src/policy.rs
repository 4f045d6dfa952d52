//! Safety gates for the command tools.
//!
//! Two independent checks: command tools as a class are off unless the
//! operator opted in, and even then only binaries under a trusted
//! prefix may run. Workspace-file containment lives with
//! [`crate::workspace::Workspace::resolve`].

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("command tools are disabled; start the bridge with BRIDGE_ENABLE_COMMANDS=1 to allow them")]
    CommandsDisabled,
    #[error("binary {0} is outside the trusted prefixes")]
    UntrustedBinary(String),
}

pub struct Policy {
    commands_enabled: bool,
    trusted_prefixes: Vec<PathBuf>,
}

impl Policy {
    pub fn new(commands_enabled: bool) -> Self {
        Self {
            commands_enabled,
            trusted_prefixes: default_trusted_prefixes(),
        }
    }

    #[must_use]
    pub fn with_trusted_prefixes(mut self, extra: impl IntoIterator<Item = PathBuf>) -> Self {
        self.trusted_prefixes.extend(extra);
        self
    }

    pub const fn commands_enabled(&self) -> bool {
        self.commands_enabled
    }

    /// Gate one command-tool invocation of `binary`.
    pub fn check_command(&self, binary: &Path) -> Result<(), PolicyError> {
        if !self.commands_enabled {
            return Err(PolicyError::CommandsDisabled);
        }
        if self
            .trusted_prefixes
            .iter()
            .any(|prefix| binary.starts_with(prefix))
        {
            Ok(())
        } else {
            Err(PolicyError::UntrustedBinary(binary.display().to_string()))
        }
    }
}

fn default_trusted_prefixes() -> Vec<PathBuf> {
    let mut prefixes = vec![
        PathBuf::from("/usr/bin"),
        PathBuf::from("/usr/local/bin"),
        PathBuf::from("/bin"),
        PathBuf::from("/opt/homebrew/bin"),
    ];
    if let Some(home) = std::env::var_os("HOME") {
        let home = PathBuf::from(home);
        prefixes.push(home.join(".cargo/bin"));
        prefixes.push(home.join(".rustup"));
    }
    prefixes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_policy_rejects_everything() {
        let policy = Policy::new(false);
        assert!(matches!(
            policy.check_command(Path::new("/usr/bin/cargo")),
            Err(PolicyError::CommandsDisabled)
        ));
    }

    #[test]
    fn trusted_prefix_is_allowed() {
        let policy = Policy::new(true);
        assert!(policy.check_command(Path::new("/usr/bin/cargo")).is_ok());
    }

    #[test]
    fn untrusted_binary_is_rejected() {
        let policy = Policy::new(true);
        assert!(matches!(
            policy.check_command(Path::new("/tmp/evil/cargo")),
            Err(PolicyError::UntrustedBinary(_))
        ));
    }

    #[test]
    fn prefix_match_is_per_component() {
        // /usr/binx must not satisfy the /usr/bin prefix.
        let policy = Policy::new(true);
        assert!(matches!(
            policy.check_command(Path::new("/usr/binx/cargo")),
            Err(PolicyError::UntrustedBinary(_))
        ));
    }

    #[test]
    fn extra_prefixes_extend_the_allow_list() {
        let policy =
            Policy::new(true).with_trusted_prefixes([PathBuf::from("/srv/toolchains")]);
        assert!(policy
            .check_command(Path::new("/srv/toolchains/bin/cargo"))
            .is_ok());
    }
}
