//! Credentials produced by managed credential callbacks.
//!
//! The same [`Credential`] value serves two consumers: the native engine,
//! which receives it as a `git_cred` object, and the managed subtransports,
//! which read the fields directly (basic auth for HTTP, key material for SSH).

use std::{fmt, ops::BitOr, path::PathBuf, ptr, sync::Arc};

use libgit2_sys as raw;

use crate::{
    errors::{GitError, check},
    utils::{to_cstring, to_opt_cstring},
};

/// Bitmask of credential kinds, using libgit2's `git_credential_t` values.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CredentialType(u32);

impl CredentialType {
    pub const USERPASS_PLAINTEXT: CredentialType = CredentialType(1 << 0);
    pub const SSH_KEY: CredentialType = CredentialType(1 << 1);
    pub const SSH_CUSTOM: CredentialType = CredentialType(1 << 2);
    pub const DEFAULT: CredentialType = CredentialType(1 << 3);
    pub const SSH_INTERACTIVE: CredentialType = CredentialType(1 << 4);
    pub const USERNAME: CredentialType = CredentialType(1 << 5);
    pub const SSH_MEMORY: CredentialType = CredentialType(1 << 6);

    pub const fn from_bits(bits: u32) -> Self {
        CredentialType(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every kind in `other` is allowed.
    pub const fn contains(self, other: CredentialType) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Whether any kind in `other` is allowed.
    pub const fn intersects(self, other: CredentialType) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for CredentialType {
    type Output = CredentialType;

    fn bitor(self, rhs: Self) -> Self::Output {
        CredentialType(self.0 | rhs.0)
    }
}

impl fmt::Debug for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(CredentialType, &str); 7] = [
            (CredentialType::USERPASS_PLAINTEXT, "USERPASS_PLAINTEXT"),
            (CredentialType::SSH_KEY, "SSH_KEY"),
            (CredentialType::SSH_CUSTOM, "SSH_CUSTOM"),
            (CredentialType::DEFAULT, "DEFAULT"),
            (CredentialType::SSH_INTERACTIVE, "SSH_INTERACTIVE"),
            (CredentialType::USERNAME, "USERNAME"),
            (CredentialType::SSH_MEMORY, "SSH_MEMORY"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(kind, _)| self.contains(*kind))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "CredentialType({})", names.join(" | "))
    }
}

/// Authentication material returned by a credential callback.
#[derive(Clone)]
pub enum Credential {
    UserpassPlaintext {
        username: String,
        password: String,
    },
    /// Key pair read from disk.
    SshKey {
        username: String,
        public_key: Option<PathBuf>,
        private_key: PathBuf,
        passphrase: Option<String>,
    },
    /// Key pair held in memory, OpenSSH or PEM encoded.
    SshMemory {
        username: String,
        public_key: Option<String>,
        private_key: String,
        passphrase: Option<String>,
    },
    /// Keys offered by the running ssh-agent.
    SshAgent {
        username: String,
    },
    /// Caller-provided signer. Only the managed SSH transport can use it.
    SshCustom {
        username: String,
        key: Arc<russh_keys::key::KeyPair>,
    },
    /// Platform default credentials (NTLM/Negotiate).
    Default,
    Username(String),
}

impl Credential {
    pub fn userpass_plaintext(username: &str, password: &str) -> Self {
        Credential::UserpassPlaintext {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    pub fn ssh_key_from_agent(username: &str) -> Self {
        Credential::SshAgent {
            username: username.to_string(),
        }
    }

    pub fn ssh_key_from_signer(username: &str, key: russh_keys::key::KeyPair) -> Self {
        Credential::SshCustom {
            username: username.to_string(),
            key: Arc::new(key),
        }
    }

    pub fn kind(&self) -> CredentialType {
        match self {
            Credential::UserpassPlaintext { .. } => CredentialType::USERPASS_PLAINTEXT,
            Credential::SshKey { .. } | Credential::SshAgent { .. } => CredentialType::SSH_KEY,
            Credential::SshMemory { .. } => CredentialType::SSH_MEMORY,
            Credential::SshCustom { .. } => CredentialType::SSH_CUSTOM,
            Credential::Default => CredentialType::DEFAULT,
            Credential::Username(_) => CredentialType::USERNAME,
        }
    }

    /// Builds the native credential object. Ownership of the returned
    /// pointer passes to libgit2.
    pub(crate) fn into_raw(self) -> Result<*mut raw::git_cred, GitError> {
        let mut out = ptr::null_mut();
        let rc = unsafe {
            match &self {
                Credential::UserpassPlaintext { username, password } => {
                    let username = to_cstring(username)?;
                    let password = to_cstring(password)?;
                    raw::git_cred_userpass_plaintext_new(
                        &mut out,
                        username.as_ptr(),
                        password.as_ptr(),
                    )
                }
                Credential::SshKey {
                    username,
                    public_key,
                    private_key,
                    passphrase,
                } => {
                    let username = to_cstring(username)?;
                    let public_key = to_opt_cstring(
                        public_key.as_ref().map(|p| p.to_string_lossy()).as_deref(),
                    )?;
                    let private_key = to_cstring(&private_key.to_string_lossy())?;
                    let passphrase = to_opt_cstring(passphrase.as_deref())?;
                    raw::git_cred_ssh_key_new(
                        &mut out,
                        username.as_ptr(),
                        public_key.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
                        private_key.as_ptr(),
                        passphrase.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
                    )
                }
                Credential::SshMemory {
                    username,
                    public_key,
                    private_key,
                    passphrase,
                } => {
                    let username = to_cstring(username)?;
                    let public_key = to_opt_cstring(public_key.as_deref())?;
                    let private_key = to_cstring(private_key)?;
                    let passphrase = to_opt_cstring(passphrase.as_deref())?;
                    raw::git_cred_ssh_key_memory_new(
                        &mut out,
                        username.as_ptr(),
                        public_key.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
                        private_key.as_ptr(),
                        passphrase.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
                    )
                }
                Credential::SshAgent { username } => {
                    let username = to_cstring(username)?;
                    raw::git_cred_ssh_key_from_agent(&mut out, username.as_ptr())
                }
                Credential::SshCustom { username, .. } => {
                    return Err(GitError::InvalidCredential(format!(
                        "custom ssh signer for {username} needs the managed ssh transport"
                    )));
                }
                Credential::Default => raw::git_cred_default_new(&mut out),
                Credential::Username(username) => {
                    let username = to_cstring(username)?;
                    raw::git_cred_username_new(&mut out, username.as_ptr())
                }
            }
        };
        check(rc)?;
        Ok(out)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::UserpassPlaintext { username, .. } => f
                .debug_struct("UserpassPlaintext")
                .field("username", username)
                .finish_non_exhaustive(),
            Credential::SshKey {
                username,
                private_key,
                ..
            } => f
                .debug_struct("SshKey")
                .field("username", username)
                .field("private_key", private_key)
                .finish_non_exhaustive(),
            Credential::SshMemory { username, .. } => f
                .debug_struct("SshMemory")
                .field("username", username)
                .finish_non_exhaustive(),
            Credential::SshAgent { username } => f
                .debug_struct("SshAgent")
                .field("username", username)
                .finish(),
            Credential::SshCustom { username, .. } => f
                .debug_struct("SshCustom")
                .field("username", username)
                .finish_non_exhaustive(),
            Credential::Default => f.write_str("Default"),
            Credential::Username(username) => f.debug_tuple("Username").field(username).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmask_matches_native_values() {
        let allowed = CredentialType::SSH_KEY | CredentialType::SSH_MEMORY;
        assert_eq!(allowed.bits(), 2 | 64);
        assert!(allowed.contains(CredentialType::SSH_MEMORY));
        assert!(!allowed.contains(CredentialType::USERPASS_PLAINTEXT));
        assert!(allowed.intersects(CredentialType::SSH_KEY | CredentialType::DEFAULT));
        assert!(!CredentialType::default().contains(CredentialType::default()));
    }

    /// Secrets never show up in debug output.
    #[test]
    fn debug_redacts_secrets() {
        let cred = Credential::userpass_plaintext("alice", "hunter2");
        let shown = format!("{cred:?}");
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
        assert_eq!(cred.kind(), CredentialType::USERPASS_PLAINTEXT);
    }

    /// A custom signer never reaches libgit2's own credential objects.
    #[test]
    fn custom_signer_is_managed_only() {
        let key = russh_keys::key::KeyPair::generate_ed25519();
        let cred = Credential::ssh_key_from_signer("git", key);
        assert_eq!(cred.kind(), CredentialType::SSH_CUSTOM);
        assert_eq!(format!("{cred:?}"), "SshCustom { username: \"git\", .. }");
        assert!(matches!(cred.into_raw(), Err(GitError::InvalidCredential(_))));
    }

    #[test]
    fn debug_lists_kind_names() {
        let allowed = CredentialType::USERPASS_PLAINTEXT | CredentialType::USERNAME;
        assert_eq!(
            format!("{allowed:?}"),
            "CredentialType(USERPASS_PLAINTEXT | USERNAME)"
        );
    }
}
