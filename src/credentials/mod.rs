//! Secrets of a backup run, stored in an [age] envelope.
//!
//! The plain text is a TOML document mapping credential keys to secrets:
//!
//! ```toml
//! [credentials.db-01-ssh]
//! passphrase = "correct horse battery staple"
//!
//! [credentials.db-01-mysql]
//! password = "hunter2"
//! ```
//!
//! Sealing and unsealing is done by the `age` command line tool.
//!
//! [age]: https://age-encryption.org

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::process::Command;

use derive_more::{Display, Error, From};

const AGE_SECRET_KEY_PREFIX: &str = "AGE-SECRET-KEY-";
const AGE_RECIPIENT_PREFIX: &str = "age1";

/// A resolved secret.
#[derive(Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Credential {
    /// Passphrase of a private key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Password of an account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

// Secrets must not end up in logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Plain text layout of the envelope.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    credentials: HashMap<String, Credential>,
}

/// Unlocked credentials. Read-only and therefore safe to share between tasks.
#[derive(Debug, Default, Clone)]
pub struct CredentialStore {
    credentials: HashMap<String, Credential>,
}

impl CredentialStore {
    /// Decrypts `envelope` with the identity at `identity_path`.
    pub fn unlock(envelope: &Path, identity_path: &Path) -> Result<Self, CredentialError> {
        let identity = std::fs::read_to_string(identity_path).map_err(CredentialError::ReadKey)?;
        if !identity
            .lines()
            .any(|line| line.trim().starts_with(AGE_SECRET_KEY_PREFIX))
        {
            return Err(CredentialError::InvalidKey);
        }

        log::debug!(target: "credentials", "Unlocking credentials: {}", envelope.display());
        let mut age_cmd = Command::new("age");
        age_cmd
            .arg("--decrypt")
            .arg("-i")
            .arg(identity_path)
            .arg(envelope);
        let plain = run_age(age_cmd)?;

        let plain = String::from_utf8(plain).map_err(|_| CredentialError::NotUtf8)?;
        Self::from_toml(&plain)
    }

    /// Parses the plain text form of the envelope.
    pub fn from_toml(plain: &str) -> Result<Self, CredentialError> {
        let file: CredentialsFile = toml::from_str(plain)?;
        Ok(Self {
            credentials: file.credentials,
        })
    }

    /// Looks up the credential stored under `key`.
    pub fn lookup(&self, key: &str) -> Result<&Credential, CredentialError> {
        self.credentials
            .get(key)
            .ok_or_else(|| CredentialError::NotFound(key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

impl FromIterator<(String, Credential)> for CredentialStore {
    fn from_iter<T: IntoIterator<Item = (String, Credential)>>(iter: T) -> Self {
        Self {
            credentials: iter.into_iter().collect(),
        }
    }
}

/// Encrypts the plain text credentials `input` for the recipient in
/// `recipient_path` and writes the envelope to `output`.
///
/// The input is parsed first so a malformed file is never sealed.
pub fn seal(input: &Path, output: &Path, recipient_path: &Path) -> Result<(), CredentialError> {
    let plain = std::fs::read_to_string(input).map_err(CredentialError::ReadInput)?;
    let store = CredentialStore::from_toml(&plain)?;
    log::debug!(target: "credentials", "Sealing {} credentials", store.len());

    let recipient = std::fs::read_to_string(recipient_path).map_err(CredentialError::ReadKey)?;
    let recipient = recipient.trim();
    if !recipient.starts_with(AGE_RECIPIENT_PREFIX) {
        return Err(CredentialError::InvalidKey);
    }

    let mut age_cmd = Command::new("age");
    age_cmd
        .arg("--encrypt")
        .arg("-r")
        .arg(recipient)
        .arg("-o")
        .arg(output)
        .arg(input);
    run_age(age_cmd)?;

    log::info!(target: "credentials", "Encrypted credentials to {}", output.display());
    Ok(())
}

fn run_age(mut age_cmd: Command) -> Result<Vec<u8>, CredentialError> {
    let age_output = age_cmd.output().map_err(CredentialError::AgeNotRun)?;
    let stderr = String::from_utf8_lossy(&age_output.stderr);
    if !age_output.status.success() {
        return Err(CredentialError::AgeFailed {
            error: stderr.trim().to_string(),
        });
    }
    if !stderr.is_empty() {
        log::warn!(target: "credentials", "{}", stderr.trim_end());
    }

    Ok(age_output.stdout)
}

#[derive(Debug, Display, Error, From)]
/// Errors of the [CredentialStore].
pub enum CredentialError {
    /// The age identity or recipient file can't be read.
    #[display("Reading the age key failed: {_0}")]
    ReadKey(io::Error),
    /// The plain text credentials can't be read.
    #[display("Reading the credentials failed: {_0}")]
    ReadInput(io::Error),
    /// The key file doesn't contain an age key of the expected kind.
    #[display("Invalid age key format")]
    InvalidKey,
    /// The `age` binary couldn't be started.
    #[display("Running age failed: {_0}")]
    AgeNotRun(io::Error),
    /// `age` exited unsuccessfully.
    #[display("age failed: {error}")]
    AgeFailed {
        #[error(ignore)]
        error: String,
    },
    /// The decrypted credentials aren't UTF-8.
    #[display("Decrypted credentials aren't valid UTF-8")]
    NotUtf8,
    /// The credentials aren't valid TOML.
    #[display("Invalid credentials format: {_0}")]
    #[from]
    Parse(toml::de::Error),
    /// No credential is stored under the key.
    #[display("Credential not found: {_0}")]
    NotFound(#[error(ignore)] String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN: &str = r#"
        [credentials.db-01-ssh]
        passphrase = "s3cret"

        [credentials.db-01-mysql]
        password = "hunter2"
    "#;

    #[test]
    fn should_lookup_credentials() {
        let store = CredentialStore::from_toml(PLAIN).unwrap();
        assert_eq!(store.len(), 2);

        let ssh = store.lookup("db-01-ssh").unwrap();
        assert_eq!(ssh.passphrase.as_deref(), Some("s3cret"));
        assert_eq!(ssh.password, None);

        let mysql = store.lookup("db-01-mysql").unwrap();
        assert_eq!(mysql.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn should_report_missing_key() {
        let store = CredentialStore::from_toml(PLAIN).unwrap();
        let err = store.lookup("nope").unwrap_err();
        assert!(matches!(err, CredentialError::NotFound(key) if key == "nope"));
    }

    #[test]
    fn should_not_debug_print_secrets() {
        let store = CredentialStore::from_toml(PLAIN).unwrap();
        let debug = format!("{:?}", store.lookup("db-01-mysql").unwrap());
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn should_reject_malformed_credentials() {
        let err = CredentialStore::from_toml("credentials = 3").unwrap_err();
        assert!(matches!(err, CredentialError::Parse(_)));
    }

    #[test]
    fn should_refuse_to_seal_with_invalid_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("credentials.toml");
        let recipient = dir.path().join("public-key.txt");
        std::fs::write(&input, PLAIN).unwrap();
        std::fs::write(&recipient, "not-a-key\n").unwrap();

        let err = seal(&input, &dir.path().join("out.age"), &recipient).unwrap_err();
        assert!(matches!(err, CredentialError::InvalidKey));
        assert!(!dir.path().join("out.age").exists());
    }

    #[test]
    fn should_refuse_to_unlock_with_invalid_identity() {
        let dir = tempfile::tempdir().unwrap();
        let identity = dir.path().join("key.txt");
        std::fs::write(&identity, "age1notasecret\n").unwrap();

        let err = CredentialStore::unlock(&dir.path().join("c.age"), &identity).unwrap_err();
        assert!(matches!(err, CredentialError::InvalidKey));
    }
}
