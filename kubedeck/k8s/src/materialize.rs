//! Just-in-time materialization of per-user credentials for exec-style auth.
//!
//! Each user's material lives under `<root>/<storage-namespace>/`. The layout
//! beneath that directory is a compatibility surface: credential helpers are
//! invoked with an environment variable pointing at exactly these paths.
//!
//! | provider   | file                      | environment                                        |
//! |------------|---------------------------|----------------------------------------------------|
//! | aws        | `aws/credentials`         | `AWS_SHARED_CREDENTIALS_FILE`, `AWS_CONFIG_FILE`   |
//! | git-helper | `git-helper/credentials`  | `KUBEDECK_HELPER_CREDENTIALS`                      |

use ahash::AHashMap as HashMap;
use kubedeck_core::{
    store::CredentialStore, ClusterDescriptor, ClusterId, Error, ExecSpec, Plaintext, Provider,
    Result, SecretStore, UserClusterCredential, UserId, Validation,
};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fs, io,
    os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::time;
use tracing::{debug, info, warn};

const DIR_MODE: u32 = 0o711;
const FILE_MODE: u32 = 0o644;
const MAX_OUTPUT: usize = 4 * 1024;
const REDACTED: &str = "[redacted]";

/// Environment variables to merge into a helper's environment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvOverlay(BTreeMap<String, String>);

/// Writes one provider's credential files.
pub trait MaterializeCredentials: Send + Sync {
    fn provider(&self) -> Provider;

    /// The credential file, relative to the user's storage namespace.
    fn credential_path(&self) -> &'static str;

    /// Writes `secret` beneath `dir` and returns the environment a helper
    /// needs to find it.
    fn write(&self, dir: &Path, secret: &Plaintext) -> io::Result<EnvOverlay>;
}

#[derive(Debug)]
pub struct AwsCredentials;

#[derive(Debug)]
pub struct GitHelperCredentials;

/// Runs an external credential helper.
#[async_trait::async_trait]
pub trait HelperRunner: Send + Sync + 'static {
    async fn run(&self, exec: &ExecSpec, env: &EnvOverlay) -> io::Result<HelperOutput>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HelperOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Runs helpers as child processes. Children are killed if the invocation is
/// dropped, e.g. on timeout.
#[derive(Clone, Debug, Default)]
pub struct ProcessRunner(());

pub struct Materializer {
    root: PathBuf,
    secrets: SecretStore,
    credentials: Arc<dyn CredentialStore>,
    runner: Arc<dyn HelperRunner>,
    helper_timeout: Duration,
    locks: Mutex<HashMap<(UserId, Provider), Arc<tokio::sync::Mutex<()>>>>,
}

/// The result of materializing a user's credentials for one cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Materialized {
    pub provider: Provider,
    pub path: PathBuf,
    pub env: EnvOverlay,
}

/// Returns the materializer for `provider`.
pub fn for_provider(provider: Provider) -> &'static dyn MaterializeCredentials {
    match provider {
        Provider::Aws => &AwsCredentials,
        Provider::GitHelper => &GitHelperCredentials,
    }
}

/// Removes every occurrence of the secret, and of each of its significant
/// tokens, from helper output.
pub fn redact(output: &[u8], secret: &Plaintext) -> String {
    let mut text = String::from_utf8_lossy(output).into_owned();
    if text.len() > MAX_OUTPUT {
        let mut end = MAX_OUTPUT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }

    let secret = String::from_utf8_lossy(secret.as_bytes());
    let whole = secret.trim();
    if !whole.is_empty() {
        text = text.replace(whole, REDACTED);
    }
    let mut tokens = secret
        .split(|c: char| c.is_whitespace() || c == '=' || c == ':' || c == '"')
        .filter(|t| t.len() >= 8)
        .collect::<Vec<_>>();
    // Longest first so that a token containing another is fully removed.
    tokens.sort_by_key(|t| std::cmp::Reverse(t.len()));
    for token in tokens {
        text = text.replace(token, REDACTED);
    }
    text.trim().to_string()
}

// === impl EnvOverlay ===

impl EnvOverlay {
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvOverlay {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// === impl AwsCredentials ===

impl MaterializeCredentials for AwsCredentials {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    fn credential_path(&self) -> &'static str {
        "aws/credentials"
    }

    fn write(&self, dir: &Path, secret: &Plaintext) -> io::Result<EnvOverlay> {
        ensure_dir(dir)?;
        let credentials = dir.join(self.credential_path());
        write_file(&credentials, secret.as_bytes())?;

        // Point the CLI at an empty config of its own rather than whatever
        // the process user has configured.
        let config = dir.join("aws/config");
        if !config.exists() {
            write_file(&config, b"")?;
        }

        Ok(EnvOverlay::from_iter([
            ("AWS_SHARED_CREDENTIALS_FILE", path_str(&credentials)?),
            ("AWS_CONFIG_FILE", path_str(&config)?),
        ]))
    }
}

// === impl GitHelperCredentials ===

impl MaterializeCredentials for GitHelperCredentials {
    fn provider(&self) -> Provider {
        Provider::GitHelper
    }

    fn credential_path(&self) -> &'static str {
        "git-helper/credentials"
    }

    fn write(&self, dir: &Path, secret: &Plaintext) -> io::Result<EnvOverlay> {
        ensure_dir(dir)?;
        let credentials = dir.join(self.credential_path());
        write_file(&credentials, secret.as_bytes())?;
        Ok(EnvOverlay::from_iter([(
            "KUBEDECK_HELPER_CREDENTIALS",
            path_str(&credentials)?,
        )]))
    }
}

fn path_str(path: &Path) -> io::Result<String> {
    path.to_str().map(str::to_string).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("non-UTF-8 path: {}", path.display()),
        )
    })
}

/// Creates `dir` so that other users may traverse, but not list, it.
fn ensure_dir(dir: &Path) -> io::Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)?;
    // The umask may have narrowed the mode.
    fs::set_permissions(dir, fs::Permissions::from_mode(DIR_MODE))
}

/// Replaces `path` atomically, creating its parent directory if needed.
fn write_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    ensure_dir(dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = dir.join(format!(".{file_name}.tmp"));
    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::set_permissions(&tmp, fs::Permissions::from_mode(FILE_MODE))?;
    fs::rename(&tmp, path)
}

// === impl ProcessRunner ===

#[async_trait::async_trait]
impl HelperRunner for ProcessRunner {
    async fn run(&self, exec: &ExecSpec, env: &EnvOverlay) -> io::Result<HelperOutput> {
        let exec_info = serde_json::json!({
            "apiVersion": exec.api_version,
            "kind": "ExecCredential",
            "spec": { "interactive": false },
        });
        let output = tokio::process::Command::new(&exec.command)
            .args(&exec.args)
            .envs(&exec.env)
            .envs(env.iter())
            .env("KUBERNETES_EXEC_INFO", exec_info.to_string())
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(HelperOutput {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

// === impl Materializer ===

impl Materializer {
    pub fn new(
        root: impl Into<PathBuf>,
        secrets: SecretStore,
        credentials: Arc<dyn CredentialStore>,
        runner: Arc<dyn HelperRunner>,
        helper_timeout: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            secrets,
            credentials,
            runner,
            helper_timeout,
            locks: Mutex::default(),
        }
    }

    /// Seals and stores a user's credential for a cluster. It must be
    /// validated again before it is trusted.
    pub async fn store(&self, user: &UserId, cluster: ClusterId, secret: &[u8]) -> Result<()> {
        let sealed = self.secrets.seal(secret)?;
        self.credentials
            .put_credential(&UserClusterCredential::new(user.clone(), cluster, sealed))
            .await
    }

    /// Writes the user's credential for `desc` into their storage namespace.
    ///
    /// Returns `None` for auth modes that don't use per-user material.
    pub async fn materialize(
        &self,
        user: &UserId,
        desc: &ClusterDescriptor,
    ) -> Result<Option<Materialized>> {
        let Some(provider) = desc.auth.provider() else {
            return Ok(None);
        };
        let lock = self.lock(user, provider);
        let _guard = lock.lock().await;
        self.write(user, desc, provider).await.map(Some)
    }

    /// Materializes the user's credential for `desc`, runs the cluster's
    /// helper once with it, and records whether it worked.
    ///
    /// The per-(user, provider) lock is held across the helper invocation so
    /// that a concurrent write can't replace the file underneath it.
    pub async fn validate(&self, user: &UserId, desc: &ClusterDescriptor) -> Result<EnvOverlay> {
        let (Some(provider), Some(exec)) = (desc.auth.provider(), desc.auth.exec()) else {
            return Ok(EnvOverlay::default());
        };
        let lock = self.lock(user, provider);
        let _guard = lock.lock().await;

        let (materialized, secret) = self.write_with_secret(user, desc, provider).await?;
        debug!(%user, cluster = %desc.name, %provider, "Invoking credential helper");

        let failure = match time::timeout(
            self.helper_timeout,
            self.runner.run(exec, &materialized.env),
        )
        .await
        {
            Ok(Ok(out)) if out.success => None,
            Ok(Ok(out)) => {
                let mut output = out.stderr;
                if output.iter().all(u8::is_ascii_whitespace) {
                    output = out.stdout;
                }
                Some(redact(&output, &secret))
            }
            Ok(Err(error)) => Some(format!("failed to run {}: {error}", exec.command)),
            Err(_) => Some(format!(
                "{} did not complete within {:?}",
                exec.command, self.helper_timeout
            )),
        };

        let validation = if failure.is_some() {
            Validation::Invalid
        } else {
            Validation::Valid
        };
        self.credentials
            .set_validation(user, desc.id, validation)
            .await?;

        match failure {
            None => {
                info!(%user, cluster = %desc.name, %provider, "Credential validated");
                Ok(materialized.env)
            }
            Some(output) => {
                warn!(%user, cluster = %desc.name, %provider, %output, "Credential helper failed");
                Err(Error::ProviderAuth { provider, output })
            }
        }
    }

    /// The directory holding `user`'s material.
    pub async fn user_dir(&self, user: &UserId) -> Result<PathBuf> {
        let ns = self.credentials.storage_namespace(user).await?;
        Ok(self.root.join(ns.to_string()))
    }

    async fn write(
        &self,
        user: &UserId,
        desc: &ClusterDescriptor,
        provider: Provider,
    ) -> Result<Materialized> {
        self.write_with_secret(user, desc, provider)
            .await
            .map(|(m, _)| m)
    }

    async fn write_with_secret(
        &self,
        user: &UserId,
        desc: &ClusterDescriptor,
        provider: Provider,
    ) -> Result<(Materialized, Plaintext)> {
        let credential = self
            .credentials
            .get_credential(user, desc.id)
            .await?
            .ok_or_else(|| Error::CredentialMissing {
                cluster: desc.name.clone(),
            })?;
        let secret = self.secrets.open(&credential.secret)?;
        let dir = self.user_dir(user).await?;

        let materializer = for_provider(provider);
        let path = dir.join(materializer.credential_path());
        let env = {
            let secret = secret.clone();
            tokio::task::spawn_blocking(move || materializer.write(&dir, &secret))
                .await
                .map_err(|e| Error::Io(io::Error::other(e)))??
        };
        debug!(%user, cluster = %desc.name, %provider, path = %path.display(), "Materialized credential");

        Ok((
            Materialized {
                provider,
                path,
                env,
            },
            secret,
        ))
    }

    fn lock(&self, user: &UserId, provider: Provider) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry((user.clone(), provider))
            .or_default()
            .clone()
    }
}

impl std::fmt::Debug for Materializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer")
            .field("root", &self.root)
            .field("helper_timeout", &self.helper_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
