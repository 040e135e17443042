use std::process::Stdio;

use bson::{Bson, Document};
use derive_where::derive_where;
use futures_util::future::BoxFuture;
use std::sync::Arc;

use crate::{
    error::{ErrorKind, Result},
    namespace::Namespace,
    options::AutoEncryptionOptions,
};

/// The minimum wire version of a server that supports automatic encryption.
pub(crate) const MIN_AUTO_ENCRYPTION_WIRE_VERSION: i32 = 8;

const DEFAULT_CRYPT_HELPER_PATH: &str = "ferrocryptd";
const IDLE_SHUTDOWN_ARG: &str = "--idleShutdownTimeoutSecs";
const IDLE_SHUTDOWN_SECS: &str = "60";

/// The engine that performs the actual field-level encryption and decryption.
/// The driver only routes commands through it; key management and the
/// cryptography itself live behind this seam.
pub trait CryptProvider: Send + Sync {
    /// Encrypts the encryptable fields of `command`, addressed to
    /// `namespace`, returning the command to put on the wire.
    fn encrypt<'a>(
        &'a self,
        namespace: &'a Namespace,
        command: &'a Document,
    ) -> BoxFuture<'a, Result<Document>>;

    /// Decrypts any encrypted fields of a server response.
    fn decrypt<'a>(&'a self, response: &'a Document) -> BoxFuture<'a, Result<Document>>;
}

/// Wraps a [`CryptProvider`] with the driver-side halves of the
/// auto-encryption contract: plaintext field preservation and helper-process
/// management.
#[derive_where(Debug)]
pub(crate) struct AutoEncrypter {
    opts: AutoEncryptionOptions,

    #[derive_where(skip)]
    provider: Arc<dyn CryptProvider>,
}

impl AutoEncrypter {
    pub(crate) fn new(opts: AutoEncryptionOptions) -> Result<Self> {
        let provider = opts.provider.clone().ok_or_else(|| {
            crate::error::Error::from(ErrorKind::MissingDependency {
                message: "auto-encryption was configured without an encryption engine; provide \
                          one via AutoEncryptionOptions::provider"
                    .to_string(),
            })
        })?;
        Ok(Self { opts, provider })
    }

    pub(crate) fn bypass_auto_encryption(&self) -> bool {
        self.opts.bypass_auto_encryption()
    }

    /// Encrypts `command`. The caller's `sort` and `createIndexes[].key`
    /// specifications must reach the server exactly as written, so they are
    /// restored verbatim after the engine's round trip.
    pub(crate) async fn encrypt(
        &self,
        namespace: &Namespace,
        command: &Document,
    ) -> Result<Document> {
        let mut encrypted = self.provider.encrypt(namespace, command).await?;

        if let Some(sort) = command.get("sort") {
            encrypted.insert("sort", sort.clone());
        }
        if command.get("createIndexes").is_some() {
            if let (Ok(original_indexes), Some(Bson::Array(encrypted_indexes))) =
                (command.get_array("indexes"), encrypted.get_mut("indexes"))
            {
                for (i, original_index) in original_indexes.iter().enumerate() {
                    if let (Some(Bson::Document(encrypted_index)), Bson::Document(original_index)) =
                        (encrypted_indexes.get_mut(i), original_index)
                    {
                        if let Some(key) = original_index.get("key") {
                            encrypted_index.insert("key", key.clone());
                        }
                    }
                }
            }
        }

        Ok(encrypted)
    }

    pub(crate) async fn decrypt(&self, response: Document) -> Result<Document> {
        self.provider.decrypt(&response).await
    }

    /// Spawns the encryption helper process detached, unless spawning is
    /// bypassed or the caller pointed the client at an already-running helper.
    /// A spawn failure is reported back for a one-time warning but never
    /// surfaced as an operation error; the caller will instead observe a
    /// connection failure to the helper's URI.
    pub(crate) fn spawn_helper_if_needed(&self) -> std::result::Result<(), std::io::Error> {
        if self.bypass_auto_encryption()
            || self.opts.bypass_crypt_helper_spawn.unwrap_or(false)
            || self.opts.crypt_helper_uri.is_some()
        {
            return Ok(());
        }

        let path = self
            .opts
            .crypt_helper_spawn_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CRYPT_HELPER_PATH.into());
        let mut args = self.opts.crypt_helper_spawn_args.clone().unwrap_or_default();
        if !args.iter().any(|arg| arg.starts_with(IDLE_SHUTDOWN_ARG)) {
            args.push(IDLE_SHUTDOWN_ARG.to_string());
            args.push(IDLE_SHUTDOWN_SECS.to_string());
        }

        tracing::debug!(path = %path.display(), "spawning encryption helper");
        tokio::process::Command::new(path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map(drop)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// An engine that tags documents instead of encrypting them, so tests can
    /// observe exactly what crossed the boundary.
    pub(crate) struct MarkingCryptProvider;

    impl CryptProvider for MarkingCryptProvider {
        fn encrypt<'a>(
            &'a self,
            _namespace: &'a Namespace,
            command: &'a Document,
        ) -> BoxFuture<'a, Result<Document>> {
            fn mark(value: &Bson) -> Bson {
                match value {
                    Bson::Document(doc) => Bson::Document(
                        doc.iter().map(|(k, v)| (k.clone(), mark(v))).collect(),
                    ),
                    Bson::Array(values) => Bson::Array(values.iter().map(mark).collect()),
                    other => Bson::String(format!("enc({})", other)),
                }
            }

            Box::pin(async move {
                Ok(command
                    .iter()
                    .map(|(key, value)| (key.clone(), mark(value)))
                    .collect())
            })
        }

        fn decrypt<'a>(&'a self, response: &'a Document) -> BoxFuture<'a, Result<Document>> {
            Box::pin(async move {
                let mut decrypted = response.clone();
                decrypted.insert("decrypted", true);
                Ok(decrypted)
            })
        }
    }
}
