//! Contains the types for client, session, and transaction options.

use std::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use derive_where::derive_where;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use typed_builder::TypedBuilder;

use crate::{
    client::csfle::CryptProvider,
    error::{Error, Result},
    namespace::Namespace,
    selection_criteria::{ReadPreference, SelectionCriteria},
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

/// An enum representing the address of a FerroDB server.
#[derive(Clone, Debug, Eq)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port pair.
    #[non_exhaustive]
    Tcp {
        /// The hostname, canonicalized to lower case with any IPv6 brackets
        /// stripped.
        host: String,

        /// The port.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },

    /// A Unix domain socket path.
    #[non_exhaustive]
    Unix {
        /// The path of the socket.
        path: PathBuf,
    },
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Tcp { host, port },
                Self::Tcp {
                    host: other_host,
                    port: other_port,
                },
            ) => {
                host == other_host
                    && port.unwrap_or(DEFAULT_PORT) == other_port.unwrap_or(DEFAULT_PORT)
            }
            (Self::Unix { path }, Self::Unix { path: other_path }) => path == other_path,
            _ => false,
        }
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        match self {
            Self::Tcp { host, port } => {
                host.hash(state);
                port.unwrap_or(DEFAULT_PORT).hash(state);
            }
            Self::Unix { path } => path.hash(state),
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        Self::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`. Strings ending in the
    /// domain-socket suffix are treated as a percent-encoded socket path;
    /// anything else is a `host[:port]` pair, with IPv6 hosts in brackets.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        if address.ends_with(".sock") {
            let path = percent_decode_str(address)
                .decode_utf8()
                .map_err(|_| Self::malformed(address))?;
            return Ok(Self::Unix {
                path: PathBuf::from(path.into_owned()),
            });
        }

        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            match rest.split_once(']') {
                Some((host, "")) => (host, None),
                Some((host, suffix)) => match suffix.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(Self::malformed(address)),
                },
                None => return Err(Self::malformed(address)),
            }
        } else {
            let mut parts = address.split(':');
            let host = parts.next().unwrap_or("");
            let port = parts.next();
            // Unbracketed IPv6 literals are ambiguous and rejected.
            if parts.next().is_some() {
                return Err(Self::malformed(address));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(Self::malformed(address));
        }
        let host = percent_decode_str(host)
            .decode_utf8()
            .map_err(|_| Self::malformed(address))?
            .to_lowercase();

        let port = match port {
            Some(port) => match u16::from_str(port) {
                Ok(0) | Err(_) => return Err(Self::malformed(address)),
                Ok(port) => Some(port),
            },
            None => None,
        };

        Ok(Self::Tcp { host, port })
    }

    fn malformed(address: &str) -> Error {
        Error::invalid_argument(format!("invalid server address \"{}\"", address))
    }

    /// Whether this address is an IPv6 literal.
    pub fn is_ipv6(&self) -> bool {
        matches!(self, Self::Tcp { host, .. } if host.contains(':'))
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                if self.is_ipv6() {
                    write!(fmt, "[{}]:{}", host, port.unwrap_or(DEFAULT_PORT))
                } else {
                    write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
                }
            }
            Self::Unix { path } => write!(fmt, "{}", path.display()),
        }
    }
}

impl Serialize for ServerAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(serde::de::Error::custom)
    }
}

/// Contains the options that can be used to create a new [`Client`](crate::Client).
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seed addresses for the deployment.
    #[builder(default = vec![ServerAddress::default()])]
    pub hosts: Vec<ServerAddress>,

    /// The application name reported to the server.
    pub app_name: Option<String>,

    /// Whether the client should retry a read operation if the operation
    /// fails.
    ///
    /// The default is true.
    pub retry_reads: Option<bool>,

    /// Whether the client should retry a write operation if the operation
    /// fails.
    ///
    /// The default is true.
    pub retry_writes: Option<bool>,

    /// The default selection criteria for operations that do not specify one.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The amount of time the client should attempt to select a server for an
    /// operation before timing out.
    ///
    /// The default is 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// The maximum number of connections a server's pool may hold.
    pub max_pool_size: Option<u32>,

    /// The options for automatic client-side field-level encryption, if
    /// enabled.
    pub auto_encryption_opts: Option<AutoEncryptionOptions>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClientOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::invalid_argument("hosts list must not be empty"));
        }
        if self.max_pool_size == Some(0) {
            return Err(Error::invalid_argument("cannot specify maxPoolSize=0"));
        }
        Ok(())
    }
}

/// Contains the options that can be used to create a new
/// [`ClientSession`](crate::ClientSession).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct SessionOptions {
    /// The default options to use for transactions started on this session.
    pub default_transaction_options: Option<TransactionOptions>,
}

/// Contains the options that can be used for a transaction.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct TransactionOptions {
    /// The read preference for the transaction.
    pub read_preference: Option<ReadPreference>,

    /// The maximum amount of time to allow a single commit command to run.
    pub max_commit_time: Option<Duration>,
}

/// Options related to automatic encryption.
#[derive(Clone, TypedBuilder)]
#[derive_where(Debug)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct AutoEncryptionOptions {
    /// The key vault namespace, referring to a collection that contains all
    /// data keys used for encryption and decryption.
    pub key_vault_namespace: Option<Namespace>,

    /// Disable automatic encryption and do not spawn the encryption helper
    /// process. Any encrypted fields will still be automatically decrypted.
    pub bypass_auto_encryption: Option<bool>,

    /// The URI of an already-running encryption helper process. When set, the
    /// client does not attempt to spawn one.
    pub crypt_helper_uri: Option<String>,

    /// Do not spawn the encryption helper process even if no URI is
    /// configured.
    pub bypass_crypt_helper_spawn: Option<bool>,

    /// The path of the encryption helper executable.
    ///
    /// The default is `ferrocryptd`, resolved through the `PATH`.
    pub crypt_helper_spawn_path: Option<PathBuf>,

    /// Extra arguments to pass to the helper process on spawn.
    pub crypt_helper_spawn_args: Option<Vec<String>>,

    /// The encryption engine commands are routed through. Automatic
    /// encryption fails without one.
    #[derive_where(skip)]
    pub provider: Option<Arc<dyn CryptProvider>>,
}

impl AutoEncryptionOptions {
    pub(crate) fn bypass_auto_encryption(&self) -> bool {
        self.bypass_auto_encryption.unwrap_or(false)
    }
}
