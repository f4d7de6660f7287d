use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DeserializeFromStr, DurationMilliSeconds, SerializeDisplay};

use crate::error::ConfigError;

/// Flags consulted once, at the start of negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Only trust keys registered for the target itself.
    pub no_default_credentials: bool,
    /// Accept a peer answering with the previous minor protocol version.
    pub allow_older_minor_version: bool,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub handshake_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub read_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub write_flush_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub shutdown_flush_timeout: Duration,
    // NOTE: granted once per read, the first time the transport stalls mid-record.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub grace_extension: Duration,
    pub options: SessionOptions,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            write_flush_timeout: Duration::from_secs(5),
            shutdown_flush_timeout: Duration::from_secs(3),
            grace_extension: Duration::from_millis(250),
            options: SessionOptions::default(),
        }
    }
}

impl ChannelConfig {
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn grace_extension(mut self, extension: Duration) -> Self {
        self.grace_extension = extension;
        self
    }

    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertSource {
    MachineStore,
    UserStore,
    File,
}

impl CertSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::MachineStore => "mstore",
            Self::UserStore => "ustore",
            Self::File => "file",
        }
    }
}

impl FromStr for CertSource {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "mstore" => Ok(Self::MachineStore),
            "ustore" => Ok(Self::UserStore),
            "file" => Ok(Self::File),
            other => Err(ConfigError::UnknownCertSource(other.to_owned())),
        }
    }
}

// LAYOUT: <source>:<location>,<common name>
//
// The location runs to the last comma, so file paths may contain colons (drive
// letters) but the common name may not contain a comma.
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct CertificateRef {
    pub source: CertSource,
    pub location: String,
    pub common_name: String,
}

impl CertificateRef {
    pub fn new(source: CertSource, location: impl Into<String>, common_name: impl Into<String>) -> Self {
        Self {
            source,
            location: location.into(),
            common_name: common_name.into(),
        }
    }
}

impl FromStr for CertificateRef {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::BadCertificateRef(value.to_owned());

        let (source, rest) = value.split_once(':').ok_or_else(bad)?;
        let (location, common_name) = rest.rsplit_once(',').ok_or_else(bad)?;
        let (location, common_name) = (location.trim(), common_name.trim());
        if location.is_empty() || common_name.is_empty() {
            return Err(bad());
        }

        Ok(Self {
            source: source.trim().parse()?,
            location: location.to_owned(),
            common_name: common_name.to_owned(),
        })
    }
}

impl fmt::Display for CertificateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{},{}",
            self.source.as_str(),
            self.location,
            self.common_name
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClientConfig {
    pub target: String,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub certificate: Option<CertificateRef>,
    #[serde(default)]
    pub close_transport: bool,
    #[serde(default)]
    pub channel: ChannelConfig,
}

impl ClientConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn certificate(mut self, certificate: CertificateRef) -> Self {
        self.certificate = Some(certificate);
        self
    }

    pub fn close_transport(mut self, close: bool) -> Self {
        self.close_transport = close;
        self
    }

    pub fn channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub certificate: CertificateRef,
    #[serde(default)]
    pub close_transport: bool,
    #[serde(default)]
    pub channel: ChannelConfig,
}

impl ServerConfig {
    pub fn new(certificate: CertificateRef) -> Self {
        Self {
            certificate,
            close_transport: false,
            channel: ChannelConfig::default(),
        }
    }

    pub fn close_transport(mut self, close: bool) -> Self {
        self.close_transport = close;
        self
    }

    pub fn channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }
}
