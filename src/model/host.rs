//! Host identity and platform descriptors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ModelError;

/// Port used when a host does not declare one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Operating system and CPU architecture pair, rendered as `os:arch`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PlatformOs {
    /// Operating system family (for example `unix` or `windows`).
    pub os: String,
    /// CPU architecture (for example `amd64` or `armv8`).
    pub arch: String,
}

impl PlatformOs {
    /// Creates a platform descriptor.
    #[must_use]
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Returns `true` when the operating system is Windows.
    #[must_use]
    pub fn is_windows(&self) -> bool {
        self.os.eq_ignore_ascii_case("windows")
    }
}

impl fmt::Display for PlatformOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.os, self.arch)
    }
}

impl FromStr for PlatformOs {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut parts = value.split(':');
        match (parts.next(), parts.next()) {
            (Some(os), Some(arch)) if !os.trim().is_empty() && !arch.trim().is_empty() => {
                Ok(Self::new(os.trim(), arch.trim()))
            }
            _ => Err(ModelError::InvalidPlatform(value.to_owned())),
        }
    }
}

/// A reachable machine that can be leased to a provision request.
///
/// Hosts are compared by every field, so a host that changes address is a
/// different host as far as populations and the engine are concerned.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Host {
    /// Stable identifier used by reservations.
    pub device_id: String,
    /// Network address or resolvable name.
    pub host_name: String,
    /// Port for the data path (SSH by default).
    pub port: u16,
    /// Optional jump host used to reach this host.
    pub proxy_jump: Option<String>,
    /// Platform the host runs.
    pub platform: PlatformOs,
}

impl Host {
    /// Starts a builder for a [`Host`].
    #[must_use]
    pub fn builder() -> HostBuilder {
        HostBuilder::default()
    }
}

/// Builder for [`Host`] that trims inputs and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HostBuilder {
    device_id: String,
    host_name: String,
    port: Option<u16>,
    proxy_jump: Option<String>,
    platform: Option<PlatformOs>,
}

impl HostBuilder {
    /// Sets the device identifier.
    #[must_use]
    pub fn device_id(mut self, value: impl Into<String>) -> Self {
        self.device_id = value.into();
        self
    }

    /// Sets the address.
    #[must_use]
    pub fn host_name(mut self, value: impl Into<String>) -> Self {
        self.host_name = value.into();
        self
    }

    /// Overrides the default port.
    #[must_use]
    pub const fn port(mut self, value: u16) -> Self {
        self.port = Some(value);
        self
    }

    /// Sets the optional jump host.
    #[must_use]
    pub fn proxy_jump(mut self, value: Option<String>) -> Self {
        self.proxy_jump = value;
        self
    }

    /// Sets the platform.
    #[must_use]
    pub fn platform(mut self, value: PlatformOs) -> Self {
        self.platform = Some(value);
        self
    }

    /// Builds the [`Host`].
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Validation`] when the device id or host name is
    /// blank, or when no platform was supplied.
    pub fn build(self) -> Result<Host, ModelError> {
        let device_id = self.device_id.trim().to_owned();
        let host_name = self.host_name.trim().to_owned();
        if device_id.is_empty() {
            return Err(ModelError::Validation("device_id".to_owned()));
        }
        if host_name.is_empty() {
            return Err(ModelError::Validation("host_name".to_owned()));
        }
        let Some(platform) = self.platform else {
            return Err(ModelError::Validation("platform".to_owned()));
        };
        Ok(Host {
            device_id,
            host_name,
            port: self.port.unwrap_or(DEFAULT_SSH_PORT),
            proxy_jump: self
                .proxy_jump
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty()),
            platform,
        })
    }
}
