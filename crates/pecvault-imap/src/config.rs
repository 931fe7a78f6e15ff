//! Connection configuration types.

use std::time::Duration;

/// Connection security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// No encryption (port 143). Only for tests against local servers.
    None,
    /// TLS from the start (port 993). **Recommended.**
    #[default]
    Implicit,
}

impl Security {
    /// Returns the default port for this security mode.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::None => 143,
            Self::Implicit => 993,
        }
    }
}

/// IMAP connection configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    pub security: Security,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Per-command timeout (covers the full command/response exchange).
    pub command_timeout: Duration,
}

impl Config {
    /// Creates a new configuration with implicit TLS on port 993.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 993,
            security: Security::Implicit,
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the security mode.
    #[must_use]
    pub const fn security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the per-command timeout.
    #[must_use]
    pub const fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// Login credentials for an IMAP account.
#[derive(Clone)]
pub struct Credentials {
    /// Account username (the full mail address for PEC providers).
    pub username: String,
    /// Account password.
    pub password: String,
}

impl Credentials {
    /// Creates new credentials.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Manual impl so passwords never end up in logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}
