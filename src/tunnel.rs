use crate::error::{TunnelError, TunnelResult};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub const DEFAULT_PROFILE: &str = "default";
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";
pub const LOOPBACK: &str = "127.0.0.1";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIs,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ForwardKind {
    /// `-L`: listen locally, forward through the ssh host
    #[serde(alias = "forward")]
    Local,
    /// `-R`: listen on the ssh host, forward back to this machine
    #[serde(alias = "reverse")]
    Remote,
    /// `-D`: local SOCKS proxy
    Dynamic,
}

impl ForwardKind {
    pub fn flag(&self) -> &'static str {
        match self {
            ForwardKind::Local => "-L",
            ForwardKind::Remote => "-R",
            ForwardKind::Dynamic => "-D",
        }
    }
}

impl std::str::FromStr for ForwardKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "l" | "forward" => Ok(ForwardKind::Local),
            "remote" | "r" | "reverse" => Ok(ForwardKind::Remote),
            "dynamic" | "d" | "socks" => Ok(ForwardKind::Dynamic),
            other => Err(format!(
                "unknown forward type '{other}', expected local, remote or dynamic"
            )),
        }
    }
}

/// Operator-authored definition of one tunnel.
///
/// `bind_*` is the listening side of the forward (local for `Local` and
/// `Dynamic`, the ssh host for `Remote`); `dest_*` is where accepted
/// connections go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ForwardKind,
    pub ssh_host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default)]
    pub auto_connect: bool,
}

fn default_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

impl TunnelSpec {
    pub fn new(id: impl Into<String>, kind: ForwardKind, ssh_host: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            ssh_host: ssh_host.into(),
            bind_host: None,
            bind_port: None,
            dest_host: None,
            dest_port: None,
            extra_args: vec![],
            profile: default_profile(),
            auto_connect: false,
        }
    }

    pub fn validate(&self) -> TunnelResult<()> {
        validate_id(&self.id)?;
        let invalid = |reason: &str| Err(TunnelError::validation(&self.id, reason));
        if self.name.trim().is_empty() {
            return invalid("name is required");
        }
        if self.ssh_host.trim().is_empty() {
            return invalid("ssh host is required");
        }
        if !port_in_range(self.bind_port) {
            return invalid("bind port must be between 1 and 65535");
        }
        if !self.kind.is_dynamic() && !port_in_range(self.dest_port) {
            return invalid("destination port must be between 1 and 65535");
        }
        Ok(())
    }

    /// The subset of [`validate`](Self::validate) enforced when persisting:
    /// an incomplete tunnel may be stored, a malformed one may not.
    pub fn validate_storable(&self) -> TunnelResult<()> {
        validate_id(&self.id)?;
        if self.bind_port == Some(0) || self.dest_port == Some(0) {
            return Err(TunnelError::validation(
                &self.id,
                "ports must be between 1 and 65535",
            ));
        }
        Ok(())
    }

    /// The `host:port` pair handed to ssh after `-L`, `-R` or `-D`.
    pub fn forward_arg(&self) -> String {
        let bind_port = self.bind_port.unwrap_or_default();
        let dest_port = self.dest_port.unwrap_or_default();
        match self.kind {
            ForwardKind::Local => format!(
                "{}:{bind_port}:{}:{dest_port}",
                self.bind_host(),
                self.dest_host()
            ),
            // the ssh server picks the bind address (GatewayPorts)
            ForwardKind::Remote => format!("{bind_port}:{}:{dest_port}", self.dest_host()),
            ForwardKind::Dynamic => format!("{}:{bind_port}", self.bind_host()),
        }
    }

    pub fn bind_host(&self) -> &str {
        match self.bind_host.as_deref() {
            Some(host) if !host.is_empty() => host,
            _ => DEFAULT_BIND_HOST,
        }
    }

    /// Destination host, never a wildcard: connections need a concrete address.
    pub fn dest_host(&self) -> &str {
        match self.dest_host.as_deref() {
            Some(host) if !host.is_empty() && host != "0.0.0.0" => host,
            _ => LOOPBACK,
        }
    }

    /// Short forwarding summary, e.g. `L:8080→localhost:80`.
    pub fn display_name(&self) -> String {
        let bind_port = self.bind_port.unwrap_or_default();
        let dest_port = self.dest_port.unwrap_or_default();
        match self.kind {
            ForwardKind::Local => format!("L:{bind_port}→{}:{dest_port}", self.dest_host()),
            ForwardKind::Remote => format!("R:{bind_port}→{}:{dest_port}", self.dest_host()),
            ForwardKind::Dynamic => format!("D:{bind_port}"),
        }
    }

    pub fn in_profile(&self, profile: &str) -> bool {
        let own = if self.profile.is_empty() {
            DEFAULT_PROFILE
        } else {
            self.profile.as_str()
        };
        own == profile
    }
}

impl Display for TunnelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

fn port_in_range(port: Option<u16>) -> bool {
    matches!(port, Some(p) if p >= 1)
}

/// Ids double as log file names, so they must be safe path components.
pub fn validate_id(id: &str) -> TunnelResult<()> {
    let reason = if id.is_empty() {
        "id cannot be empty"
    } else if id.contains('/') || id.contains('\\') {
        "id cannot contain path separators"
    } else if id == "." || id.contains("..") {
        "id cannot reference a directory"
    } else if id.chars().any(|c| c.is_whitespace()) {
        "id cannot contain whitespace"
    } else if !id.chars().all(|c| c.is_ascii_graphic()) {
        "id must be printable ASCII"
    } else {
        return Ok(());
    };
    Err(TunnelError::validation(id, reason))
}
