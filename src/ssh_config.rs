//! Reads forwards out of an OpenSSH client config so they can be imported as
//! tunnels.
//!
//! Only the handful of keywords that matter for forwarding are understood.
//! Options of every matching `Host` block are merged: single-valued options
//! keep the first value seen, forwards accumulate, as ssh itself does.

use crate::error::{FileError, TunnelError, TunnelResult};
use crate::file::read_optional;
use crate::tunnel::{DEFAULT_BIND_HOST, ForwardKind, TunnelSpec};
use std::path::Path;

/// Profile given to dynamic forwards imported from an ssh config.
pub const SSH_CONFIG_PROFILE: &str = "ssh-config";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub bind_host: String,
    pub bind_port: u16,
    pub dest_host: Option<String>,
    pub dest_port: Option<u16>,
}

/// Everything known about one host alias after merging the matching blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshHost {
    pub alias: String,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub local_forwards: Vec<Forward>,
    pub remote_forwards: Vec<Forward>,
    pub dynamic_forwards: Vec<Forward>,
}

#[derive(Debug, Default)]
struct HostBlock {
    patterns: Vec<String>,
    options: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct SshConfig {
    blocks: Vec<HostBlock>,
}

impl SshConfig {
    /// A missing file is an empty config.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, FileError> {
        let path = path.as_ref();
        Ok(read_optional(path)?
            .map(|raw| Self::parse(&raw))
            .unwrap_or_default())
    }

    pub fn parse(raw: &str) -> Self {
        let mut blocks = vec![];
        // options before the first Host line apply to every host
        let mut current = HostBlock {
            patterns: vec!["*".to_string()],
            options: vec![],
        };
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = split_keyword(line) else {
                continue;
            };
            if key == "host" {
                blocks.push(std::mem::take(&mut current));
                current.patterns = value.split_whitespace().map(String::from).collect();
            } else if key == "match" {
                // conditional blocks are not evaluated
                blocks.push(std::mem::take(&mut current));
            } else {
                current.options.push((key, value.to_string()));
            }
        }
        blocks.push(current);
        blocks.retain(|b| !b.patterns.is_empty());
        Self { blocks }
    }

    /// Concrete host aliases in file order; wildcard patterns are skipped.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = vec![];
        for pattern in self.blocks.iter().flat_map(|b| &b.patterns) {
            if is_concrete(pattern) && !hosts.contains(pattern) {
                hosts.push(pattern.clone());
            }
        }
        hosts
    }

    /// Settings for `alias`, or `None` when only the catch-all block applies.
    pub fn host(&self, alias: &str) -> Option<SshHost> {
        let matching: Vec<&HostBlock> = self
            .blocks
            .iter()
            .filter(|b| b.patterns.iter().any(|p| matches_pattern(alias, p)))
            .collect();
        let named = matching
            .iter()
            .any(|b| b.patterns.iter().any(|p| p != "*" && matches_pattern(alias, p)));
        if !named {
            return None;
        }
        let mut host = SshHost {
            alias: alias.to_string(),
            ..Default::default()
        };
        for (key, value) in matching.iter().flat_map(|b| &b.options) {
            match key.as_str() {
                "hostname" if host.hostname.is_none() => host.hostname = Some(value.clone()),
                "user" if host.user.is_none() => host.user = Some(value.clone()),
                "port" if host.port.is_none() => host.port = value.parse().ok(),
                "localforward" => host.local_forwards.extend(parse_forward(value)),
                "remoteforward" => host.remote_forwards.extend(parse_forward(value)),
                "dynamicforward" => host.dynamic_forwards.extend(parse_dynamic(value)),
                _ => {}
            }
        }
        Some(host)
    }

    /// One tunnel per forward of `alias`. Tunnels connect through the alias
    /// itself so that the rest of the ssh config still applies.
    pub fn to_specs(&self, alias: &str) -> TunnelResult<Vec<TunnelSpec>> {
        let Some(host) = self.host(alias) else {
            return Err(TunnelError::NotFound {
                id: alias.to_string(),
                suggestion: crate::error::find_similar_tunnel(
                    alias,
                    self.hosts().iter().map(|h| h.as_str()),
                ),
            });
        };
        Ok(host.to_specs())
    }
}

impl SshHost {
    pub fn to_specs(&self) -> Vec<TunnelSpec> {
        let alias = &self.alias;
        let mut specs = vec![];
        for (i, fwd) in self.local_forwards.iter().enumerate() {
            let mut spec = self.spec(ForwardKind::Local, i, fwd);
            spec.name = format!(
                "{alias} Local {}→{}",
                fwd.bind_port,
                fwd.dest_port.unwrap_or_default()
            );
            specs.push(spec);
        }
        for (i, fwd) in self.remote_forwards.iter().enumerate() {
            let mut spec = self.spec(ForwardKind::Remote, i, fwd);
            spec.name = format!(
                "{alias} Remote {}←{}",
                fwd.bind_port,
                fwd.dest_port.unwrap_or_default()
            );
            specs.push(spec);
        }
        for (i, fwd) in self.dynamic_forwards.iter().enumerate() {
            let mut spec = self.spec(ForwardKind::Dynamic, i, fwd);
            spec.name = format!("{alias} SOCKS {}", fwd.bind_port);
            spec.profile = SSH_CONFIG_PROFILE.to_string();
            specs.push(spec);
        }
        specs
    }

    fn spec(&self, kind: ForwardKind, index: usize, fwd: &Forward) -> TunnelSpec {
        let mut spec = TunnelSpec::new(
            format!("{}-{kind}-{}", self.alias, index + 1),
            kind,
            &self.alias,
        );
        spec.bind_host = Some(fwd.bind_host.clone());
        spec.bind_port = Some(fwd.bind_port);
        spec.dest_host = fwd.dest_host.clone();
        spec.dest_port = fwd.dest_port;
        spec
    }
}

/// Parses the compact forwarding notation accepted on the command line:
/// `8080:localhost:80` for local, `8080:80` (remote port, local port) for
/// remote and `1080` for dynamic forwards.
pub fn parse_forwarding_spec(spec: &str, kind: ForwardKind) -> Result<Forward, String> {
    let parts: Vec<&str> = spec.split(':').collect();
    let port = |s: &str, what: &str| -> Result<u16, String> {
        match s.trim().parse::<u16>() {
            Ok(p) if p > 0 => Ok(p),
            _ => Err(format!("invalid {what} port '{s}'")),
        }
    };
    let forward = match (kind, parts.as_slice()) {
        (ForwardKind::Local, [bind, host, dest]) => Forward {
            bind_host: DEFAULT_BIND_HOST.to_string(),
            bind_port: port(*bind, "local")?,
            dest_host: Some(host.to_string()),
            dest_port: Some(port(*dest, "remote")?),
        },
        (ForwardKind::Local, _) => {
            return Err("local forward requires the form localPort:remoteHost:remotePort".into());
        }
        (ForwardKind::Remote, [bind, dest]) => Forward {
            bind_host: DEFAULT_BIND_HOST.to_string(),
            bind_port: port(*bind, "remote")?,
            dest_host: None,
            dest_port: Some(port(*dest, "local")?),
        },
        (ForwardKind::Remote, _) => {
            return Err("remote forward requires the form remotePort:localPort".into());
        }
        (ForwardKind::Dynamic, [bind]) => Forward {
            bind_host: DEFAULT_BIND_HOST.to_string(),
            bind_port: port(*bind, "local")?,
            dest_host: None,
            dest_port: None,
        },
        (ForwardKind::Dynamic, _) => {
            return Err("dynamic forward requires the form localPort".into());
        }
    };
    Ok(forward)
}

/// `keyword value` or `keyword=value`; the keyword is lowercased.
fn split_keyword(line: &str) -> Option<(String, &str)> {
    let end = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let key = line[..end].to_ascii_lowercase();
    let value = line[end..]
        .trim_start_matches(|c: char| c.is_whitespace() || c == '=')
        .trim();
    if value.is_empty() {
        return None;
    }
    Some((key, value))
}

fn is_concrete(pattern: &str) -> bool {
    !pattern.contains('*') && !pattern.contains('?') && !pattern.starts_with('!')
}

fn matches_pattern(host: &str, pattern: &str) -> bool {
    match pattern.strip_prefix('*') {
        Some(suffix) => host.ends_with(suffix),
        None => host == pattern,
    }
}

/// `[bind_address:]port host:hostport`
fn parse_forward(value: &str) -> Option<Forward> {
    let mut fields = value.split_whitespace();
    let (listen, dest) = (fields.next()?, fields.next()?);
    if fields.next().is_some() {
        return None;
    }
    let (bind_host, bind_port) = parse_listen(listen)?;
    let (dest_host, dest_port) = dest.rsplit_once(':')?;
    Some(Forward {
        bind_host,
        bind_port,
        dest_host: Some(dest_host.to_string()),
        dest_port: Some(dest_port.parse().ok()?),
    })
}

/// `[bind_address:]port`
fn parse_dynamic(value: &str) -> Option<Forward> {
    let (bind_host, bind_port) = parse_listen(value.split_whitespace().next()?)?;
    Some(Forward {
        bind_host,
        bind_port,
        dest_host: None,
        dest_port: None,
    })
}

fn parse_listen(listen: &str) -> Option<(String, u16)> {
    match listen.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((DEFAULT_BIND_HOST.to_string(), listen.parse().ok()?)),
    }
}
