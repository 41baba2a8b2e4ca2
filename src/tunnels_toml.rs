use crate::error::{ConfigParseError, FileError};
use crate::file::{read_optional, with_file_lock, write_atomic};
use crate::tunnel::{DEFAULT_PROFILE, ForwardKind, TunnelSpec};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Durable home of the tunnel definitions.
///
/// A missing backing store is an empty list, not an error. Writers reject any
/// spec without an id or with an out-of-range port before touching storage.
pub trait SpecStore: Send + Sync {
    fn load_specs(&self) -> Result<Vec<TunnelSpec>, FileError>;
    fn save_specs(&self, specs: &[TunnelSpec]) -> Result<(), FileError>;
}

/// Raw on-disk shape; the table key is the tunnel id.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct TunnelsTomlRaw {
    #[serde(default)]
    tunnels: IndexMap<String, TunnelTomlRaw>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct TunnelTomlRaw {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "type")]
    kind: ForwardKind,
    ssh_host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bind_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bind_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dest_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dest_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    extra_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    profile: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    auto_connect: bool,
}

impl TunnelTomlRaw {
    fn into_spec(self, id: String) -> TunnelSpec {
        TunnelSpec {
            name: self.name.unwrap_or_else(|| id.clone()),
            id,
            kind: self.kind,
            ssh_host: self.ssh_host,
            bind_host: self.bind_host,
            bind_port: self.bind_port,
            dest_host: self.dest_host,
            dest_port: self.dest_port,
            extra_args: self.extra_args,
            profile: self.profile.unwrap_or_else(|| DEFAULT_PROFILE.to_string()),
            auto_connect: self.auto_connect,
        }
    }

    fn from_spec(spec: &TunnelSpec) -> Self {
        Self {
            name: (spec.name != spec.id).then(|| spec.name.clone()),
            kind: spec.kind,
            ssh_host: spec.ssh_host.clone(),
            bind_host: spec.bind_host.clone(),
            bind_port: spec.bind_port,
            dest_host: spec.dest_host.clone(),
            dest_port: spec.dest_port,
            extra_args: spec.extra_args.clone(),
            profile: (spec.profile != DEFAULT_PROFILE && !spec.profile.is_empty())
                .then(|| spec.profile.clone()),
            auto_connect: spec.auto_connect,
        }
    }
}

/// `tunnels.toml`: one `[tunnels.<id>]` table per tunnel.
#[derive(Debug, Clone)]
pub struct TunnelsToml {
    pub path: PathBuf,
    pub tunnels: IndexMap<String, TunnelSpec>,
}

impl TunnelsToml {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            tunnels: IndexMap::new(),
        }
    }

    pub fn parse_str(raw: &str, path: &Path) -> Result<Self, FileError> {
        let raw_toml: TunnelsTomlRaw = toml::from_str(raw).map_err(|e| {
            FileError::Parse(Box::new(ConfigParseError::from_toml_error(
                path,
                raw.to_string(),
                e,
            )))
        })?;
        let mut tt = Self::new(path.to_path_buf());
        for (id, raw_tunnel) in raw_toml.tunnels {
            tt.tunnels.insert(id.clone(), raw_tunnel.into_spec(id));
        }
        Ok(tt)
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, FileError> {
        let path = path.as_ref();
        match with_file_lock(path, || read_optional(path))? {
            Some(raw) => Self::parse_str(&raw, path),
            None => Ok(Self::new(path.to_path_buf())),
        }
    }

    /// Validates every entry, keeps the previous file as `<name>.backup`, then
    /// replaces the file atomically.
    pub fn write(&self) -> Result<(), FileError> {
        let mut raw = TunnelsTomlRaw::default();
        for (id, spec) in &self.tunnels {
            if let Err(err) = spec.validate_storable() {
                return Err(FileError::InvalidEntry {
                    path: self.path.clone(),
                    id: id.clone(),
                    reason: err.to_string(),
                });
            }
            raw.tunnels
                .insert(id.clone(), TunnelTomlRaw::from_spec(spec));
        }
        let raw_str = toml::to_string(&raw).map_err(|e| FileError::SerializeError {
            path: self.path.clone(),
            source: e,
        })?;
        with_file_lock(&self.path, || {
            if self.path.exists() {
                std::fs::copy(&self.path, backup_path(&self.path)).map_err(|e| {
                    FileError::WriteError {
                        path: backup_path(&self.path),
                        details: Some(e.to_string()),
                    }
                })?;
            }
            write_atomic(&self.path, &raw_str)
        })
    }

    /// Puts the `.backup` copy made by the last write back in place.
    pub fn restore_backup<P: AsRef<Path>>(path: P) -> Result<(), FileError> {
        let path = path.as_ref();
        let backup = backup_path(path);
        with_file_lock(path, || match read_optional(&backup)? {
            Some(raw) => write_atomic(path, &raw),
            None => Err(FileError::ReadError {
                path: backup.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no backup found"),
            }),
        })
    }
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".backup");
    path.with_file_name(name)
}

/// [`SpecStore`] over a `tunnels.toml` file.
#[derive(Debug, Clone)]
pub struct FileSpecStore {
    path: PathBuf,
}

impl FileSpecStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SpecStore for FileSpecStore {
    fn load_specs(&self) -> Result<Vec<TunnelSpec>, FileError> {
        Ok(TunnelsToml::read(&self.path)?.tunnels.into_values().collect())
    }

    fn save_specs(&self, specs: &[TunnelSpec]) -> Result<(), FileError> {
        let mut tt = TunnelsToml::new(self.path.clone());
        for spec in specs {
            tt.tunnels.insert(spec.id.clone(), spec.clone());
        }
        tt.write()
    }
}
