//! Command line, environment overrides and the global config file.

use crate::wire::PORT_MACHINED;
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/machined.conf";
/// Section holding the daemon's own `key=value` options.
pub const OPTIONS_SECTION: &str = "machined";
pub const DEFAULT_TIMING_METHOD: &str = "gettime";
/// Per-user file in the user's home directory.
pub const USER_CONFIG_FILE: &str = ".machined.conf";
const MAX_LINE_LEN: usize = 511;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: section header is missing its closing ']'")]
    BadHeader { line: usize },
    #[error("line {line}: longer than {} bytes", MAX_LINE_LEN)]
    LineTooLong { line: usize },
}

/// A global user table key: numeric uid or account name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserKey {
    Uid(u16),
    Name(String),
}

/// `uid_or_username;fsroot;respath`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalUserEntry {
    pub key: UserKey,
    pub fsroot: String,
    pub respath: String,
}

impl GlobalUserEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split(';').map(str::trim);
        let key = parts.next().filter(|k| !k.is_empty())?;
        let fsroot = parts.next()?.to_string();
        let respath = parts.next().unwrap_or("").to_string();
        let key = match key.parse::<u16>() {
            Ok(uid) => UserKey::Uid(uid),
            Err(_) => UserKey::Name(key.to_string()),
        };
        Some(Self {
            key,
            fsroot,
            respath,
        })
    }

    pub fn matches(&self, uid: u16, username: &str) -> bool {
        match &self.key {
            UserKey::Uid(u) => *u == uid,
            UserKey::Name(n) => n == username,
        }
    }
}

/// First non-comment line of a per-user file: `fsroot;respath`.
pub fn parse_user_file(text: &str) -> Option<(String, String)> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))?;
    let (fsroot, respath) = line.split_once(';')?;
    Some((fsroot.trim().to_string(), respath.trim().to_string()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachinedConfig {
    sections: BTreeMap<String, Vec<String>>,
    users: Vec<GlobalUserEntry>,
}

impl MachinedConfig {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let mut current: Option<String> = None;
        for (i, raw) in text.lines().enumerate() {
            let line_no = i + 1;
            if raw.len() > MAX_LINE_LEN {
                return Err(ConfigError::LineTooLong { line: line_no });
            }
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .ok_or(ConfigError::BadHeader { line: line_no })?;
                let name = name.trim().to_string();
                cfg.sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            match &current {
                Some(section) => cfg
                    .sections
                    .entry(section.clone())
                    .or_default()
                    .push(line.to_string()),
                None => match GlobalUserEntry::parse(line) {
                    Some(entry) => cfg.users.push(entry),
                    None => warn!(line = line_no, "ignoring malformed user entry"),
                },
            }
        }
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Like [`load`](Self::load), but a missing or broken file only warns.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(error = %e, "using default configuration");
                Self::default()
            }
        }
    }

    /// Lines of a section, if it exists.
    pub fn tags(&self, section: &str) -> Option<&[String]> {
        self.sections.get(section).map(Vec::as_slice)
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    pub fn users(&self) -> &[GlobalUserEntry] {
        &self.users
    }

    /// `key=value` from the options section.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.tags(OPTIONS_SECTION)?.iter().find_map(|line| {
            let (k, v) = line.split_once('=')?;
            (k.trim() == key).then(|| v.trim())
        })
    }

    pub fn internal_interface(&self) -> Option<&str> {
        self.option("internal_interface").filter(|v| !v.is_empty())
    }

    /// Suffix appended to a config name to pick a build directory.
    pub fn architecture(&self) -> String {
        match self.option("architecture") {
            Some("64") => "64".into(),
            Some("32") => String::new(),
            None => host_architecture().into(),
            Some(other) => {
                warn!(architecture = other, "unknown architecture, using the host's");
                host_architecture().into()
            }
        }
    }

    pub fn timing_method(&self) -> &str {
        self.option("timing_method").unwrap_or(DEFAULT_TIMING_METHOD)
    }
}

fn host_architecture() -> &'static str {
    if cfg!(target_pointer_width = "64") {
        "64"
    } else {
        ""
    }
}

// Environment overrides (read once)
fn env_path(var: &'static str, cell: &'static OnceCell<Option<PathBuf>>) -> Option<PathBuf> {
    cell.get_or_init(|| std::env::var_os(var).filter(|v| !v.is_empty()).map(PathBuf::from))
        .clone()
}

fn config_override() -> Option<PathBuf> {
    static V: OnceCell<Option<PathBuf>> = OnceCell::new();
    env_path("MACHINED_CONFIG", &V)
}

fn state_file_override() -> Option<PathBuf> {
    static V: OnceCell<Option<PathBuf>> = OnceCell::new();
    env_path("MACHINED_STATE_FILE", &V)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub config: PathBuf,
    pub state_file: PathBuf,
    pub port: u16,
    pub foreground: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config: config_override().unwrap_or_else(|| DEFAULT_CONFIG_PATH.into()),
            state_file: state_file_override()
                .unwrap_or_else(|| crate::registry::DEFAULT_STATE_FILE.into()),
            port: PORT_MACHINED,
            foreground: false,
        }
    }
}

pub fn usage(prog: &str) -> String {
    format!(
        "Usage: {prog} [--config PATH|-c PATH] [--state-file PATH] [--port PORT|-p PORT] [--foreground|-f]"
    )
}

/// `Err` carries the text to print: usage for `--help`, a message otherwise.
pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Options, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "machined".into());
    let mut opts = Options::default();

    while let Some(arg) = it.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) if f.starts_with("--") => (f.to_string(), Some(v.to_string())),
            _ => (arg.clone(), None),
        };
        let mut value = |name: &str| -> Result<String, String> {
            inline
                .clone()
                .or_else(|| it.next())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| format!("{name} needs a value\n{}", usage(&prog)))
        };
        match flag.as_str() {
            "-h" | "--help" => return Err(usage(&prog)),
            "-c" | "--config" => opts.config = value("--config")?.into(),
            "--state-file" => opts.state_file = value("--state-file")?.into(),
            "-p" | "--port" => {
                let v = value("--port")?;
                opts.port = v
                    .parse()
                    .map_err(|_| format!("invalid port '{v}'\n{}", usage(&prog)))?;
            }
            "-f" | "--foreground" => opts.foreground = true,
            _ => return Err(format!("Unexpected argument '{arg}'\n{}", usage(&prog))),
        }
    }
    Ok(opts)
}
