//! Configuration: a hand-rolled reader for the `Key = Value` plus
//! bracketed-subsection dialect (`BackupLocations { location-name { ... } }`
//! style), matching the text format named in the design rather than a
//! generic format like TOML/YAML — the source format predates both and
//! sibling tooling in this stack expects this exact dialect.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required key {0}")]
    MissingKey(String),
    #[error("invalid value for key {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct BackupLocation {
    pub path: PathBuf,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store_hostname: String,
    pub account_number: u64,
    pub certificate_file: PathBuf,
    pub private_key_file: PathBuf,
    pub trusted_cas_file: PathBuf,
    pub keys_file: PathBuf,
    pub data_directory: PathBuf,
    pub command_socket: PathBuf,
    pub notify_script: Option<String>,
    pub sync_allow_script: Option<String>,
    pub automatic_backup: bool,
    pub update_store_interval_secs: u64,
    pub minimum_file_age_secs: u64,
    pub max_upload_wait_secs: u64,
    pub max_file_time_in_future_secs: u64,
    pub file_tracking_size_threshold: u64,
    pub diffing_upload_size_threshold: u64,
    pub maximum_diffing_time_secs: u64,
    pub keep_alive_time_secs: u64,
    pub extended_logging: bool,
    pub store_object_info_file: Option<PathBuf>,
    pub backup_locations: HashMap<String, BackupLocation>,
}

/// A parsed but untyped tree: flat keys plus named subsections, each of
/// which nests the same way. Parsed first, then validated into [`Config`].
struct RawSection {
    keys: HashMap<String, String>,
    subsections: HashMap<String, RawSection>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let root = parse_section(&mut text.lines().enumerate().peekable())?;
        Self::from_raw(&root)
    }

    fn from_raw(root: &RawSection) -> Result<Self, ConfigError> {
        let backup_locations = match root.subsections.get("BackupLocations") {
            Some(section) => section
                .subsections
                .iter()
                .map(|(name, loc)| -> Result<(String, BackupLocation), ConfigError> {
                    let path = PathBuf::from(required(&loc.keys, "Path")?);
                    let exclude = loc
                        .keys
                        .get("ExcludeFile")
                        .map(|s| s.split(',').map(|p| p.trim().to_string()).collect())
                        .unwrap_or_default();
                    Ok((name.clone(), BackupLocation { path, exclude }))
                })
                .collect::<Result<_, _>>()?,
            None => HashMap::new(),
        };

        Ok(Config {
            store_hostname: required(&root.keys, "StoreHostname")?,
            account_number: required_parsed(&root.keys, "AccountNumber")?,
            certificate_file: PathBuf::from(required(&root.keys, "CertificateFile")?),
            private_key_file: PathBuf::from(required(&root.keys, "PrivateKeyFile")?),
            trusted_cas_file: PathBuf::from(required(&root.keys, "TrustedCAsFile")?),
            keys_file: PathBuf::from(required(&root.keys, "KeysFile")?),
            data_directory: PathBuf::from(required(&root.keys, "DataDirectory")?),
            command_socket: PathBuf::from(required(&root.keys, "CommandSocket")?),
            notify_script: root.keys.get("NotifyScript").cloned(),
            sync_allow_script: root.keys.get("SyncAllowScript").cloned(),
            automatic_backup: optional_bool(&root.keys, "AutomaticBackup", true)?,
            update_store_interval_secs: optional_parsed(&root.keys, "UpdateStoreInterval", 3600)?,
            minimum_file_age_secs: optional_parsed(&root.keys, "MinimumFileAge", 21600)?,
            max_upload_wait_secs: optional_parsed(&root.keys, "MaxUploadWait", 86400)?,
            max_file_time_in_future_secs: optional_parsed(&root.keys, "MaxFileTimeInFuture", 5)?,
            file_tracking_size_threshold: optional_parsed(&root.keys, "FileTrackingSizeThreshold", 65536)?,
            diffing_upload_size_threshold: optional_parsed(&root.keys, "DiffingUploadSizeThreshold", 8192)?,
            maximum_diffing_time_secs: optional_parsed(&root.keys, "MaximumDiffingTime", 0)?,
            keep_alive_time_secs: optional_parsed(&root.keys, "KeepAliveTime", 0)?,
            extended_logging: optional_bool(&root.keys, "ExtendedLogging", false)?,
            store_object_info_file: root.keys.get("StoreObjectInfoFile").map(PathBuf::from),
            backup_locations,
        })
    }
}

fn required(keys: &HashMap<String, String>, key: &str) -> Result<String, ConfigError> {
    keys.get(key)
        .cloned()
        .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
}

fn required_parsed<T: std::str::FromStr>(keys: &HashMap<String, String>, key: &str) -> Result<T, ConfigError> {
    let raw = required(keys, key)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw,
    })
}

fn optional_parsed<T: std::str::FromStr>(
    keys: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match keys.get(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
        }),
        None => Ok(default),
    }
}

fn optional_bool(keys: &HashMap<String, String>, key: &str, default: bool) -> Result<bool, ConfigError> {
    match keys.get(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "yes" | "true" | "1" => Ok(true),
            "no" | "false" | "0" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
            }),
        },
        None => Ok(default),
    }
}

type Lines<'a> = std::iter::Peekable<std::iter::Enumerate<std::str::Lines<'a>>>;

/// Recursive-descent parser for the `Key = Value` / `Name { ... }`
/// dialect. A subsection is a bare identifier followed by `{`, terminated
/// by a line containing only `}`.
fn parse_section(lines: &mut Lines) -> Result<RawSection, ConfigError> {
    let mut keys = HashMap::new();
    let mut subsections = HashMap::new();

    while let Some(&(line_no, raw_line)) = lines.peek() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            lines.next();
            continue;
        }
        if line == "}" {
            lines.next();
            break;
        }
        if let Some(name) = line.strip_suffix('{').map(|s| s.trim().to_string()) {
            lines.next();
            let nested = parse_section(lines)?;
            subsections.insert(name, nested);
            continue;
        }
        match line.split_once('=') {
            Some((k, v)) => {
                keys.insert(k.trim().to_string(), v.trim().to_string());
                lines.next();
            }
            None => {
                return Err(ConfigError::Parse {
                    line: line_no + 1,
                    message: format!("expected `Key = Value` or `Name {{`, got: {line}"),
                });
            }
        }
    }

    Ok(RawSection { keys, subsections })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
StoreHostname = backup.example.com
AccountNumber = 1001
CertificateFile = /etc/vaultsync/cert.pem
PrivateKeyFile = /etc/vaultsync/key.pem
TrustedCAsFile = /etc/vaultsync/ca.pem
KeysFile = /etc/vaultsync/keys
DataDirectory = /var/lib/vaultsync
CommandSocket = /var/run/vaultsync.sock
AutomaticBackup = yes
MinimumFileAge = 3600
ExtendedLogging = true

BackupLocations {
    home {
        Path = /home/alice
        ExcludeFile = /tmp, /home/alice/.cache
    }
}
"#;

    #[test]
    fn parses_required_and_typed_keys() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.store_hostname, "backup.example.com");
        assert_eq!(cfg.account_number, 1001);
        assert!(cfg.automatic_backup);
        assert_eq!(cfg.minimum_file_age_secs, 3600);
        assert!(cfg.extended_logging);
    }

    #[test]
    fn parses_backup_locations_subsection() {
        let cfg = Config::parse(SAMPLE).unwrap();
        let home = cfg.backup_locations.get("home").unwrap();
        assert_eq!(home.path, PathBuf::from("/home/alice"));
        assert_eq!(home.exclude, vec!["/tmp", "/home/alice/.cache"]);
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let text = "AccountNumber = 1\n";
        assert!(matches!(Config::parse(text), Err(ConfigError::MissingKey(_))));
    }

    #[test]
    fn invalid_numeric_value_is_an_error() {
        let text = SAMPLE.replace("AccountNumber = 1001", "AccountNumber = not-a-number");
        assert!(matches!(Config::parse(&text), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn maximum_diffing_time_defaults_to_disabled() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.maximum_diffing_time_secs, 0);
    }
}
