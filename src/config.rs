//! Daemon configuration: the three top-level YAML sections from
//! "Config file" (`global-settings`, `backends`, `resources`).

use facet::Facet;
use std::path::Path;

use crate::error::DaemonError;

pub const DEFAULT_WORKERS: u32 = 8;
pub const DEFAULT_TRANSFER_SIZE: u64 = 128 * 1024;
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/echofs-api.sock";

#[derive(Debug, Clone, Facet)]
pub struct DaemonConfig {
    #[facet(rename = "global-settings")]
    pub global_settings: GlobalSettings,
    #[facet(default)]
    pub backends: Vec<BackendConfig>,
    #[facet(default)]
    pub resources: Vec<ResourcePreload>,
}

#[derive(Debug, Clone, Facet)]
pub struct GlobalSettings {
    #[facet(rename = "root-dir")]
    pub root_dir: String,
    #[facet(rename = "mount-dir")]
    pub mount_dir: String,
    #[facet(rename = "results-dir", default)]
    pub results_dir: String,
    #[facet(rename = "log-file", default)]
    pub log_file: String,
    #[facet(default = 8)]
    pub workers: u32,
    #[facet(rename = "transfer-size", default)]
    pub transfer_size: String,
}

#[derive(Debug, Clone, Facet)]
pub struct BackendConfig {
    pub id: String,
    #[facet(rename = "type")]
    pub kind: String,
    pub capacity: String,
    #[facet(default)]
    pub daxfs: String,
    #[facet(rename = "segment-size", default)]
    pub segment_size: String,
}

#[derive(Debug, Clone, Facet)]
pub struct ResourcePreload {
    pub path: String,
    pub backend: String,
    #[facet(default)]
    pub flags: String,
}

impl BackendConfig {
    /// Capacity in bytes, `parse_size`.
    pub fn capacity_bytes(&self) -> Result<u64, DaemonError> {
        parse_size(&self.capacity)
    }

    /// Segment (slot) size in bytes, defaulting to
    /// [`echofs_core::pool::DEFAULT_SLOT_SIZE`] when unset.
    pub fn segment_size_bytes(&self) -> Result<u64, DaemonError> {
        if self.segment_size.is_empty() {
            Ok(echofs_core::pool::DEFAULT_SLOT_SIZE)
        } else {
            parse_size(&self.segment_size)
        }
    }
}

impl GlobalSettings {
    pub fn transfer_size_bytes(&self) -> Result<u64, DaemonError> {
        if self.transfer_size.is_empty() {
            Ok(DEFAULT_TRANSFER_SIZE)
        } else {
            parse_size(&self.transfer_size)
        }
    }
}

impl DaemonConfig {
    fn validate(&self) -> Result<(), DaemonError> {
        if self.global_settings.root_dir.is_empty() {
            return Err(DaemonError::Validation {
                    message: "global-settings.root-dir must not be empty".into(),
            });
        }
        if self.global_settings.mount_dir.is_empty() {
            return Err(DaemonError::Validation {
                    message: "global-settings.mount-dir must not be empty".into(),
            });
        }
        for backend in &self.backends {
            if backend.id.is_empty() {
                return Err(DaemonError::Validation {
                        message: "backend id must not be empty".into(),
                });
            }
            if backend.kind != "NVRAM-NVML" {
                return Err(DaemonError::Validation {
                        message: format!(
                            "backend '{}': unsupported type '{}' (only NVRAM-NVML is implemented)",
                            backend.id, backend.kind
                        ),
                });
            }
            if backend.daxfs.is_empty() {
                return Err(DaemonError::Validation {
                        message: format!("backend '{}': daxfs is required for NVRAM-NVML", backend.id),
                });
            }
            let capacity = backend.capacity_bytes()?;
            let slot_size = backend.segment_size_bytes()?;
            if slot_size < echofs_core::pool::MIN_SLOT_SIZE {
                return Err(DaemonError::Validation {
                        message: format!(
                            "backend '{}': segment-size must be at least {} bytes",
                            backend.id,
                            echofs_core::pool::MIN_SLOT_SIZE
                        ),
                });
            }
            if capacity < slot_size {
                return Err(DaemonError::Validation {
                        message: format!("backend '{}': capacity must hold at least one slot", backend.id),
                });
            }
        }
        for resource in &self.resources {
            if !self.backends.iter().any(|b| b.id == resource.backend) {
                return Err(DaemonError::Validation {
                        message: format!(
                            "resource '{}' references unknown backend '{}'",
                            resource.path, resource.backend
                        ),
                });
            }
        }
        Ok(())
    }

    pub fn socket_path(&self) -> &str {
        DEFAULT_SOCKET_PATH
    }
}

pub fn load_config(path: &Path) -> Result<DaemonConfig, DaemonError> {
    let contents = std::fs::read_to_string(path).map_err(|source| DaemonError::ConfigLoad {
            path: path.display().to_string(),
            source,
    })?;

    let config: DaemonConfig = facet_yaml::from_str(&contents).map_err(|e| DaemonError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
    })?;

    config.validate()?;
    Ok(config)
}

/// Parses a human-readable size string into bytes (`"20G"`, `"512M"`,
/// `"128K"`, or a bare byte count). Binary units (1G = 1024³),
/// "capacity (size with K/M/G units)".
pub fn parse_size(s: &str) -> Result<u64, DaemonError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(DaemonError::Validation {
                message: "size cannot be empty".into(),
        });
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.parse().map_err(|_| DaemonError::Validation {
            message: format!("invalid size number: '{num_str}'"),
    })?;

    let multiplier: u64 = match suffix.as_str() {
        "" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024 * 1024 * 1024 * 1024,
        _ => {
            return Err(DaemonError::Validation {
                    message: format!("unknown size suffix: '{suffix}' (use G, M, K, or T)"),
            });
        }
    };

    num.checked_mul(multiplier).ok_or_else(|| DaemonError::Validation {
            message: format!("size overflows: '{s}'"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> DaemonConfig {
        DaemonConfig {
            global_settings: GlobalSettings {
                root_dir: "/data/root".into(),
                mount_dir: "/mnt/echofs".into(),
                results_dir: String::new(),
                log_file: String::new(),
                workers: DEFAULT_WORKERS,
                transfer_size: String::new(),
            },
            backends: vec![BackendConfig {
                    id: "nvram0".into(),
                    kind: "NVRAM-NVML".into(),
                    capacity: "4G".into(),
                    daxfs: "/dev/dax0.0".into(),
                    segment_size: "128M".into(),
            }],
            resources: vec![],
        }
    }

    #[test]
    fn parse_size_gibibytes() {
        assert_eq!(parse_size("20G").unwrap(), 20 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1GB").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn parse_size_mebibytes() {
        assert_eq!(parse_size("512M").unwrap(), 512 * 1024 * 1024);
    }

    #[test]
    fn parse_size_rejects_empty() {
        assert!(parse_size("").is_err());
    }

    #[test]
    fn parse_size_rejects_bad_suffix() {
        assert!(parse_size("10X").is_err());
    }

    #[test]
    fn valid_config_passes_validation() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn rejects_empty_root_dir() {
        let mut cfg = valid_config();
        cfg.global_settings.root_dir.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unsupported_backend_type() {
        let mut cfg = valid_config();
        cfg.backends[0].kind = "DRAM".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_backend_without_daxfs() {
        let mut cfg = valid_config();
        cfg.backends[0].daxfs.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_capacity_smaller_than_one_slot() {
        let mut cfg = valid_config();
        cfg.backends[0].capacity = "64M".into();
        cfg.backends[0].segment_size = "128M".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_resource_with_unknown_backend() {
        let mut cfg = valid_config();
        cfg.resources.push(ResourcePreload {
                path: "/a".into(),
                backend: "does-not-exist".into(),
                flags: String::new(),
        });
        assert!(cfg.validate().is_err());
    }
}
