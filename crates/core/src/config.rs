//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database file shared by every worker of the offer.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Seconds a writer waits on a locked database before failing.
        #[serde(default = "default_busy_timeout_secs")]
        busy_timeout_secs: u64,
        /// Maximum connections in the pool.
        #[serde(default = "default_sqlite_max_connections")]
        max_connections: u32,
    },
}

fn default_busy_timeout_secs() -> u64 {
    5
}

fn default_sqlite_max_connections() -> u32 {
    4
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/tapevault.db"),
            busy_timeout_secs: default_busy_timeout_secs(),
            max_connections: default_sqlite_max_connections(),
        }
    }
}

impl MetadataConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite {
                max_connections, ..
            } if *max_connections == 0 => {
                Err("metadata.max_connections must be at least 1".to_string())
            }
            MetadataConfig::Sqlite { .. } => Ok(()),
        }
    }
}

/// On-disk layout of the offer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Objects written by callers, before they are packed into a TAR.
    #[serde(default = "default_input_files_path")]
    pub input_files_path: PathBuf,
    /// TARs being built or sealed and waiting for a tape write.
    #[serde(default = "default_input_tars_path")]
    pub input_tars_path: PathBuf,
    /// Scratch space for archives read back from tape.
    #[serde(default = "default_tmp_tar_output_path")]
    pub tmp_tar_output_path: PathBuf,
    /// Staged archives served to readers.
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
    /// Objects larger than this are split across several TAR entries.
    #[serde(default = "default_max_tar_entry_size")]
    pub max_tar_entry_size: u64,
    /// A TAR is sealed before it grows past this size.
    #[serde(default = "default_max_tar_file_size")]
    pub max_tar_file_size: u64,
    /// A TAR with no new entry for this long is sealed.
    #[serde(default = "default_tar_seal_timeout_secs")]
    pub tar_seal_timeout_secs: u64,
    /// Archive cache capacity in bytes.
    #[serde(default = "default_cache_max_capacity")]
    pub cache_max_capacity: u64,
}

fn default_input_files_path() -> PathBuf {
    PathBuf::from("./data/inputFiles")
}

fn default_input_tars_path() -> PathBuf {
    PathBuf::from("./data/inputTars")
}

fn default_tmp_tar_output_path() -> PathBuf {
    PathBuf::from("./data/tmpTarOutput")
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("./data/cache")
}

fn default_max_tar_entry_size() -> u64 {
    crate::DEFAULT_MAX_TAR_ENTRY_SIZE
}

fn default_max_tar_file_size() -> u64 {
    crate::DEFAULT_MAX_TAR_FILE_SIZE
}

fn default_tar_seal_timeout_secs() -> u64 {
    600 // 10 minutes
}

fn default_cache_max_capacity() -> u64 {
    100 * 1024 * 1024 * 1024 // 100 GiB
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            input_files_path: default_input_files_path(),
            input_tars_path: default_input_tars_path(),
            tmp_tar_output_path: default_tmp_tar_output_path(),
            cache_path: default_cache_path(),
            max_tar_entry_size: default_max_tar_entry_size(),
            max_tar_file_size: default_max_tar_file_size(),
            tar_seal_timeout_secs: default_tar_seal_timeout_secs(),
            cache_max_capacity: default_cache_max_capacity(),
        }
    }
}

impl StorageConfig {
    pub fn tar_seal_timeout(&self) -> Duration {
        Duration::from_secs(self.tar_seal_timeout_secs)
    }

    /// Storage layout rooted under a single directory.
    pub fn under(root: &Path) -> Self {
        Self {
            input_files_path: root.join("inputFiles"),
            input_tars_path: root.join("inputTars"),
            tmp_tar_output_path: root.join("tmpTarOutput"),
            cache_path: root.join("cache"),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_tar_entry_size == 0 {
            return Err("storage.max_tar_entry_size cannot be 0".to_string());
        }
        // Room for the entry header, its padding and the two end-of-archive blocks.
        let overhead = 4 * crate::TAR_BLOCK_SIZE;
        if self.max_tar_file_size < self.max_tar_entry_size + overhead {
            return Err(format!(
                "storage.max_tar_file_size ({}) must exceed max_tar_entry_size ({}) by at least {overhead} bytes",
                self.max_tar_file_size, self.max_tar_entry_size
            ));
        }
        if self.tar_seal_timeout_secs == 0 {
            return Err("storage.tar_seal_timeout_secs cannot be 0".to_string());
        }
        if self.cache_max_capacity < self.max_tar_file_size {
            return Err(format!(
                "storage.cache_max_capacity ({}) must hold at least one TAR ({})",
                self.cache_max_capacity, self.max_tar_file_size
            ));
        }
        Ok(())
    }
}

/// Robot (media changer) driven through `mtx`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TapeRobotConf {
    /// Changer device, e.g. `/dev/sg0`.
    pub device: String,
    #[serde(default = "default_mtx_path")]
    pub mtx_path: String,
    #[serde(default = "default_robot_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_mtx_path() -> String {
    "/usr/sbin/mtx".to_string()
}

fn default_robot_timeout_ms() -> u64 {
    300_000 // 5 minutes: a load includes threading the tape
}

impl TapeRobotConf {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Drive controlled through `mt`, with data moved by `dd`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TapeDriveConf {
    /// Drive index as reported by the robot (data transfer element).
    pub index: u32,
    /// Non-rewinding device, e.g. `/dev/nst0`.
    pub device: String,
    #[serde(default = "default_mt_path")]
    pub mt_path: String,
    #[serde(default = "default_dd_path")]
    pub dd_path: String,
    /// Timeout for positioning and status commands.
    #[serde(default = "default_drive_timeout_ms")]
    pub timeout_ms: u64,
    /// Timeout for copying one TAR to or from tape.
    #[serde(default = "default_read_write_timeout_ms")]
    pub read_write_timeout_ms: u64,
    /// Block size handed to `dd`.
    #[serde(default = "default_block_size")]
    pub block_size: u64,
}

fn default_mt_path() -> String {
    "/bin/mt".to_string()
}

fn default_dd_path() -> String {
    "/bin/dd".to_string()
}

fn default_drive_timeout_ms() -> u64 {
    3_600_000 // 1 hour: eod on a full LTO can take a while
}

fn default_read_write_timeout_ms() -> u64 {
    7_200_000 // 2 hours
}

fn default_block_size() -> u64 {
    256 * 1024
}

impl TapeDriveConf {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn read_write_timeout(&self) -> Duration {
        Duration::from_millis(self.read_write_timeout_ms)
    }
}

/// Physical library: one robot and the drives it serves.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Library name recorded on registered tapes.
    #[serde(default = "default_library_name")]
    pub name: String,
    pub robot: Option<TapeRobotConf>,
    #[serde(default)]
    pub drives: Vec<TapeDriveConf>,
    /// Cartridges declared by barcode are registered on startup if missing.
    #[serde(default)]
    pub tapes: Vec<TapeDeclaration>,
}

fn default_library_name() -> String {
    "library1".to_string()
}

/// Cartridge declared in configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TapeDeclaration {
    pub code: String,
    pub slot: u32,
    pub capacity: u64,
}

impl LibraryConfig {
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for drive in &self.drives {
            if !seen.insert(drive.index) {
                return Err(format!("library.drives: duplicate drive index {}", drive.index));
            }
            if drive.timeout_ms == 0 || drive.read_write_timeout_ms == 0 {
                return Err(format!("library.drives[{}]: timeouts cannot be 0", drive.index));
            }
            if drive.block_size == 0 || drive.block_size % crate::TAR_BLOCK_SIZE != 0 {
                return Err(format!(
                    "library.drives[{}]: block_size must be a non-zero multiple of {}",
                    drive.index,
                    crate::TAR_BLOCK_SIZE
                ));
            }
        }
        if !self.drives.is_empty() && self.robot.is_none() {
            return Err("library.robot is required when drives are configured".to_string());
        }
        if let Some(robot) = &self.robot
            && robot.timeout_ms == 0
        {
            return Err("library.robot.timeout_ms cannot be 0".to_string());
        }
        Ok(())
    }
}

/// A file bucket groups containers whose objects share TARs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileBucketConfig {
    pub id: String,
    /// Tape bucket the file bucket's TARs are written to.
    pub bucket: String,
    pub containers: Vec<String>,
}

/// Container → file bucket → tape bucket mapping.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub file_buckets: Vec<FileBucketConfig>,
    /// File bucket for containers not listed anywhere.
    pub default_file_bucket: Option<String>,
}

impl TopologyConfig {
    /// Resolve a container into `(bucket, file_bucket_id)`.
    pub fn resolve(&self, container: &str) -> Option<(&str, &str)> {
        let by_container = self
            .file_buckets
            .iter()
            .find(|fb| fb.containers.iter().any(|c| c == container));
        let file_bucket = by_container.or_else(|| {
            let default = self.default_file_bucket.as_deref()?;
            self.file_buckets.iter().find(|fb| fb.id == default)
        })?;
        Some((file_bucket.bucket.as_str(), file_bucket.id.as_str()))
    }

    pub fn file_bucket(&self, id: &str) -> Option<&FileBucketConfig> {
        self.file_buckets.iter().find(|fb| fb.id == id)
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut containers = std::collections::HashSet::new();
        for fb in &self.file_buckets {
            if fb.id.is_empty() || fb.id.contains(['/', '\\']) {
                return Err(format!("topology: invalid file bucket id {:?}", fb.id));
            }
            for container in &fb.containers {
                if !containers.insert(container.as_str()) {
                    return Err(format!(
                        "topology: container {container} mapped to more than one file bucket"
                    ));
                }
            }
        }
        if let Some(default) = &self.default_file_bucket
            && self.file_bucket(default).is_none()
        {
            return Err(format!(
                "topology.default_file_bucket {default} is not a declared file bucket"
            ));
        }
        Ok(())
    }
}

/// Lifetime of staging tickets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessRequestConfig {
    /// How long a READY request keeps its archives readable.
    #[serde(default = "default_expiration_delay_secs")]
    pub expiration_delay_secs: u64,
    /// How long after readiness a request is deleted.
    #[serde(default = "default_purge_delay_secs")]
    pub purge_delay_secs: u64,
    /// Period of the purge task.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// How long a request may wait for its archives before it is deleted.
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: u64,
    /// Maximum object names in one request.
    #[serde(default = "default_max_objects_per_request")]
    pub max_objects_per_request: usize,
}

fn default_expiration_delay_secs() -> u64 {
    3600 // 1 hour
}

fn default_purge_delay_secs() -> u64 {
    30 * 24 * 3600 // 30 days
}

fn default_pending_timeout_secs() -> u64 {
    7 * 24 * 3600 // 7 days
}

fn default_cleanup_interval_secs() -> u64 {
    600 // 10 minutes
}

fn default_max_objects_per_request() -> usize {
    1000
}

impl Default for AccessRequestConfig {
    fn default() -> Self {
        Self {
            expiration_delay_secs: default_expiration_delay_secs(),
            purge_delay_secs: default_purge_delay_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            pending_timeout_secs: default_pending_timeout_secs(),
            max_objects_per_request: default_max_objects_per_request(),
        }
    }
}

impl AccessRequestConfig {
    pub fn expiration_delay(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.expiration_delay_secs).unwrap_or(i64::MAX))
    }

    pub fn purge_delay(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.purge_delay_secs).unwrap_or(i64::MAX))
    }

    pub fn pending_timeout(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.pending_timeout_secs).unwrap_or(i64::MAX))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.purge_delay_secs < self.expiration_delay_secs {
            return Err(format!(
                "access_request.purge_delay_secs ({}) must be >= expiration_delay_secs ({})",
                self.purge_delay_secs, self.expiration_delay_secs
            ));
        }
        // tokio::time::interval panics on a zero period
        if self.cleanup_interval_secs == 0 {
            return Err("access_request.cleanup_interval_secs cannot be 0".to_string());
        }
        if self.pending_timeout_secs == 0 {
            return Err("access_request.pending_timeout_secs cannot be 0".to_string());
        }
        if self.max_objects_per_request == 0 {
            return Err("access_request.max_objects_per_request cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Drive worker polling behaviour.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Sleep between two empty queue polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Sleep after a failed order before polling again.
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_error_backoff_ms() -> u64 {
    30_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            error_backoff_ms: default_error_backoff_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

/// Prometheus metrics export.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Text exposition file rewritten periodically (node_exporter textfile collector).
    pub textfile_path: Option<PathBuf>,
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

fn default_metrics_interval_secs() -> u64 {
    15
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub access_request: AccessRequestConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl AppConfig {
    /// Create a test configuration rooted in `root`.
    ///
    /// **For testing only.** Small TARs, fast polling, one file bucket
    /// `objects` in bucket `default` taking every container.
    pub fn for_testing(root: &Path) -> Self {
        Self {
            metadata: MetadataConfig::Sqlite {
                path: root.join("tapevault.db"),
                busy_timeout_secs: default_busy_timeout_secs(),
                max_connections: default_sqlite_max_connections(),
            },
            storage: StorageConfig {
                max_tar_entry_size: 1024 * 1024,
                max_tar_file_size: 4 * 1024 * 1024,
                tar_seal_timeout_secs: 1,
                cache_max_capacity: 64 * 1024 * 1024,
                ..StorageConfig::under(root)
            },
            library: LibraryConfig::default(),
            topology: TopologyConfig {
                file_buckets: vec![FileBucketConfig {
                    id: "objects".to_string(),
                    bucket: "default".to_string(),
                    containers: Vec::new(),
                }],
                default_file_bucket: Some("objects".to_string()),
            },
            access_request: AccessRequestConfig::default(),
            worker: WorkerConfig {
                poll_interval_ms: 10,
                error_backoff_ms: 10,
            },
            metrics: MetricsConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.metadata.validate()?;
        self.storage.validate()?;
        self.library.validate()?;
        self.topology.validate()?;
        self.access_request.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_conf_defaults() {
        let conf: TapeDriveConf =
            serde_json::from_str(r#"{"index": 0, "device": "/dev/nst0"}"#).unwrap();
        assert_eq!(conf.mt_path, "/bin/mt");
        assert_eq!(conf.dd_path, "/bin/dd");
        assert_eq!(conf.block_size, 256 * 1024);
    }

    #[test]
    fn test_metadata_config_tagged() {
        let conf: MetadataConfig =
            serde_json::from_str(r#"{"type": "sqlite", "path": "/tmp/db"}"#).unwrap();
        let MetadataConfig::Sqlite {
            path,
            busy_timeout_secs,
            ..
        } = conf;
        assert_eq!(path, PathBuf::from("/tmp/db"));
        assert_eq!(busy_timeout_secs, 5);
    }

    #[test]
    fn test_for_testing_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        AppConfig::for_testing(dir.path()).validate().unwrap();
    }

    #[test]
    fn test_topology_resolve() {
        let topology = TopologyConfig {
            file_buckets: vec![
                FileBucketConfig {
                    id: "metadata".into(),
                    bucket: "prod".into(),
                    containers: vec!["0_unit".into(), "0_objectgroup".into()],
                },
                FileBucketConfig {
                    id: "objects".into(),
                    bucket: "prod".into(),
                    containers: vec!["0_object".into()],
                },
            ],
            default_file_bucket: Some("objects".into()),
        };
        topology.validate().unwrap();
        assert_eq!(topology.resolve("0_unit"), Some(("prod", "metadata")));
        assert_eq!(topology.resolve("1_report"), Some(("prod", "objects")));

        let strict = TopologyConfig {
            default_file_bucket: None,
            ..topology
        };
        assert_eq!(strict.resolve("1_report"), None);
    }

    #[test]
    fn test_topology_rejects_duplicate_container() {
        let topology = TopologyConfig {
            file_buckets: vec![
                FileBucketConfig {
                    id: "a".into(),
                    bucket: "b".into(),
                    containers: vec!["c".into()],
                },
                FileBucketConfig {
                    id: "d".into(),
                    bucket: "b".into(),
                    containers: vec!["c".into()],
                },
            ],
            default_file_bucket: None,
        };
        assert!(topology.validate().is_err());
    }

    #[test]
    fn test_purge_must_follow_expiration() {
        let conf = AccessRequestConfig {
            expiration_delay_secs: 100,
            purge_delay_secs: 10,
            ..AccessRequestConfig::default()
        };
        assert!(conf.validate().is_err());

        let conf = AccessRequestConfig {
            pending_timeout_secs: 0,
            ..AccessRequestConfig::default()
        };
        assert!(conf.validate().is_err());
        assert_eq!(
            AccessRequestConfig::default().pending_timeout(),
            time::Duration::days(7)
        );
    }

    #[test]
    fn test_drives_require_robot() {
        let library = LibraryConfig {
            drives: vec![TapeDriveConf {
                index: 0,
                device: "/dev/nst0".into(),
                mt_path: default_mt_path(),
                dd_path: default_dd_path(),
                timeout_ms: 1000,
                read_write_timeout_ms: 1000,
                block_size: 512,
            }],
            ..LibraryConfig::default()
        };
        assert!(library.validate().is_err());
    }
}
