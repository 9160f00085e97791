use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub out_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Cadence of the per-transfer progress ticker.
    pub progress_interval: Duration,
    /// Declared sizes below this are treated as an error page, not a video.
    pub min_video_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("./downloads"),
            max_concurrent_downloads: 3,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(10),
            progress_interval: Duration::from_secs(1),
            min_video_bytes: 5_000_000,
        }
    }
}

impl EngineConfig {
    pub fn with_out_dir(out_dir: impl Into<PathBuf>) -> Self {
        Self { out_dir: out_dir.into(), ..Self::default() }
    }

    pub fn db_path(&self) -> PathBuf {
        self.out_dir.join(".downloads.sqlite")
    }
}
