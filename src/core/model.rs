use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

pub type ItemId = u64;

/// One playable source for an item, as produced by a provider/extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadLink {
    pub url: String,
    #[serde(default)]
    pub referer: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub is_segmented: bool,
    #[serde(default)]
    pub quality: i32,
    #[serde(default)]
    pub display_name: String,
}

impl DownloadLink {
    /// Segmented either by declaration or by a `.m3u8` path.
    pub fn is_playlist(&self) -> bool {
        if self.is_segmented {
            return true;
        }
        match url::Url::parse(&self.url) {
            Ok(u) => u.path().ends_with(".m3u8"),
            Err(_) => self.url.split('?').next().unwrap_or_default().ends_with(".m3u8"),
        }
    }

    pub fn is_torrent(&self) -> bool {
        self.url.starts_with("magnet") || self.url.ends_with(".torrent")
    }

    pub fn preferred_height(&self) -> Option<u32> {
        preferred_height(self.quality)
    }
}

/// Provider quality codes -> vertical resolution. Anything else means "best".
pub fn preferred_height(quality: i32) -> Option<u32> {
    match quality {
        -2 => Some(360),
        -1 => Some(480),
        1 => Some(720),
        2 => Some(1080),
        _ => None,
    }
}

/// Derives a stable id from a source URL for callers that do not carry one.
pub fn stable_item_id(url: &str) -> ItemId {
    let (hi, _) = Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes()).as_u64_pair();
    hi
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeMetadata {
    pub id: ItemId,
    pub group_name: String,
    pub source_name: Option<String>,
    pub poster_url: Option<String>,
    pub title: Option<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

impl EpisodeMetadata {
    /// Base file name (no extension) for the episode's output.
    pub fn file_stem(&self) -> String {
        let raw = match (&self.title, self.episode) {
            (Some(t), _) if !t.trim().is_empty() => t.clone(),
            (_, Some(n)) => format!("Episode {}", n),
            _ => self.group_name.clone(),
        };
        let cleaned = sanitize_filename::sanitize(raw.trim());
        if cleaned.is_empty() {
            format!("download-{}", self.id)
        } else {
            cleaned
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadItem {
    pub source_url: Option<String>,
    pub destination_folder: Option<String>,
    pub episode: EpisodeMetadata,
    pub links: Vec<DownloadLink>,
}

impl DownloadItem {
    pub fn id(&self) -> ItemId {
        self.episode.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePackage {
    pub item: DownloadItem,
    pub link_index: Option<usize>,
}

impl ResumePackage {
    pub fn fresh(item: DownloadItem) -> Self {
        Self { item, link_index: None }
    }

    pub fn id(&self) -> ItemId {
        self.item.id()
    }
}

/// Persisted progress marker. `extra_info` holds the number of completed
/// segments for segmented transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadedFileInfo {
    pub total_bytes: u64,
    pub relative_path: String,
    pub display_name: String,
    pub extra_info: Option<String>,
}

impl DownloadedFileInfo {
    pub fn segment_index(&self) -> Option<usize> {
        self.extra_info.as_deref().and_then(|s| s.parse().ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFileInfoResult {
    pub file_length: u64,
    pub total_bytes: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub index: usize,
    pub pkg: ResumePackage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    Paused,
    Downloading,
    Done,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadAction {
    Pause,
    Resume,
    Stop,
}
