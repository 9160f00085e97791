use async_trait::async_trait;
use bytes::Bytes;
use clap::{ArgMatches, Command};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::EngineConfig;
use crate::core::model::DownloadLink;

#[derive(Debug, Clone)]
pub struct DriverContext {
    pub user_agent: String,
    pub connect_timeout: Duration,
}

impl DriverContext {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self { user_agent: cfg.user_agent.clone(), connect_timeout: cfg.connect_timeout }
    }
}

/// An opened single-stream response.
pub struct OpenedBody {
    /// Length of the body about to be streamed (remaining bytes when ranged).
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub body: BoxStream<'static, std::io::Result<Bytes>>,
}

#[async_trait]
pub trait TransferDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Opens the link, requesting bytes from `offset` onward when non-zero.
    async fn open(&self, link: &DownloadLink, ctx: &DriverContext, offset: u64) -> anyhow::Result<OpenedBody>;
}

/// One step of a segmented download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentData {
    pub bytes: Bytes,
    /// Zero-based playlist index of this segment.
    pub index: usize,
    pub total_segments: usize,
    pub errored: bool,
}

impl SegmentData {
    pub fn failed(index: usize, total_segments: usize) -> Self {
        Self { bytes: Bytes::new(), index, total_segments, errored: true }
    }
}

pub type SegmentStream = BoxStream<'static, SegmentData>;

/// Lazily yields a playlist's segments in order, starting at `start_index`.
/// A fetch failure yields one `errored` record and ends the stream.
#[async_trait]
pub trait SegmentSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn open(
        &self,
        link: &DownloadLink,
        ctx: &DriverContext,
        preferred_height: Option<u32>,
        start_index: usize,
    ) -> anyhow::Result<SegmentStream>;
}

#[derive(Debug, Clone)]
pub struct DownloadCliConfig {
    pub headers: HashMap<String, String>,
    pub engine: EngineConfig,
}

pub trait CliPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn augment_download_command(&self, cmd: Command) -> Command;
    fn apply_download_matches(&self, matches: &ArgMatches, cfg: &mut DownloadCliConfig) -> anyhow::Result<()>;
}

/// Which executor a link is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    SingleFile,
    Segmented,
}

pub struct PluginRegistry {
    driver: Arc<dyn TransferDriver>,
    segments: Arc<dyn SegmentSource>,
    cli_plugins: Vec<Box<dyn CliPlugin>>,
}

impl PluginRegistry {
    pub fn new(driver: Arc<dyn TransferDriver>, segments: Arc<dyn SegmentSource>) -> Self {
        Self { driver, segments, cli_plugins: vec![] }
    }

    pub fn with_defaults() -> anyhow::Result<Self> {
        let mut reg = Self::new(
            Arc::new(crate::plugins::http::driver::HttpDriver::new()?),
            Arc::new(crate::plugins::hls::source::HlsSource::new()?),
        );
        reg.cli_plugins.push(Box::new(crate::plugins::http::cli::HttpCliPlugin::new()));
        Ok(reg)
    }

    pub fn augment_download_command(&self, cmd: Command) -> Command {
        self.cli_plugins
            .iter()
            .fold(cmd, |c, p| p.augment_download_command(c))
    }

    pub fn apply_download_matches(&self, matches: &ArgMatches, cfg: &mut DownloadCliConfig) -> anyhow::Result<()> {
        for p in &self.cli_plugins {
            p.apply_download_matches(matches, cfg)?;
        }
        Ok(())
    }

    pub fn route(link: &DownloadLink) -> TransferKind {
        if link.is_playlist() {
            TransferKind::Segmented
        } else {
            TransferKind::SingleFile
        }
    }

    pub fn driver(&self) -> Arc<dyn TransferDriver> {
        self.driver.clone()
    }

    pub fn segment_source(&self) -> Arc<dyn SegmentSource> {
        self.segments.clone()
    }
}
