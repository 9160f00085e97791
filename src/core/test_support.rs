//! In-memory fakes shared by the unit tests.

use crate::core::events::{ControlEvent, EngineEvent, ProgressSink};
use crate::core::model::{DownloadItem, DownloadLink, DownloadStatus, EpisodeMetadata, ItemId};
use crate::core::control::ControlListener;
use crate::core::progress::{ProgressTracker, Reporter, StatusBoard};
use crate::core::records::Records;
use crate::core::sink::OutputTarget;
use crate::core::store::{KeyValueStore, Namespace};
use crate::core::transfer::TransferContext;
use crate::plugins::registry::{DriverContext, OpenedBody, SegmentData, SegmentSource, SegmentStream, TransferDriver};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};

pub fn link(url: &str) -> DownloadLink {
    DownloadLink {
        url: url.to_string(),
        referer: String::new(),
        headers: HashMap::new(),
        is_segmented: false,
        quality: 0,
        display_name: "mirror".to_string(),
    }
}

pub fn playlist_link(url: &str) -> DownloadLink {
    DownloadLink { is_segmented: true, quality: 1, ..link(url) }
}

pub fn sample_item(id: ItemId, urls: &[&str]) -> DownloadItem {
    DownloadItem {
        source_url: Some(format!("https://site.example/watch/{}", id)),
        destination_folder: Some("Show".to_string()),
        episode: EpisodeMetadata {
            id,
            group_name: "Show".to_string(),
            source_name: Some("site".to_string()),
            poster_url: None,
            title: None,
            season: Some(1),
            episode: Some(id as u32),
        },
        links: urls.iter().map(|u| link(u)).collect(),
    }
}

#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<(ItemId, DownloadStatus, u64, u64)>>,
}

impl RecordingSink {
    pub fn calls(&self) -> Vec<(ItemId, DownloadStatus, u64, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn on_progress(&self, item_id: ItemId, status: DownloadStatus, downloaded: u64, total: u64) {
        self.calls.lock().unwrap().push((item_id, status, downloaded, total));
    }
}

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<(Namespace, String), Vec<u8>>>,
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, ns: Namespace, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.rows.lock().unwrap().get(&(ns, key.to_string())).cloned())
    }

    async fn set(&self, ns: Namespace, key: &str, blob: &[u8]) -> anyhow::Result<()> {
        self.rows.lock().unwrap().insert((ns, key.to_string()), blob.to_vec());
        Ok(())
    }

    async fn remove(&self, ns: Namespace, key: &str) -> anyhow::Result<()> {
        self.rows.lock().unwrap().remove(&(ns, key.to_string()));
        Ok(())
    }

    async fn keys(&self, ns: Namespace) -> anyhow::Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .rows
            .lock()
            .unwrap()
            .keys()
            .filter(|(n, _)| *n == ns)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Wiring for driving one executor directly.
pub struct Harness {
    pub ctx: TransferContext,
    pub sink: Arc<RecordingSink>,
    pub events: broadcast::Sender<EngineEvent>,
    pub control: broadcast::Sender<ControlEvent>,
    pub statuses: StatusBoard,
    pub dir: tempfile::TempDir,
    pub _listener: ControlListener,
}

impl Harness {
    pub fn target(&self, stem: &str) -> OutputTarget {
        OutputTarget::new(self.dir.path(), None, stem, "mp4")
    }
}

pub async fn harness(item_id: ItemId) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let (events, _) = broadcast::channel(1024);
    let (control, _) = broadcast::channel(64);
    let statuses: StatusBoard = Default::default();
    let sink = Arc::new(RecordingSink::default());
    let reporter = Arc::new(Reporter::new(item_id, statuses.clone(), events.clone(), sink.clone()));
    let tracker = Arc::new(ProgressTracker::default());
    let listener = ControlListener::spawn(&control, item_id, reporter.clone(), tracker.clone());
    let ctx = TransferContext {
        item_id,
        reporter,
        records: Records::new(Arc::new(MemoryStore::default())),
        gate: listener.gate(),
        tracker,
        driver_ctx: DriverContext { user_agent: "test".to_string(), connect_timeout: Duration::from_secs(1) },
        // long enough that only the immediate first tick fires during a test
        progress_interval: Duration::from_secs(30),
    };
    Harness { ctx, sink, events, control, statuses, dir, _listener: listener }
}

/// Decrements the open-body gauge when a body is dropped.
struct OpenGuard(Arc<AtomicUsize>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serves in-memory bodies, honoring the range offset.
#[derive(Default)]
pub struct FakeDriver {
    bodies: HashMap<String, Vec<u8>>,
    failing: HashSet<String>,
    content_type: Option<String>,
    fail_after: Option<usize>,
    chunk_delay: Option<Duration>,
    streamed: Mutex<HashMap<String, (u64, mpsc::Receiver<Vec<u8>>)>>,
    opened: Mutex<Vec<(String, u64)>>,
    opened_notify: Arc<Notify>,
    open_now: Arc<AtomicUsize>,
    open_peak: Arc<AtomicUsize>,
}

impl FakeDriver {
    pub fn with_body(mut self, url: &str, body: Vec<u8>) -> Self {
        self.bodies.insert(url.to_string(), body);
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    /// Opening this URL fails outright.
    pub fn failing(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    /// Bodies break with an I/O error after `n` bytes.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// The body for `url` is whatever the test pushes into the returned
    /// sender; dropping the sender ends it.
    pub fn streamed(self, url: &str, declared_len: u64) -> (Self, mpsc::Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(8);
        self.streamed.lock().unwrap().insert(url.to_string(), (declared_len, rx));
        (self, tx)
    }

    pub fn opened(&self) -> Vec<(String, u64)> {
        self.opened.lock().unwrap().clone()
    }

    pub async fn wait_opened(&self) {
        self.opened_notify.notified().await;
    }

    /// Highest number of bodies that were open at the same time.
    pub fn peak_open(&self) -> usize {
        self.open_peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferDriver for FakeDriver {
    fn name(&self) -> &'static str {
        "fake-driver"
    }

    async fn open(&self, link: &DownloadLink, _ctx: &DriverContext, offset: u64) -> anyhow::Result<OpenedBody> {
        self.opened.lock().unwrap().push((link.url.clone(), offset));
        self.opened_notify.notify_one();

        if self.failing.contains(&link.url) {
            anyhow::bail!("connection refused: {}", link.url);
        }

        let streamed = self.streamed.lock().unwrap().remove(&link.url);
        if let Some((declared, rx)) = streamed {
            let body = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (Ok(Bytes::from(chunk)), rx))
            });
            return Ok(OpenedBody {
                content_length: Some(declared.saturating_sub(offset)),
                content_type: self.content_type.clone(),
                body: Box::pin(body),
            });
        }

        let Some(full) = self.bodies.get(&link.url) else {
            anyhow::bail!("404 for {}", link.url);
        };
        let start = (offset as usize).min(full.len());
        let rest = full[start..].to_vec();
        let content_length = Some(rest.len() as u64);

        let mut chunks: VecDeque<std::io::Result<Bytes>> = VecDeque::new();
        let cut = self.fail_after.map(|n| n.min(rest.len())).unwrap_or(rest.len());
        for piece in rest[..cut].chunks(500) {
            chunks.push_back(Ok(Bytes::copy_from_slice(piece)));
        }
        if self.fail_after.is_some() {
            chunks.push_back(Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer")));
        }

        let now = self.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.open_peak.fetch_max(now, Ordering::SeqCst);
        let guard = OpenGuard(self.open_now.clone());
        let delay = self.chunk_delay;

        let body = futures::stream::unfold((chunks, guard), move |(mut chunks, guard)| async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            chunks.pop_front().map(|c| (c, (chunks, guard)))
        });

        Ok(OpenedBody { content_length, content_type: self.content_type.clone(), body: Box::pin(body) })
    }
}

/// Serves a fixed list of segments, optionally failing at one index.
pub struct FakeSegments {
    segments: Vec<Vec<u8>>,
    error_at: Option<usize>,
    delay: Option<Duration>,
    start_indexes: Mutex<Vec<usize>>,
}

impl FakeSegments {
    pub fn new(segments: Vec<Vec<u8>>) -> Self {
        Self { segments, error_at: None, delay: None, start_indexes: Mutex::new(vec![]) }
    }

    pub fn erroring_at(mut self, index: usize) -> Self {
        self.error_at = Some(index);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn start_indexes(&self) -> Vec<usize> {
        self.start_indexes.lock().unwrap().clone()
    }
}

#[async_trait]
impl SegmentSource for FakeSegments {
    fn name(&self) -> &'static str {
        "fake-segments"
    }

    async fn open(
        &self,
        _link: &DownloadLink,
        _ctx: &DriverContext,
        _preferred_height: Option<u32>,
        start_index: usize,
    ) -> anyhow::Result<SegmentStream> {
        self.start_indexes.lock().unwrap().push(start_index);

        let total = self.segments.len();
        let mut out = vec![];
        for (index, bytes) in self.segments.iter().enumerate().skip(start_index) {
            if Some(index) == self.error_at {
                out.push(SegmentData::failed(index, total));
                break;
            }
            out.push(SegmentData { bytes: Bytes::from(bytes.clone()), index, total_segments: total, errored: false });
        }

        let delay = self.delay;
        let stream = futures::stream::unfold(VecDeque::from(out), move |mut queue| async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            queue.pop_front().map(|seg| (seg, queue))
        });
        Ok(Box::pin(stream))
    }
}
