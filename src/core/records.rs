use crate::core::error::RecordError;
use crate::core::model::{DownloadedFileInfo, ItemId, QueueEntry, ResumePackage};
use crate::core::store::{KeyValueStore, Namespace};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Bump when any persisted record changes shape.
pub const SCHEMA_VERSION: u32 = 1;

const QUEUE_KEY: &str = "queue";

#[derive(Serialize)]
struct EnvelopeOut<'a, T> {
    version: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    version: u32,
    data: serde_json::Value,
}

/// Typed view of the durable store.
#[derive(Clone)]
pub struct Records {
    kv: Arc<dyn KeyValueStore>,
}

impl Records {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    async fn load<T: DeserializeOwned>(&self, ns: Namespace, key: &str) -> anyhow::Result<Option<T>> {
        let Some(blob) = self.kv.get(ns, key).await? else {
            return Ok(None);
        };
        let codec = |source| RecordError::Codec { namespace: ns.as_str(), key: key.to_string(), source };
        let env: EnvelopeIn = serde_json::from_slice(&blob).map_err(codec)?;
        if env.version != SCHEMA_VERSION {
            return Err(RecordError::SchemaMismatch {
                namespace: ns.as_str(),
                key: key.to_string(),
                found: env.version,
                expected: SCHEMA_VERSION,
            }
            .into());
        }
        Ok(Some(serde_json::from_value(env.data).map_err(codec)?))
    }

    async fn save<T: Serialize>(&self, ns: Namespace, key: &str, value: &T) -> anyhow::Result<()> {
        let blob = serde_json::to_vec(&EnvelopeOut { version: SCHEMA_VERSION, data: value })?;
        self.kv.set(ns, key, &blob).await
    }

    pub async fn resume_package(&self, id: ItemId) -> anyhow::Result<Option<ResumePackage>> {
        self.load(Namespace::ResumePackages, &id.to_string()).await
    }

    pub async fn set_resume_package(&self, pkg: &ResumePackage) -> anyhow::Result<()> {
        self.save(Namespace::ResumePackages, &pkg.id().to_string(), pkg).await
    }

    pub async fn remove_resume_package(&self, id: ItemId) -> anyhow::Result<()> {
        self.kv.remove(Namespace::ResumePackages, &id.to_string()).await
    }

    /// All readable resume packages; unreadable ones are logged and skipped.
    pub async fn resume_packages(&self) -> anyhow::Result<Vec<ResumePackage>> {
        let mut out = vec![];
        for key in self.kv.keys(Namespace::ResumePackages).await? {
            match self.load::<ResumePackage>(Namespace::ResumePackages, &key).await {
                Ok(Some(pkg)) => out.push(pkg),
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, "skipping resume package: {:#}", e),
            }
        }
        Ok(out)
    }

    pub async fn file_info(&self, id: ItemId) -> anyhow::Result<Option<DownloadedFileInfo>> {
        self.load(Namespace::DownloadedFileInfo, &id.to_string()).await
    }

    pub async fn set_file_info(&self, id: ItemId, info: &DownloadedFileInfo) -> anyhow::Result<()> {
        self.save(Namespace::DownloadedFileInfo, &id.to_string(), info).await
    }

    pub async fn remove_file_info(&self, id: ItemId) -> anyhow::Result<()> {
        self.kv.remove(Namespace::DownloadedFileInfo, &id.to_string()).await
    }

    pub async fn queue_snapshot(&self) -> anyhow::Result<Vec<QueueEntry>> {
        let mut entries: Vec<QueueEntry> = self.load(Namespace::QueueSnapshot, QUEUE_KEY).await?.unwrap_or_default();
        entries.sort_by_key(|e| e.index);
        Ok(entries)
    }

    pub async fn save_queue(&self, entries: &[QueueEntry]) -> anyhow::Result<()> {
        self.save(Namespace::QueueSnapshot, QUEUE_KEY, &entries).await
    }
}
