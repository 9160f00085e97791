use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use m3u8_rs::{KeyMethod, MasterPlaylist, MediaPlaylist, Playlist, VariantStream};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, REFERER, USER_AGENT};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

use crate::core::model::DownloadLink;
use crate::plugins::registry::{DriverContext, SegmentData, SegmentSource, SegmentStream};

#[derive(thiserror::Error, Debug)]
pub enum HlsError {
    #[error("playlist could not be parsed: {0}")]
    Parse(String),

    #[error("master playlist has no playable variant")]
    NoVariant,

    #[error("http status {status} for {url}")]
    Status { status: reqwest::StatusCode, url: String },

    #[error("AES-128 decryption failed: {0}")]
    Decrypt(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedSegment {
    pub url: String,
    pub key: Option<KeyRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KeyRef {
    pub uri: String,
    pub iv: [u8; 16],
}

struct Cursor {
    client: reqwest::Client,
    headers: HeaderMap,
    connect_timeout: std::time::Duration,
    segments: Arc<Vec<PlannedSegment>>,
    keys: Arc<HashMap<String, Vec<u8>>>,
    next: usize,
    finished: bool,
}

pub struct HlsSource {
    client: reqwest::Client,
}

impl HlsSource {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .pool_max_idle_per_host(8)
            .build()
            .context("build hls client")?;
        Ok(Self { client })
    }

    fn headers(link: &DownloadLink, ctx: &DriverContext) -> anyhow::Result<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_str(&ctx.user_agent)?);
        if !link.referer.is_empty() {
            h.insert(REFERER, HeaderValue::from_str(&link.referer)?);
        }
        for (k, v) in &link.headers {
            h.insert(HeaderName::from_bytes(k.as_bytes())?, HeaderValue::from_str(v)?);
        }
        Ok(h)
    }

    async fn fetch(
        client: &reqwest::Client,
        headers: &HeaderMap,
        connect_timeout: std::time::Duration,
        url: &str,
    ) -> anyhow::Result<Bytes> {
        let send = client.get(url).headers(headers.clone()).send();
        let resp = tokio::time::timeout(connect_timeout, send)
            .await
            .with_context(|| format!("connect timeout for {}", url))??;
        if !resp.status().is_success() {
            return Err(HlsError::Status { status: resp.status(), url: url.to_string() }.into());
        }
        Ok(resp.bytes().await?)
    }

    async fn media_playlist(
        &self,
        link: &DownloadLink,
        headers: &HeaderMap,
        ctx: &DriverContext,
        preferred_height: Option<u32>,
    ) -> anyhow::Result<(String, MediaPlaylist)> {
        let text = Self::fetch(&self.client, headers, ctx.connect_timeout, &link.url).await?;
        match parse(&text)? {
            Playlist::MediaPlaylist(media) => Ok((link.url.clone(), media)),
            Playlist::MasterPlaylist(master) => {
                let variant = select_variant(&master, preferred_height).ok_or(HlsError::NoVariant)?;
                let variant_url = resolve_url(&link.url, &variant.uri)?;
                tracing::debug!(url = %variant_url, height = ?variant.resolution.as_ref().map(|r| r.height), "selected variant");
                let text = Self::fetch(&self.client, headers, ctx.connect_timeout, &variant_url).await?;
                match parse(&text)? {
                    Playlist::MediaPlaylist(media) => Ok((variant_url, media)),
                    Playlist::MasterPlaylist(_) => Err(HlsError::Parse("nested master playlist".to_string()).into()),
                }
            }
        }
    }
}

fn parse(bytes: &[u8]) -> anyhow::Result<Playlist> {
    m3u8_rs::parse_playlist_res(bytes).map_err(|e| HlsError::Parse(format!("{:?}", e)).into())
}

#[async_trait]
impl SegmentSource for HlsSource {
    fn name(&self) -> &'static str {
        "hls-source"
    }

    async fn open(
        &self,
        link: &DownloadLink,
        ctx: &DriverContext,
        preferred_height: Option<u32>,
        start_index: usize,
    ) -> anyhow::Result<SegmentStream> {
        let headers = Self::headers(link, ctx)?;
        let (media_url, media) = self.media_playlist(link, &headers, ctx, preferred_height).await?;
        let segments = plan_segments(&media, &media_url)?;

        let mut keys = HashMap::new();
        for key in segments.iter().filter_map(|s| s.key.as_ref()) {
            if !keys.contains_key(&key.uri) {
                let bytes = Self::fetch(&self.client, &headers, ctx.connect_timeout, &key.uri).await?;
                keys.insert(key.uri.clone(), bytes.to_vec());
            }
        }

        tracing::info!(
            url = %media_url,
            segments = segments.len(),
            start_index,
            encrypted = !keys.is_empty(),
            "hls playlist ready"
        );

        let cursor = Cursor {
            client: self.client.clone(),
            headers,
            connect_timeout: ctx.connect_timeout,
            segments: Arc::new(segments),
            keys: Arc::new(keys),
            next: start_index,
            finished: false,
        };

        let s = stream::unfold(cursor, |mut c| async move {
            let total = c.segments.len();
            if c.finished || c.next >= total {
                return None;
            }
            let index = c.next;
            let seg = &c.segments[index];
            let fetched = Self::fetch(&c.client, &c.headers, c.connect_timeout, &seg.url).await;
            let data = match fetched.and_then(|raw| decrypt(seg, &c.keys, raw)) {
                Ok(bytes) => SegmentData { bytes, index, total_segments: total, errored: false },
                Err(e) => {
                    tracing::warn!(index, url = %seg.url, "segment fetch failed: {:#}", e);
                    c.finished = true;
                    SegmentData::failed(index, total)
                }
            };
            c.next += 1;
            Some((data, c))
        });

        Ok(Box::pin(s))
    }
}

fn decrypt(seg: &PlannedSegment, keys: &HashMap<String, Vec<u8>>, raw: Bytes) -> anyhow::Result<Bytes> {
    use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
    type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

    let Some(key) = &seg.key else {
        return Ok(raw);
    };
    let key_bytes = keys
        .get(&key.uri)
        .ok_or_else(|| HlsError::Decrypt(format!("missing key {}", key.uri)))?;
    let dec = Aes128CbcDec::new_from_slices(key_bytes, &key.iv).map_err(|e| HlsError::Decrypt(format!("{:?}", e)))?;
    let mut buf = raw.to_vec();
    let plain = dec
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|e| HlsError::Decrypt(format!("{:?}", e)))?;
    Ok(Bytes::copy_from_slice(plain))
}

/// Highest variant not above the preferred height; the lowest when all
/// exceed it; the highest when there is no preference.
pub(crate) fn select_variant(master: &MasterPlaylist, preferred_height: Option<u32>) -> Option<&VariantStream> {
    let mut real: Vec<&VariantStream> = master.variants.iter().filter(|v| !v.is_i_frame).collect();
    if real.is_empty() {
        return None;
    }
    real.sort_by_key(|v| (v.resolution.as_ref().map(|r| r.height).unwrap_or(0), v.bandwidth));

    match preferred_height {
        None => real.last().copied(),
        Some(max_h) => real
            .iter()
            .rev()
            .find(|v| v.resolution.as_ref().map(|r| r.height <= max_h as u64).unwrap_or(true))
            .copied()
            .or_else(|| real.first().copied()),
    }
}

pub(crate) fn resolve_url(base: &str, relative: &str) -> anyhow::Result<String> {
    let base = Url::parse(base).with_context(|| format!("invalid playlist url {}", base))?;
    Ok(base.join(relative)?.to_string())
}

/// Flattens a media playlist into absolute segment URLs with the key in
/// effect for each. EXT-X-KEY applies until the next key tag.
pub(crate) fn plan_segments(media: &MediaPlaylist, base: &str) -> anyhow::Result<Vec<PlannedSegment>> {
    let mut current: Option<(String, Option<[u8; 16]>)> = None;
    let mut out = Vec::with_capacity(media.segments.len());

    for (i, seg) in media.segments.iter().enumerate() {
        if let Some(key) = &seg.key {
            current = match (&key.method, &key.uri) {
                (KeyMethod::AES128, Some(uri)) => {
                    let iv = key.iv.as_deref().map(parse_hex_iv).transpose()?;
                    Some((resolve_url(base, uri)?, iv))
                }
                _ => None,
            };
        }
        let key = current.as_ref().map(|(uri, iv)| KeyRef {
            uri: uri.clone(),
            iv: iv.unwrap_or_else(|| sequence_iv(media.media_sequence + i as u64)),
        });
        out.push(PlannedSegment { url: resolve_url(base, &seg.uri)?, key });
    }
    Ok(out)
}

fn sequence_iv(sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}

/// `IV=0x...` with up to 32 hex digits, left-padded with zeros.
fn parse_hex_iv(s: &str) -> Result<[u8; 16], HlsError> {
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if hex.is_empty() || hex.len() > 32 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(HlsError::Parse(format!("invalid IV {:?}", s)));
    }

    let padded = format!("{:0>32}", hex);
    let mut iv = [0u8; 16];
    for (byte, pair) in iv.iter_mut().zip(padded.as_bytes().chunks(2)) {
        let digits = std::str::from_utf8(pair).map_err(|_| HlsError::Parse(format!("invalid IV {:?}", s)))?;
        *byte = u8::from_str_radix(digits, 16).map_err(|_| HlsError::Parse(format!("invalid IV {:?}", s)))?;
    }
    Ok(iv)
}
