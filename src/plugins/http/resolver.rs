use crate::core::model::DownloadLink;
use std::collections::HashMap;
use url::Url;

/// Raw link as typed on the command line.
#[derive(Debug, Clone)]
pub struct LinkInput {
    pub raw: String,
    pub referer: String,
    pub quality: i32,
    pub headers: HashMap<String, String>,
}

/// Turns a raw http(s) URL into a mirror descriptor.
pub fn resolve_link(input: &LinkInput) -> anyhow::Result<DownloadLink> {
    let url = Url::parse(&input.raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("unsupported scheme `{}` in {}", url.scheme(), input.raw);
    }

    let display_name = url.host_str().unwrap_or("mirror").to_string();
    let is_segmented = url.path().ends_with(".m3u8");

    Ok(DownloadLink {
        url: input.raw.clone(),
        referer: input.referer.clone(),
        headers: input.headers.clone(),
        is_segmented,
        quality: input.quality,
        display_name,
    })
}
