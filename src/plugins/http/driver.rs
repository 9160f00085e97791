use anyhow::Context;
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, RANGE, REFERER,
    USER_AGENT,
};
use reqwest::StatusCode;

use crate::core::model::DownloadLink;
use crate::plugins::registry::{DriverContext, OpenedBody, TransferDriver};

#[derive(thiserror::Error, Debug)]
pub enum HttpDriverError {
    /// Server ignored the Range header and answered with the full body.
    #[error("server ignored range request starting at {0}")]
    RangeIgnored(u64),

    #[error("http status error: {0}")]
    Status(StatusCode),
}

pub struct HttpDriver {
    client: reqwest::Client,
}

impl HttpDriver {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }

    pub(crate) fn build_headers(link: &DownloadLink, ctx: &DriverContext) -> anyhow::Result<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        h.insert(USER_AGENT, HeaderValue::from_str(&ctx.user_agent)?);
        if !link.referer.is_empty() {
            h.insert(REFERER, HeaderValue::from_str(&link.referer)?);
        }
        h.insert(ACCEPT, HeaderValue::from_static("*/*"));
        h.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
        h.insert("sec-fetch-user", HeaderValue::from_static("?1"));
        h.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
        h.insert("sec-fetch-dest", HeaderValue::from_static("video"));
        for (k, v) in &link.headers {
            let name = HeaderName::from_bytes(k.as_bytes())?;
            let value = HeaderValue::from_str(v)?;
            h.insert(name, value);
        }
        Ok(h)
    }

    pub(crate) fn request_url(raw: &str) -> String {
        raw.replace(' ', "%20")
    }
}

#[async_trait]
impl TransferDriver for HttpDriver {
    fn name(&self) -> &'static str {
        "http-driver"
    }

    async fn open(&self, link: &DownloadLink, ctx: &DriverContext, offset: u64) -> anyhow::Result<OpenedBody> {
        let mut headers = Self::build_headers(link, ctx)?;
        if offset > 0 {
            headers.insert(RANGE, HeaderValue::from_str(&format!("bytes={}-", offset))?);
        }

        // connect timeout only; the body may legitimately stream for hours
        let connect = self.client.get(Self::request_url(&link.url)).headers(headers).send();
        let resp = tokio::time::timeout(ctx.connect_timeout, connect)
            .await
            .with_context(|| format!("connect timeout after {:?}", ctx.connect_timeout))?
            .with_context(|| format!("GET {}", link.url))?;

        let status = resp.status();
        if offset > 0 && status == StatusCode::OK {
            return Err(HttpDriverError::RangeIgnored(offset).into());
        }
        if !status.is_success() {
            return Err(HttpDriverError::Status(status).into());
        }

        let content_length = resp.content_length().or_else(|| {
            resp.headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
        });
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));

        Ok(OpenedBody { content_length, content_type, body: Box::pin(body) })
    }
}
