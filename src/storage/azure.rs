//! Azure Blob Storage page blob client.
//!
//! Talks to the Blob REST API with `reqwest`, authorizing every request
//! with the storage account key (Shared Key).  The key itself comes from
//! the management plane (`listKeys`), so nothing here reads the
//! environment.
//!
//! Operations used by the uploader:
//!   `create_container_if_absent()` -> Create Container (409 = already there)
//!   `create_page_blob()`           -> Put Blob, `x-ms-blob-type: PageBlob`
//!   `set_blob_metadata()`          -> Set Blob Metadata
//!   `put_pages()`                  -> Put Page, `x-ms-page-write: update`
//!   `get_page_ranges()`            -> Get Page Ranges (paged via marker)
//!   `get_blob_properties()`        -> Get Blob Properties (HEAD)
//!   `set_content_md5()`            -> Set Blob Properties

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{
    BlobProperties, PageBlobStore, StoreFuture, MAX_PUT_PAGE_BYTES, PAGE_ALIGNMENT,
};
use crate::errors::RemoteError;
use crate::range::IndexRange;

/// Azure REST API version used for all requests.
const AZURE_API_VERSION: &str = "2023-11-03";

/// Service name carried by [`RemoteError`]s from this client.
const SERVICE: &str = "Azure Blob";

/// Prefix of user metadata headers.
const META_PREFIX: &str = "x-ms-meta-";

/// Page blob store backed by one Azure storage account.
pub struct AzurePageBlobStore {
    /// HTTP client for Azure Blob REST API calls.
    client: reqwest::Client,
    /// Azure storage account name.
    account: String,
    /// `https://{account}.{suffix}`.
    base_url: String,
    /// Decoded account key.
    key_bytes: Vec<u8>,
}

impl AzurePageBlobStore {
    /// Create a client for `account` using its base64 `account_key`.
    pub fn new(
        account: &str,
        account_key: &str,
        endpoint_suffix: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let key_bytes = BASE64_STANDARD
            .decode(account_key.trim())
            .map_err(|e| anyhow::anyhow!("Invalid storage account key (not valid base64): {}", e))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        let base_url = format!("https://{}.{}", account, endpoint_suffix.trim_matches('.'));
        info!("Azure page blob store initialized: {}", base_url);

        Ok(Self {
            client,
            account: account.to_string(),
            base_url,
            key_bytes,
        })
    }

    /// Resource path (un-encoded) for a container or blob.
    fn resource(container: &str, blob: Option<&str>) -> String {
        match blob {
            Some(blob) => format!("{}/{}", container, blob),
            None => container.to_string(),
        }
    }

    /// Full URL for `resource` with `query` appended.
    fn url(&self, resource: &str, query: &[(&str, &str)]) -> String {
        let encoded = percent_encoding::utf8_percent_encode(resource, &AZURE_BLOB_ENCODE_SET);
        let mut url = format!("{}/{}", self.base_url, encoded);
        for (i, (k, v)) in query.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(k);
            url.push('=');
            url.extend(percent_encoding::utf8_percent_encode(
                v,
                percent_encoding::NON_ALPHANUMERIC,
            ));
        }
        url
    }

    /// Build the Shared Key string-to-sign.
    ///
    /// ```text
    /// VERB\n
    /// Content-Encoding\n
    /// Content-Language\n
    /// Content-Length\n
    /// Content-MD5\n
    /// Content-Type\n
    /// Date\n
    /// If-Modified-Since\n
    /// If-Match\n
    /// If-None-Match\n
    /// If-Unmodified-Since\n
    /// Range\n
    /// CanonicalizedHeaders\n
    /// CanonicalizedResource
    /// ```
    fn string_to_sign(
        &self,
        method: &str,
        resource: &str,
        content_length: Option<usize>,
        content_type: &str,
        ms_headers: &[(String, String)],
        query: &[(&str, &str)],
    ) -> String {
        // Content-Length: empty for 0 or if not provided.
        let content_length_str = match content_length {
            Some(0) | None => String::new(),
            Some(len) => len.to_string(),
        };

        let mut headers: Vec<(String, &str)> = ms_headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.as_str()))
            .filter(|(k, _)| k.starts_with("x-ms-"))
            .collect();
        headers.sort_by(|a, b| a.0.cmp(&b.0));
        let canonicalized_headers = headers
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v.trim()))
            .collect::<Vec<_>>()
            .join("\n");

        // The canonicalized resource uses the un-encoded path.
        let mut canonicalized_resource = format!("/{}/{}", self.account, resource);
        let mut sorted: Vec<(String, &str)> =
            query.iter().map(|(k, v)| (k.to_lowercase(), *v)).collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        for (k, v) in &sorted {
            canonicalized_resource.push_str(&format!("\n{}:{}", k, v));
        }

        format!(
            "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n{}\n{}",
            method, content_length_str, content_type, canonicalized_headers, canonicalized_resource
        )
    }

    /// `SharedKey {account}:{signature}` for the given string-to-sign.
    fn authorization(&self, string_to_sign: &str) -> anyhow::Result<String> {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(&self.key_bytes)
            .map_err(|e| anyhow::anyhow!("HMAC key error: {}", e))?;
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());
        Ok(format!("SharedKey {}:{}", self.account, signature))
    }

    /// Get the current UTC date in RFC 1123 format for Azure headers.
    fn rfc1123_date() -> String {
        use std::time::SystemTime;
        httpdate::fmt_http_date(SystemTime::now())
    }

    /// Build and sign a request.
    ///
    /// `headers` must only hold `x-ms-*` headers; `x-ms-date` and
    /// `x-ms-version` are added here.  PUTs without a body get an explicit
    /// zero Content-Length.
    fn request(
        &self,
        method: Method,
        resource: &str,
        query: &[(&str, &str)],
        mut headers: Vec<(String, String)>,
        body: Option<Bytes>,
    ) -> anyhow::Result<reqwest::RequestBuilder> {
        headers.push(("x-ms-date".to_string(), Self::rfc1123_date()));
        headers.push(("x-ms-version".to_string(), AZURE_API_VERSION.to_string()));

        let content_type = if body.is_some() {
            "application/octet-stream"
        } else {
            ""
        };
        let content_length = body.as_ref().map(|b| b.len());
        let string_to_sign = self.string_to_sign(
            method.as_str(),
            resource,
            content_length,
            content_type,
            &headers,
            query,
        );
        let authorization = self.authorization(&string_to_sign)?;

        let mut req = self
            .client
            .request(method.clone(), self.url(resource, query))
            .header("Authorization", authorization);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        match body {
            Some(body) => {
                req = req.header(CONTENT_TYPE, content_type).body(body);
            }
            None if method == Method::PUT => {
                req = req.header(CONTENT_LENGTH, "0");
            }
            None => {}
        }
        Ok(req)
    }

    /// Send a request, mapping transport failures.
    async fn send(
        operation: &'static str,
        req: reqwest::RequestBuilder,
    ) -> anyhow::Result<reqwest::Response> {
        req.send()
            .await
            .map_err(|e| RemoteError::transport(SERVICE, operation, e).into())
    }

    /// Turn a non-success response into a [`RemoteError`].
    async fn check(
        operation: &'static str,
        resp: reqwest::Response,
    ) -> anyhow::Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        Err(Self::map_azure_error(operation, resp).await)
    }

    /// Map an Azure HTTP error response to an anyhow error.
    async fn map_azure_error(operation: &'static str, resp: reqwest::Response) -> anyhow::Error {
        let status = resp.status();
        let code = error_code(&resp);
        let body = resp.text().await.unwrap_or_default();
        let body = match code {
            Some(code) if body.is_empty() => code,
            _ => body,
        };
        RemoteError::http(SERVICE, operation, status, body).into()
    }

    // -- Azure Blob REST API operations ----------------------------------------

    async fn azure_create_container(&self, container: &str) -> anyhow::Result<bool> {
        let req = self.request(
            Method::PUT,
            &Self::resource(container, None),
            &[("restype", "container")],
            Vec::new(),
            None,
        )?;
        let resp = Self::send("create container", req).await?;

        if resp.status() == StatusCode::CONFLICT
            && error_code(&resp).as_deref() != Some("ContainerBeingDeleted")
        {
            debug!("Container {} already exists", container);
            return Ok(false);
        }
        Self::check("create container", resp).await?;
        info!("Created container {}", container);
        Ok(true)
    }

    async fn azure_create_page_blob(
        &self,
        container: &str,
        blob: &str,
        size: u64,
    ) -> anyhow::Result<()> {
        if size % PAGE_ALIGNMENT != 0 {
            return Err(anyhow::anyhow!(
                "page blob size {} is not a multiple of {}",
                size,
                PAGE_ALIGNMENT
            ));
        }
        let headers = vec![
            ("x-ms-blob-type".to_string(), "PageBlob".to_string()),
            ("x-ms-blob-content-length".to_string(), size.to_string()),
        ];
        let req = self.request(
            Method::PUT,
            &Self::resource(container, Some(blob)),
            &[],
            headers,
            None,
        )?;
        let resp = Self::send("create page blob", req).await?;
        Self::check("create page blob", resp).await?;
        info!("Created page blob {}/{} ({} bytes)", container, blob, size);
        Ok(())
    }

    async fn azure_set_metadata(
        &self,
        container: &str,
        blob: &str,
        metadata: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let headers = metadata
            .iter()
            .map(|(k, v)| (format!("{}{}", META_PREFIX, k), v.clone()))
            .collect();
        let req = self.request(
            Method::PUT,
            &Self::resource(container, Some(blob)),
            &[("comp", "metadata")],
            headers,
            None,
        )?;
        let resp = Self::send("set blob metadata", req).await?;
        Self::check("set blob metadata", resp).await?;
        Ok(())
    }

    async fn azure_put_pages(
        &self,
        container: &str,
        blob: &str,
        offset: u64,
        data: Bytes,
    ) -> anyhow::Result<()> {
        let len = data.len() as u64;
        if len == 0
            || len > MAX_PUT_PAGE_BYTES
            || offset % PAGE_ALIGNMENT != 0
            || len % PAGE_ALIGNMENT != 0
        {
            return Err(anyhow::anyhow!(
                "invalid page write of {} bytes at offset {}",
                len,
                offset
            ));
        }
        let headers = vec![
            ("x-ms-page-write".to_string(), "update".to_string()),
            (
                "x-ms-range".to_string(),
                format!("bytes={}-{}", offset, offset + len - 1),
            ),
        ];
        let req = self.request(
            Method::PUT,
            &Self::resource(container, Some(blob)),
            &[("comp", "page")],
            headers,
            Some(data),
        )?;
        let resp = Self::send("put page", req).await?;
        Self::check("put page", resp).await?;
        Ok(())
    }

    async fn azure_get_page_ranges(
        &self,
        container: &str,
        blob: &str,
    ) -> anyhow::Result<Vec<IndexRange>> {
        let resource = Self::resource(container, Some(blob));
        let mut ranges = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query = vec![("comp", "pagelist")];
            if let Some(m) = marker.as_deref() {
                query.push(("marker", m));
            }
            let req = self.request(Method::GET, &resource, &query, Vec::new(), None)?;
            let resp = Self::send("get page ranges", req).await?;
            let resp = Self::check("get page ranges", resp).await?;
            let body = resp
                .text()
                .await
                .map_err(|e| RemoteError::transport(SERVICE, "get page ranges", e))?;

            let (page, next) = parse_page_list(&body)?;
            ranges.extend(page);
            match next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        debug!(
            "Blob {}/{} has {} written page ranges",
            container,
            blob,
            ranges.len()
        );
        Ok(ranges)
    }

    async fn azure_get_properties(
        &self,
        container: &str,
        blob: &str,
    ) -> anyhow::Result<Option<BlobProperties>> {
        let req = self.request(
            Method::HEAD,
            &Self::resource(container, Some(blob)),
            &[],
            Vec::new(),
            None,
        )?;
        let resp = Self::send("get blob properties", req).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::check("get blob properties", resp).await?;
        Ok(Some(properties_from_headers(resp.headers())))
    }

    async fn azure_set_content_md5(
        &self,
        container: &str,
        blob: &str,
        md5_base64: &str,
    ) -> anyhow::Result<()> {
        let headers = vec![(
            "x-ms-blob-content-md5".to_string(),
            md5_base64.to_string(),
        )];
        let req = self.request(
            Method::PUT,
            &Self::resource(container, Some(blob)),
            &[("comp", "properties")],
            headers,
            None,
        )?;
        let resp = Self::send("set blob properties", req).await?;
        Self::check("set blob properties", resp).await?;
        Ok(())
    }
}

/// Percent-encoding set for Azure blob names: encode everything except
/// unreserved characters and '/'.
const AZURE_BLOB_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// `x-ms-error-code` of a response, if present.
fn error_code(resp: &reqwest::Response) -> Option<String> {
    resp.headers()
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn properties_from_headers(headers: &reqwest::header::HeaderMap) -> BlobProperties {
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let metadata = headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(META_PREFIX)?;
            let value = value.to_str().ok()?;
            Some((key.to_string(), value.to_string()))
        })
        .collect();

    BlobProperties {
        content_length: text(CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        blob_type: text("x-ms-blob-type").unwrap_or_default(),
        content_md5: text("content-md5"),
        metadata,
    }
}

#[derive(Debug, Deserialize)]
struct PageListXml {
    #[serde(rename = "PageRange", default)]
    page_ranges: Vec<PageRangeXml>,
    #[serde(rename = "NextMarker", default)]
    next_marker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageRangeXml {
    #[serde(rename = "Start")]
    start: u64,
    #[serde(rename = "End")]
    end: u64,
}

/// Parse a Get Page Ranges body into ranges and the continuation marker.
fn parse_page_list(xml: &str) -> anyhow::Result<(Vec<IndexRange>, Option<String>)> {
    let parsed: PageListXml = quick_xml::de::from_str(xml.trim_start_matches('\u{feff}'))
        .map_err(|e| anyhow::anyhow!("Malformed page list: {}", e))?;

    let mut ranges = Vec::with_capacity(parsed.page_ranges.len());
    for r in parsed.page_ranges {
        if r.end < r.start {
            return Err(anyhow::anyhow!(
                "Malformed page list: range {}-{} ends before it starts",
                r.start,
                r.end
            ));
        }
        ranges.push(IndexRange::from_inclusive(r.start, r.end));
    }
    let next = parsed.next_marker.filter(|m| !m.is_empty());
    Ok((ranges, next))
}

impl PageBlobStore for AzurePageBlobStore {
    fn create_container_if_absent<'a>(&'a self, container: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(self.azure_create_container(container))
    }

    fn create_page_blob<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        size: u64,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.azure_create_page_blob(container, blob, size))
    }

    fn set_blob_metadata<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        metadata: &'a BTreeMap<String, String>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.azure_set_metadata(container, blob, metadata))
    }

    fn put_pages<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        offset: u64,
        data: Bytes,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.azure_put_pages(container, blob, offset, data))
    }

    fn get_page_ranges<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> StoreFuture<'a, Vec<IndexRange>> {
        Box::pin(self.azure_get_page_ranges(container, blob))
    }

    fn get_blob_properties<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> StoreFuture<'a, Option<BlobProperties>> {
        Box::pin(self.azure_get_properties(container, blob))
    }

    fn set_content_md5<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        md5_base64: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.azure_set_content_md5(container, blob, md5_base64))
    }
}

// -- Tests -------------------------------------------------------------------
