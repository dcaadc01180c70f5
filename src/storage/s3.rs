//! S3-compatible object store implementation
//!
//! Works against AWS S3 and MinIO (path-style addressing). Requests are
//! signed with AWS Signature Version 4; uploads above the multipart
//! threshold are split into parts and uploaded in parallel; transient
//! failures retry with exponential backoff and jitter.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::resilience::RetryConfig;

use super::object_store::{
    clamp_presign_expiry, ObjectMetadata, ObjectStore, PresignOperation, PutResult, StorageError,
    StorageResult, StorageTier,
};

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Multipart threshold: uploads at or above this size are split.
const MULTIPART_THRESHOLD: usize = 32 * 1024 * 1024;

/// Size of each multipart part.
const MULTIPART_PART_SIZE: usize = 16 * 1024 * 1024;

/// Parts uploaded concurrently.
const MULTIPART_PARALLELISM: usize = 8;

/// Hard cap on a single object.
const MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// S3-compatible storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Custom endpoint for S3-compatible services (MinIO)
    pub endpoint: Option<String>,
    /// Path-style addressing for MinIO compatibility
    pub use_path_style: bool,
    pub request_timeout_secs: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            endpoint: None,
            use_path_style: false,
            request_timeout_secs: 60,
        }
    }
}

/// S3-compatible object store
pub struct S3ObjectStore {
    config: S3Config,
    client: Client,
    retry: RetryConfig,
    cleanup_queue: RwLock<Vec<(StorageTier, String)>>,
}

impl S3ObjectStore {
    /// Create a new store from configuration.
    pub fn new(config: S3Config) -> StorageResult<Self> {
        if config.access_key.is_empty() || config.secret_key.is_empty() {
            return Err(StorageError::InvalidConfig(
                "missing S3 credentials".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| StorageError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            config,
            client,
            retry: RetryConfig::default(),
            cleanup_queue: RwLock::new(Vec::new()),
        })
    }

    fn host_for(&self, bucket: &str) -> String {
        match &self.config.endpoint {
            Some(endpoint) => {
                let stripped = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://");
                stripped.trim_end_matches('/').to_string()
            }
            None if self.config.use_path_style => {
                format!("s3.{}.amazonaws.com", self.config.region)
            }
            None => format!("{}.s3.{}.amazonaws.com", bucket, self.config.region),
        }
    }

    fn scheme(&self) -> &'static str {
        match &self.config.endpoint {
            Some(endpoint) if endpoint.starts_with("http://") => "http",
            _ => "https",
        }
    }

    /// Canonical URI path for a bucket/key pair.
    fn uri_path(&self, bucket: &str, key: &str) -> String {
        let encoded_key: String = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");

        if self.config.use_path_style || self.config.endpoint.is_some() {
            if key.is_empty() {
                format!("/{}", bucket)
            } else {
                format!("/{}/{}", bucket, encoded_key)
            }
        } else if key.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", encoded_key)
        }
    }

    fn url(&self, bucket: &str, key: &str, query: &str) -> String {
        let base = format!(
            "{}://{}{}",
            self.scheme(),
            self.host_for(bucket),
            self.uri_path(bucket, key)
        );
        if query.is_empty() {
            base
        } else {
            format!("{}?{}", base, query)
        }
    }

    /// Sign a request with AWS Signature Version 4 and return the headers
    /// to attach.
    fn sign(
        &self,
        method: &str,
        bucket: &str,
        key: &str,
        query: &str,
        payload_hash: &str,
        extra_headers: &[(String, String)],
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let host = self.host_for(bucket);

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), host),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        for (name, value) in extra_headers {
            headers.push((name.to_ascii_lowercase(), value.trim().to_string()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{}:{}\n", name, value))
            .collect();
        let signed_headers: String = headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_query = canonicalize_query(query);
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            self.uri_path(bucket, key),
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let signature = hex::encode(hmac_chain(
            &self.config.secret_key,
            &date_stamp,
            &self.config.region,
            string_to_sign.as_bytes(),
        ));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.config.access_key, scope, signed_headers, signature
        );

        let mut out: Vec<(String, String)> = headers
            .into_iter()
            .filter(|(name, _)| name != "host")
            .collect();
        out.push(("authorization".to_string(), authorization));
        out
    }

    /// Issue a signed request, retrying transient failures.
    async fn send(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
        query: &str,
        body: Option<Vec<u8>>,
        extra_headers: Vec<(String, String)>,
    ) -> StorageResult<Response> {
        let payload_hash = match &body {
            Some(bytes) => sha256_hex(bytes),
            None => sha256_hex(b""),
        };

        let mut attempt = 0u32;
        loop {
            let signed = self.sign(
                method.as_str(),
                bucket,
                key,
                query,
                &payload_hash,
                &extra_headers,
                Utc::now(),
            );

            let url = self.url(bucket, key, query);
            let mut request = self.client.request(method.clone(), &url);
            for (name, value) in &signed {
                request = request.header(name, value);
            }
            if let Some(bytes) = &body {
                request = request.body(bytes.clone());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || status == StatusCode::NOT_FOUND {
                        return Ok(response);
                    }
                    if status == StatusCode::FORBIDDEN {
                        return Err(StorageError::AccessDenied(key.to_string()));
                    }
                    if !is_retryable_status(status) || attempt >= self.retry.max_attempts {
                        return Err(StorageError::Other(format!(
                            "S3 {} {} failed: {}",
                            method, key, status
                        )));
                    }
                }
                Err(e) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(StorageError::Unreachable(e.to_string()));
                    }
                }
            }

            let delay = self.retry.delay_for_attempt(attempt);
            log::warn!(
                "Retrying S3 {} {} (attempt {}) after {:?}",
                method,
                key,
                attempt + 1,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn multipart_put(
        &self,
        tier: StorageTier,
        key: &str,
        data: &[u8],
        upload_headers: Vec<(String, String)>,
    ) -> StorageResult<PutResult> {
        let bucket = tier.bucket();

        // Initiate.
        let response = self
            .send(
                Method::POST,
                bucket,
                key,
                "uploads=",
                Some(Vec::new()),
                upload_headers.clone(),
            )
            .await?;
        let body = response
            .text()
            .await
            .map_err(|e| StorageError::Unreachable(e.to_string()))?;
        let upload_id = extract_xml_value(&body, "UploadId")
            .ok_or_else(|| StorageError::Other("missing UploadId in response".to_string()))?;

        log::info!(
            "Multipart upload started: {} ({} bytes, {} parts)",
            key,
            data.len(),
            (data.len() + MULTIPART_PART_SIZE - 1) / MULTIPART_PART_SIZE
        );

        // Upload parts in parallel, preserving part-number order in the
        // completion manifest.
        let parts: Vec<(usize, Vec<u8>)> = data
            .chunks(MULTIPART_PART_SIZE)
            .enumerate()
            .map(|(index, chunk)| (index + 1, chunk.to_vec()))
            .collect();

        let upload_results: Vec<StorageResult<(usize, String)>> = stream::iter(parts)
            .map(|(part_number, chunk)| {
                let upload_id = upload_id.clone();
                let key = key.to_string();
                async move {
                    let query =
                        format!("partNumber={}&uploadId={}", part_number, urlencoding::encode(&upload_id));
                    let response = self
                        .send(Method::PUT, bucket, &key, &query, Some(chunk), Vec::new())
                        .await?;
                    let etag = response
                        .headers()
                        .get("etag")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    Ok((part_number, etag))
                }
            })
            .buffered(MULTIPART_PARALLELISM)
            .collect()
            .await;

        let mut etags: Vec<(usize, String)> = Vec::new();
        for result in upload_results {
            match result {
                Ok(part) => etags.push(part),
                Err(e) => {
                    self.abort_multipart(bucket, key, &upload_id).await;
                    return Err(e);
                }
            }
        }
        etags.sort_by_key(|(part_number, _)| *part_number);

        // Complete.
        let mut manifest = String::from("<CompleteMultipartUpload>");
        for (part_number, etag) in &etags {
            manifest.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                part_number, etag
            ));
        }
        manifest.push_str("</CompleteMultipartUpload>");

        let query = format!("uploadId={}", urlencoding::encode(&upload_id));
        let response = self
            .send(
                Method::POST,
                bucket,
                key,
                &query,
                Some(manifest.into_bytes()),
                Vec::new(),
            )
            .await?;

        let version_id = header_string(&response, "x-amz-version-id");
        Ok(PutResult {
            key: key.to_string(),
            tier,
            size: data.len() as u64,
            version_id,
        })
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) {
        let query = format!("uploadId={}", urlencoding::encode(upload_id));
        if let Err(e) = self
            .send(Method::DELETE, bucket, key, &query, None, Vec::new())
            .await
        {
            log::warn!("Failed to abort multipart upload {}: {}", key, e);
        }
    }

    /// Provision every tier bucket: versioning on, public access blocked,
    /// lifecycle rules attached.
    pub async fn provision_buckets(&self) -> StorageResult<()> {
        for tier in StorageTier::all() {
            let bucket = tier.bucket();

            // Create (409/conflict from an existing bucket is fine; the
            // send path surfaces only success/404 here).
            let _ = self
                .send(Method::PUT, bucket, "", "", Some(Vec::new()), Vec::new())
                .await;

            self.send(
                Method::PUT,
                bucket,
                "",
                "versioning=",
                Some(VERSIONING_XML.as_bytes().to_vec()),
                Vec::new(),
            )
            .await?;

            self.send(
                Method::PUT,
                bucket,
                "",
                "publicAccessBlock=",
                Some(PUBLIC_ACCESS_BLOCK_XML.as_bytes().to_vec()),
                Vec::new(),
            )
            .await?;

            self.send(
                Method::PUT,
                bucket,
                "",
                "lifecycle=",
                Some(LIFECYCLE_XML.as_bytes().to_vec()),
                Vec::new(),
            )
            .await?;

            log::info!("Provisioned bucket {}", bucket);
        }
        Ok(())
    }

    /// Best-effort deletion of stale copies left by partial tier moves.
    pub async fn drain_cleanup_queue(&self) {
        let stale: Vec<(StorageTier, String)> =
            std::mem::take(&mut *self.cleanup_queue.write().await);
        for (tier, key) in stale {
            let _ = self
                .send(Method::DELETE, tier.bucket(), &key, "", None, Vec::new())
                .await;
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        tier: StorageTier,
        key: &str,
        data: &[u8],
        metadata: ObjectMetadata,
    ) -> StorageResult<PutResult> {
        if data.len() as u64 > MAX_OBJECT_SIZE {
            return Err(StorageError::ObjectTooLarge {
                size: data.len() as u64,
                max: MAX_OBJECT_SIZE,
            });
        }

        let mut headers: Vec<(String, String)> = Vec::new();
        if let Some(content_type) = &metadata.content_type {
            headers.push(("content-type".to_string(), content_type.clone()));
        }
        if let Some(disposition) = &metadata.content_disposition {
            headers.push(("content-disposition".to_string(), disposition.clone()));
        }
        if let Some(sha256) = &metadata.sha256 {
            headers.push(("x-amz-meta-sha256".to_string(), sha256.clone()));
        }
        for (name, value) in &metadata.custom {
            headers.push((format!("x-amz-meta-{}", name), value.clone()));
        }

        if data.len() >= MULTIPART_THRESHOLD {
            return self.multipart_put(tier, key, data, headers).await;
        }

        let response = self
            .send(
                Method::PUT,
                tier.bucket(),
                key,
                "",
                Some(data.to_vec()),
                headers,
            )
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::Other(format!(
                "bucket {} does not exist",
                tier.bucket()
            )));
        }

        Ok(PutResult {
            key: key.to_string(),
            tier,
            size: data.len() as u64,
            version_id: header_string(&response, "x-amz-version-id"),
        })
    }

    async fn get_from(&self, tier: StorageTier, key: &str) -> StorageResult<Vec<u8>> {
        let response = self
            .send(Method::GET, tier.bucket(), key, "", None, Vec::new())
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(key.to_string()));
        }

        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|e| StorageError::Unreachable(e.to_string()))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMetadata> {
        for tier in StorageTier::all() {
            let response = self
                .send(Method::HEAD, tier.bucket(), key, "", None, Vec::new())
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                continue;
            }

            let size = header_string(&response, "content-length")
                .parse::<u64>()
                .unwrap_or(0);
            return Ok(ObjectMetadata {
                key: key.to_string(),
                size,
                modified: Utc::now(),
                content_type: optional_header(&response, "content-type"),
                content_disposition: optional_header(&response, "content-disposition"),
                sha256: optional_header(&response, "x-amz-meta-sha256"),
                version_id: header_string(&response, "x-amz-version-id"),
                custom: HashMap::new(),
            });
        }
        Err(StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        for tier in StorageTier::all() {
            // 404 comes back as success from the send path, which is the
            // idempotency the contract requires.
            self.send(Method::DELETE, tier.bucket(), key, "", None, Vec::new())
                .await?;
        }
        Ok(())
    }

    async fn move_tier(
        &self,
        key: &str,
        from: StorageTier,
        to: StorageTier,
    ) -> StorageResult<()> {
        if from == to {
            return Ok(());
        }

        let copy_source = format!("/{}/{}", from.bucket(), key);
        let response = self
            .send(
                Method::PUT,
                to.bucket(),
                key,
                "",
                Some(Vec::new()),
                vec![("x-amz-copy-source".to_string(), copy_source)],
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(key.to_string()));
        }

        // Copy succeeded: the object counts as moved even if the source
        // delete fails; the stale copy is queued for cleanup.
        if let Err(e) = self
            .send(Method::DELETE, from.bucket(), key, "", None, Vec::new())
            .await
        {
            log::warn!("Stale copy left at {}/{}: {}", from.bucket(), key, e);
            self.cleanup_queue
                .write()
                .await
                .push((from, key.to_string()));
        }

        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        tier: Option<StorageTier>,
        max_results: usize,
    ) -> StorageResult<Vec<String>> {
        let tiers: Vec<StorageTier> = match tier {
            Some(t) => vec![t],
            None => StorageTier::all().to_vec(),
        };

        let mut keys = Vec::new();
        for tier in tiers {
            if keys.len() >= max_results {
                break;
            }
            let query = format!(
                "list-type=2&max-keys={}&prefix={}",
                max_results - keys.len(),
                urlencoding::encode(prefix)
            );
            let response = self
                .send(Method::GET, tier.bucket(), "", &query, None, Vec::new())
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                continue;
            }
            let body = response
                .text()
                .await
                .map_err(|e| StorageError::Unreachable(e.to_string()))?;
            keys.extend(extract_xml_values(&body, "Key"));
        }

        keys.sort();
        keys.dedup();
        keys.truncate(max_results);
        Ok(keys)
    }

    async fn presigned_url(
        &self,
        key: &str,
        operation: PresignOperation,
        expiry_secs: u64,
    ) -> StorageResult<String> {
        let expiry = clamp_presign_expiry(expiry_secs);
        let bucket = StorageTier::Hot.bucket();
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);

        let credential = format!("{}/{}", self.config.access_key, scope);
        let mut query_pairs = vec![
            ("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
            ("X-Amz-Credential".to_string(), credential),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-Expires".to_string(), expiry.to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        query_pairs.sort();

        let canonical_query: String = query_pairs
            .iter()
            .map(|(name, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(name),
                    urlencoding::encode(value)
                )
            })
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "{}\n{}\n{}\nhost:{}\n\nhost\n{}",
            operation.http_method(),
            self.uri_path(bucket, key),
            canonical_query,
            self.host_for(bucket),
            UNSIGNED_PAYLOAD
        );

        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let signature = hex::encode(hmac_chain(
            &self.config.secret_key,
            &date_stamp,
            &self.config.region,
            string_to_sign.as_bytes(),
        ));

        Ok(format!(
            "{}&X-Amz-Signature={}",
            self.url(bucket, key, &canonical_query),
            signature
        ))
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// SigV4 signing-key derivation chain.
fn hmac_chain(secret: &str, date_stamp: &str, region: &str, string_to_sign: &[u8]) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    hmac_sha256(&k_signing, string_to_sign)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn header_string(response: &Response, name: &str) -> String {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn optional_header(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Sort query parameters by name, as SigV4 canonicalization requires.
fn canonicalize_query(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<&str> = query.split('&').collect();
    pairs.sort();
    pairs
        .iter()
        .map(|pair| {
            if pair.contains('=') {
                pair.to_string()
            } else {
                format!("{}=", pair)
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn extract_xml_value(body: &str, tag: &str) -> Option<String> {
    extract_xml_values(body, tag).into_iter().next()
}

/// Pull every `<tag>value</tag>` occurrence out of a flat S3 XML response.
fn extract_xml_values(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut values = Vec::new();
    let mut rest = body;

    while let Some(start) = rest.find(&open) {
        rest = &rest[start + open.len()..];
        if let Some(end) = rest.find(&close) {
            values.push(rest[..end].to_string());
            rest = &rest[end + close.len()..];
        } else {
            break;
        }
    }
    values
}

const VERSIONING_XML: &str = "<VersioningConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\"><Status>Enabled</Status></VersioningConfiguration>";

const PUBLIC_ACCESS_BLOCK_XML: &str = "<PublicAccessBlockConfiguration><BlockPublicAcls>true</BlockPublicAcls><IgnorePublicAcls>true</IgnorePublicAcls><BlockPublicPolicy>true</BlockPublicPolicy><RestrictPublicBuckets>true</RestrictPublicBuckets></PublicAccessBlockConfiguration>";

/// Lifecycle rules attached to every backup bucket: abort incomplete
/// multipart uploads after 7 days, expire the transient/ prefix after 90,
/// transition noncurrent versions to IA after 30 and expire them after 180.
const LIFECYCLE_XML: &str = "<LifecycleConfiguration>\
<Rule><ID>abort-incomplete-multipart</ID><Filter><Prefix></Prefix></Filter><Status>Enabled</Status>\
<AbortIncompleteMultipartUpload><DaysAfterInitiation>7</DaysAfterInitiation></AbortIncompleteMultipartUpload></Rule>\
<Rule><ID>expire-transient</ID><Filter><Prefix>transient/</Prefix></Filter><Status>Enabled</Status>\
<Expiration><Days>90</Days></Expiration></Rule>\
<Rule><ID>noncurrent-versions</ID><Filter><Prefix></Prefix></Filter><Status>Enabled</Status>\
<NoncurrentVersionTransition><NoncurrentDays>30</NoncurrentDays><StorageClass>STANDARD_IA</StorageClass></NoncurrentVersionTransition>\
<NoncurrentVersionExpiration><NoncurrentDays>180</NoncurrentDays></NoncurrentVersionExpiration></Rule>\
</LifecycleConfiguration>";

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> S3ObjectStore {
        S3ObjectStore::new(S3Config {
            region: "us-east-1".to_string(),
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            endpoint: Some("http://127.0.0.1:9000".to_string()),
            use_path_style: true,
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_missing_credentials_rejected() {
        assert!(S3ObjectStore::new(S3Config::default()).is_err());
    }

    #[test]
    fn test_url_building_path_style() {
        let store = test_store();
        assert_eq!(
            store.url("backups-hot", "snapshots/a/backup_a_1", ""),
            "http://127.0.0.1:9000/backups-hot/snapshots/a/backup_a_1"
        );
    }

    #[test]
    fn test_url_building_virtual_hosted() {
        let store = S3ObjectStore::new(S3Config {
            region: "eu-west-1".to_string(),
            access_key: "AK".to_string(),
            secret_key: "SK".to_string(),
            endpoint: None,
            use_path_style: false,
            request_timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(
            store.url("backups-hot", "k", ""),
            "https://backups-hot.s3.eu-west-1.amazonaws.com/k"
        );
    }

    #[test]
    fn test_signature_is_deterministic() {
        let store = test_store();
        let now = DateTime::parse_from_rfc3339("2026-01-15T10:30:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let a = store.sign("GET", "backups-hot", "k", "", &sha256_hex(b""), &[], now);
        let b = store.sign("GET", "backups-hot", "k", "", &sha256_hex(b""), &[], now);
        assert_eq!(a, b);

        let auth = a.iter().find(|(name, _)| name == "authorization").unwrap();
        assert!(auth.1.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20260115/"));
        assert!(auth.1.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
    }

    #[test]
    fn test_canonical_query_sorting() {
        assert_eq!(
            canonicalize_query("uploadId=abc&partNumber=2"),
            "partNumber=2&uploadId=abc"
        );
        assert_eq!(canonicalize_query("uploads"), "uploads=");
    }

    #[test]
    fn test_xml_extraction() {
        let body = "<ListBucketResult><Contents><Key>a/1</Key></Contents><Contents><Key>a/2</Key></Contents></ListBucketResult>";
        assert_eq!(extract_xml_values(body, "Key"), vec!["a/1", "a/2"]);
        assert_eq!(
            extract_xml_value("<InitiateMultipartUploadResult><UploadId>XYZ</UploadId></InitiateMultipartUploadResult>", "UploadId"),
            Some("XYZ".to_string())
        );
    }

    #[tokio::test]
    async fn test_presigned_url_shape() {
        let store = test_store();
        let url = store
            .presigned_url("artefacts/j/a.step", PresignOperation::Get, 3600)
            .await
            .unwrap();
        assert!(url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(url.contains("X-Amz-Expires=3600"));
        assert!(url.contains("X-Amz-Signature="));
    }

    #[tokio::test]
    async fn test_presigned_url_expiry_clamped() {
        let store = test_store();
        let url = store
            .presigned_url("k", PresignOperation::Put, 1_000_000)
            .await
            .unwrap();
        assert!(url.contains("X-Amz-Expires=86400"));
    }
}
