//! Amazon S3 object store.
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication
//! (see [`crate::signing`]). Supports custom endpoints for S3-compatible
//! services (MinIO, LocalStack), which are addressed path-style.
//!
//! # Configuration
//!
//! ```toml
//! [object_store]
//! backend = "s3"
//! bucket = "octember-bizcard-us-east-1-123456789012"
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! ```
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (temporary credentials / IAM roles)
//!
//! Non-2xx responses are returned as [`ObjectStoreError::Upstream`] with the
//! original status code so callers can pass them through.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::{validate_key, ObjectData, ObjectMeta, ObjectResult, ObjectStore, ObjectStoreError};
use crate::config::ObjectStoreConfig;
use crate::signing::{derive_signing_key, hex_hmac_sha256, hex_sha256, uri_encode};

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

pub struct S3ObjectStore {
    config: ObjectStoreConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3ObjectStore {
    pub fn from_env(config: ObjectStoreConfig) -> Result<Self> {
        let creds = AwsCredentials::from_env()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build S3 HTTP client")?;
        Ok(Self {
            config,
            creds,
            client,
        })
    }

    /// Scheme, host, and the path prefix for the bucket.
    ///
    /// Custom endpoints use path-style addressing (`/<bucket>/<key>`);
    /// AWS uses virtual-hosted style (`<bucket>.s3.<region>.amazonaws.com`).
    fn endpoint(&self) -> (String, String, String) {
        match self.config.endpoint_url {
            Some(ref endpoint) => {
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                (
                    scheme.to_string(),
                    host,
                    format!("/{}", uri_encode(&self.config.bucket)),
                )
            }
            None => (
                "https".to_string(),
                format!(
                    "{}.s3.{}.amazonaws.com",
                    self.config.bucket, self.config.region
                ),
                String::new(),
            ),
        }
    }

    /// Send a SigV4-signed request. `key` is `None` for bucket-level calls.
    async fn send_signed(
        &self,
        method: reqwest::Method,
        key: Option<&str>,
        query_params: &[(String, String)],
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> ObjectResult<reqwest::Response> {
        let (scheme, host, bucket_path) = self.endpoint();
        let encoded_key = key
            .map(|k| k.split('/').map(uri_encode).collect::<Vec<_>>().join("/"))
            .unwrap_or_default();
        let canonical_uri = format!("{}/{}", bucket_path, encoded_key);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut sorted_params = query_params.to_vec();
        sorted_params.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let payload_hash = hex_sha256(&body);

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ct) = content_type {
            headers.push(("content-type".to_string(), ct.to_string()));
        }
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.config.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", scheme, host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut req = self
            .client
            .request(method, &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ct) = content_type {
            req = req.header("content-type", ct);
        }
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        let resp = req.send().await.map_err(|e| {
            ObjectStoreError::Request(format!(
                "s3://{}/{}: {}",
                self.config.bucket,
                key.unwrap_or(""),
                e
            ))
        })?;

        if resp.status().as_u16() == 404 {
            return Err(ObjectStoreError::NotFound(key.unwrap_or("").to_string()));
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ObjectStoreError::Upstream {
                status,
                message: body.chars().take(500).collect(),
            });
        }
        Ok(resp)
    }
}

fn header_str(resp: &reqwest::Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn meta_from_headers(key: &str, resp: &reqwest::Response) -> ObjectMeta {
    let size = header_str(resp, "content-length")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    let content_type = header_str(resp, "content-type")
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let last_modified = header_str(resp, "last-modified")
        .and_then(|s| DateTime::parse_from_rfc2822(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    ObjectMeta {
        key: key.to_string(),
        size,
        content_type,
        last_modified,
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> ObjectResult<ObjectMeta> {
        validate_key(key)?;
        let size = bytes.len() as u64;
        self.send_signed(reqwest::Method::PUT, Some(key), &[], bytes, Some(content_type))
            .await?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size,
            content_type: content_type.to_string(),
            last_modified: Utc::now(),
        })
    }

    async fn get(&self, key: &str) -> ObjectResult<ObjectData> {
        validate_key(key)?;
        let resp = self
            .send_signed(reqwest::Method::GET, Some(key), &[], Vec::new(), None)
            .await?;
        let mut meta = meta_from_headers(key, &resp);
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?
            .to_vec();
        meta.size = bytes.len() as u64;
        Ok(ObjectData { meta, bytes })
    }

    async fn head(&self, key: &str) -> ObjectResult<ObjectMeta> {
        validate_key(key)?;
        let resp = self
            .send_signed(reqwest::Method::HEAD, Some(key), &[], Vec::new(), None)
            .await?;
        Ok(meta_from_headers(key, &resp))
    }

    /// Uses `ListObjectsV2` with `max-keys=1000` per page, following
    /// `NextContinuationToken` until the listing is complete.
    async fn list(&self, prefix: &str) -> ObjectResult<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query_params = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query_params.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query_params.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self
                .send_signed(reqwest::Method::GET, None, &query_params, Vec::new(), None)
                .await?;
            let xml_body = resp
                .text()
                .await
                .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
            let page = parse_list_objects_response(&xml_body);
            objects.extend(page.objects);

            match (page.is_truncated, page.next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

struct ListPage {
    objects: Vec<ObjectMeta>,
    is_truncated: bool,
    next_token: Option<String>,
}

/// Parse a `ListObjectsV2` XML response.
fn parse_list_objects_response(xml: &str) -> ListPage {
    let mut objects = Vec::new();
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        remaining = &remaining[block_start + end + "</Contents>".len()..];

        let key = extract_xml_value(block, "Key").unwrap_or_default();
        if key.is_empty() || key.ends_with('/') {
            continue;
        }
        let last_modified = extract_xml_value(block, "LastModified")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let size = extract_xml_value(block, "Size")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        objects.push(ObjectMeta {
            content_type: super::detect_content_type(&key),
            key,
            size,
            last_modified,
        });
    }

    ListPage {
        objects,
        is_truncated,
        next_token,
    }
}

/// Extract the text content of an XML tag (simple, non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}
