//! S3-Compatible API Client
//!
//! Provides signed (AWS Signature V4) path-style access to an S3-compatible
//! endpoint such as MinIO for object and bucket operations.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, ETAG, LAST_MODIFIED};
use reqwest::{Client, Method, Response, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::errors::StoreError;
use super::types::{ListEntry, ObjectStat};
use super::ObjectStore;
use crate::cache::mirror::write_atomic;
use crate::config::MirrorConfig;

/// Maximum number of retries for retryable errors
const MAX_RETRIES: u32 = 3;

/// Backoff delays between attempts
const BACKOFF_MS: [u64; 3] = [500, 1000, 2000];

/// Signing algorithm identifier
const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Maximum keys requested per ListObjectsV2 page
const LIST_PAGE_SIZE: u32 = 1000;

type HmacSha256 = Hmac<Sha256>;

/// S3 API client for making signed requests
#[derive(Clone)]
pub struct S3Client {
    /// HTTP client for making requests
    http_client: Client,
    /// `scheme://host[:port]` of the endpoint
    base_url: Url,
    access_key: String,
    secret_key: String,
    region: String,
}

/// Response body of ListObjectsV2
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListContents>,
    #[serde(default)]
    common_prefixes: Vec<CommonPrefix>,
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListContents {
    key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommonPrefix {
    prefix: String,
}

impl S3Client {
    /// Create a client from a resolved configuration
    ///
    /// No request timeout is configured: a stalled transfer blocks its
    /// caller until the connection fails.
    pub fn new(config: &MirrorConfig) -> Result<Self, StoreError> {
        let base = if config.endpoint.contains("://") {
            config.endpoint.clone()
        } else {
            let scheme = if config.secure { "https" } else { "http" };
            format!("{}://{}", scheme, config.endpoint)
        };
        let base_url = Url::parse(&base)
            .map_err(|e| StoreError::Request(format!("invalid endpoint '{}': {}", base, e)))?;

        let mut builder = Client::builder();
        if let Some(name) = &config.client_name {
            builder = builder.user_agent(name.clone());
        }
        let http_client = builder.build()?;

        debug!(endpoint = %base_url, region = %config.region, "S3 client ready");

        Ok(Self {
            http_client,
            base_url,
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            region: config.region.clone(),
        })
    }

    /// Execute an operation with retry logic and exponential backoff
    async fn with_retry<F, Fut, T>(&self, operation: &str, path: &str, f: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    let delay = BACKOFF_MS
                        .get(attempt as usize)
                        .copied()
                        .unwrap_or(2000);
                    warn!(
                        operation = operation,
                        path = path,
                        attempt = attempt + 1,
                        max = MAX_RETRIES,
                        delay_ms = delay,
                        error = %e,
                        "Retrying S3 operation"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Build a path-style URL with a canonically encoded query
    fn url(&self, bucket: &str, key: Option<&str>, query: &[(&str, &str)]) -> Url {
        let mut url = self.base_url.clone();
        let mut path = format!("/{}", encode_segment(bucket));
        if let Some(key) = key {
            path.push('/');
            path.push_str(&encode_key(key));
        }
        url.set_path(&path);
        let query = canonical_query(query);
        url.set_query(if query.is_empty() { None } else { Some(query.as_str()) });
        url
    }

    /// Sign and send a request, mapping non-success statuses to errors
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Vec<u8>,
        resource: &str,
    ) -> Result<Response, StoreError> {
        let payload_hash = hex::encode(Sha256::digest(&body));
        let headers = self.sign(&method, &url, &payload_hash, Utc::now())?;

        let mut request = self.http_client.request(method, url).headers(headers);
        if !body.is_empty() {
            request = request.body(body);
        }
        let response = request.send().await?;

        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let detail = if text.is_empty() { resource } else { &text };
        Err(StoreError::from_status(status, detail))
    }

    /// Compute AWS Signature V4 headers for a request
    fn sign(
        &self,
        method: &Method,
        url: &Url,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<HeaderMap, StoreError> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let host = host_header(url);

        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_request = format!(
            "{}\n{}\n{}\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
            method.as_str(),
            url.path(),
            url.query().unwrap_or(""),
            host,
            payload_hash,
            amz_date,
            signed_headers,
            payload_hash
        );

        let scope = format!("{}/{}/s3/aws4_request", date, self.region);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let k_date = hmac(format!("AWS4{}", self.secret_key).as_bytes(), &date)?;
        let k_region = hmac(&k_date, &self.region)?;
        let k_service = hmac(&k_region, "s3")?;
        let k_signing = hmac(&k_service, "aws4_request")?;
        let signature = hex::encode(hmac(&k_signing, &string_to_sign)?);

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.access_key, scope, signed_headers, signature
        );

        let mut headers = HeaderMap::new();
        for (name, value) in [
            ("x-amz-date", amz_date.as_str()),
            ("x-amz-content-sha256", payload_hash),
            ("authorization", authorization.as_str()),
        ] {
            let value: HeaderValue = value
                .parse()
                .map_err(|_| StoreError::Request(format!("invalid header value for {}", name)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
        token: Option<&str>,
    ) -> Result<ListBucketResult, StoreError> {
        let max_keys = LIST_PAGE_SIZE.to_string();
        let mut query = vec![
            ("list-type", "2"),
            ("max-keys", max_keys.as_str()),
            ("prefix", prefix),
        ];
        if !recursive {
            query.push(("delimiter", "/"));
        }
        if let Some(token) = token {
            query.push(("continuation-token", token));
        }

        let url = self.url(bucket, None, &query);
        let response = self.send(Method::GET, url, Vec::new(), bucket).await?;
        let body = response.text().await?;
        quick_xml::de::from_str(&body)
            .map_err(|e| StoreError::Request(format!("failed to parse bucket listing: {}", e)))
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn stat(&self, bucket: &str, key: &str) -> Result<ObjectStat, StoreError> {
        let resource = format!("{}/{}", bucket, key);
        self.with_retry("stat", &resource, || async {
            let url = self.url(bucket, Some(key), &[]);
            let response = self.send(Method::HEAD, url, Vec::new(), &resource).await?;
            stat_from_headers(response.headers(), &resource)
        })
        .await
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
        version_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let resource = format!("{}/{}", bucket, key);
        let bytes = self
            .with_retry("get", &resource, || async {
                let query: Vec<(&str, &str)> =
                    version_id.map(|v| vec![("versionId", v)]).unwrap_or_default();
                let url = self.url(bucket, Some(key), &query);
                let response = self.send(Method::GET, url, Vec::new(), &resource).await?;
                Ok::<_, StoreError>(response.bytes().await?)
            })
            .await?;

        write_atomic(dest, &bytes)?;
        info!(object = %resource, size = bytes.len(), "Downloaded object");
        Ok(())
    }

    async fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), StoreError> {
        let resource = format!("{}/{}", bucket, key);
        let data = tokio::fs::read(source).await?;
        let size = data.len();

        self.with_retry("put", &resource, || async {
            let url = self.url(bucket, Some(key), &[]);
            self.send(Method::PUT, url, data.clone(), &resource).await?;
            Ok::<_, StoreError>(())
        })
        .await?;

        info!(object = %resource, size = size, "Uploaded object");
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<ListEntry>, StoreError> {
        let mut entries = Vec::new();
        let mut token: Option<String> = None;

        loop {
            debug!(bucket = bucket, prefix = prefix, token = ?token, "Listing objects");
            let page = self
                .with_retry("list", bucket, || {
                    self.list_page(bucket, prefix, recursive, token.as_deref())
                })
                .await?;

            entries.extend(page.contents.into_iter().map(|c| ListEntry {
                bucket: bucket.to_string(),
                is_directory: c.key.ends_with('/'),
                key: c.key,
            }));
            entries.extend(page.common_prefixes.into_iter().map(|p| ListEntry {
                bucket: bucket.to_string(),
                key: p.prefix,
                is_directory: true,
            }));

            match page.next_continuation_token {
                Some(next) if page.is_truncated => token = Some(next),
                _ => break,
            }
        }

        debug!(bucket = bucket, count = entries.len(), "Listed objects");
        Ok(entries)
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        let url = self.url(bucket, None, &[]);
        match self.send(Method::HEAD, url, Vec::new(), bucket).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let body = if self.region == "us-east-1" {
            Vec::new()
        } else {
            format!(
                "<CreateBucketConfiguration><LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                self.region
            )
            .into_bytes()
        };
        let url = self.url(bucket, None, &[]);
        self.send(Method::PUT, url, body, bucket).await?;
        info!(bucket = bucket, "Created bucket");
        Ok(())
    }
}

fn hmac(key: &[u8], data: &str) -> Result<Vec<u8>, StoreError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StoreError::Request(format!("signing key rejected: {}", e)))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// `Host` header value exactly as reqwest will send it
fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn encode_segment(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// Encode an object key, keeping `/` separators
fn encode_key(key: &str) -> String {
    key.split('/').map(encode_segment).collect::<Vec<_>>().join("/")
}

/// Sorted, RFC 3986 encoded query string as required by SigV4
fn canonical_query(params: &[(&str, &str)]) -> String {
    let mut pairs: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (encode_segment(k), encode_segment(v)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn stat_from_headers(headers: &HeaderMap, resource: &str) -> Result<ObjectStat, StoreError> {
    let header = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let mtime = header(LAST_MODIFIED).ok_or_else(|| {
        StoreError::Request(format!("no Last-Modified header for {}", resource))
    })?;
    let size = header(CONTENT_LENGTH)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    Ok(ObjectStat {
        mtime,
        size,
        etag: header(ETAG).map(|e| e.trim_matches('"').to_string()),
        version_id: headers
            .get("x-amz-version-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(endpoint: &str) -> MirrorConfig {
        MirrorConfig {
            endpoint: endpoint.to_string(),
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            cache_root: std::env::temp_dir(),
            client_name: Some("s3mirror-test".to_string()),
            secure: false,
            region: "us-east-1".to_string(),
            disable_auto_refresh: false,
            workers: 2,
        }
    }

    #[test]
    fn test_canonical_query_sorted_and_encoded() {
        let query = canonical_query(&[
            ("prefix", "a b/c"),
            ("list-type", "2"),
            ("delimiter", "/"),
        ]);
        assert_eq!(query, "delimiter=%2F&list-type=2&prefix=a%20b%2Fc");
    }

    #[test]
    fn test_encode_key_keeps_separators() {
        assert_eq!(encode_key("dir/my file.txt"), "dir/my%20file.txt");
        assert_eq!(encode_key("k+1.pkl"), "k%2B1.pkl");
    }

    #[test]
    fn test_endpoint_scheme() {
        let client = S3Client::new(&test_config("localhost:9000")).unwrap();
        assert_eq!(client.base_url.as_str(), "http://localhost:9000/");

        let mut config = test_config("play.min.io");
        config.secure = true;
        let client = S3Client::new(&config).unwrap();
        assert_eq!(client.base_url.scheme(), "https");
    }

    #[test]
    fn test_signature_shape() {
        let client = S3Client::new(&test_config("localhost:9000")).unwrap();
        let url = client.url("data", Some("a.txt"), &[]);
        let now = DateTime::from_timestamp(1_369_353_600, 0).unwrap();
        let headers = client
            .sign(&Method::GET, &url, &hex::encode(Sha256::digest(b"")), now)
            .unwrap();

        let auth = headers["authorization"].to_str().unwrap();
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20130524/us-east-1/s3/aws4_request"
        ));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
        assert_eq!(headers["x-amz-date"], "20130524T000000Z");
    }

    #[tokio::test]
    async fn test_stat_and_missing_object() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/data/a.txt"))
            .and(header_exists("authorization"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Last-Modified", "Wed, 01 Jan 2025 00:00:00 GMT")
                    .insert_header("ETag", "\"abc\""),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/data/missing.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = S3Client::new(&test_config(&server.uri())).unwrap();
        let stat = client.stat("data", "a.txt").await.unwrap();
        assert_eq!(stat.mtime, "Wed, 01 Jan 2025 00:00:00 GMT");
        assert_eq!(stat.etag.as_deref(), Some("abc"));

        let err = client.stat("data", "missing.txt").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_writes_destination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/dir/b.bin"))
            .and(query_param("versionId", "v1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;

        let client = S3Client::new(&test_config(&server.uri())).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("b.bin");
        client
            .get("data", "dir/b.bin", &dest, Some("v1"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_list_paginates_and_marks_directories() {
        let server = MockServer::start().await;
        let first = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>data</Name>
  <Prefix>dir/</Prefix>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>next-page</NextContinuationToken>
  <Contents><Key>dir/a.txt</Key><Size>3</Size></Contents>
</ListBucketResult>"#;
        let second = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>data</Name>
  <IsTruncated>false</IsTruncated>
  <Contents><Key>dir/b.txt</Key><Size>3</Size></Contents>
  <CommonPrefixes><Prefix>dir/sub/</Prefix></CommonPrefixes>
</ListBucketResult>"#;

        Mock::given(method("GET"))
            .and(path("/data"))
            .and(query_param("continuation-token", "next-page"))
            .respond_with(ResponseTemplate::new(200).set_body_string(second))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .and(query_param("list-type", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(first))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let client = S3Client::new(&test_config(&server.uri())).unwrap();
        let entries = client.list("data", "dir/", false).await.unwrap();
        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["dir/a.txt", "dir/b.txt", "dir/sub/"]);
        assert!(entries[2].is_directory);
    }

    #[tokio::test]
    async fn test_bucket_exists() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/present"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/absent"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = S3Client::new(&test_config(&server.uri())).unwrap();
        assert!(client.bucket_exists("present").await.unwrap());
        assert!(!client.bucket_exists("absent").await.unwrap());
    }
}
