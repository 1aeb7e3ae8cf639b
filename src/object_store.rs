//! Image storage backends.
//!
//! Downloaded images go either to a local directory or to an S3 bucket
//! (`[options.s3]`). Both are addressed by file name; the engine only needs
//! `get` and `put`.
//!
//! S3 requests are signed with AWS Signature V4 by hand. Credentials come
//! from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, and optionally
//! `AWS_SESSION_TOKEN`. A custom `endpoint_url` switches to path-style
//! addressing (`<endpoint>/<bucket>/<key>`) for MinIO and LocalStack.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::config::{S3Settings, Settings};

type HmacSha256 = Hmac<Sha256>;

pub enum Storage {
    Local { dir: PathBuf },
    S3(S3Bucket),
}

impl Storage {
    /// Backend selected by the run settings.
    pub fn from_settings(settings: &Settings, client: reqwest::Client) -> Result<Self> {
        match &settings.s3 {
            Some(s3) => Ok(Storage::S3(S3Bucket {
                settings: s3.clone(),
                creds: AwsCredentials::from_env()?,
                client,
            })),
            None => Ok(Storage::Local {
                dir: settings.image_dir.clone(),
            }),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Storage::S3(_))
    }

    /// Where `key` lives, for log lines.
    pub fn describe(&self, key: &str) -> String {
        match self {
            Storage::Local { dir } => dir.join(key).display().to_string(),
            Storage::S3(b) => format!("s3://{}/{}", b.settings.bucket, b.object_key(key)),
        }
    }

    /// Stored bytes for `key`, or `None` if nothing is stored.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self {
            Storage::Local { dir } => {
                let path = dir.join(key);
                match tokio::fs::read(&path).await {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
                }
            }
            Storage::S3(bucket) => bucket.get(key).await,
        }
    }

    pub async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        match self {
            Storage::Local { dir } => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("Failed to create image directory {}", dir.display()))?;
                let path = dir.join(key);
                tokio::fs::write(&path, bytes)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))
            }
            Storage::S3(bucket) => bucket.put(key, bytes, content_type).await,
        }
    }
}

// ============ AWS Credentials ============

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

// ============ S3 Bucket ============

pub struct S3Bucket {
    settings: S3Settings,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3Bucket {
    fn object_key(&self, key: &str) -> String {
        match &self.settings.path_prefix {
            Some(prefix) if !prefix.trim_matches('/').is_empty() => {
                format!("{}/{}", prefix.trim_matches('/'), key)
            }
            _ => key.to_string(),
        }
    }

    /// `(url, host, canonical_uri)` for an object key.
    fn locate(&self, key: &str) -> (String, String, String) {
        let encoded_key = self
            .object_key(key)
            .split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/");
        match &self.settings.endpoint_url {
            Some(endpoint) => {
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
                let uri = format!("/{}/{}", uri_encode(&self.settings.bucket), encoded_key);
                (format!("{}://{}{}", scheme, host, uri), host, uri)
            }
            None => {
                let host = format!(
                    "{}.s3.{}.amazonaws.com",
                    self.settings.bucket, self.settings.region
                );
                let uri = format!("/{}", encoded_key);
                (format!("https://{}{}", host, uri), host, uri)
            }
        }
    }

    /// Signed headers for one request. `extra` headers are signed too.
    fn sign(
        &self,
        method: &str,
        host: &str,
        canonical_uri: &str,
        payload_hash: &str,
        extra: &[(&str, &str)],
    ) -> Vec<(String, String)> {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = vec![
            ("host".to_string(), host.to_string()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        for (k, v) in extra {
            headers.push((k.to_ascii_lowercase(), v.trim().to_string()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method, canonical_uri, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.settings.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.settings.region,
            "s3",
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        // reqwest sets Host itself.
        let mut out: Vec<(String, String)> =
            headers.into_iter().filter(|(k, _)| k != "host").collect();
        out.push(("authorization".to_string(), authorization));
        out
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let (url, host, uri) = self.locate(key);
        let payload_hash = hex_sha256(b"");

        let mut req = self.client.get(&url);
        for (k, v) in self.sign("GET", &host, &uri, &payload_hash, &[]) {
            req = req.header(k, v);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("Failed to get s3://{}/{}", self.settings.bucket, key))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            bail!("S3 GetObject failed (HTTP {}) for key '{}'", status, key);
        }
        Ok(Some(resp.bytes().await?.to_vec()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let (url, host, uri) = self.locate(key);
        let payload_hash = hex_sha256(&bytes);

        let mut extra = vec![("content-type", content_type)];
        if let Some(acl) = &self.settings.acl {
            extra.push(("x-amz-acl", acl.as_str()));
        }

        let mut req = self.client.put(&url).body(bytes);
        for (k, v) in self.sign("PUT", &host, &uri, &payload_hash, &extra) {
            req = req.header(k, v);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("Failed to put s3://{}/{}", self.settings.bucket, key))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("S3 PutObject failed (HTTP {}) for key '{}': {}", status, key, body);
        }
        Ok(())
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything but `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(endpoint: Option<&str>, prefix: Option<&str>) -> S3Bucket {
        S3Bucket {
            settings: S3Settings {
                bucket: "art".to_string(),
                path_prefix: prefix.map(str::to_string),
                acl: Some("public-read".to_string()),
                region: "eu-west-1".to_string(),
                endpoint_url: endpoint.map(str::to_string),
            },
            creds: AwsCredentials {
                access_key_id: "AKID".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: None,
            },
            client: reqwest::Client::new(),
        }
    }

    #[test]
    fn virtual_hosted_and_path_style_urls() {
        let (url, host, uri) = bucket(None, Some("/images/")).locate("a b.jpg");
        assert_eq!(host, "art.s3.eu-west-1.amazonaws.com");
        assert_eq!(uri, "/images/a%20b.jpg");
        assert_eq!(url, "https://art.s3.eu-west-1.amazonaws.com/images/a%20b.jpg");

        let (url, host, _) = bucket(Some("http://localhost:4566/"), None).locate("x.jpg");
        assert_eq!(host, "localhost:4566");
        assert_eq!(url, "http://localhost:4566/art/x.jpg");
    }

    #[test]
    fn signature_covers_acl_and_content_type() {
        let b = bucket(None, None);
        let headers = b.sign(
            "PUT",
            "art.s3.eu-west-1.amazonaws.com",
            "/x.jpg",
            &hex_sha256(b"data"),
            &[("content-type", "image/jpeg"), ("x-amz-acl", "public-read")],
        );
        let auth = &headers
            .iter()
            .find(|(k, _)| k == "authorization")
            .unwrap()
            .1;
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKID/"));
        assert!(auth.contains("/eu-west-1/s3/aws4_request"));
        assert!(auth.contains(
            "SignedHeaders=content-type;host;x-amz-acl;x-amz-content-sha256;x-amz-date"
        ));
        assert!(!headers.iter().any(|(k, _)| k == "host"));
    }

    #[test]
    fn known_sha256_and_encoding() {
        assert_eq!(
            hex_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(uri_encode("a/b c"), "a%2Fb%20c");
    }

    #[tokio::test]
    async fn local_storage_get_put() {
        let tmp = tempfile::TempDir::new().unwrap();
        let storage = Storage::Local {
            dir: tmp.path().join("images"),
        };
        assert!(storage.get("x.jpg").await.unwrap().is_none());
        storage.put("x.jpg", vec![1, 2, 3], "image/jpeg").await.unwrap();
        assert_eq!(storage.get("x.jpg").await.unwrap(), Some(vec![1, 2, 3]));
        assert!(!storage.is_remote());
    }
}
