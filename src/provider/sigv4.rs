//! AWS Signature Version 4 签名
//!
//! 纯函数：输入请求方法、URL、请求头、请求体、凭证、区域、服务和时间戳，
//! 输出需要附加到请求上的签名头。不做任何IO，便于用已知向量验证。

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{RequestBuilder, Url};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// AWS凭证
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

impl AwsCredentials {
    /// 从标准环境变量读取
    pub fn from_env() -> Option<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        Some(Self {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

/// 签名范围：区域 + 服务
#[derive(Debug, Clone, Copy)]
pub struct SigningScope<'a> {
    pub region: &'a str,
    pub service: &'a str,
}

/// 签名结果，`canonical_request` 和 `string_to_sign` 保留用于排查签名不匹配
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
    pub security_token: Option<String>,
    pub canonical_request: String,
    pub string_to_sign: String,
}

impl SignedRequest {
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request
            .header("authorization", &self.authorization)
            .header("x-amz-date", &self.amz_date)
            .header("x-amz-content-sha256", &self.content_sha256);
        match &self.security_token {
            Some(token) => request.header("x-amz-security-token", token),
            None => request,
        }
    }
}

/// 计算SigV4签名
pub fn sign(
    method: &str,
    url: &str,
    headers: &BTreeMap<String, String>,
    payload: &[u8],
    credentials: &AwsCredentials,
    scope: SigningScope<'_>,
    timestamp: DateTime<Utc>,
) -> Result<SignedRequest> {
    if credentials.access_key_id.trim().is_empty() || credentials.secret_access_key.trim().is_empty() {
        return Err(Error::Config("sigv4 credentials are incomplete".into()));
    }
    let url = Url::parse(url).map_err(|e| Error::Config(format!("sigv4 invalid url {}: {}", url, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Config("sigv4 url has no host".into()))?;
    let host = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();
    let date = timestamp.format("%Y%m%d").to_string();
    let payload_hash = sha256_hex(payload);

    // 规范化请求头：小写名、折叠空白、同名合并
    let mut canonical: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            continue;
        }
        let value = collapse_whitespace(value);
        canonical
            .entry(name)
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    canonical.entry("host".into()).or_insert(host);
    canonical.insert("x-amz-date".into(), amz_date.clone());
    canonical.insert("x-amz-content-sha256".into(), payload_hash.clone());
    if let Some(token) = &credentials.session_token {
        canonical.insert("x-amz-security-token".into(), collapse_whitespace(token));
    }

    let canonical_headers: String = canonical
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();
    let signed_headers = canonical.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method.trim().to_ascii_uppercase(),
        canonical_uri(&url),
        canonical_query(&url),
        canonical_headers,
        signed_headers,
        payload_hash
    );

    let credential_scope = format!("{}/{}/{}/aws4_request", date, scope.region, scope.service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let k_date = hmac(format!("AWS4{}", credentials.secret_access_key).as_bytes(), &date)?;
    let k_region = hmac(&k_date, scope.region)?;
    let k_service = hmac(&k_region, scope.service)?;
    let k_signing = hmac(&k_service, "aws4_request")?;
    let signature = hex::encode(hmac(&k_signing, &string_to_sign)?);

    Ok(SignedRequest {
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            credentials.access_key_id, credential_scope, signed_headers, signature
        ),
        amz_date,
        content_sha256: payload_hash,
        security_token: credentials.session_token.clone(),
        canonical_request,
        string_to_sign,
    })
}

/// 路径已经是URL编码形式，这里再编码一次（非S3服务要求双重编码）
fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        "/".to_string()
    } else {
        uri_encode(path, false)
    }
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k, true), uri_encode(&v, true)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// AWS风格的百分号编码，只保留非保留字符
pub(crate) fn uri_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        let unreserved = byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~');
        if unreserved || (!encode_slash && byte == b'/') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn hmac(key: &[u8], data: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Config(format!("sigv4 invalid hmac key: {}", e)))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn example_credentials() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            session_token: None,
        }
    }

    #[test]
    fn matches_known_signature() {
        let mut headers = BTreeMap::new();
        headers.insert(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded; charset=utf-8".to_string(),
        );
        let timestamp = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();

        let signed = sign(
            "GET",
            "https://iam.amazonaws.com/?Action=ListUsers&Version=2010-05-08",
            &headers,
            b"",
            &example_credentials(),
            SigningScope {
                region: "us-east-1",
                service: "iam",
            },
            timestamp,
        )
        .unwrap();

        let expected_canonical = [
            "GET",
            "/",
            "Action=ListUsers&Version=2010-05-08",
            "content-type:application/x-www-form-urlencoded; charset=utf-8",
            "host:iam.amazonaws.com",
            "x-amz-content-sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            "x-amz-date:20150830T123600Z",
            "",
            "content-type;host;x-amz-content-sha256;x-amz-date",
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        ]
        .join("\n");
        assert_eq!(signed.canonical_request, expected_canonical);
        assert_eq!(
            signed.authorization,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/iam/aws4_request, SignedHeaders=content-type;host;x-amz-content-sha256;x-amz-date, Signature=dd479fa8a80364edf2119ec24bebde66712ee9c9cb2b0d92eb3ab9ccdc0c3947"
        );
    }

    #[test]
    fn encoded_path_segments_are_encoded_again() {
        let url = Url::parse("https://bedrock-runtime.us-east-1.amazonaws.com/model/a.b-v1%3A0/converse").unwrap();
        assert_eq!(canonical_uri(&url), "/model/a.b-v1%253A0/converse");
    }

    #[test]
    fn session_token_is_signed() {
        let mut credentials = example_credentials();
        credentials.session_token = Some("token".into());
        let signed = sign(
            "POST",
            "https://bedrock-runtime.us-east-1.amazonaws.com/model/x/converse",
            &BTreeMap::new(),
            b"{}",
            &credentials,
            SigningScope {
                region: "us-east-1",
                service: "bedrock",
            },
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
        .unwrap();
        assert!(signed.authorization.contains("x-amz-security-token"));
        assert_eq!(signed.security_token.as_deref(), Some("token"));
    }
}
