//! AWS Signature Version 4. The signer is pure given (request, credential,
//! timestamp); callers pass `now()` at the call site.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};

use crate::credential::Credential;
use crate::{JanusError, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct SigV4Timestamp {
    pub amz_date: String,
    pub date: String,
}

impl SigV4Timestamp {
    pub fn from_datetime(datetime: OffsetDateTime) -> Result<Self> {
        const AMZ_FORMAT: &[FormatItem<'_>] =
            format_description!("[year][month][day]T[hour][minute][second]Z");
        const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year][month][day]");

        let amz_date = datetime
            .format(AMZ_FORMAT)
            .map_err(|err| JanusError::internal(format!("failed to format amz date: {err}")))?;
        let date = datetime
            .format(DATE_FORMAT)
            .map_err(|err| JanusError::internal(format!("failed to format scope date: {err}")))?;
        Ok(Self { amz_date, date })
    }

    pub fn from_amz_date(amz_date: &str) -> Result<Self> {
        let amz_date = amz_date.trim();
        if amz_date.len() < 8 {
            return Err(JanusError::internal(
                "amz date must be at least 8 chars".to_string(),
            ));
        }
        Ok(Self {
            amz_date: amz_date.to_string(),
            date: amz_date[..8].to_string(),
        })
    }
}

/// Headers to inject into the outbound request after signing.
#[derive(Debug, Clone)]
pub struct SigV4Headers {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
    pub host: String,
    pub security_token: Option<String>,
}

/// Signs one request with an AWS credential. Scope is
/// `YYYYMMDD/<region>/<service>/aws4_request`.
pub fn sign_sigv4(
    credential: &Credential,
    region: &str,
    service: &str,
    method: &str,
    url: &str,
    headers: &BTreeMap<String, String>,
    payload: &[u8],
    timestamp: SigV4Timestamp,
) -> Result<SigV4Headers> {
    let Credential::Aws {
        access_key,
        secret_key,
        session_token,
        ..
    } = credential
    else {
        return Err(JanusError::internal(format!(
            "sigv4 requires an aws credential, got {}",
            credential.kind_name()
        )));
    };

    let method = method.trim().to_ascii_uppercase();
    if method.is_empty() {
        return Err(JanusError::internal("sigv4 method must be non-empty"));
    }

    let url = Url::parse(url)
        .map_err(|err| JanusError::internal(format!("sigv4 invalid url {url:?}: {err}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| JanusError::internal("sigv4 url missing host"))?;
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let payload_hash = sha256_hex(payload);
    let canonical_headers_map = prepare_headers(
        headers,
        &host,
        &timestamp.amz_date,
        &payload_hash,
        session_token.as_deref(),
    );
    let (canonical_headers, signed_headers) = canonical_headers(&canonical_headers_map);
    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        canonical_uri(&url),
        canonical_query(&url),
        canonical_headers,
        signed_headers,
        payload_hash
    );

    let scope = format!("{}/{region}/{service}/aws4_request", timestamp.date);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        timestamp.amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), &timestamp.date)?;
    let k_region = hmac_sha256(&k_date, region)?;
    let k_service = hmac_sha256(&k_region, service)?;
    let k_signing = hmac_sha256(&k_service, "aws4_request")?;
    let signature = hex_encode(&hmac_sha256(&k_signing, &string_to_sign)?);

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={access_key}/{scope}, SignedHeaders={signed_headers}, Signature={signature}"
    );

    Ok(SigV4Headers {
        authorization,
        amz_date: timestamp.amz_date,
        content_sha256: payload_hash,
        host,
        security_token: session_token.clone(),
    })
}

fn prepare_headers(
    headers: &BTreeMap<String, String>,
    host: &str,
    amz_date: &str,
    payload_hash: &str,
    session_token: Option<&str>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();
    for (name, value) in headers {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let key = name.to_ascii_lowercase();
        let value = normalize_header_value(value);
        if let Some(existing) = out.get_mut(&key) {
            if !existing.is_empty() {
                existing.push(',');
            }
            existing.push_str(&value);
        } else {
            out.insert(key, value);
        }
    }

    out.entry("host".to_string())
        .or_insert_with(|| host.to_string());
    out.insert("x-amz-date".to_string(), amz_date.to_string());
    out.entry("x-amz-content-sha256".to_string())
        .or_insert_with(|| payload_hash.to_string());
    if let Some(token) = session_token {
        out.insert(
            "x-amz-security-token".to_string(),
            normalize_header_value(token),
        );
    }
    out
}

fn canonical_headers(headers: &BTreeMap<String, String>) -> (String, String) {
    let mut canonical = String::new();
    let mut signed = Vec::<String>::new();
    for (name, value) in headers {
        canonical.push_str(name);
        canonical.push(':');
        canonical.push_str(value);
        canonical.push('\n');
        signed.push(name.clone());
    }
    (canonical, signed.join(";"))
}

fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        "/".to_string()
    } else {
        aws_percent_encode(path, false)
    }
}

fn canonical_query(url: &Url) -> String {
    let mut pairs = Vec::<(String, String)>::new();
    for (name, value) in url.query_pairs() {
        pairs.push((
            aws_percent_encode(&name, true),
            aws_percent_encode(&value, true),
        ));
    }
    pairs.sort();
    pairs
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn aws_percent_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::new();
    for &byte in value.as_bytes() {
        let is_unreserved =
            matches!(byte, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~');
        if is_unreserved || (!encode_slash && byte == b'/') {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push(HEX_CHARS[(byte >> 4) as usize] as char);
            out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
        }
    }
    out
}

fn normalize_header_value(value: &str) -> String {
    let mut out = String::new();
    let mut last_space = false;
    for ch in value.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out.trim().to_string()
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| JanusError::internal(format!("invalid hmac key: {err}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX_CHARS[(byte >> 4) as usize] as char);
        out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    out
}
