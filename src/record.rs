//! Flattening of an inbound HTTP request into the JSON payload stored for a
//! session.
//!
//! Header names are stored in canonical form (`Content-Type`, `X-Request-Id`).
//! Multi-valued headers and query parameters are concatenated in arrival order
//! without a separator, and every byte sequence is decoded as lossy UTF-8. The
//! result is meant for humans reading the log back, not for replaying the
//! request.

use std::collections::BTreeMap;

use anyhow::Context as _;
use chrono::{DateTime, SecondsFormat, Utc};
use hyper::http::request::Parts;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestRecord {
    pub date: String,
    pub method: String,
    pub url: String,
    pub proto: String,
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    pub body: String,
}

impl RequestRecord {
    pub fn from_parts(parts: &Parts, body: &[u8]) -> Self {
        Self::from_parts_at(parts, body, Utc::now())
    }

    pub fn from_parts_at(parts: &Parts, body: &[u8], received_at: DateTime<Utc>) -> Self {
        let mut headers = BTreeMap::<String, String>::new();
        for (name, value) in &parts.headers {
            headers
                .entry(canonical_header_name(name.as_str()))
                .or_default()
                .push_str(&String::from_utf8_lossy(value.as_bytes()));
        }

        let mut params = BTreeMap::<String, String>::new();
        if let Some(query) = parts.uri.query() {
            for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
                params.entry(name.into_owned()).or_default().push_str(&value);
            }
        }

        Self {
            date: received_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            method: parts.method.as_str().to_owned(),
            url: parts.uri.path().to_owned(),
            proto: format!("{:?}", parts.version),
            headers,
            params,
            body: String::from_utf8_lossy(body).into_owned(),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("serialize request record")
    }
}

/// Upper-cases the first letter of each `-`-separated word and lower-cases
/// the rest.
fn canonical_header_name(name: &str) -> String {
    let mut canonical = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper {
            canonical.push(ch.to_ascii_uppercase());
        } else {
            canonical.push(ch.to_ascii_lowercase());
        }
        upper = ch == '-';
    }
    canonical
}
