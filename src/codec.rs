//! Mapping between the gateway's live request / session and the objects
//! handed to hooks.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use hook_plugin::message::{RequestObject, ReturnOverride, SessionObject};
use thiserror::Error;

use crate::session::SessionState;

pub type LiveRequest = http::Request<Bytes>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid method '{0}'")]
    Method(String),
    #[error("invalid url '{0}'")]
    Url(String),
    #[error("invalid header '{0}'")]
    Header(String),
}

/// Request line as first seen, kept across stages.
#[derive(Debug, Clone)]
struct OriginalUrl(String);

/// Record the current URI as the original request line. Only the first
/// call has an effect.
pub fn mark_original(live: &mut LiveRequest) {
    if live.extensions().get::<OriginalUrl>().is_none() {
        let url = live.uri().to_string();
        live.extensions_mut().insert(OriginalUrl(url));
    }
}

fn url_of(uri: &Uri) -> String {
    if uri.scheme().is_some() {
        uri.to_string()
    } else {
        uri.path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string())
    }
}

fn joined(headers: &HeaderMap, name: &HeaderName) -> String {
    headers
        .get_all(name)
        .iter()
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .collect::<Vec<_>>()
        .join(", ")
}

fn text_view(body: &[u8]) -> &str {
    std::str::from_utf8(body).unwrap_or("")
}

pub fn encode_request(live: &LiveRequest) -> RequestObject {
    let uri = live.uri();

    let mut headers = BTreeMap::new();
    for name in live.headers().keys() {
        headers.insert(name.as_str().to_string(), joined(live.headers(), name));
    }

    let mut params = BTreeMap::new();
    if let Some(q) = uri.query() {
        for (k, v) in url::form_urlencoded::parse(q.as_bytes()) {
            params.entry(k.into_owned()).or_insert_with(|| v.into_owned());
        }
    }

    let scheme = uri
        .scheme_str()
        .map(str::to_string)
        .or_else(|| live.headers().get("x-forwarded-proto").and_then(|v| v.to_str().ok()).map(str::to_string))
        .unwrap_or_else(|| "http".to_string());

    RequestObject {
        method: live.method().as_str().to_string(),
        url: url_of(uri),
        raw_url: live
            .extensions()
            .get::<OriginalUrl>()
            .map(|o| o.0.clone())
            .unwrap_or_else(|| uri.to_string()),
        scheme,
        headers,
        set_headers: BTreeMap::new(),
        delete_headers: Vec::new(),
        params,
        add_params: BTreeMap::new(),
        delete_params: Vec::new(),
        body: text_view(live.body()).to_string(),
        raw_body: live.body().to_vec(),
        return_overrides: ReturnOverride::default(),
    }
}

/// Apply a hook-returned object onto the live request. Fields the object
/// leaves as they were encoded stay untouched.
pub fn decode_request(obj: &RequestObject, live: &mut LiveRequest) -> Result<(), CodecError> {
    if !obj.method.is_empty() && !obj.method.eq_ignore_ascii_case(live.method().as_str()) {
        let method = Method::from_bytes(obj.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| CodecError::Method(obj.method.clone()))?;
        *live.method_mut() = method;
    }

    let mut uri = if obj.url.is_empty() || obj.url == url_of(live.uri()) {
        live.uri().clone()
    } else {
        obj.url.parse::<Uri>().map_err(|_| CodecError::Url(obj.url.clone()))?
    };
    if !obj.delete_params.is_empty() || !obj.add_params.is_empty() {
        uri = rewrite_query(&uri, &obj.delete_params, &obj.add_params)?;
    }
    if &uri != live.uri() {
        *live.uri_mut() = uri;
    }

    apply_headers(obj, live.headers_mut())?;

    let new_body = if obj.raw_body.as_slice() != live.body().as_ref() {
        Some(Bytes::copy_from_slice(&obj.raw_body))
    } else if obj.body != text_view(live.body()) {
        Some(Bytes::from(obj.body.clone().into_bytes()))
    } else {
        None
    };
    if let Some(body) = new_body {
        if live.headers().contains_key(CONTENT_LENGTH) {
            live.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        }
        *live.body_mut() = body;
    }
    Ok(())
}

fn header_name(name: &str) -> Result<HeaderName, CodecError> {
    HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| CodecError::Header(name.to_string()))
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, CodecError> {
    HeaderValue::from_str(value).map_err(|_| CodecError::Header(name.to_string()))
}

fn apply_headers(obj: &RequestObject, headers: &mut HeaderMap) -> Result<(), CodecError> {
    let mut wanted: Vec<(HeaderName, &str)> = Vec::with_capacity(obj.headers.len());
    for (k, v) in &obj.headers {
        wanted.push((header_name(k)?, v.as_str()));
    }

    let stale: Vec<HeaderName> = headers
        .keys()
        .filter(|k| !wanted.iter().any(|(w, _)| w == *k))
        .cloned()
        .collect();
    for name in stale {
        headers.remove(&name);
    }
    for (name, value) in wanted {
        // untouched multi-value headers keep their separate entries
        if joined(headers, &name) != value {
            headers.insert(name.clone(), header_value(name.as_str(), value)?);
        }
    }

    for name in &obj.delete_headers {
        headers.remove(header_name(name)?);
    }
    for (k, v) in &obj.set_headers {
        headers.insert(header_name(k)?, header_value(k, v)?);
    }
    Ok(())
}

fn rewrite_query(
    uri: &Uri,
    delete: &[String],
    add: &BTreeMap<String, String>,
) -> Result<Uri, CodecError> {
    let mut pairs: Vec<(String, String)> = uri
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    pairs.retain(|(k, _)| !delete.contains(k) && !add.contains_key(k));
    pairs.extend(add.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut path_and_query = uri.path().to_string();
    if !pairs.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        path_and_query.push('?');
        path_and_query.push_str(&query);
    }

    let mut builder = Uri::builder();
    if let Some(scheme) = uri.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = uri.authority() {
        builder = builder.authority(authority.clone());
    }
    builder
        .path_and_query(path_and_query.as_str())
        .build()
        .map_err(|_| CodecError::Url(path_and_query))
}

// -----------------------------------------------------------------------------
// Sessions
// -----------------------------------------------------------------------------

pub fn encode_session(s: &SessionState, authorized: bool) -> SessionObject {
    SessionObject {
        rate: Some(s.rate),
        per: Some(s.per),
        quota_max: Some(s.quota_max),
        quota_remaining: Some(s.quota_remaining),
        quota_renewal_rate: Some(s.quota_renewal_rate),
        quota_renews: Some(s.quota_renews),
        apply_policy_id: s.apply_policy_id.clone(),
        apply_policies: s.apply_policies.clone(),
        alias: s.alias.clone(),
        org_id: s.org_id.clone(),
        tags: s.tags.clone(),
        expires: s.expires,
        metadata: s.meta_data.clone(),
        is_authorized: authorized,
    }
}

/// Copy what the object carries onto `s`. Unset numeric fields keep their
/// current value; `is_authorized` is never read back.
pub fn decode_session(obj: &SessionObject, s: &mut SessionState) {
    if let Some(v) = obj.rate {
        s.rate = v;
    }
    if let Some(v) = obj.per {
        s.per = v;
    }
    if let Some(v) = obj.quota_max {
        s.quota_max = v;
    }
    if let Some(v) = obj.quota_remaining {
        s.quota_remaining = v;
    }
    if let Some(v) = obj.quota_renewal_rate {
        s.quota_renewal_rate = v;
    }
    if let Some(v) = obj.quota_renews {
        s.quota_renews = v;
    }
    s.apply_policy_id = obj.apply_policy_id.clone();
    s.apply_policies = obj.apply_policies.clone();
    s.alias = obj.alias.clone();
    s.org_id = obj.org_id.clone();
    s.tags = obj.tags.clone();
    s.expires = obj.expires;
    s.meta_data = obj.metadata.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(method: &str, uri: &str, body: &[u8]) -> LiveRequest {
        http::Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "text/plain")
            .header("Accept", "application/json")
            .body(Bytes::copy_from_slice(body))
            .unwrap()
    }

    #[test]
    fn encode_collects_headers_params_and_body() {
        let mut live = request("GET", "/get?a=1&b=two&a=3", b"{}");
        mark_original(&mut live);
        let obj = encode_request(&live);

        assert_eq!(obj.method, "GET");
        assert_eq!(obj.url, "/get?a=1&b=two&a=3");
        assert_eq!(obj.raw_url, "/get?a=1&b=two&a=3");
        assert_eq!(obj.scheme, "http");
        assert_eq!(obj.headers["accept"], "text/plain, application/json");
        assert_eq!(obj.params["a"], "1");
        assert_eq!(obj.params["b"], "two");
        assert_eq!(obj.body, "{}");
        assert_eq!(obj.raw_body, b"{}".to_vec());
        assert!(obj.return_overrides.is_empty());
    }

    #[test]
    fn encode_decode_encode_is_stable() {
        let mut live = request("POST", "/things?x=1", b"payload");
        let first = encode_request(&live);
        decode_request(&first, &mut live).unwrap();
        let second = encode_request(&live);
        assert_eq!(first, second);
        // untouched repeated headers keep both entries
        assert_eq!(live.headers().get_all("accept").iter().count(), 2);
    }

    #[test]
    fn binary_body_survives_untouched() {
        let bytes: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let mut live = request("POST", "/upload", &bytes);
        let obj = encode_request(&live);
        assert_eq!(obj.body, "");
        assert_eq!(obj.raw_body.len(), 4096);

        decode_request(&obj, &mut live).unwrap();
        assert_eq!(live.body().as_ref(), bytes.as_slice());
    }

    #[test]
    fn text_body_change_wins_when_raw_body_is_unchanged() {
        let mut live = request("POST", "/", b"old");
        let mut obj = encode_request(&live);
        obj.body = "new".into();
        decode_request(&obj, &mut live).unwrap();
        assert_eq!(live.body().as_ref(), b"new");
    }

    #[test]
    fn raw_body_change_wins_over_text() {
        let mut live = request("POST", "/", b"old");
        live.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(3usize));
        let mut obj = encode_request(&live);
        obj.body = "ignored".into();
        obj.raw_body = vec![0, 1, 2, 3, 4];
        decode_request(&obj, &mut live).unwrap();
        assert_eq!(live.body().as_ref(), &[0, 1, 2, 3, 4]);
        assert_eq!(live.headers()[CONTENT_LENGTH], "5");
    }

    #[test]
    fn header_mutations_apply_in_order() {
        let mut live = request("GET", "/", b"");
        let mut obj = encode_request(&live);
        obj.headers.insert("X-Replaced".into(), "yes".into());
        obj.headers.remove("content-type");
        obj.delete_headers.push("Accept".into());
        obj.set_headers.insert("x-added".into(), "1".into());
        decode_request(&obj, &mut live).unwrap();

        let h = live.headers();
        assert_eq!(h["x-replaced"], "yes");
        assert_eq!(h["x-added"], "1");
        assert!(h.get("content-type").is_none());
        assert!(h.get("accept").is_none());
    }

    #[test]
    fn query_mutations_rewrite_the_url() {
        let mut live = request("GET", "/search?q=rust&page=2", b"");
        let mut obj = encode_request(&live);
        obj.delete_params.push("page".into());
        obj.add_params.insert("lang".into(), "en gb".into());
        decode_request(&obj, &mut live).unwrap();
        assert_eq!(live.uri().to_string(), "/search?q=rust&lang=en+gb");
    }

    #[test]
    fn url_and_method_rewrites() {
        let mut live = request("POST", "/test2", b"");
        mark_original(&mut live);
        let mut obj = encode_request(&live);
        obj.url = "tyk://test-api-2/newpath".into();
        obj.method = "get".into();
        decode_request(&obj, &mut live).unwrap();

        assert_eq!(live.method(), Method::GET);
        assert_eq!(live.uri().scheme_str(), Some("tyk"));
        assert_eq!(live.uri().host(), Some("test-api-2"));
        let again = encode_request(&live);
        assert_eq!(again.url, "tyk://test-api-2/newpath");
        assert_eq!(again.raw_url, "/test2");
    }

    #[test]
    fn invalid_values_are_codec_errors() {
        let mut live = request("GET", "/", b"");
        let mut obj = encode_request(&live);
        obj.method = "NOT A METHOD".into();
        assert!(matches!(decode_request(&obj, &mut live), Err(CodecError::Method(_))));

        let mut obj = encode_request(&live);
        obj.set_headers.insert("bad header".into(), "v".into());
        assert!(matches!(decode_request(&obj, &mut live), Err(CodecError::Header(_))));

        let mut obj = encode_request(&live);
        obj.url = "http://[bad".into();
        assert!(matches!(decode_request(&obj, &mut live), Err(CodecError::Url(_))));
    }

    #[test]
    fn session_round_trip_keeps_metadata_and_skips_unset_fields() {
        let mut stored = SessionState { rate: 1000.0, per: 1.0, quota_max: 1, ..Default::default() };
        stored.meta_data.insert("testkey".into(), json!({"nestedkey": "nestedvalue"}));
        stored.meta_data.insert("stringkey".into(), json!("testvalue"));

        let obj = encode_session(&stored, true);
        assert!(obj.is_authorized);
        let mut back = SessionState::default();
        decode_session(&obj, &mut back);
        assert_eq!(back, stored);

        let mut partial = SessionObject { rate: Some(5.0), ..Default::default() };
        partial.metadata = stored.meta_data.clone();
        let mut target = stored.clone();
        decode_session(&partial, &mut target);
        assert_eq!(target.rate, 5.0);
        assert_eq!(target.quota_max, 1);
        assert_eq!(target.per, 1.0);
    }
}
