use std::sync::Mutex;

use http::HeaderMap;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HeaderName, HeaderValue};

use crate::error::Error;

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn merge_headers(default_headers: &HeaderMap, request_headers: &HeaderMap) -> HeaderMap {
    let mut merged = default_headers.clone();
    for name in request_headers.keys() {
        merged.remove(name);
    }
    for (name, value) in request_headers {
        merged.append(name.clone(), value.clone());
    }
    merged
}

pub(crate) fn is_absolute_http_url(path: &str) -> bool {
    let lower = path
        .get(..8)
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| path.to_ascii_lowercase());
    lower.starts_with("http://") || lower.starts_with("https://")
}

pub(crate) fn resolve_url(base_url: Option<&str>, path: &str) -> String {
    match base_url {
        Some(base_url) if !is_absolute_http_url(path) => join_base_path(base_url, path),
        _ => path.to_owned(),
    }
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}/{relative}"),
    }
}

/// Appends encoded pairs to `path`. A query already present is kept exactly as
/// written, and a fragment stays at the end.
pub(crate) fn append_query_pairs(path: &str, query_pairs: &[(String, String)]) -> String {
    if query_pairs.is_empty() {
        return path.to_owned();
    }

    let (without_fragment, fragment) = match path.split_once('#') {
        Some((left, right)) => (left, Some(right)),
        None => (path, None),
    };
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in query_pairs {
        serializer.append_pair(name, value);
    }
    let appended = serializer.finish();

    let mut merged = match without_fragment.split_once('?') {
        Some((base, existing)) if !existing.is_empty() && existing != "&" => {
            let existing = existing.strip_suffix('&').unwrap_or(existing);
            format!("{base}?{existing}&{appended}")
        }
        Some((base, _)) => format!("{base}?{appended}"),
        None => format!("{without_fragment}?{appended}"),
    };
    if let Some(fragment) = fragment {
        merged.push('#');
        merged.push_str(fragment);
    }
    merged
}

pub(crate) fn redact_url_for_logs(url_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(url_text) else {
        return url_text.split('?').next().unwrap_or(url_text).to_owned();
    };
    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

pub(crate) fn same_origin(left: &url::Url, right: &url::Url) -> bool {
    if !left.scheme().eq_ignore_ascii_case(right.scheme()) {
        return false;
    }
    let left_host = left.host_str().unwrap_or_default();
    let right_host = right.host_str().unwrap_or_default();
    if !left_host.eq_ignore_ascii_case(right_host) {
        return false;
    }
    left.port_or_known_default() == right.port_or_known_default()
}

/// Drops request headers that must not follow a redirect: body headers once
/// the method became GET, credentials once the origin changed.
pub(crate) fn sanitize_headers_for_redirect(
    headers: &mut Vec<(HeaderName, HeaderValue)>,
    method_changed_to_get: bool,
    same_origin_redirect: bool,
) {
    headers.retain(|(name, _)| {
        let body_header = *name == CONTENT_LENGTH || *name == CONTENT_TYPE;
        let credential = *name == AUTHORIZATION || *name == COOKIE;
        !(method_changed_to_get && body_header) && !(!same_origin_redirect && credential)
    });
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse().map_err(|source| Error::InvalidHeaderName {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value.parse().map_err(|source| Error::InvalidHeaderValue {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}
