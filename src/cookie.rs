use std::fmt;
use std::sync::Mutex;

use crate::util::lock_unpoisoned;

/// Storage for cookies received through `Set-Cookie` headers.
///
/// Implementations must tolerate concurrent calls.
pub trait CookieStore: Send + Sync {
    fn add_cookie(&self, raw_cookie: &str);

    fn cookies(&self) -> Vec<String>;

    fn save_cookies(&self, cookies: Vec<String>);
}

/// Append-only in-memory cookie list that ignores exact duplicates.
#[derive(Default)]
pub struct MemoryCookieJar {
    cookies: Mutex<Vec<String>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for MemoryCookieJar {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MemoryCookieJar")
            .field("len", &lock_unpoisoned(&self.cookies).len())
            .finish()
    }
}

impl CookieStore for MemoryCookieJar {
    fn add_cookie(&self, raw_cookie: &str) {
        let raw_cookie = raw_cookie.trim();
        if raw_cookie.is_empty() {
            return;
        }
        let mut cookies = lock_unpoisoned(&self.cookies);
        if !cookies.iter().any(|existing| existing == raw_cookie) {
            cookies.push(raw_cookie.to_owned());
        }
    }

    fn cookies(&self) -> Vec<String> {
        lock_unpoisoned(&self.cookies).clone()
    }

    fn save_cookies(&self, cookies: Vec<String>) {
        *lock_unpoisoned(&self.cookies) = cookies;
    }
}

/// `name=value` part of a raw `Set-Cookie` value, without its attributes.
pub(crate) fn cookie_pair(raw_cookie: &str) -> Option<(&str, &str)> {
    let pair = raw_cookie.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}

/// Builds a `Cookie` header value from stored cookies and per-request
/// cookies. Per-request values win on name collision.
pub(crate) fn build_cookie_header<'a>(
    stored: &[String],
    request_cookies: impl IntoIterator<Item = (&'a String, &'a String)>,
) -> Option<String> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut upsert = |name: &str, value: &str| match pairs
        .iter_mut()
        .find(|(existing, _)| existing == name)
    {
        Some(entry) => entry.1 = value.to_owned(),
        None => pairs.push((name.to_owned(), value.to_owned())),
    };

    for raw_cookie in stored {
        if let Some((name, value)) = cookie_pair(raw_cookie) {
            upsert(name, value);
        }
    }
    for (name, value) in request_cookies {
        upsert(name, value);
    }

    if pairs.is_empty() {
        return None;
    }
    Some(
        pairs
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; "),
    )
}
