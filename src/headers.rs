//! Raw response header capture.
//!
//! Transports report each raw header line through a [`HeaderSink`]. The
//! [`HeaderCapture`] sink folds those lines into a [`ResponseHeaders`]
//! multi-map, starting a fresh block whenever a status line arrives (once per
//! redirect hop) while carrying `Set-Cookie` values forward so cookies set by
//! intermediate hops survive.

use std::sync::Mutex;

use crate::util::lock_unpoisoned;

const STATUS_LINE_PREFIX: &str = "HTTP/";
const SET_COOKIE: &str = "set-cookie";

/// Receives raw response header lines as the transport reads them.
pub trait HeaderSink: Send + Sync {
    fn on_header_line(&self, line: &str);
}

/// Case-insensitive multi-valued header map that keeps the original spelling
/// of each header name for display.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    entries: Vec<(String, Vec<String>)>,
}

impl ResponseHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(index) => self.entries[index].1.push(value),
            None => self.entries.push((name, vec![value])),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.position(name)
            .map(|index| self.entries[index].1.as_slice())
    }

    /// All values for `name` joined with `", "`.
    pub fn get_line(&self, name: &str) -> Option<String> {
        self.get(name).map(|values| values.join(", "))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }

    fn retain_set_cookie(&mut self) {
        self.entries
            .retain(|(name, _)| name.eq_ignore_ascii_case(SET_COOKIE));
    }

    /// Applies one raw header line to the map.
    pub fn capture_line(&mut self, raw_line: &str) {
        let line = raw_line.trim_end_matches(['\r', '\n']);
        if line.starts_with(STATUS_LINE_PREFIX) {
            self.retain_set_cookie();
            return;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if name.is_empty() {
                return;
            }
            self.append(name, value.trim());
        }
    }
}

/// [`HeaderSink`] that accumulates lines for the handle wrapper owning it.
#[derive(Debug, Default)]
pub struct HeaderCapture {
    headers: Mutex<ResponseHeaders>,
}

impl HeaderCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.headers).clear();
    }

    pub fn snapshot(&self) -> ResponseHeaders {
        lock_unpoisoned(&self.headers).clone()
    }
}

impl HeaderSink for HeaderCapture {
    fn on_header_line(&self, line: &str) {
        lock_unpoisoned(&self.headers).capture_line(line);
    }
}
