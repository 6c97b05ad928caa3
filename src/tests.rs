use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use http::Method;
use serde_json::json;

use crate::body::Body;
use crate::client::Client;
use crate::config::RequestConfig;
use crate::cookie::{CookieStore, MemoryCookieJar};
use crate::error::ErrorCode;
use crate::headers::HeaderSink;
use crate::multi::ThreadMulti;
use crate::transport::{
    CompletedTransfer, MultiTransport, SharedWriter, TransferErrorKind, TransferInfo, Transport,
    TransportHandle, TransportOption,
};

const BASE_URL: &str = "http://scripted.test";

#[derive(Clone)]
struct Outcome {
    status: u16,
    error: TransferErrorKind,
    body: Bytes,
    headers: Vec<String>,
    delay: Duration,
}

impl Outcome {
    fn status(status: u16) -> Self {
        Self {
            status,
            error: TransferErrorKind::None,
            body: Bytes::from(format!("status {status}")),
            headers: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    fn error(error: TransferErrorKind) -> Self {
        Self {
            status: 0,
            error,
            body: Bytes::new(),
            headers: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    fn header(mut self, line: &str) -> Self {
        self.headers.push(line.to_owned());
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug)]
struct Performed {
    url: String,
    timeout: Duration,
    cookie: Option<String>,
    headers: Vec<String>,
}

#[derive(Default)]
struct Script {
    outcomes: Mutex<HashMap<String, VecDeque<Outcome>>>,
    performed: Mutex<Vec<Performed>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Script {
    fn respond(&self, path: &str, outcomes: impl IntoIterator<Item = Outcome>) {
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .insert(format!("{BASE_URL}{path}"), outcomes.into_iter().collect());
    }

    fn next_outcome(&self, url: &str) -> Outcome {
        let mut outcomes = self.outcomes.lock().expect("outcomes lock");
        let queue = outcomes.entry(url.to_owned()).or_default();
        let outcome = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        outcome.unwrap_or_else(|| Outcome::status(200))
    }

    fn performed(&self) -> Vec<Performed> {
        self.performed.lock().expect("performed lock").clone()
    }

    fn performed_paths(&self) -> Vec<String> {
        self.performed()
            .into_iter()
            .map(|performed| performed.url.trim_start_matches(BASE_URL).to_owned())
            .collect()
    }
}

#[derive(Clone, Default)]
struct ScriptedTransport {
    script: Arc<Script>,
}

struct ScriptedHandle {
    script: Arc<Script>,
    url: Option<String>,
    timeout: Duration,
    cookie: Option<String>,
    headers: Vec<String>,
    sink: Option<Arc<dyn HeaderSink>>,
    destination: Option<SharedWriter>,
    info: TransferInfo,
    error: TransferErrorKind,
}

impl Transport for ScriptedTransport {
    fn create_handle(&self) -> Box<dyn TransportHandle> {
        Box::new(ScriptedHandle {
            script: Arc::clone(&self.script),
            url: None,
            timeout: Duration::ZERO,
            cookie: None,
            headers: Vec::new(),
            sink: None,
            destination: None,
            info: TransferInfo::default(),
            error: TransferErrorKind::None,
        })
    }
}

impl TransportHandle for ScriptedHandle {
    fn reset(&mut self) {
        self.url = None;
        self.timeout = Duration::ZERO;
        self.cookie = None;
        self.headers.clear();
        self.sink = None;
        self.destination = None;
        self.info = TransferInfo::default();
        self.error = TransferErrorKind::None;
    }

    fn set_option(&mut self, option: TransportOption) -> crate::Result<()> {
        match option {
            TransportOption::Url(url) => self.url = Some(url),
            TransportOption::Timeout(timeout) => self.timeout = timeout,
            TransportOption::Cookie(cookie) => self.cookie = cookie,
            TransportOption::Headers(lines) => self.headers = lines,
            TransportOption::HeaderSink(sink) => self.sink = Some(sink),
            TransportOption::Destination(destination) => self.destination = destination,
            _ => {}
        }
        Ok(())
    }

    fn perform(&mut self) -> Option<Bytes> {
        let url = self.url.clone().unwrap_or_default();
        let outcome = self.script.next_outcome(&url);

        let running = self.script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.script
            .max_in_flight
            .fetch_max(running, Ordering::SeqCst);
        self.script
            .performed
            .lock()
            .expect("performed lock")
            .push(Performed {
                url: url.clone(),
                timeout: self.timeout,
                cookie: self.cookie.clone(),
                headers: self.headers.clone(),
            });
        thread::sleep(outcome.delay);
        self.script.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.info = TransferInfo {
            status: outcome.status,
            effective_url: url,
            size_download: outcome.body.len() as u64,
            ..TransferInfo::default()
        };
        if let Some(destination) = self.destination.as_mut()
            && destination.write_all(&outcome.body).is_err()
        {
            self.error = TransferErrorKind::Write;
            self.info.status = 0;
            return None;
        }
        self.error = outcome.error;
        if !outcome.error.is_none() {
            self.info.status = 0;
            return None;
        }
        if let Some(sink) = &self.sink {
            sink.on_header_line(&format!("HTTP/1.1 {} Scripted\r\n", outcome.status));
            for line in &outcome.headers {
                sink.on_header_line(&format!("{line}\r\n"));
            }
        }
        if self.destination.is_some() {
            return Some(Bytes::new());
        }
        Some(outcome.body)
    }

    fn info(&self) -> TransferInfo {
        self.info.clone()
    }

    fn error(&self) -> TransferErrorKind {
        self.error
    }

    fn error_message(&self) -> String {
        if self.error.is_none() {
            String::new()
        } else {
            format!("scripted {}", self.error)
        }
    }
}

/// Multi transport whose first polls fail and which loses the first finished
/// transfer it is asked for.
struct FlakyMulti {
    inner: ThreadMulti,
    poll_failures: Arc<AtomicUsize>,
    lose_next_removal: bool,
}

impl MultiTransport for FlakyMulti {
    fn add(&mut self, token: usize, handle: Box<dyn TransportHandle>) {
        self.inner.add(token, handle);
    }

    fn perform(&mut self) -> usize {
        self.inner.perform()
    }

    fn poll(&mut self, timeout: Duration) -> io::Result<()> {
        let remaining = self.poll_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.poll_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(io::Error::other("scripted poll failure"));
        }
        self.inner.poll(timeout)
    }

    fn remove(&mut self, token: usize) -> Option<CompletedTransfer> {
        let completed = self.inner.remove(token);
        if self.lose_next_removal && completed.is_some() {
            self.lose_next_removal = false;
            return None;
        }
        completed
    }
}

struct FlakyTransport {
    scripted: ScriptedTransport,
    poll_failures: Arc<AtomicUsize>,
}

impl Transport for FlakyTransport {
    fn create_handle(&self) -> Box<dyn TransportHandle> {
        self.scripted.create_handle()
    }

    fn create_multi(&self) -> Box<dyn MultiTransport> {
        Box::new(FlakyMulti {
            inner: ThreadMulti::new(),
            poll_failures: Arc::clone(&self.poll_failures),
            lose_next_removal: true,
        })
    }
}

fn scripted_client(concurrency: usize) -> (Client, Arc<Script>) {
    let transport = ScriptedTransport::default();
    let script = Arc::clone(&transport.script);
    let client = Client::builder()
        .transport(transport)
        .base_url(BASE_URL)
        .concurrency(concurrency)
        .build();
    (client, script)
}

fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).expect("write gzip fixture");
    encoder.finish().expect("finish gzip fixture")
}

#[test]
fn batch_yields_responses_in_enqueue_order_with_bounded_concurrency() {
    let (client, script) = scripted_client(3);
    for index in 0..10_u64 {
        script.respond(
            &format!("/item/{index}"),
            [Outcome::status(200)
                .body(format!("item {index}"))
                .delay(Duration::from_millis((10 - index) * 4))],
        );
    }

    let mut batch = client.batch();
    for index in 0..10 {
        batch
            .enqueue(Method::GET, format!("/item/{index}"), RequestConfig::new())
            .expect("enqueue should validate");
    }
    assert_eq!(batch.len(), 10);

    let bodies = batch
        .run_all()
        .map(|response| response.expect("response").text().expect("text"))
        .collect::<Vec<_>>();
    let expected = (0..10).map(|index| format!("item {index}")).collect::<Vec<_>>();
    assert_eq!(bodies, expected);
    assert!(script.max_in_flight.load(Ordering::SeqCst) <= 3);
    assert!(batch.is_empty());
}

#[test]
fn batch_concurrency_is_at_least_one() {
    let (client, _) = scripted_client(0);
    assert_eq!(client.batch().concurrency(), 1);
}

#[test]
fn batch_retries_failed_slots_within_their_round() {
    let (client, script) = scripted_client(5);
    script.respond(
        "/flaky",
        [
            Outcome::status(503),
            Outcome::status(429),
            Outcome::status(200).body("recovered"),
        ],
    );
    script.respond("/steady", [Outcome::status(200).body("steady")]);
    script.respond("/broken", [Outcome::status(500)]);
    script.respond("/refused", [Outcome::error(TransferErrorKind::Connect)]);

    let mut batch = client.batch();
    for path in ["/flaky", "/steady", "/broken", "/refused"] {
        batch
            .enqueue(Method::GET, path, RequestConfig::new().max_retry(2))
            .expect("enqueue");
    }
    let responses = batch
        .collect_all()
        .into_iter()
        .map(|response| response.expect("response"))
        .collect::<Vec<_>>();

    assert_eq!(responses[0].status_code(), 200);
    assert_eq!(responses[0].retry_count(), 2);
    assert_eq!(responses[0].text().expect("text"), "recovered");

    assert_eq!(responses[1].retry_count(), 0);

    assert_eq!(responses[2].status_code(), 500);
    assert_eq!(responses[2].retry_count(), 2);

    assert!(responses[3].is_failure());
    assert_eq!(responses[3].error_code(), TransferErrorKind::Connect);
    assert_eq!(responses[3].retry_count(), 0);
    assert_eq!(responses[3].error_message(), "scripted connect");

    let paths = script.performed_paths();
    assert_eq!(paths.iter().filter(|path| *path == "/flaky").count(), 3);
    assert_eq!(paths.iter().filter(|path| *path == "/broken").count(), 3);
    assert_eq!(paths.iter().filter(|path| *path == "/refused").count(), 1);
}

#[test]
fn batch_rounds_never_interleave() {
    let (client, script) = scripted_client(2);
    script.respond(
        "/slow",
        [
            Outcome::status(502).delay(Duration::from_millis(20)),
            Outcome::status(200).delay(Duration::from_millis(20)),
        ],
    );
    script.respond("/fast", [Outcome::status(200)]);
    script.respond("/next-round", [Outcome::status(200)]);

    let mut batch = client.batch();
    for path in ["/slow", "/fast", "/next-round"] {
        batch
            .enqueue(Method::GET, path, RequestConfig::new())
            .expect("enqueue");
    }
    let statuses = batch
        .collect_all()
        .into_iter()
        .map(|response| response.expect("response").status_code())
        .collect::<Vec<_>>();
    assert_eq!(statuses, vec![200, 200, 200]);

    let paths = script.performed_paths();
    let next_round = paths
        .iter()
        .position(|path| path == "/next-round")
        .expect("next round ran");
    let last_slow = paths
        .iter()
        .rposition(|path| path == "/slow")
        .expect("slow ran");
    assert!(last_slow < next_round, "performed order: {paths:?}");
}

#[test]
fn batch_survives_poll_failures_and_lost_transfers() {
    let scripted = ScriptedTransport::default();
    let script = Arc::clone(&scripted.script);
    let poll_failures = Arc::new(AtomicUsize::new(3));
    let client = Client::builder()
        .transport(FlakyTransport {
            scripted,
            poll_failures: Arc::clone(&poll_failures),
        })
        .base_url(BASE_URL)
        .build();
    script.respond(
        "/lost",
        [Outcome::status(200).delay(Duration::from_millis(30))],
    );

    let mut batch = client.batch();
    batch
        .enqueue(Method::GET, "/lost", RequestConfig::new())
        .expect("enqueue");
    let responses = batch.collect_all();
    assert_eq!(responses.len(), 1);
    let response = responses
        .into_iter()
        .next()
        .expect("one response")
        .expect("response");
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.retry_count(), 1);
    assert_eq!(poll_failures.load(Ordering::SeqCst), 0);
    assert_eq!(script.performed_paths().len(), 2);
}

#[test]
fn batch_reports_apply_errors_in_place() {
    let (client, _) = scripted_client(3);
    let mut batch = client.batch();
    batch
        .enqueue(Method::GET, "/before", RequestConfig::new())
        .expect("enqueue");
    batch
        .enqueue(
            Method::PUT,
            "/upload",
            RequestConfig::new().body(Body::File("/definitely/missing/file.bin".into())),
        )
        .expect("file is only opened when the request is applied");
    batch
        .enqueue(Method::GET, "/after", RequestConfig::new())
        .expect("enqueue");

    let results = batch.collect_all();
    assert!(results[0].is_ok());
    let error = results[1].as_ref().expect_err("missing body file");
    assert_eq!(error.code(), ErrorCode::ReadBodyFile);
    assert!(results[2].is_ok());
}

#[test]
fn enqueue_rejects_invalid_configuration_synchronously() {
    let client = Client::builder().transport(ScriptedTransport::default()).build();
    let mut batch = client.batch();
    let error = batch
        .enqueue(Method::GET, "", RequestConfig::new())
        .expect_err("empty url should fail");
    assert_eq!(error.code(), ErrorCode::InvalidUri);
    assert!(batch.is_empty());

    let error = Client::builder()
        .options(&json!({"maxRetry": -1}))
        .expect_err("negative retry budget should fail");
    assert_eq!(error.code(), ErrorCode::InvalidOption);
}

#[test]
fn standalone_request_retries_with_shortened_timeouts() {
    let (client, script) = scripted_client(1);
    script.respond(
        "/retry",
        [
            Outcome::error(TransferErrorKind::Timeout),
            Outcome::status(502),
            Outcome::status(200).body("done"),
        ],
    );

    let response = client
        .get("/retry", RequestConfig::new().timeout(Duration::from_secs(30)))
        .expect("request");
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.retry_count(), 2);
    assert_eq!(response.info("retry_count"), Some(&json!(2)));

    let timeouts = script
        .performed()
        .into_iter()
        .map(|performed| performed.timeout)
        .collect::<Vec<_>>();
    assert_eq!(
        timeouts,
        vec![
            Duration::from_secs(30),
            Duration::from_secs(1),
            Duration::from_secs(3)
        ]
    );
}

#[test]
fn standalone_request_returns_last_attempt_when_retries_run_out() {
    let (client, script) = scripted_client(1);
    script.respond("/down", [Outcome::error(TransferErrorKind::Timeout)]);

    let response = client
        .get(
            "/down",
            RequestConfig::new().timeout(Duration::ZERO).max_retry(1),
        )
        .expect("request");
    assert!(response.is_timeout());
    assert_eq!(response.retry_count(), 1);
    assert_eq!(response.status_code(), 0);

    let timeouts = script
        .performed()
        .into_iter()
        .map(|performed| performed.timeout)
        .collect::<Vec<_>>();
    assert_eq!(timeouts, vec![Duration::ZERO, Duration::ZERO]);
}

#[test]
fn cookies_from_one_response_are_sent_with_the_next_request() {
    let jar = Arc::new(MemoryCookieJar::new());
    let transport = ScriptedTransport::default();
    let script = Arc::clone(&transport.script);
    let client = Client::builder()
        .transport(transport)
        .base_url(BASE_URL)
        .cookie_jar(jar.clone())
        .build();
    script.respond(
        "/login",
        [Outcome::status(200).header("Set-Cookie: session=abc; Path=/")],
    );

    client.post("/login", RequestConfig::new()).expect("login");
    assert_eq!(jar.cookies(), vec!["session=abc; Path=/".to_owned()]);

    client
        .get("/profile", RequestConfig::new().cookie("lang", "en"))
        .expect("profile");
    let performed = script.performed();
    assert_eq!(performed[0].cookie, None);
    assert_eq!(performed[1].cookie.as_deref(), Some("session=abc; lang=en"));
}

#[test]
fn per_request_headers_replace_client_defaults_by_name() {
    let transport = ScriptedTransport::default();
    let script = Arc::clone(&transport.script);
    let client = Client::builder()
        .transport(transport)
        .base_url(BASE_URL)
        .try_default_header("X-Client", "default")
        .expect("header")
        .try_default_header("X-Keep", "kept")
        .expect("header")
        .build();

    client
        .get(
            "/headers",
            RequestConfig::new()
                .try_header("x-client", "override")
                .expect("header"),
        )
        .expect("request");

    let headers = &script.performed()[0].headers;
    assert!(headers.contains(&"x-keep: kept".to_owned()), "{headers:?}");
    assert!(headers.contains(&"x-client: override".to_owned()), "{headers:?}");
    assert!(!headers.iter().any(|line| line.ends_with("default")));
}

#[cfg(feature = "gzip")]
#[test]
fn gzip_response_decodes_once_into_structured_content() {
    let (client, script) = scripted_client(1);
    script.respond(
        "/gzip",
        [Outcome::status(200)
            .header("Content-Encoding: gzip")
            .body(gzip(br#"{"items":[1,2,3]}"#))],
    );

    let response = client.get("/gzip", RequestConfig::new()).expect("request");
    assert_eq!(
        response.to_structured().expect("structured"),
        json!({"items": [1, 2, 3]})
    );
    assert_eq!(
        response.raw_content().map(Bytes::len),
        Some(gzip(br#"{"items":[1,2,3]}"#).len())
    );
}

#[test]
fn download_streams_content_into_destination_and_response() {
    let (client, script) = scripted_client(1);
    script.respond(
        "/file",
        [Outcome::status(200).body(&b"downloaded bytes"[..])],
    );
    let destination = std::env::temp_dir().join(format!(
        "reqpool-download-{}-{}.bin",
        std::process::id(),
        line!()
    ));

    let response = client
        .download("/file", &destination, RequestConfig::new())
        .expect("download");
    let written = std::fs::read(&destination).expect("downloaded file");
    let _ = std::fs::remove_file(&destination);

    assert_eq!(written, b"downloaded bytes");
    assert_eq!(
        response.raw_content().map(|content| content.as_ref()),
        Some(&b"downloaded bytes"[..])
    );
}

#[test]
fn retried_download_keeps_only_the_last_attempt() {
    let (client, script) = scripted_client(1);
    script.respond(
        "/flaky-file",
        [
            Outcome::status(503).body(&b"first attempt body"[..]),
            Outcome::status(200).body(&b"final"[..]),
        ],
    );
    let destination = std::env::temp_dir().join(format!(
        "reqpool-download-{}-{}.bin",
        std::process::id(),
        line!()
    ));

    let response = client
        .download("/flaky-file", &destination, RequestConfig::new().max_retry(1))
        .expect("download");
    let written = std::fs::read(&destination).expect("downloaded file");
    let _ = std::fs::remove_file(&destination);

    assert_eq!(response.status_code(), 200);
    assert_eq!(written, b"final");
}

#[test]
fn failed_download_removes_the_partial_file() {
    let (client, script) = scripted_client(1);
    script.respond(
        "/missing",
        [Outcome::error(TransferErrorKind::Receive).body(&b"partial"[..])],
    );
    let destination = std::env::temp_dir().join(format!(
        "reqpool-download-{}-{}.bin",
        std::process::id(),
        line!()
    ));

    let response = client
        .download("/missing", &destination, RequestConfig::new())
        .expect("download");
    assert!(response.is_failure());
    assert!(!destination.exists());
}

#[test]
fn stream_body_is_sent_once_even_with_retry_budget() {
    let (client, script) = scripted_client(1);
    script.respond("/upload", [Outcome::status(503)]);

    let response = client
        .put(
            "/upload",
            RequestConfig::new()
                .max_retry(3)
                .body(Body::stream(io::Cursor::new(b"payload".to_vec()))),
        )
        .expect("request");

    assert_eq!(response.status_code(), 503);
    assert_eq!(script.performed_paths(), vec!["/upload".to_owned()]);
}
