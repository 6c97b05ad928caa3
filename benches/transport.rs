use std::hint::black_box;
use std::io::{Cursor, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use reqpool::prelude::{Body, Client, Method, RequestConfig};
use reqpool::{HeaderCapture, HeaderSink};

/// Keep-alive server answering every request with `200 OK` and a fixed body.
struct KeepAliveServer {
    address: String,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl KeepAliveServer {
    fn start(body: &'static [u8]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind bench server");
        let address = listener.local_addr().expect("bench server address").to_string();
        listener
            .set_nonblocking(true)
            .expect("set bench listener nonblocking");

        let stop = Arc::new(AtomicBool::new(false));
        let stop_accepting = Arc::clone(&stop);
        let join = thread::spawn(move || {
            let mut connections = Vec::new();
            while !stop_accepting.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let stop = Arc::clone(&stop_accepting);
                        connections.push(thread::spawn(move || serve(stream, body, &stop)));
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Err(_) => break,
                }
            }
            for connection in connections {
                let _ = connection.join();
            }
        });

        Self {
            address,
            stop,
            join: Some(join),
        }
    }

    fn base_url(&self) -> String {
        format!("http://{}", self.address)
    }
}

impl Drop for KeepAliveServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = TcpStream::connect(&self.address);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn serve(mut stream: TcpStream, body: &[u8], stop: &AtomicBool) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let mut head = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
        body.len()
    )
    .into_bytes();
    head.extend_from_slice(body);

    let mut pending = Vec::new();
    let mut chunk = [0_u8; 16 * 1024];
    while !stop.load(Ordering::Relaxed) {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(read) => pending.extend_from_slice(&chunk[..read]),
        }
        // Answer every complete request buffered so far.
        while let Some(length) = complete_request_length(&pending) {
            pending.drain(..length);
            if stream.write_all(&head).is_err() {
                return;
            }
        }
    }
}

fn complete_request_length(raw: &[u8]) -> Option<usize> {
    let header_end = raw.windows(4).position(|window| window == b"\r\n\r\n")? + 4;
    let content_length = String::from_utf8_lossy(&raw[..header_end])
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    (raw.len() >= header_end + content_length).then_some(header_end + content_length)
}

fn benchmark_client(base_url: &str, concurrency: usize) -> Client {
    Client::builder()
        .base_url(base_url)
        .timeout(Duration::from_secs(2))
        .max_retry(0)
        .concurrency(concurrency)
        .build()
}

fn bench_config_merge(c: &mut Criterion) {
    let defaults = RequestConfig::defaults()
        .base_url("http://127.0.0.1:8080")
        .try_header("x-tenant", "bench")
        .expect("valid default header")
        .cookie("session", "abc")
        .query_pair("locale", "en");
    let overrides = RequestConfig::new()
        .url("/v1/items")
        .try_header("x-trace", "1")
        .expect("valid override header")
        .query_pairs([("page", "2"), ("limit", "50")])
        .timeout(Duration::from_secs(1));

    let mut group = c.benchmark_group("config");
    group.bench_function("merge", |b| {
        b.iter(|| black_box(RequestConfig::merge(&defaults, &overrides)));
    });
    let merged = RequestConfig::merge(&defaults, &overrides);
    group.bench_function("build_full_url", |b| {
        b.iter(|| black_box(merged.build_full_url().expect("full url should build")));
    });
    group.finish();
}

fn bench_header_capture(c: &mut Criterion) {
    let lines = [
        "HTTP/1.1 302 Found\r\n",
        "Location: /next\r\n",
        "Set-Cookie: first=1\r\n",
        "\r\n",
        "HTTP/1.1 200 OK\r\n",
        "Content-Type: application/json\r\n",
        "Content-Length: 11\r\n",
        "Set-Cookie: second=2\r\n",
        "Cache-Control: no-store\r\n",
        "\r\n",
    ];

    c.bench_function("header_capture_two_hops", |b| {
        b.iter(|| {
            let capture = HeaderCapture::new();
            for line in lines {
                capture.on_header_line(line);
            }
            black_box(capture.snapshot())
        });
    });
}

fn bench_small_get_latency(c: &mut Criterion) {
    let server = KeepAliveServer::start(br#"{"ok":true}"#);
    let client = benchmark_client(&server.base_url(), 1);

    let mut group = c.benchmark_group("small_get_latency");
    group.sample_size(80);
    group.bench_function("get_200_json", |b| {
        b.iter(|| {
            let response = client
                .get("/v1/ping", RequestConfig::new())
                .expect("small get request should succeed");
            black_box(response.status_code());
        });
    });
    group.finish();
}

fn bench_batch_throughput(c: &mut Criterion) {
    let server = KeepAliveServer::start(br#"{"ok":true}"#);

    let mut group = c.benchmark_group("batch_throughput");
    group.sample_size(30);

    for concurrency in [1_usize, 4, 16] {
        let client = benchmark_client(&server.base_url(), concurrency);
        group.throughput(Throughput::Elements(32));
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &concurrency,
            |b, _| {
                b.iter(|| {
                    let mut batch = client.batch();
                    for page in 0..32 {
                        batch
                            .enqueue(
                                Method::GET,
                                "/v1/items",
                                RequestConfig::new().query_pair("page", page.to_string()),
                            )
                            .expect("batch request should enqueue");
                    }
                    for response in batch.run_all() {
                        black_box(
                            response
                                .expect("batch request should apply")
                                .status_code(),
                        );
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_upload_modes(c: &mut Criterion) {
    const PAYLOAD_BYTES: usize = 256 * 1024;

    let server = KeepAliveServer::start(b"ok");
    let client = benchmark_client(&server.base_url(), 1);
    let payload = Bytes::from(vec![b'x'; PAYLOAD_BYTES]);

    let mut group = c.benchmark_group("upload_256k");
    group.sample_size(40);
    group.throughput(Throughput::Bytes(PAYLOAD_BYTES as u64));

    group.bench_function("buffered", |b| {
        b.iter(|| {
            let response = client
                .post("/v1/upload", RequestConfig::new().body(payload.clone()))
                .expect("buffered upload should succeed");
            black_box(response.status_code());
        });
    });

    group.bench_function("streamed", |b| {
        b.iter(|| {
            let reader = Cursor::new(payload.clone());
            let response = client
                .post(
                    "/v1/upload",
                    RequestConfig::new()
                        .body(Body::stream(reader))
                        .try_header("content-length", &PAYLOAD_BYTES.to_string())
                        .expect("valid content-length header"),
                )
                .expect("stream upload should succeed");
            black_box(response.status_code());
        });
    });

    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_secs(2))
        .measurement_time(Duration::from_secs(8));
    targets = bench_config_merge, bench_header_capture, bench_small_get_latency,
        bench_batch_throughput, bench_upload_modes
);
criterion_main!(benches);
