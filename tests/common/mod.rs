//! Scripted in-memory sources for swarm tests. Each fake source answers the
//! range protocol over a duplex pipe, so sessions run end to end without
//! touching the network.
#![allow(dead_code)]

use futures_util::future::BoxFuture;
use rust_swarm::download::hash_tree::HashTree;
use rust_swarm::download::interval::Interval;
use rust_swarm::download::protocol::{encode_response_head, parse_request_head};
use rust_swarm::net::{BoxedStream, Connector};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const PIPE_CAPACITY: usize = 64 * 1024;
const PIECE: usize = 16 * 1024;

/// How one fake source misbehaves.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Range requests answered with a queue slot before serving.
    pub queue_replies: usize,
    pub queue_position: u32,
    pub queue_poll_secs: u64,
    /// After this many served ranges every request gets a plain 503.
    pub busy_after: Option<usize>,
    /// Flips the byte at this offset the first time it is served.
    pub corrupt_once: Option<u64>,
    /// Sends the body `n` bytes at a time with a pause in between.
    pub trickle: Option<(usize, Duration)>,
    /// Pause after every body piece at full speed.
    pub pace: Option<Duration>,
    /// Served on `/uri-res/N2X` and advertised in every reply.
    pub tree: Option<HashTree>,
}

/// One request a fake source answered.
#[derive(Debug, Clone)]
pub struct Served {
    pub source: String,
    pub range: Option<Interval>,
    pub status: u16,
    pub at: Instant,
}

struct FakeSource {
    data: Arc<Vec<u8>>,
    script: Script,
    queued: AtomicUsize,
    ranges: AtomicUsize,
    corrupted: AtomicBool,
}

/// A set of fake sources reachable through `Connector`.
#[derive(Clone, Default)]
pub struct FakeSwarm {
    sources: Arc<Mutex<HashMap<String, Arc<FakeSource>>>>,
    log: Arc<Mutex<Vec<Served>>>,
    connects: Arc<AtomicUsize>,
}

impl FakeSwarm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, address: &str, data: Arc<Vec<u8>>, script: Script) {
        self.sources.lock().expect("sources").insert(
            address.to_string(),
            Arc::new(FakeSource {
                data,
                script,
                queued: AtomicUsize::new(0),
                ranges: AtomicUsize::new(0),
                corrupted: AtomicBool::new(false),
            }),
        );
    }

    pub fn served(&self) -> Vec<Served> {
        self.log.lock().expect("log").clone()
    }

    pub fn served_by(&self, address: &str) -> Vec<Served> {
        self.served()
            .into_iter()
            .filter(|s| s.source == address)
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

impl Connector for FakeSwarm {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        _connect_timeout: Duration,
    ) -> BoxFuture<'a, std::io::Result<BoxedStream>> {
        Box::pin(async move {
            let address = format!("{host}:{port}");
            let source = self.sources.lock().expect("sources").get(&address).cloned();
            let Some(source) = source else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("no fake source at {address}"),
                ));
            };
            self.connects.fetch_add(1, Ordering::Relaxed);
            let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
            tokio::spawn(serve(server, address, source, self.log.clone()));
            Ok(Box::new(client) as BoxedStream)
        })
    }
}

async fn read_request(stream: &mut DuplexStream) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.ok()?;
        buf.push(byte[0]);
    }
    Some(buf)
}

async fn reply(stream: &mut DuplexStream, status: u16, reason: &str, headers: &[(&str, String)]) -> bool {
    stream
        .write_all(encode_response_head(status, reason, headers).as_bytes())
        .await
        .is_ok()
}

async fn send_body(stream: &mut DuplexStream, body: &[u8], script: &Script) -> bool {
    let (step, pause) = match script.trickle {
        Some((n, pause)) => (n.max(1), Some(pause)),
        None => (PIECE, script.pace),
    };
    for piece in body.chunks(step) {
        if stream.write_all(piece).await.is_err() {
            return false;
        }
        if let Some(pause) = pause {
            tokio::time::sleep(pause).await;
        }
    }
    true
}

async fn serve(
    mut stream: DuplexStream,
    address: String,
    src: Arc<FakeSource>,
    log: Arc<Mutex<Vec<Served>>>,
) {
    let size = src.data.len() as u64;
    let record = |range: Option<Interval>, status: u16| {
        log.lock().expect("log").push(Served {
            source: address.clone(),
            range,
            status,
            at: Instant::now(),
        });
    };
    let thex = src
        .script
        .tree
        .as_ref()
        .map(|t| format!("/uri-res/N2X?root:{}", t.root_hex()));

    loop {
        let Some(raw) = read_request(&mut stream).await else {
            return;
        };
        let Ok(req) = parse_request_head(&raw) else {
            return;
        };

        if req.is_tree_request() {
            let Some(tree) = &src.script.tree else {
                record(None, 404);
                if !reply(&mut stream, 404, "Not Found", &[("Content-Length", "0".into())]).await {
                    return;
                }
                continue;
            };
            let body = serde_json::to_vec(tree).expect("tree json");
            record(None, 200);
            if !reply(&mut stream, 200, "OK", &[("Content-Length", body.len().to_string())]).await
                || stream.write_all(&body).await.is_err()
            {
                return;
            }
            continue;
        }

        let range = match req.range() {
            Ok(Some(r)) => r,
            Ok(None) => Interval::new(0, size.saturating_sub(1)),
            Err(_) => {
                record(None, 400);
                return;
            }
        };

        if src
            .script
            .busy_after
            .is_some_and(|limit| src.ranges.load(Ordering::SeqCst) >= limit)
        {
            record(Some(range), 503);
            let ok = reply(
                &mut stream,
                503,
                "Busy",
                &[("Retry-After", "60".into()), ("Content-Length", "0".into())],
            )
            .await;
            if !ok {
                return;
            }
            continue;
        }

        if src.queued.load(Ordering::SeqCst) < src.script.queue_replies {
            src.queued.fetch_add(1, Ordering::SeqCst);
            record(Some(range), 503);
            let queue = format!(
                "position={},length=10,limit=1,pollMin={},pollMax={}",
                src.script.queue_position,
                src.script.queue_poll_secs,
                src.script.queue_poll_secs * 2
            );
            if !reply(
                &mut stream,
                503,
                "Queued",
                &[("X-Queue", queue), ("Content-Length", "0".into())],
            )
            .await
            {
                return;
            }
            continue;
        }

        if range.low >= size {
            record(Some(range), 416);
            if !reply(&mut stream, 416, "Range Not Satisfiable", &[("Content-Length", "0".into())]).await {
                return;
            }
            continue;
        }

        let granted = Interval::new(range.low, range.high.min(size - 1));
        src.ranges.fetch_add(1, Ordering::SeqCst);
        record(Some(granted), 206);

        let mut body = src.data[granted.low as usize..=granted.high as usize].to_vec();
        if let Some(offset) = src.script.corrupt_once
            && granted.contains(offset)
            && !src.corrupted.swap(true, Ordering::SeqCst)
        {
            body[(offset - granted.low) as usize] ^= 0xff;
        }

        let mut headers = vec![
            (
                "Content-Range",
                format!("bytes {}-{}/{}", granted.low, granted.high, size),
            ),
            ("Content-Length", granted.len().to_string()),
        ];
        if let Some(uri) = &thex {
            headers.push(("X-Thex-URI", uri.clone()));
        }
        if !reply(&mut stream, 206, "Partial Content", &headers).await {
            return;
        }
        if !send_body(&mut stream, &body, &src.script).await {
            return;
        }
    }
}

/// Deterministic bytes that differ across offsets.
pub fn test_data(len: usize) -> Arc<Vec<u8>> {
    Arc::new((0..len).map(|i| (i * 31 % 251) as u8).collect())
}

pub fn temp_dir(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("rust-swarm-it-{tag}-{nanos}"));
    std::fs::create_dir_all(&dir).expect("mkdir");
    dir
}

pub async fn within<T>(limit: Duration, fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(limit, fut).await.expect("timed out")
}
