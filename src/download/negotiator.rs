use crate::download::block_state::BlockState;
use crate::download::hash_tree::HashTree;
use crate::download::interval::{Interval, IntervalSet};
use crate::download::outcome::{ConnectionOutcome, NegotiationError, StreamError};
use crate::download::progress::TransferProgress;
use crate::download::protocol::{
    self, MAX_HEAD_LEN, MAX_LINE_LEN, ProtocolError, RangeRequest, ResponseHead,
};
use crate::download::rate_limit::{ConnectionClass, RateLimiter};
use crate::download::source::RemoteSource;
use crate::net::{BoxedStream, Connector};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;

type Result<T> = std::result::Result<T, NegotiationError>;

const READ_BUF: usize = 16 * 1024;
/// Unwanted body bytes up to this size are read and dropped to keep the
/// connection usable; larger leftovers close it.
const DRAIN_LIMIT: u64 = 64 * 1024;
const MAX_TREE_BODY: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct NegotiatorOptions {
    pub io_timeout: Duration,
    pub max_queue_position: u32,
    /// We can do firewall-to-firewall transfers.
    pub firewall_capable: bool,
    /// Bounds on the poll interval a remote queue may ask for.
    pub min_queue_poll: Duration,
    pub max_queue_poll: Duration,
}

impl Default for NegotiatorOptions {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(30),
            max_queue_position: 50,
            firewall_capable: true,
            min_queue_poll: Duration::from_secs(1),
            max_queue_poll: Duration::from_secs(180),
        }
    }
}

impl NegotiatorOptions {
    fn queue_poll(&self, asked: Duration) -> Duration {
        let floor = self.min_queue_poll.min(self.max_queue_poll);
        asked.clamp(floor, self.max_queue_poll)
    }
}

/// How a body transfer ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamEnd {
    pub written: u64,
    /// The window was cut short (range theft) before the body ended.
    pub stopped_early: bool,
}

#[derive(Debug, Clone, Copy)]
struct PendingBody {
    offset: u64,
    remaining: u64,
}

/// One connection to one source: range handshakes, gossip headers and body
/// streaming. Reusable across exchanges while the framing stays intact.
pub struct ConnectionNegotiator {
    stream: BufReader<BoxedStream>,
    source: RemoteSource,
    class: ConnectionClass,
    opts: NegotiatorOptions,
    body: Option<PendingBody>,
    alts: Vec<String>,
    nalts: Vec<String>,
    available: Option<IntervalSet>,
    tree_advertised: bool,
    reusable: bool,
}

impl ConnectionNegotiator {
    pub async fn connect(
        connector: &dyn Connector,
        source: &RemoteSource,
        connect_timeout: Duration,
        opts: NegotiatorOptions,
    ) -> Result<Self> {
        tracing::debug!(source = %source.address(), "connecting to source");
        let stream = connector
            .connect(&source.host, source.port, connect_timeout)
            .await
            .map_err(NegotiationError::CantConnect)?;
        Ok(Self::from_stream(stream, source, ConnectionClass::Direct, opts))
    }

    pub fn from_stream(
        stream: BoxedStream,
        source: &RemoteSource,
        class: ConnectionClass,
        opts: NegotiatorOptions,
    ) -> Self {
        Self {
            stream: BufReader::new(stream),
            source: source.clone(),
            class,
            opts,
            body: None,
            alts: Vec::new(),
            nalts: Vec::new(),
            available: None,
            tree_advertised: false,
            reusable: true,
        }
    }

    pub fn class(&self) -> ConnectionClass {
        self.class
    }

    pub fn is_reusable(&self) -> bool {
        self.reusable && self.body.is_none()
    }

    /// Ranges the source last said it has; `None` means the whole file.
    pub fn available_ranges(&self) -> Option<&IntervalSet> {
        self.available.as_ref()
    }

    pub fn tree_advertised(&self) -> bool {
        self.tree_advertised
    }

    /// Alternate locations received (good, failed) since the last call.
    pub fn take_alt_locations(&mut self) -> (Vec<String>, Vec<String>) {
        (std::mem::take(&mut self.alts), std::mem::take(&mut self.nalts))
    }

    /// Asks for `range`. Granted ranges may differ from the request; the
    /// caller re-clips its lease.
    pub async fn negotiate_range(
        &mut self,
        range: Interval,
        allow_queue: bool,
        alts: &[String],
        nalts: &[String],
    ) -> Result<ConnectionOutcome> {
        if !self.is_reusable() {
            return Err(NegotiationError::Closed);
        }
        let request = protocol::encode_range_request(&RangeRequest {
            host: &self.source.address(),
            content_hash: self.source.content_hash,
            file_name: &self.source.file_name,
            file_index: self.source.file_index,
            range,
            allow_queue,
            firewall_capable: self.opts.firewall_capable,
            alts,
            nalts,
        });
        self.send(&request).await?;
        let head = self.read_head().await?;
        let res = self.classify(&head, range, allow_queue);
        if !matches!(res, Ok(ConnectionOutcome::Connected { .. })) {
            self.skip_body(&head).await;
        }
        res
    }

    /// Asks for the hash tree over the same connection.
    pub async fn request_hash_tree(&mut self) -> Result<ConnectionOutcome> {
        if !self.is_reusable() {
            return Err(NegotiationError::Closed);
        }
        let Some(hash) = self.source.content_hash else {
            return Err(NegotiationError::NotFound);
        };
        self.send(&protocol::encode_tree_request(&self.source.address(), hash))
            .await?;
        let head = self.read_head().await?;
        match head.status {
            200 => {}
            404 | 410 => {
                self.skip_body(&head).await;
                return Err(NegotiationError::NotFound);
            }
            503 => {
                self.skip_body(&head).await;
                return Err(NegotiationError::Busy {
                    retry_after: head.retry_after(),
                });
            }
            code => {
                self.skip_body(&head).await;
                return Err(NegotiationError::UnknownCode(code));
            }
        }
        let len = head
            .content_length()?
            .ok_or_else(|| ProtocolError::BadContentLength("missing".to_string()))?;
        if len > MAX_TREE_BODY {
            self.reusable = false;
            return Err(ProtocolError::BadContentLength(len.to_string()).into());
        }
        let mut body = vec![0u8; len as usize];
        self.read_exact_timeout(&mut body, "tree body").await?;
        let tree: HashTree = serde_json::from_slice(&body).map_err(|err| {
            NegotiationError::Malformed(ProtocolError::BadHeaderLine(format!(
                "tree body: {err}"
            )))
        })?;
        if tree.file_size() != self.source.file_size {
            return Err(NegotiationError::ContentMismatch);
        }
        Ok(ConnectionOutcome::ThexResponse { tree })
    }

    /// Reads the granted body, handing every byte the progress window still
    /// owns to `blocks`. Stops early once the window is exhausted.
    pub async fn stream_into(
        &mut self,
        blocks: &BlockState,
        progress: &TransferProgress,
        limiter: &RateLimiter,
    ) -> std::result::Result<StreamEnd, StreamError> {
        let Some(mut body) = self.body.take() else {
            return Ok(StreamEnd::default());
        };
        let expected = body.remaining;
        let mut buf = vec![0u8; READ_BUF];
        let mut end = StreamEnd::default();
        while body.remaining > 0 {
            if progress.is_exhausted() {
                end.stopped_early = true;
                if body.remaining <= DRAIN_LIMIT {
                    self.drain(body.remaining).await;
                } else {
                    self.reusable = false;
                }
                break;
            }
            let want = (buf.len() as u64).min(body.remaining) as usize;
            let allowed = limiter.acquire(want).await;
            let n = match timeout(self.opts.io_timeout, self.stream.read(&mut buf[..allowed])).await
            {
                Ok(Ok(0)) => {
                    self.reusable = false;
                    return Err(StreamError::Truncated {
                        expected,
                        received: expected - body.remaining,
                    });
                }
                Ok(Ok(n)) => n,
                Ok(Err(err)) => {
                    self.reusable = false;
                    return Err(StreamError::Io(err));
                }
                Err(_) => {
                    self.reusable = false;
                    return Err(StreamError::Timeout);
                }
            };
            progress.record_bytes(n as u64);
            if let Some(claimed) = progress.accept(body.offset, n as u64) {
                let from = (claimed.low - body.offset) as usize;
                let to = from + claimed.len() as usize;
                blocks
                    .write(claimed, buf[from..to].to_vec())
                    .map_err(StreamError::Block)?;
                end.written += claimed.len();
            }
            body.offset += n as u64;
            body.remaining -= n as u64;
        }
        Ok(end)
    }

    fn classify(
        &mut self,
        head: &ResponseHead,
        requested: Interval,
        allow_queue: bool,
    ) -> Result<ConnectionOutcome> {
        self.alts.extend(head.alt_locations());
        self.nalts.extend(head.failed_alt_locations());
        if head.thex_uri().is_some() {
            self.tree_advertised = true;
        }
        if let Some(ranges) = head.available_ranges(self.source.file_size)? {
            self.available = Some(ranges);
        }
        if let (Some(ours), Some(theirs)) = (self.source.content_hash, head.content_urn())
            && ours != theirs
        {
            return Err(NegotiationError::ContentMismatch);
        }

        match head.status {
            200..=299 => {
                let granted = match head.content_range()? {
                    Some(cr) => {
                        if cr.total.is_some_and(|t| t != self.source.file_size) {
                            return Err(NegotiationError::ContentMismatch);
                        }
                        cr.interval
                    }
                    None => requested,
                };
                if granted.low > granted.high || granted.high >= self.source.file_size {
                    self.reusable = false;
                    return Err(NegotiationError::BadGrant { requested, granted });
                }
                if let Some(len) = head.content_length()?
                    && len != granted.len()
                {
                    self.reusable = false;
                    return Err(ProtocolError::BadContentLength(len.to_string()).into());
                }
                if !granted.overlaps(&requested) {
                    self.reusable = false;
                    return Err(NegotiationError::BadGrant { requested, granted });
                }
                self.body = Some(PendingBody {
                    offset: granted.low,
                    remaining: granted.len(),
                });
                Ok(ConnectionOutcome::Connected { granted })
            }
            503 => {
                if let Some(queue) = head.queue()? {
                    if !allow_queue {
                        return Err(NegotiationError::Busy {
                            retry_after: Some(self.opts.queue_poll(queue.poll_min)),
                        });
                    }
                    if queue.position > self.opts.max_queue_position {
                        return Err(NegotiationError::QueueFull {
                            position: queue.position,
                        });
                    }
                    return Ok(ConnectionOutcome::Queued {
                        position: queue.position,
                        poll: self.opts.queue_poll(queue.poll_min),
                    });
                }
                if self.available.is_some() {
                    return Err(NegotiationError::RangeNotAvailable {
                        available: self.available.clone(),
                    });
                }
                Err(NegotiationError::Busy {
                    retry_after: head.retry_after(),
                })
            }
            404 => Err(NegotiationError::NotFound),
            410 => Err(NegotiationError::NotSharing),
            416 => Err(NegotiationError::RangeNotAvailable {
                available: self.available.clone(),
            }),
            code => Err(NegotiationError::UnknownCode(code)),
        }
    }

    async fn send(&mut self, request: &str) -> Result<()> {
        let io_timeout = self.opts.io_timeout;
        let stream = self.stream.get_mut();
        match timeout(io_timeout, async {
            stream.write_all(request.as_bytes()).await?;
            stream.flush().await
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.reusable = false;
                Err(NegotiationError::io("write request", err))
            }
            Err(_) => {
                self.reusable = false;
                Err(NegotiationError::Timeout("write request"))
            }
        }
    }

    async fn read_head(&mut self) -> Result<ResponseHead> {
        let io_timeout = self.opts.io_timeout;
        let res = match timeout(io_timeout, read_head_capped(&mut self.stream)).await {
            Ok(r) => r,
            Err(_) => Err(NegotiationError::Timeout("read response head")),
        };
        match res {
            Ok(raw) => protocol::parse_response_head(&raw).map_err(|err| {
                self.reusable = false;
                if crate::logging::warn_throttled("malformed_response_head", Duration::from_secs(30)) {
                    tracing::warn!(source = %self.source.address(), error = %err, "malformed response head");
                }
                NegotiationError::Malformed(err)
            }),
            Err(err) => {
                self.reusable = false;
                Err(err)
            }
        }
    }

    async fn read_exact_timeout(&mut self, buf: &mut [u8], what: &'static str) -> Result<()> {
        match timeout(self.opts.io_timeout, self.stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => {
                self.reusable = false;
                Err(NegotiationError::io(what, err))
            }
            Err(_) => {
                self.reusable = false;
                Err(NegotiationError::Timeout(what))
            }
        }
    }

    async fn skip_body(&mut self, head: &ResponseHead) {
        match head.content_length() {
            Ok(None) | Ok(Some(0)) => {}
            Ok(Some(len)) if len <= DRAIN_LIMIT => self.drain(len).await,
            _ => self.reusable = false,
        }
    }

    async fn drain(&mut self, mut len: u64) {
        let mut buf = [0u8; 4096];
        while len > 0 {
            let want = (buf.len() as u64).min(len) as usize;
            match timeout(self.opts.io_timeout, self.stream.read(&mut buf[..want])).await {
                Ok(Ok(n)) if n > 0 => len -= n as u64,
                _ => {
                    self.reusable = false;
                    return;
                }
            }
        }
    }
}

/// Reads header lines up to the blank line; each line and the whole head
/// are size-capped.
async fn read_head_capped(reader: &mut BufReader<BoxedStream>) -> Result<Vec<u8>> {
    let mut head = Vec::new();
    loop {
        let mut line = Vec::new();
        let n = (&mut *reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| NegotiationError::io("read response head", e))?;
        if n == 0 {
            return Err(if head.is_empty() {
                NegotiationError::Closed
            } else {
                ProtocolError::MissingDelimiter.into()
            });
        }
        if line.len() > MAX_LINE_LEN || !line.ends_with(b"\n") {
            return Err(ProtocolError::HeadTooLarge(line.len()).into());
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        if line.is_empty() {
            if head.is_empty() {
                // Stray blank line between exchanges.
                continue;
            }
            return Ok(head);
        }
        if !head.is_empty() {
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(&line);
        if head.len() > MAX_HEAD_LEN {
            return Err(ProtocolError::HeadTooLarge(head.len()).into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::block_state::BlockOptions;
    use crate::download::hash_tree::ContentHash;
    use crate::download::selection::Sequential;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};

    fn source(size: u64) -> RemoteSource {
        RemoteSource::new("127.0.0.1", 6346, "f.bin", size)
    }

    fn negotiator(size: u64) -> (ConnectionNegotiator, DuplexStream) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let n = ConnectionNegotiator::from_stream(
            Box::new(client),
            &source(size),
            ConnectionClass::Direct,
            NegotiatorOptions {
                io_timeout: Duration::from_secs(2),
                max_queue_position: 10,
                ..NegotiatorOptions::default()
            },
        );
        (n, server)
    }

    async fn respond(server: &mut DuplexStream, head: &str, body: &[u8]) {
        // Consume the request head first.
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            server.read_exact(&mut byte).await.expect("read request");
            buf.push(byte[0]);
        }
        server.write_all(head.as_bytes()).await.expect("head");
        server.write_all(body).await.expect("body");
    }

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("rust-swarm-negotiator-{tag}-{nanos}"));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[tokio::test]
    async fn maps_status_codes_to_distinct_kinds() {
        let cases: Vec<(&str, fn(&Result<ConnectionOutcome>) -> bool)> = vec![
            ("HTTP/1.1 404 Not Found\r\n\r\n", |r| {
                matches!(r, Err(NegotiationError::NotFound))
            }),
            ("HTTP/1.1 410 Gone\r\n\r\n", |r| {
                matches!(r, Err(NegotiationError::NotSharing))
            }),
            ("HTTP/1.1 416 Range\r\nX-Available-Ranges: bytes 0-9\r\n\r\n", |r| {
                matches!(r, Err(NegotiationError::RangeNotAvailable { available: Some(_) }))
            }),
            ("HTTP/1.1 503 Busy\r\nRetry-After: 7\r\n\r\n", |r| {
                matches!(r, Err(NegotiationError::Busy { retry_after: Some(d) }) if d.as_secs() == 7)
            }),
            ("HTTP/1.1 503 Queued\r\nX-Queue: position=40,pollMin=1,pollMax=2\r\n\r\n", |r| {
                matches!(r, Err(NegotiationError::QueueFull { position: 40 }))
            }),
            ("HTTP/1.1 500 Oops\r\n\r\n", |r| {
                matches!(r, Err(NegotiationError::UnknownCode(500)))
            }),
            ("garbage\r\n\r\n", |r| matches!(r, Err(NegotiationError::Malformed(_)))),
        ];
        for (head, check) in cases {
            let (mut n, mut server) = negotiator(1000);
            let srv = tokio::spawn(async move {
                respond(&mut server, head, b"").await;
                server
            });
            let res = n.negotiate_range(Interval::new(0, 99), true, &[], &[]).await;
            assert!(check(&res), "{head:?} -> {res:?}");
            let _ = srv.await;
        }
    }

    #[tokio::test]
    async fn queued_reply_carries_position_and_poll() {
        let (mut n, mut server) = negotiator(1000);
        let srv = tokio::spawn(async move {
            respond(
                &mut server,
                "HTTP/1.1 503 Queued\r\nX-Queue: position=3,pollMin=2,pollMax=4\r\nContent-Length: 4\r\n\r\n",
                b"busy",
            )
            .await;
            server
        });
        let res = n
            .negotiate_range(Interval::new(0, 99), true, &[], &[])
            .await
            .expect("queued");
        assert_eq!(
            res,
            ConnectionOutcome::Queued {
                position: 3,
                poll: Duration::from_secs(2)
            }
        );
        assert!(n.is_reusable());
        let _ = srv.await;
    }

    #[tokio::test]
    async fn content_urn_mismatch_is_reported() {
        let (client, mut server) = tokio::io::duplex(4096);
        let src = source(1000).with_hash(ContentHash::digest(b"ours"));
        let mut n = ConnectionNegotiator::from_stream(
            Box::new(client),
            &src,
            ConnectionClass::Direct,
            NegotiatorOptions::default(),
        );
        let other = ContentHash::digest(b"theirs").to_urn();
        let srv = tokio::spawn(async move {
            let head = format!("HTTP/1.1 200 OK\r\nX-Content-URN: {other}\r\nContent-Length: 100\r\n\r\n");
            respond(&mut server, &head, &[0u8; 100]).await;
            server
        });
        let res = n.negotiate_range(Interval::new(0, 99), true, &[], &[]).await;
        assert!(matches!(res, Err(NegotiationError::ContentMismatch)));
        let _ = srv.await;
    }

    #[tokio::test]
    async fn connected_streams_granted_subrange_into_blocks() {
        let root = temp_dir("stream");
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let blocks = BlockState::open(
            root.join("f.part"),
            1000,
            BlockOptions::default(),
            Arc::new(Sequential),
            None,
        )
        .await
        .expect("open");
        let lease = blocks.lease_white(None, 1000).expect("lease");

        let (mut n, mut server) = negotiator(1000);
        let body = data[100..600].to_vec();
        let srv = tokio::spawn(async move {
            respond(
                &mut server,
                "HTTP/1.1 206 Partial\r\nContent-Range: bytes 100-599/1000\r\nContent-Length: 500\r\nX-Alt: 10.1.1.1:6346\r\n\r\n",
                &body,
            )
            .await;
            server
        });
        let granted = match n
            .negotiate_range(lease, true, &[], &[])
            .await
            .expect("negotiate")
        {
            ConnectionOutcome::Connected { granted } => granted,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(granted, Interval::new(100, 599));
        blocks.release(Interval::new(0, 99)).expect("release low");
        blocks.release(Interval::new(600, 999)).expect("release high");

        let progress = TransferProgress::new();
        progress.begin(granted);
        let end = n
            .stream_into(&blocks, &progress, &RateLimiter::unlimited())
            .await
            .expect("stream");
        assert_eq!(end.written, 500);
        assert!(!end.stopped_early);
        assert!(n.is_reusable());
        assert_eq!(n.take_alt_locations().0, vec!["10.1.1.1:6346".to_string()]);

        blocks.wait_for_outstanding_writes().await;
        assert_eq!(blocks.counts().verified, 500);
        let _ = srv.await;
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn hash_tree_request_parses_json_body() {
        let data = vec![5u8; 4096];
        let tree = HashTree::build(&data, 1024).expect("tree");
        let json = serde_json::to_vec(&tree).expect("json");
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let src = source(4096).with_hash(ContentHash::digest(&data));
        let mut n = ConnectionNegotiator::from_stream(
            Box::new(client),
            &src,
            ConnectionClass::Direct,
            NegotiatorOptions::default(),
        );
        let srv = tokio::spawn(async move {
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", json.len());
            respond(&mut server, &head, &json).await;
            server
        });
        match n.request_hash_tree().await.expect("tree") {
            ConnectionOutcome::ThexResponse { tree: got } => assert_eq!(got.root(), tree.root()),
            other => panic!("unexpected {other:?}"),
        }
        let _ = srv.await;
    }

    #[tokio::test]
    async fn oversized_header_line_is_malformed() {
        let (mut n, mut server) = negotiator(1000);
        let srv = tokio::spawn(async move {
            let long = format!("HTTP/1.1 200 OK\r\nX-Junk: {}\r\n\r\n", "a".repeat(MAX_LINE_LEN + 10));
            respond(&mut server, &long, b"").await;
            server
        });
        let res = n.negotiate_range(Interval::new(0, 9), true, &[], &[]).await;
        assert!(matches!(res, Err(NegotiationError::Malformed(ProtocolError::HeadTooLarge(_)))));
        assert!(!n.is_reusable());
        let _ = srv.await;
    }

    #[tokio::test]
    async fn grant_past_end_of_file_is_rejected() {
        for range in ["bytes 0-18446744073709551615/*", "bytes 990-1000/*"] {
            let (mut n, mut server) = negotiator(1000);
            let head = format!("HTTP/1.1 206 Partial\r\nContent-Range: {range}\r\n\r\n");
            let srv = tokio::spawn(async move {
                respond(&mut server, &head, b"").await;
                server
            });
            let res = n.negotiate_range(Interval::new(0, 99), true, &[], &[]).await;
            assert!(
                matches!(res, Err(NegotiationError::BadGrant { .. })),
                "{range} -> {res:?}"
            );
            assert!(!n.is_reusable());
            let _ = srv.await;
        }
    }

    #[tokio::test]
    async fn queue_poll_interval_is_clamped() {
        for (poll_min, expected) in [(0u64, 1u64), (100_000, 180)] {
            let (mut n, mut server) = negotiator(1000);
            let head = format!(
                "HTTP/1.1 503 Queued\r\nX-Queue: position=2,pollMin={poll_min},pollMax={poll_min}\r\n\r\n"
            );
            let srv = tokio::spawn(async move {
                respond(&mut server, &head, b"").await;
                server
            });
            let res = n
                .negotiate_range(Interval::new(0, 99), true, &[], &[])
                .await
                .expect("queued");
            assert_eq!(
                res,
                ConnectionOutcome::Queued {
                    position: 2,
                    poll: Duration::from_secs(expected)
                }
            );
            let _ = srv.await;
        }
    }
}
