use crate::download::hash_tree::ContentHash;
use crate::download::interval::{Interval, IntervalSet};
use std::collections::HashMap;
use std::time::Duration;

pub const MAX_HEAD_LEN: usize = 16 * 1024;
pub const MAX_LINE_LEN: usize = 8 * 1024;
pub const USER_AGENT: &str = "rust-swarm/0.1";
pub const FEATURES: &str = "fwt/1";
pub const QUEUE_VERSION: &str = "0.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    MissingDelimiter,
    HeadTooLarge(usize),
    NotUtf8,
    BadStatusLine(String),
    BadRequestLine(String),
    BadHeaderLine(String),
    BadContentRange(String),
    BadContentLength(String),
    BadAvailableRanges(String),
    BadQueue(String),
    BadRange(String),
    BadGiv(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingDelimiter => write!(f, "response head missing blank line"),
            Self::HeadTooLarge(n) => write!(f, "head too large: {n} > {MAX_HEAD_LEN}"),
            Self::NotUtf8 => write!(f, "head is not valid UTF-8"),
            Self::BadStatusLine(l) => write!(f, "bad status line: {l}"),
            Self::BadRequestLine(l) => write!(f, "bad request line: {l}"),
            Self::BadHeaderLine(l) => write!(f, "bad header line: {l}"),
            Self::BadContentRange(v) => write!(f, "bad Content-Range: {v}"),
            Self::BadContentLength(v) => write!(f, "bad Content-Length: {v}"),
            Self::BadAvailableRanges(v) => write!(f, "bad X-Available-Ranges: {v}"),
            Self::BadQueue(v) => write!(f, "bad X-Queue: {v}"),
            Self::BadRange(v) => write!(f, "bad Range: {v}"),
            Self::BadGiv(v) => write!(f, "bad GIV line: {v}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// One range request on a persistent connection.
#[derive(Debug, Clone)]
pub struct RangeRequest<'a> {
    pub host: &'a str,
    pub content_hash: Option<ContentHash>,
    pub file_name: &'a str,
    pub file_index: u64,
    pub range: Interval,
    pub allow_queue: bool,
    pub firewall_capable: bool,
    pub alts: &'a [String],
    pub nalts: &'a [String],
}

fn request_uri(hash: Option<ContentHash>, file_index: u64, file_name: &str) -> String {
    match hash {
        Some(h) => format!("/uri-res/N2R?{}", h.to_urn()),
        None => format!("/get/{file_index}/{}", file_name.replace(' ', "%20")),
    }
}

pub fn encode_range_request(req: &RangeRequest<'_>) -> String {
    let mut out = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {USER_AGENT}\r\n",
        request_uri(req.content_hash, req.file_index, req.file_name),
        req.host
    );
    if req.allow_queue {
        out.push_str(&format!("X-Queue: {QUEUE_VERSION}\r\n"));
    }
    if let Some(h) = req.content_hash {
        out.push_str(&format!("X-Content-URN: {}\r\n", h.to_urn()));
    }
    if !req.alts.is_empty() {
        out.push_str(&format!("X-Alt: {}\r\n", req.alts.join(", ")));
    }
    if !req.nalts.is_empty() {
        out.push_str(&format!("X-NAlt: {}\r\n", req.nalts.join(", ")));
    }
    if req.firewall_capable {
        out.push_str(&format!("X-Features: {FEATURES}\r\n"));
    }
    out.push_str(&format!(
        "Range: bytes={}-{}\r\n\r\n",
        req.range.low, req.range.high
    ));
    out
}

pub fn encode_tree_request(host: &str, hash: ContentHash) -> String {
    format!(
        "GET /uri-res/N2X?{} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: {USER_AGENT}\r\n\r\n",
        hash.to_urn()
    )
}

/// Serving side; used by local fixtures and tests.
pub fn encode_response_head(status: u16, reason: &str, headers: &[(&str, String)]) -> String {
    let mut out = format!("HTTP/1.1 {status} {reason}\r\n");
    for (k, v) in headers {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    out.push_str("\r\n");
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub interval: Interval,
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    pub position: u32,
    pub poll_min: Duration,
    pub poll_max: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    headers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub uri: String,
    headers: HashMap<String, String>,
}

/// Splits `raw` at the first blank line. Tolerates bare LF.
pub fn split_head(raw: &[u8]) -> Option<(&[u8], &[u8])> {
    if let Some(i) = find(raw, b"\r\n\r\n") {
        return Some((&raw[..i], &raw[i + 4..]));
    }
    find(raw, b"\n\n").map(|i| (&raw[..i], &raw[i + 2..]))
}

fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    hay.windows(needle.len()).position(|w| w == needle)
}

fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (k, v) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::BadHeaderLine(line.to_string()))?;
        let key = k.trim().to_ascii_lowercase();
        let value = v.trim().to_string();
        // Repeated headers fold into one comma list.
        headers
            .entry(key)
            .and_modify(|old: &mut String| {
                old.push_str(", ");
                old.push_str(&value);
            })
            .or_insert(value);
    }
    Ok(headers)
}

fn head_str(head: &[u8]) -> Result<&str> {
    if head.len() > MAX_HEAD_LEN {
        return Err(ProtocolError::HeadTooLarge(head.len()));
    }
    std::str::from_utf8(head).map_err(|_| ProtocolError::NotUtf8)
}

/// Parses a response head (without the trailing blank line).
pub fn parse_response_head(head: &[u8]) -> Result<ResponseHead> {
    let text = head_str(head)?;
    let mut lines = text.split('\n');
    let status_line = lines.next().unwrap_or_default().trim_end_matches('\r');
    let mut parts = status_line.splitn(3, ' ');
    let proto = parts.next().unwrap_or_default();
    if !proto.starts_with("HTTP/") {
        return Err(ProtocolError::BadStatusLine(status_line.to_string()));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|s| (100..600).contains(s))
        .ok_or_else(|| ProtocolError::BadStatusLine(status_line.to_string()))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();
    Ok(ResponseHead {
        status,
        reason,
        headers: parse_header_lines(lines)?,
    })
}

pub fn parse_request_head(head: &[u8]) -> Result<RequestHead> {
    let text = head_str(head)?;
    let mut lines = text.split('\n');
    let request_line = lines.next().unwrap_or_default().trim_end_matches('\r');
    let parts: Vec<&str> = request_line.split(' ').collect();
    let [method, uri, proto] = parts.as_slice() else {
        return Err(ProtocolError::BadRequestLine(request_line.to_string()));
    };
    if !proto.starts_with("HTTP/") {
        return Err(ProtocolError::BadRequestLine(request_line.to_string()));
    }
    Ok(RequestHead {
        method: method.to_string(),
        uri: uri.to_string(),
        headers: parse_header_lines(lines)?,
    })
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn range(&self) -> Result<Option<Interval>> {
        self.header("range").map(parse_range_header).transpose()
    }

    pub fn is_tree_request(&self) -> bool {
        self.uri.starts_with("/uri-res/N2X")
    }
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_length(&self) -> Result<Option<u64>> {
        self.header("content-length")
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|_| ProtocolError::BadContentLength(v.to_string()))
            })
            .transpose()
    }

    pub fn content_range(&self) -> Result<Option<ContentRange>> {
        self.header("content-range")
            .map(parse_content_range)
            .transpose()
    }

    pub fn available_ranges(&self, file_size: u64) -> Result<Option<IntervalSet>> {
        self.header("x-available-ranges")
            .map(|v| parse_available_ranges(v, file_size))
            .transpose()
    }

    pub fn queue(&self) -> Result<Option<QueueInfo>> {
        self.header("x-queue").map(parse_queue).transpose()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    pub fn content_urn(&self) -> Option<ContentHash> {
        self.header("x-content-urn")
            .and_then(|v| v.split(',').find_map(ContentHash::parse_urn))
    }

    pub fn alt_locations(&self) -> Vec<String> {
        split_list(self.header("x-alt"))
    }

    pub fn failed_alt_locations(&self) -> Vec<String> {
        split_list(self.header("x-nalt"))
    }

    pub fn thex_uri(&self) -> Option<&str> {
        self.header("x-thex-uri")
    }

    pub fn firewall_capable(&self) -> bool {
        self.header("x-features")
            .is_some_and(|v| v.split(',').any(|f| f.trim().starts_with("fwt/")))
    }
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_pair(s: &str) -> Option<(u64, u64)> {
    let (a, b) = s.trim().split_once('-')?;
    let low = a.trim().parse::<u64>().ok()?;
    let high = b.trim().parse::<u64>().ok()?;
    (low <= high).then_some((low, high))
}

fn strip_bytes_unit(s: &str) -> Option<&str> {
    let s = s.trim();
    if !s.get(..5)?.eq_ignore_ascii_case("bytes") {
        return None;
    }
    Some(s[5..].trim_start_matches([' ', '=']))
}

/// `bytes a-b/total`, `bytes a-b/*`, also `bytes=a-b/total`.
pub fn parse_content_range(value: &str) -> Result<ContentRange> {
    let bad = || ProtocolError::BadContentRange(value.to_string());
    let rest = strip_bytes_unit(value).ok_or_else(bad)?;
    let (range, total) = rest.split_once('/').ok_or_else(bad)?;
    let (low, high) = parse_pair(range).ok_or_else(bad)?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<u64>().map_err(|_| bad())?),
    };
    if total.is_some_and(|t| high >= t) {
        return Err(bad());
    }
    Ok(ContentRange {
        interval: Interval::new(low, high),
        total,
    })
}

/// `bytes a-b, c-d`; ranges are clipped to the file.
pub fn parse_available_ranges(value: &str, file_size: u64) -> Result<IntervalSet> {
    let bad = || ProtocolError::BadAvailableRanges(value.to_string());
    let rest = strip_bytes_unit(value).ok_or_else(bad)?;
    let mut set = IntervalSet::new();
    for part in rest.split(',').filter(|p| !p.trim().is_empty()) {
        let (low, high) = parse_pair(part).ok_or_else(bad)?;
        if low >= file_size {
            continue;
        }
        set.add(Interval::new(low, high.min(file_size.saturating_sub(1))));
    }
    Ok(set)
}

/// `position=3,length=10,limit=4,pollMin=2,pollMax=4`; poll values are
/// seconds.
pub fn parse_queue(value: &str) -> Result<QueueInfo> {
    let bad = || ProtocolError::BadQueue(value.to_string());
    let mut position = None;
    let mut poll_min = None;
    let mut poll_max = None;
    for part in value.split(',') {
        let Some((k, v)) = part.split_once('=') else {
            continue;
        };
        let v = v.trim();
        match k.trim().to_ascii_lowercase().as_str() {
            "position" => position = Some(v.parse::<u32>().map_err(|_| bad())?),
            "pollmin" => poll_min = Some(v.parse::<u64>().map_err(|_| bad())?),
            "pollmax" => poll_max = Some(v.parse::<u64>().map_err(|_| bad())?),
            _ => {}
        }
    }
    let position = position.ok_or_else(bad)?;
    let poll_min = poll_min.ok_or_else(bad)?;
    let poll_max = poll_max.unwrap_or(poll_min).max(poll_min);
    Ok(QueueInfo {
        position,
        poll_min: Duration::from_secs(poll_min),
        poll_max: Duration::from_secs(poll_max),
    })
}

/// `bytes=a-b`.
pub fn parse_range_header(value: &str) -> Result<Interval> {
    let rest = strip_bytes_unit(value).ok_or_else(|| ProtocolError::BadRange(value.to_string()))?;
    let (low, high) = parse_pair(rest).ok_or_else(|| ProtocolError::BadRange(value.to_string()))?;
    Ok(Interval::new(low, high))
}

pub fn render_available_ranges(set: &IntervalSet) -> String {
    let parts: Vec<String> = set.iter().map(|r| format!("{}-{}", r.low, r.high)).collect();
    format!("bytes {}", parts.join(", "))
}

/// First line a firewalled source sends after connecting back to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GivLine {
    pub file_index: u64,
    /// Lowercase hex client id.
    pub source_id: String,
    pub file_name: String,
}

/// `GIV <index>:<client id>/<file name>`.
pub fn parse_giv_line(line: &str) -> Result<GivLine> {
    let bad = || ProtocolError::BadGiv(line.to_string());
    let rest = line.trim_end_matches(['\r', '\n']);
    let rest = rest.strip_prefix("GIV ").ok_or_else(bad)?;
    let (index, rest) = rest.split_once(':').ok_or_else(bad)?;
    let (source_id, file_name) = rest.split_once('/').ok_or_else(bad)?;
    let file_index = index.trim().parse::<u64>().map_err(|_| bad())?;
    if source_id.is_empty() || !source_id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(bad());
    }
    Ok(GivLine {
        file_index,
        source_id: source_id.to_ascii_lowercase(),
        file_name: file_name.to_string(),
    })
}

pub fn encode_giv_line(file_index: u64, source_id: &str, file_name: &str) -> String {
    format!("GIV {file_index}:{source_id}/{file_name}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_request_carries_queue_alts_and_features() {
        let hash = ContentHash::digest(b"x");
        let alts = vec!["10.0.0.1:6346".to_string()];
        let req = encode_range_request(&RangeRequest {
            host: "10.0.0.2:6346",
            content_hash: Some(hash),
            file_name: "a b.bin",
            file_index: 3,
            range: Interval::new(100, 199),
            allow_queue: true,
            firewall_capable: true,
            alts: &alts,
            nalts: &[],
        });
        assert!(req.starts_with(&format!("GET /uri-res/N2R?{} HTTP/1.1\r\n", hash.to_urn())));
        assert!(req.contains("X-Queue: 0.1\r\n"));
        assert!(req.contains("X-Alt: 10.0.0.1:6346\r\n"));
        assert!(!req.contains("X-NAlt"));
        assert!(req.contains("X-Features: fwt/1\r\n"));
        assert!(req.ends_with("Range: bytes=100-199\r\n\r\n"));

        let (head, rest) = split_head(req.as_bytes()).expect("split");
        assert!(rest.is_empty());
        let parsed = parse_request_head(head).expect("parse");
        assert_eq!(parsed.range().expect("range"), Some(Interval::new(100, 199)));
    }

    #[test]
    fn parses_partial_content_head() {
        let raw = b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 50-99/1000\r\nContent-Length: 50\r\nX-Available-Ranges: bytes 0-99, 500-2000\r\nX-Alt: a:1, b:2\r\n\r\nBODY";
        let (head, body) = split_head(raw).expect("split");
        assert_eq!(body, b"BODY");
        let h = parse_response_head(head).expect("parse");
        assert!(h.is_success());
        assert_eq!(
            h.content_range().expect("cr"),
            Some(ContentRange {
                interval: Interval::new(50, 99),
                total: Some(1000)
            })
        );
        assert_eq!(h.content_length().expect("cl"), Some(50));
        let avail = h.available_ranges(1000).expect("avail").expect("some");
        assert_eq!(avail.as_slice(), &[Interval::new(0, 99), Interval::new(500, 999)]);
        assert_eq!(h.alt_locations(), vec!["a:1".to_string(), "b:2".to_string()]);
    }

    #[test]
    fn parses_queue_header_in_seconds() {
        let q = parse_queue("position=3, length=5, pollMin=2, pollMax=4").expect("queue");
        assert_eq!(q.position, 3);
        assert_eq!(q.poll_min, Duration::from_secs(2));
        assert_eq!(q.poll_max, Duration::from_secs(4));
        assert!(parse_queue("length=5").is_err());
    }

    #[test]
    fn content_range_variants() {
        assert!(parse_content_range("bytes=0-9/10").is_ok());
        assert_eq!(
            parse_content_range("bytes 0-9/*").expect("star").total,
            None
        );
        assert!(parse_content_range("bytes 0-10/10").is_err());
        assert!(parse_content_range("bytes 9-0/10").is_err());
        assert!(parse_content_range("items 0-9/10").is_err());
    }

    #[test]
    fn rejects_garbage_status_lines() {
        assert!(matches!(
            parse_response_head(b"HTTX/1.1 200 OK"),
            Err(ProtocolError::BadStatusLine(_))
        ));
        assert!(matches!(
            parse_response_head(b"HTTP/1.1 abc OK"),
            Err(ProtocolError::BadStatusLine(_))
        ));
        assert!(matches!(
            parse_response_head(b"HTTP/1.1 200 OK\r\nbroken"),
            Err(ProtocolError::BadHeaderLine(_))
        ));
        assert!(split_head(b"HTTP/1.1 200 OK\r\n").is_none());
    }

    #[test]
    fn available_ranges_render_parse_roundtrip() {
        let set: IntervalSet = [Interval::new(0, 9), Interval::new(20, 29)].into_iter().collect();
        let text = render_available_ranges(&set);
        assert_eq!(text, "bytes 0-9, 20-29");
        assert_eq!(parse_available_ranges(&text, 100).expect("parse"), set);
    }

    #[test]
    fn giv_lines_name_the_waiting_download() {
        let giv = parse_giv_line("GIV 7:ABCDEF01/some file.bin\r\n").expect("giv");
        assert_eq!(
            giv,
            GivLine {
                file_index: 7,
                source_id: "abcdef01".to_string(),
                file_name: "some file.bin".to_string(),
            }
        );
        assert_eq!(
            parse_giv_line(encode_giv_line(7, "abcdef01", "some file.bin").trim_end()),
            Ok(giv)
        );
        assert!(parse_giv_line("GET / HTTP/1.1").is_err());
        assert!(parse_giv_line("GIV x:ab/f").is_err());
        assert!(parse_giv_line("GIV 1:zz/f").is_err());
    }
}
