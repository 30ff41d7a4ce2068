#![no_main]

use libfuzzer_sys::fuzz_target;
use rust_swarm::download::protocol::{parse_request_head, parse_response_head, split_head};

fuzz_target!(|data: &[u8]| {
    let head = match split_head(data) {
        Some((head, _body)) => head,
        None => data,
    };
    if let Ok(resp) = parse_response_head(head) {
        let _ = resp.content_length();
        let _ = resp.content_range();
        let _ = resp.available_ranges(1 << 40);
        let _ = resp.queue();
        let _ = resp.retry_after();
        let _ = resp.content_urn();
        let _ = resp.alt_locations();
    }
    if let Ok(req) = parse_request_head(head) {
        let _ = req.range();
        let _ = req.is_tree_request();
    }
});
