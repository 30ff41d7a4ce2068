#![no_main]

use libfuzzer_sys::fuzz_target;
use rust_swarm::download::protocol::{
    parse_available_ranges, parse_content_range, parse_giv_line, parse_queue, parse_range_header,
    render_available_ranges,
};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let _ = parse_content_range(text);
    let _ = parse_range_header(text);
    let _ = parse_queue(text);
    let _ = parse_giv_line(text);
    if let Ok(set) = parse_available_ranges(text, 1 << 32) {
        let _ = render_available_ranges(&set);
    }
});
