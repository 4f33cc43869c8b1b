use std::net::SocketAddr;
use std::sync::OnceLock;

/// Environment variable that turns on raw frame dumps.
const TRACE_FRAMES_ENV: &str = "VBMC_TRACE_FRAMES";

fn frame_tracing_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var(TRACE_FRAMES_ENV).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    })
}

/// Render bytes as a compact hex string, 16 bytes per line.
pub(crate) fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, chunk) in bytes.chunks(16).enumerate() {
        if i > 0 {
            out.push('\n');
        }
        for (j, b) in chunk.iter().enumerate() {
            if j > 0 {
                out.push(' ');
            }
            out.push_str(&format!("{b:02x}"));
        }
    }
    out
}

/// Trace a raw datagram when frame tracing is enabled.
pub(crate) fn trace_frame(direction: &str, peer: SocketAddr, bytes: &[u8]) {
    if !frame_tracing_enabled() {
        return;
    }
    tracing::trace!(
        direction,
        %peer,
        len = bytes.len(),
        "frame:\n{}",
        hex_dump(bytes)
    );
}
