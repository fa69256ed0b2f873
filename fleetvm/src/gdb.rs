//! A GDB remote-serial-protocol stub (§4.12, §6): TCP port 2159, one client
//! at a time, 60-second accept timeout, loops until the client disconnects.
//! Implements enough framing and a handful of query responses to prove the
//! debug channel up; the full register/memory model is out of scope (it
//! belongs to the `Machine` back-end).

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use fleetvm_shared::{FleetError, FleetResult};

pub const GDB_STUB_PORT: u16 = 2159;
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sum of packet bytes mod 256 — the GDB remote-protocol checksum.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Frames `payload` as `$payload#xx`.
pub fn frame(payload: &str) -> String {
    format!("${payload}#{:02x}", checksum(payload.as_bytes()))
}

/// Parses a `$payload#xx` frame, verifying the checksum. `None` on a
/// malformed frame or checksum mismatch (the caller replies `-`).
pub fn parse_frame(raw: &str) -> Option<&str> {
    let body = raw.strip_prefix('$')?;
    let (payload, hex) = body.split_once('#')?;
    let expected = u8::from_str_radix(hex.get(..2)?, 16).ok()?;
    (checksum(payload.as_bytes()) == expected).then_some(payload)
}

/// Replies to the handful of GDB queries this stub understands (§4.12):
/// `?` (halt reason), `g` (register read — reported all-zero, since the
/// full register file is outside the `Machine` trait's exposed slice),
/// `qSupported`.
pub fn respond_to(payload: &str) -> Option<String> {
    match payload {
        "?" => Some("S05".to_string()),
        "g" => Some("0".repeat(32)),
        p if p.starts_with("qSupported") => Some("PacketSize=1024".to_string()),
        _ => None,
    }
}

/// Binds port 2159 and accepts exactly one client within the 60-second
/// budget, then serves it until it disconnects (§4.12).
pub fn serve_one_session() -> FleetResult<()> {
    let listener = TcpListener::bind(("0.0.0.0", GDB_STUB_PORT))
        .map_err(|e| FleetError::Engine(format!("gdb stub bind failed: {e}")))?;
    let stream = accept_with_timeout(&listener, ACCEPT_TIMEOUT)?;
    serve_session(stream)
}

fn accept_with_timeout(listener: &TcpListener, timeout: Duration) -> FleetResult<TcpStream> {
    listener
        .set_nonblocking(true)
        .map_err(|e| FleetError::Engine(format!("gdb stub configure failed: {e}")))?;
    let start = Instant::now();
    loop {
        match listener.accept() {
            Ok((stream, _)) => return Ok(stream),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() > timeout {
                    return Err(FleetError::MachineTimeout(
                        "gdb stub accept timed out".to_string(),
                    ));
                }
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => return Err(FleetError::Engine(format!("gdb stub accept failed: {e}"))),
        }
    }
}

fn serve_session(mut stream: TcpStream) -> FleetResult<()> {
    stream.set_nonblocking(false).ok();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream
            .read(&mut buf)
            .map_err(|e| FleetError::Engine(format!("gdb stub read failed: {e}")))?;
        if n == 0 {
            return Ok(());
        }
        let raw = String::from_utf8_lossy(&buf[..n]).into_owned();
        for chunk in raw.split('$').filter(|s| !s.is_empty()) {
            let reconstructed = format!("${chunk}");
            match parse_frame(&reconstructed) {
                Some(payload) => {
                    stream.write_all(b"+").ok();
                    if let Some(reply) = respond_to(payload) {
                        stream.write_all(frame(&reply).as_bytes()).ok();
                    }
                }
                None => {
                    stream.write_all(b"-").ok();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_and_parse_round_trip() {
        let framed = frame("qSupported");
        assert_eq!(parse_frame(&framed), Some("qSupported"));
    }

    #[test]
    fn parse_frame_rejects_bad_checksum() {
        assert_eq!(parse_frame("$g#00"), None);
    }

    #[test]
    fn respond_to_halt_reason_query() {
        assert_eq!(respond_to("?"), Some("S05".to_string()));
    }

    #[test]
    fn respond_to_unknown_query_is_none() {
        assert_eq!(respond_to("vMustReplyEmpty"), None);
    }

    #[test]
    fn checksum_is_sum_mod_256() {
        assert_eq!(checksum(b"g"), b'g');
        assert_eq!(checksum(&[0xFFu8, 0x02]), 0x01);
    }
}
