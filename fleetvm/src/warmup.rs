//! The warmup subsystem (§4.4): an external TCP/Unix client that exercises
//! the master guest's accept path with real connections before the Master
//! is frozen, driving its JIT and lazy initializers. Runs on its own OS
//! threads, concurrently with the Master's own run loop on the boot thread.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::unix::net::UnixStream;
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use fleetvm_shared::{FleetError, FleetResult};

/// Where the warmup client connects — mirrors `Endpoint` but owns a
/// connectable address rather than a validated one (§4.4 step 1: "read the
/// master's tracked listener host address via getsockname").
#[derive(Debug, Clone)]
pub enum WarmupTarget {
    Tcp(SocketAddr),
    /// Ported from the original's `unix:`-prefixed target dispatch
    /// (`original_source/src/warmup.cpp`).
    Unix(PathBuf),
}

impl WarmupTarget {
    /// Parses a `unix:`-prefixed path or a TCP socket address, matching the
    /// original's `connect_and_send_request` dispatch.
    pub fn parse(addr: &str) -> FleetResult<Self> {
        if let Some(path) = addr.strip_prefix("unix:") {
            return Ok(WarmupTarget::Unix(PathBuf::from(path)));
        }
        addr.parse::<SocketAddr>()
            .map(WarmupTarget::Tcp)
            .map_err(|e| FleetError::Config(format!("invalid warmup target '{addr}': {e}")))
    }
}

/// Warmup tuning, derived from `Configuration` (§6 `-w/--warmup`,
/// `warmup_intra_connect_requests`, `warmup_threads`, `warmup_path`).
#[derive(Debug, Clone)]
pub struct WarmupConfig {
    /// `W`: number of client threads (§4.4 step 2, "compile-time constant,
    /// small"; exposed here as a configured value rather than fixed at
    /// compile time, matching `Configuration::warmup_threads`).
    pub threads: u32,
    /// Connections opened in sequence by each thread.
    pub connections_per_thread: u32,
    /// Requests sent per connection (`warmup_intra_connect_requests`).
    pub requests_per_connection: u32,
    pub path: String,
}

impl WarmupConfig {
    /// Total count of freed accepted sockets the master's warmup hooks
    /// should expect (`W × warmup_connect_requests`, §4.4 step 3).
    pub fn expected_freed_sockets(&self) -> u32 {
        self.threads * self.connections_per_thread
    }
}

/// A spawned warmup run; `join` blocks until every client thread completes
/// (§4.4 step 5: "warmup threads are joined before freeze").
pub struct WarmupHandle {
    threads: Vec<std::thread::JoinHandle<FleetResult<()>>>,
}

impl WarmupHandle {
    pub fn join(self) -> FleetResult<()> {
        let mut first_err = None;
        for handle in self.threads {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => first_err.get_or_insert(e),
                Err(_) => first_err.get_or_insert(FleetError::Engine(
                    "warmup client thread panicked".to_string(),
                )),
            };
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

const SOCKET_TIMEOUT: Duration = Duration::from_secs(1);

/// Spawns `config.threads` client threads against `target` (§4.4 step 2).
pub fn spawn(target: WarmupTarget, config: WarmupConfig) -> WarmupHandle {
    let threads = (0..config.threads)
        .map(|_| {
            let target = target.clone();
            let config = config.clone();
            std::thread::spawn(move || run_client_thread(&target, &config))
        })
        .collect();
    WarmupHandle { threads }
}

fn run_client_thread(target: &WarmupTarget, config: &WarmupConfig) -> FleetResult<()> {
    for conn_idx in 0..config.connections_per_thread {
        let is_last_connection = conn_idx + 1 == config.connections_per_thread;
        send_requests_on_one_connection(target, config, is_last_connection)?;
    }
    Ok(())
}

fn send_requests_on_one_connection(
    target: &WarmupTarget,
    config: &WarmupConfig,
    is_last_connection: bool,
) -> FleetResult<()> {
    match target {
        WarmupTarget::Tcp(addr) => {
            let stream = TcpStream::connect(addr)
                .map_err(|e| FleetError::Engine(format!("warmup connect failed: {e}")))?;
            stream.set_read_timeout(Some(SOCKET_TIMEOUT)).ok();
            stream.set_write_timeout(Some(SOCKET_TIMEOUT)).ok();
            drive_requests(stream, config, is_last_connection)
        }
        WarmupTarget::Unix(path) => {
            let stream = UnixStream::connect(path)
                .map_err(|e| FleetError::Engine(format!("warmup connect failed: {e}")))?;
            stream.set_read_timeout(Some(SOCKET_TIMEOUT)).ok();
            stream.set_write_timeout(Some(SOCKET_TIMEOUT)).ok();
            drive_requests(stream, config, is_last_connection)
        }
    }
}

/// Sends `requests_per_connection` minimal HTTP/1.1 GETs over `stream`,
/// reading each response fully; the last request on the last connection
/// carries `Connection: close` (§4.4 step 2).
fn drive_requests<S: Read + Write>(mut stream: S, config: &WarmupConfig, is_last_connection: bool) -> FleetResult<()> {
    for req_idx in 0..config.requests_per_connection {
        let is_last_request = is_last_connection && req_idx + 1 == config.requests_per_connection;
        let connection_header = if is_last_request { "close" } else { "keep-alive" };
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: fleetvm\r\nConnection: {connection_header}\r\n\r\n",
            path = config.path,
        );
        stream
            .write_all(request.as_bytes())
            .map_err(|e| FleetError::Engine(format!("warmup request write failed: {e}")))?;

        read_one_response(&mut stream)?;
    }
    Ok(())
}

/// Reads until the connection closes or a reasonably-sized buffer fills;
/// the warmup client does not parse `Content-Length` — it only needs the
/// guest to observe a full request/response cycle, not a protocol-correct
/// client.
fn read_one_response<S: Read>(stream: &mut S) -> FleetResult<()> {
    let mut buf = [0u8; 4096];
    match stream.read(&mut buf) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => Ok(()),
        Err(e) => Err(FleetError::Engine(format!("warmup response read failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn warmup_target_parses_unix_prefix() {
        match WarmupTarget::parse("unix:/tmp/app.sock").unwrap() {
            WarmupTarget::Unix(p) => assert_eq!(p, PathBuf::from("/tmp/app.sock")),
            _ => panic!("expected Unix target"),
        }
    }

    #[test]
    fn warmup_target_parses_tcp_socket_addr() {
        match WarmupTarget::parse("127.0.0.1:8080").unwrap() {
            WarmupTarget::Tcp(addr) => assert_eq!(addr.port(), 8080),
            _ => panic!("expected Tcp target"),
        }
    }

    #[test]
    fn expected_freed_sockets_multiplies_threads_by_connections() {
        let config = WarmupConfig {
            threads: 4,
            connections_per_thread: 50,
            requests_per_connection: 5,
            path: "/".to_string(),
        };
        assert_eq!(config.expected_freed_sockets(), 200);
    }

    #[test]
    fn drive_requests_sets_close_only_on_final_request_of_final_connection() {
        let config = WarmupConfig {
            threads: 1,
            connections_per_thread: 1,
            requests_per_connection: 2,
            path: "/ping".to_string(),
        };
        let mut recorded = Vec::new();
        {
            let mut sink = RecordingStream { sent: &mut recorded, response: Cursor::new(b"HTTP/1.1 200 OK\r\n\r\n".to_vec()) };
            drive_requests(&mut sink, &config, true).unwrap();
        }
        let text = String::from_utf8(recorded.concat()).unwrap();
        assert_eq!(text.matches("Connection: close").count(), 1);
        assert_eq!(text.matches("Connection: keep-alive").count(), 1);
    }

    struct RecordingStream<'a> {
        sent: &'a mut Vec<Vec<u8>>,
        response: Cursor<Vec<u8>>,
    }

    impl<'a> Write for RecordingStream<'a> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.sent.push(buf.to_vec());
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> Read for RecordingStream<'a> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.response.read(buf)
        }
    }
}
