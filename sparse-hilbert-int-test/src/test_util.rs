//! Shared helpers for the integration tests: logging setup, index fixtures
//! and a minimal loopback HTTP server for exercising range requests.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sparse_hilbert::{create_index, IndexConfig, LineCodec, SpatialIndex};
use tempfile::TempDir;

pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .is_test(true)
        .try_init();
}

/// Parses a record of comma-separated numbers into its coordinates.
pub fn csv_point(record: &String) -> Vec<f64> {
    record.split(',').map(|s| s.parse().unwrap()).collect()
}

pub fn write_lines(path: &Path, lines: &[String]) {
    let mut content = String::new();
    for l in lines {
        content.push_str(l);
        content.push('\n');
    }
    std::fs::write(path, content).unwrap();
}

pub type CsvIndex = SpatialIndex<LineCodec, fn(&String) -> Vec<f64>>;

/// Builds an index over the given CSV lines inside a fresh temp directory and
/// returns the directory (keep it alive), the index and the sorted data path.
pub fn build_csv_index(lines: &[String], bits: u32, dimensions: u32) -> (TempDir, CsvIndex, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.txt");
    write_lines(&input, lines);
    let sorted = dir.path().join("sorted.txt");
    let config = IndexConfig::new(bits, dimensions).unwrap();
    let index = create_index(
        LineCodec,
        csv_point as fn(&String) -> Vec<f64>,
        &config,
        &input,
        &sorted,
    )
    .unwrap();
    (dir, index, sorted)
}

/// The three-record fixture used across the tests: coordinates span
/// `[4,2,100]..[10,7,600]` and sort into `4,5,600`, `8,7,100`, `10,2,300`.
pub fn scenario_lines() -> Vec<String> {
    vec![
        "10,2,300".to_string(),
        "4,5,600".to_string(),
        "8,7,100".to_string(),
    ]
}

/// A single-file loopback HTTP server.
///
/// With `honor_range` it answers `Range` requests with `206 Partial Content`
/// and the requested slice; without it the header is ignored and every
/// request gets the full body with `200 OK`, which searches must cope with.
pub struct TestHttpServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestHttpServer {
    pub fn serve(content: Vec<u8>, honor_range: bool) -> TestHttpServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let _ = handle_request(stream, &content, honor_range);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });
        TestHttpServer {
            addr,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/data", self.addr)
    }
}

impl Drop for TestHttpServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_request(mut stream: TcpStream, content: &[u8], honor_range: bool) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte)? == 0 {
            return Ok(());
        }
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head);
    let range = head
        .lines()
        .find_map(|l| l.to_ascii_lowercase().strip_prefix("range:").map(str::trim).map(String::from))
        .and_then(|v| parse_range(&v, content.len() as u64));
    match range {
        Some((start, end)) if honor_range => {
            let body = &content[start as usize..end as usize];
            write!(
                stream,
                "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {}-{}/{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                start,
                end - 1,
                content.len(),
                body.len()
            )?;
            stream.write_all(body)?;
        }
        _ => {
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                content.len()
            )?;
            stream.write_all(content)?;
        }
    }
    stream.flush()
}

/// Parses `bytes=a-b` or `bytes=a-` into a half-open `[start, end)` clamped
/// to the content length.
fn parse_range(value: &str, len: u64) -> Option<(u64, u64)> {
    let suffix = value.strip_prefix("bytes=")?;
    let (start, end) = suffix.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        len
    } else {
        (end.parse::<u64>().ok()? + 1).min(len)
    };
    if start >= end {
        return None;
    }
    Some((start, end))
}
