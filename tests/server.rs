//! End-to-end tests: a real server on an ephemeral port, plain `TcpStream`
//! clients.

use std::{
    fs,
    io::{Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use edgeserve::{Server, ServerConfig, Strategy};
use tempfile::{tempdir, TempDir};

const NOT_FOUND: &[u8] =
    b"HTTP/1.0 404 NOT FOUND\r\nContent-length: 0\r\nContent-Type: text/html\r\n\r\n";

struct TestServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<edgeserve::Result<()>>>,
}

impl TestServer {
    fn start(root: &Path, strategy: Strategy) -> Self {
        Self::start_with(root, strategy, |_| {})
    }

    fn start_with(
        root: &Path,
        strategy: Strategy,
        tweak: impl FnOnce(&mut ServerConfig),
    ) -> Self {
        let mut config = ServerConfig::new(root);
        config.host = "127.0.0.1".to_string();
        config.port = 0;
        config.wait_timeout_ms = 20;
        config.dispatch = strategy;
        tweak(&mut config);

        let server = Server::bind(&config).expect("bind");
        let addr = server.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = thread::spawn({
            let shutdown = Arc::clone(&shutdown);
            move || server.run(&shutdown)
        });

        TestServer {
            addr,
            shutdown,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Sends `request` in one piece and reads until the server closes.
    fn request(&self, request: &[u8]) -> Vec<u8> {
        let mut stream = self.connect();
        stream.write_all(request).unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        response
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap().unwrap();
        }
    }
}

/// A scratch document root holding `index.html`, removed when dropped.
fn document_root() -> TempDir {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("index.html"), b"hello").unwrap();
    dir
}

fn body(response: &[u8]) -> &[u8] {
    let end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has a head");
    &response[end + 4..]
}

#[test]
fn root_serves_index() {
    let dir = document_root();
    let root = dir.path();
    let server = TestServer::start(root, Strategy::Thread);

    let response = server.request(b"GET / HTTP/1.0\r\n\r\n");
    assert_eq!(
        response,
        b"HTTP/1.0 200 OK\r\nContent-length: 5\r\nContent-Type: text/html\r\n\r\nhello"
    );
}

#[test]
fn missing_file_is_not_found() {
    let dir = document_root();
    let root = dir.path();
    let server = TestServer::start(root, Strategy::Thread);

    assert_eq!(server.request(b"GET /missing.html HTTP/1.0\r\n\r\n"), NOT_FOUND);
}

#[test]
fn malformed_request_is_not_found() {
    let dir = document_root();
    let root = dir.path();
    let server = TestServer::start(root, Strategy::Thread);

    assert_eq!(server.request(b"DELETE /index.html HTTP/1.0\r\n\r\n"), NOT_FOUND);
    assert_eq!(server.request(b"GET /index.html SPDY/3\r\n\r\n"), NOT_FOUND);
}

#[test]
fn bare_request_line_is_answered() {
    let dir = document_root();
    let root = dir.path();
    let server = TestServer::start(root, Strategy::Thread);

    // The peer keeps its side open and waits for the answer.
    let mut stream = server.connect();
    stream.write_all(b"GET / HTTP/1.0\r\n").unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    assert_eq!(
        response,
        b"HTTP/1.0 200 OK\r\nContent-length: 5\r\nContent-Type: text/html\r\n\r\nhello"
    );
}

#[test]
fn bare_malformed_line_is_not_found() {
    let dir = document_root();
    let root = dir.path();
    let server = TestServer::start(root, Strategy::Thread);

    let mut stream = server.connect();
    stream.write_all(b"garbage\r\n").unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    assert_eq!(response, NOT_FOUND);
}

#[test]
fn query_is_ignored() {
    let dir = document_root();
    let root = dir.path();
    fs::write(root.join("a.html"), b"<h1>a</h1>").unwrap();
    let server = TestServer::start(root, Strategy::Thread);

    let plain = server.request(b"GET /a.html HTTP/1.0\r\n\r\n");
    let with_query = server.request(b"GET /a.html?x=1 HTTP/1.0\r\n\r\n");
    assert_eq!(plain, with_query);
    assert_eq!(body(&plain), b"<h1>a</h1>");
}

#[test]
fn content_length_matches_large_file() {
    let dir = document_root();
    let root = dir.path();
    let contents: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
    fs::write(root.join("large.bin"), &contents).unwrap();
    let server = TestServer::start(root, Strategy::Thread);

    let response = server.request(b"GET /large.bin HTTP/1.0\r\n\r\n");
    let head = String::from_utf8_lossy(&response[..response.len() - contents.len()]);
    assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(head.contains(&format!("Content-length: {}\r\n", contents.len())));
    assert_eq!(body(&response), &contents[..]);
}

#[test]
fn request_split_across_segments_is_answered_once() {
    let dir = document_root();
    let root = dir.path();
    let server = TestServer::start(root, Strategy::Thread);

    let mut stream = server.connect();
    let pieces: [&[u8]; 4] =
        [b"GET / HT", b"TP/1.0\r\n", b"Host: x\r\n", b"\r\n"];
    for piece in pieces {
        stream.write_all(piece).unwrap();
        thread::sleep(Duration::from_millis(30));
    }

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    assert!(response.starts_with(b"HTTP/1.0 200 OK\r\n"));
    assert_eq!(body(&response), b"hello");
}

#[test]
fn connection_is_closed_after_the_response() {
    let dir = document_root();
    let root = dir.path();
    let server = TestServer::start(root, Strategy::Thread);

    let mut stream = server.connect();
    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();

    // EOF was reached; anything sent now goes nowhere and nothing comes back.
    let _ = stream.write_all(b"GET / HTTP/1.0\r\n\r\n");
    let mut more = [0u8; 16];
    assert!(matches!(stream.read(&mut more), Ok(0) | Err(_)));
}

#[test]
fn peer_that_leaves_early_gets_nothing() {
    let dir = document_root();
    let root = dir.path();
    let server = TestServer::start(root, Strategy::Thread);

    let mut stream = server.connect();
    stream.write_all(b"GET / HTT").unwrap();
    stream.shutdown(Shutdown::Write).unwrap();

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response);
    assert!(response.is_empty());

    // The server is still fine afterwards.
    assert!(server.request(b"GET / HTTP/1.0\r\n\r\n").ends_with(b"hello"));
}

#[test]
fn oversized_request_is_rejected() {
    let dir = document_root();
    let root = dir.path();
    let server = TestServer::start_with(root, Strategy::Thread, |config| {
        config.chunk_size = 64;
        config.max_request_bytes = 256;
    });

    let mut stream = server.connect();
    let mut request = b"GET /".to_vec();
    request.extend(std::iter::repeat(b'a').take(300));
    stream.write_all(&request).unwrap();

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response);
    assert!(response.starts_with(b"HTTP/1.0 400 BAD REQUEST\r\n"));
}

fn concurrent_peers_are_isolated(strategy: Strategy) {
    const PEERS: usize = 16;

    let dir = document_root();
    let root = dir.path();
    for i in 0..PEERS {
        let contents = format!("{i}").repeat(100 + i);
        fs::write(root.join(format!("peer-{i}.html")), contents).unwrap();
    }
    let server = TestServer::start(root, strategy);

    // Every peer dribbles its request in so that several workers are in
    // flight at once and each connection is re-armed at least once.
    let clients: Vec<_> = (0..PEERS)
        .map(|i| {
            let mut stream = server.connect();
            thread::spawn(move || {
                let request = format!("GET /peer-{i}.html HTTP/1.0\r\n\r\n");
                for piece in request.as_bytes().chunks(7) {
                    stream.write_all(piece).unwrap();
                    thread::sleep(Duration::from_millis(5));
                }
                let mut response = Vec::new();
                stream.read_to_end(&mut response).unwrap();
                (i, response)
            })
        })
        .collect();

    for client in clients {
        let (i, response) = client.join().unwrap();
        let expected = format!("{i}").repeat(100 + i);
        assert!(
            response.starts_with(b"HTTP/1.0 200 OK\r\n"),
            "peer {i}: {}",
            String::from_utf8_lossy(&response)
        );
        assert_eq!(body(&response), expected.as_bytes(), "peer {i}");
    }
}

#[test]
fn concurrent_peers_on_threads() {
    concurrent_peers_are_isolated(Strategy::Thread);
}

#[test]
fn concurrent_peers_on_tokio() {
    concurrent_peers_are_isolated(Strategy::Tokio);
}
