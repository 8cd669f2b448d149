//! End-to-end scenarios over loopback TCP.
//!
//! Workers run in threaded mode so the whole dispatch pipeline (accept,
//! balancer, channel hand-off, worker event loop, parser, response writer)
//! executes in-process.

use std::collections::HashSet;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use gaffel::{Handler, Master, ServerConfig, SpawnMode, WorkerPoolConfig};
use parser::h1::response::Response;

fn test_config(port: u16) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port,
        max_request_size: 1024,
        keep_alive_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(2),
        ..ServerConfig::default()
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Binds a threaded-mode server and leaves it running for the test's
/// lifetime.
fn start_server(handler: Handler, workers: usize) -> SocketAddr {
    start_server_with(handler, workers, test_config(free_port()))
}

fn start_server_with(handler: Handler, workers: usize, config: ServerConfig) -> SocketAddr {
    let pool = WorkerPoolConfig {
        worker_count: workers,
        ..WorkerPoolConfig::default()
    };

    let mut master = Master::bind(config, pool, handler).unwrap();
    master.set_spawn_mode(SpawnMode::Threaded);
    let addr = master.local_addr();

    thread::spawn(move || {
        let _ = master.run();
    });

    addr
}

fn content_length(head: &str) -> usize {
    for line in head.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reads one response: headers plus the declared content length.
fn read_response(stream: &mut TcpStream) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(split) = find_subslice(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..split]).into_owned();
            if buf.len() >= split + 4 + content_length(&head) {
                return buf;
            }
        }

        match stream.read(&mut chunk) {
            Ok(0) => return buf,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                return buf
            }
            Err(_) => return buf,
        }
    }
}

/// One request/response exchange, retried until the worker pool is ready.
fn roundtrip(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    for _ in 0..50 {
        if let Ok(mut stream) = TcpStream::connect(addr) {
            if stream.write_all(request).is_ok() {
                let response = read_response(&mut stream);
                if !response.is_empty() {
                    return response;
                }
            }
        }
        thread::sleep(Duration::from_millis(100));
    }

    Vec::new()
}

fn starts_with(response: &[u8], prefix: &str) -> bool {
    response.starts_with(prefix.as_bytes())
}

#[test]
fn get_receives_the_handler_response() {
    let handler: Handler = Arc::new(|_req| Response::new(200).body("hi"));
    let addr = start_server(handler, 1);

    let response = roundtrip(addr, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert!(
        starts_with(&response, "HTTP/1.1 200 OK\r\n"),
        "response: {}",
        String::from_utf8_lossy(&response)
    );
    assert!(find_subslice(&response, b"Content-Length: 2").is_some());
    assert!(response.ends_with(b"hi"));
}

#[test]
fn smuggling_shaped_requests_never_reach_the_handler() {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    let handler: Handler = Arc::new(move |req| {
        if req.target != "/probe" {
            seen.fetch_add(1, Ordering::SeqCst);
        }
        Response::new(200).body("ok")
    });
    let addr = start_server(handler, 1);

    // wait until the pool serves requests at all
    let probe = roundtrip(addr, b"GET /probe HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(starts_with(&probe, "HTTP/1.1 200"));

    #[rustfmt::skip]
    let rejected: [&[u8]; 3] = [
        b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 10\r\nContent-Length: 20\r\n\r\n0123456789",
        b"GET / HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n",
        b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4\r\nTransfer-Encoding: chunked\r\n\r\nbody",
    ];

    for request in rejected {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(request).unwrap();
        let response = read_response(&mut stream);

        assert!(
            starts_with(&response, "HTTP/1.1 400"),
            "response: {}",
            String::from_utf8_lossy(&response)
        );

        // connection is closed after the rejection
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
        assert!(rest.is_empty());
    }

    assert_eq!(0, hits.load(Ordering::SeqCst), "handler saw a smuggled request");
}

#[test]
fn repeated_cookie_headers_reach_the_handler_merged() {
    let captured = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&captured);
    let handler: Handler = Arc::new(move |req| {
        *sink.lock().unwrap() = Some(req.cookies.clone());
        Response::new(200).body("ok")
    });
    let addr = start_server(handler, 1);

    let response = roundtrip(
        addr,
        b"GET / HTTP/1.1\r\nHost: localhost\r\nCookie: s=1\r\nCookie: u=x\r\n\r\n",
    );
    assert!(starts_with(&response, "HTTP/1.1 200"));

    let cookies = captured.lock().unwrap().clone().expect("handler ran");
    assert_eq!(Some(&"1".to_string()), cookies.get("s"));
    assert_eq!(Some(&"x".to_string()), cookies.get("u"));
}

#[test]
fn oversized_request_draws_413() {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    let handler: Handler = Arc::new(move |req| {
        if req.target != "/probe" {
            seen.fetch_add(1, Ordering::SeqCst);
        }
        Response::new(200).body("ok")
    });
    // max_request_size is 1024 in the test config
    let addr = start_server(handler, 1);

    let probe = roundtrip(addr, b"GET /probe HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(starts_with(&probe, "HTTP/1.1 200"));

    let mut request =
        b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 1025\r\n\r\n".to_vec();
    request.extend(std::iter::repeat(b'x').take(1025));

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(&request).unwrap();
    let response = read_response(&mut stream);

    assert!(
        starts_with(&response, "HTTP/1.1 413"),
        "response: {}",
        String::from_utf8_lossy(&response)
    );
    assert_eq!(0, hits.load(Ordering::SeqCst));
}

#[test]
fn keep_alive_serves_serial_requests_on_one_connection() {
    let handler: Handler = Arc::new(|req| Response::new(200).body(req.target.clone()));
    let addr = start_server(handler, 1);

    // readiness
    let probe = roundtrip(addr, b"GET /probe HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(starts_with(&probe, "HTTP/1.1 200"));

    let mut stream = TcpStream::connect(addr).unwrap();

    stream
        .write_all(b"GET /first HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let first = read_response(&mut stream);
    assert!(starts_with(&first, "HTTP/1.1 200"));
    assert!(first.ends_with(b"/first"));

    stream
        .write_all(b"GET /second HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let second = read_response(&mut stream);
    assert!(
        starts_with(&second, "HTTP/1.1 200"),
        "second response on the same connection: {}",
        String::from_utf8_lossy(&second)
    );
    assert!(second.ends_with(b"/second"));
}

#[test]
fn chunked_request_bodies_are_decoded() {
    let handler: Handler =
        Arc::new(|req| Response::new(200).body(req.body.len().to_string()));
    let addr = start_server(handler, 1);

    let response = roundtrip(
        addr,
        b"POST / HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n\
          5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    );

    assert!(starts_with(&response, "HTTP/1.1 200"));
    assert!(response.ends_with(b"11"));
}

#[test]
fn handler_panic_becomes_a_500() {
    let handler: Handler = Arc::new(|req| {
        if req.target == "/panic" {
            panic!("boom");
        }
        Response::new(200).body("ok")
    });
    let addr = start_server(handler, 1);

    let probe = roundtrip(addr, b"GET /probe HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(starts_with(&probe, "HTTP/1.1 200"));

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"GET /panic HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);

    assert!(
        starts_with(&response, "HTTP/1.1 500"),
        "response: {}",
        String::from_utf8_lossy(&response)
    );
}

#[test]
fn head_responses_carry_length_but_no_body() {
    let handler: Handler = Arc::new(|_req| Response::new(200).body("invisible"));
    let addr = start_server(handler, 1);

    let response = roundtrip(addr, b"HEAD / HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert!(starts_with(&response, "HTTP/1.1 200"));
    assert!(find_subslice(&response, b"Content-Length: 9").is_some());
    assert!(response.ends_with(b"\r\n\r\n"), "no body bytes after headers");
}

#[test]
fn least_connections_spreads_load_across_workers() {
    let workers = Arc::new(Mutex::new(HashSet::new()));
    let seen = Arc::clone(&workers);
    let handler: Handler = Arc::new(move |_req| {
        // threaded workers run on named threads; record which one served us
        if let Some(name) = thread::current().name() {
            seen.lock().unwrap().insert(name.to_string());
        }
        thread::sleep(Duration::from_millis(100));
        Response::new(200).body("ok")
    });
    let addr = start_server(handler, 2);

    let probe = roundtrip(addr, b"GET /probe HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(starts_with(&probe, "HTTP/1.1 200"));

    let clients: Vec<_> = (0..6)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                stream
                    .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                    .unwrap();
                read_response(&mut stream)
            })
        })
        .collect();

    for client in clients {
        let response = client.join().unwrap();
        assert!(starts_with(&response, "HTTP/1.1 200"));
    }

    let served_by = workers.lock().unwrap();
    assert!(
        served_by.len() >= 2,
        "expected both workers to serve connections, saw {served_by:?}"
    );
}

#[test]
fn connection_close_is_honored() {
    let handler: Handler = Arc::new(|_req| Response::new(200).body("bye"));
    let addr = start_server(handler, 1);

    let probe = roundtrip(addr, b"GET /probe HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(starts_with(&probe, "HTTP/1.1 200"));

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();

    let response = read_response(&mut stream);
    assert!(starts_with(&response, "HTTP/1.1 200"));
    assert!(find_subslice(&response, b"Connection: close").is_some());

    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
    assert!(rest.is_empty(), "server kept the connection open");
}
