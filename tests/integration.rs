// tests/integration.rs
//
// End-to-end coverage over real sockets: every test starts its own server
// on its own port and speaks raw HTTP/1.1 through TcpStream.

use futures::future::BoxFuture;
use portico::{
    session_handler, ChunkedWriter, Config, Error, Handler, ParsedRoute, Plugin, Request,
    Response, RestRouter, Result, Server, Stream,
};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

// ------------------------------- harness -------------------------------------

fn start_server(port: u16, plugins: Vec<Plugin>, tweak: fn(&mut Config)) -> Arc<Server> {
    let mut config = Config::default();
    config.http_port = port as i32;
    tweak(&mut config);
    let mut builder = Server::builder(config).workers(2);
    for plugin in plugins {
        builder = builder.plugin(plugin);
    }
    let server = builder.build().expect("server builds");
    let runner = Arc::clone(&server);
    thread::spawn(move || {
        let _ = runner.run();
    });
    wait_until_ready(port);
    server
}

fn wait_until_ready(port: u16) {
    for _ in 0..250 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            // give the probe connection time to disappear again
            thread::sleep(Duration::from_millis(20));
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("server on port {port} never became ready");
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();
    stream
}

struct ClientResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ClientResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Minimal client-side response reader: status line, headers, then a
/// Content-Length or chunked body.
fn read_response(stream: &mut TcpStream) -> ClientResponse {
    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).expect("read response head");
        assert!(n > 0, "connection closed before response head");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().expect("status line");
    assert!(status_line.starts_with("HTTP/1.1 "), "{status_line}");
    let status: u16 = status_line[9..12].parse().expect("status code");
    let headers: Vec<(String, String)> = lines
        .map(|line| {
            let (name, value) = line.split_once(':').expect("header line");
            (name.trim().to_string(), value.trim().to_string())
        })
        .collect();

    let mut rest = buf[head_end + 4..].to_vec();
    let response = ClientResponse {
        status,
        headers,
        body: Vec::new(),
    };

    let body = if response
        .header("Transfer-Encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        read_chunked_body(stream, &mut rest)
    } else {
        let len: usize = response
            .header("Content-Length")
            .unwrap_or("0")
            .parse()
            .expect("content length");
        read_exact_body(stream, &mut rest, len)
    };

    ClientResponse { body, ..response }
}

fn read_exact_body(stream: &mut TcpStream, rest: &mut Vec<u8>, len: usize) -> Vec<u8> {
    while rest.len() < len {
        let mut chunk = [0u8; 65536];
        let n = stream.read(&mut chunk).expect("read body");
        assert!(n > 0, "connection closed mid-body");
        rest.extend_from_slice(&chunk[..n]);
    }
    rest[..len].to_vec()
}

fn read_chunked_body(stream: &mut TcpStream, rest: &mut Vec<u8>) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let line_end = loop {
            if let Some(pos) = find(rest, b"\r\n") {
                break pos;
            }
            fill(stream, rest);
        };
        let size_line = String::from_utf8_lossy(&rest[..line_end]).into_owned();
        let size = usize::from_str_radix(size_line.split(';').next().unwrap(), 16)
            .unwrap_or_else(|_| panic!("bad chunk size {size_line:?}"));
        rest.drain(..line_end + 2);

        while rest.len() < size + 2 {
            fill(stream, rest);
        }
        body.extend_from_slice(&rest[..size]);
        assert_eq!(&rest[size..size + 2], b"\r\n");
        rest.drain(..size + 2);
        if size == 0 {
            return body;
        }
    }
}

fn fill(stream: &mut TcpStream, buf: &mut Vec<u8>) {
    let mut chunk = [0u8; 65536];
    let n = stream.read(&mut chunk).expect("read");
    assert!(n > 0, "connection closed mid-chunk");
    buf.extend_from_slice(&chunk[..n]);
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ------------------------------- handlers ------------------------------------

fn test0<'a>(stream: &'a mut Stream, req: &'a mut Request) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        stream.read(req).await?;
        stream.write_response(&Response::new(200)).await
    })
}

fn echo_test<'a>(stream: &'a mut Stream, req: &'a mut Request) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        stream.set_session_timeout(Duration::from_secs(10));
        let body = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&body);
        req.set_body_callback(move |chunk| {
            sink.lock().unwrap().extend_from_slice(chunk);
            Ok(())
        });
        stream.read(req).await?;

        let content_length = req.header("Content-Length").unwrap_or("").to_string();
        let body = body.lock().unwrap().clone();
        if content_length.parse::<usize>().ok() != Some(body.len()) {
            return Err(Error::Status(400));
        }

        stream
            .write_response(&Response::new(200).with_chunked_body())
            .await?;
        let mut text = format!("~~~~ ContentLength: {content_length}\n~~~~ Headers:\n");
        for (name, value) in req.headers() {
            text.push_str(&format!("{name} : {value}\n"));
        }
        text.push_str("~~~~ Body:\n");
        let mut chunked = ChunkedWriter::new(stream);
        chunked.write_pieces(&[text.as_bytes(), &body]).await?;
        chunked.finish().await
    })
}

fn secure_only<'a>(stream: &'a mut Stream, req: &'a mut Request) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        if !stream.is_secured_connection() {
            return Err(Error::ErrorResponse(
                Response::new(403)
                    .with_body("Only secured connections allowed")
                    .with_header("ErrorKey1", "Value1")
                    .with_header("ErrorKey2", "Value2"),
            ));
        }
        stream.read(req).await?;
        stream.write_response(&Response::new(200)).await
    })
}

fn test_expectation<'a>(stream: &'a mut Stream, req: &'a mut Request) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        if req.header("Expect") == Some("100-continue") && req.header("X-Continue") != Some("100")
        {
            return Err(Error::ErrorResponse(Response::new(417)));
        }
        req.set_body_callback(|_| Ok(()));
        stream.read(req).await?;
        stream.write_response(&Response::new(200)).await
    })
}

fn reference_payload() -> &'static [u8] {
    static PAYLOAD: OnceLock<Vec<u8>> = OnceLock::new();
    PAYLOAD.get_or_init(|| {
        (0..50 * 1024 * 1024_u32)
            .map(|i| 33 + (i % 93) as u8)
            .collect()
    })
}

fn test_ppp<'a>(stream: &'a mut Stream, req: &'a mut Request) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let body = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&body);
        req.set_body_callback(move |chunk| {
            sink.lock().unwrap().extend_from_slice(chunk);
            Ok(())
        });
        stream.read(req).await?;

        let body = body.lock().unwrap().clone();
        if body != reference_payload() {
            return Err(Error::ErrorResponse(
                Response::new(400).with_body("Invalid body"),
            ));
        }
        stream
            .write_response(&Response::new(200).with_content_length(body.len() as u64))
            .await?;
        stream.write(&body).await
    })
}

fn test_plugin() -> Plugin {
    Plugin::new("test", 0, |req| {
        let handler: Handler = match req.url() {
            "/test0" => Box::new(test0),
            "/echoTest" => Box::new(echo_test),
            "/secureOnly" => Box::new(secure_only),
            "/testExpectation" => Box::new(test_expectation),
            "/testPPP" => Box::new(test_ppp),
            _ => return Ok(None),
        };
        Ok(Some(handler))
    })
}

// devices API, the RESTful routing path

struct DeviceList(Mutex<Vec<String>>);

fn devices_plugin() -> Plugin {
    static DEVICES: OnceLock<DeviceList> = OnceLock::new();
    static ROUTER: OnceLock<RestRouter<Handler>> = OnceLock::new();

    fn devices() -> &'static Mutex<Vec<String>> {
        &DEVICES.get_or_init(|| DeviceList(Mutex::new(Vec::new()))).0
    }

    fn collect_body(req: &mut Request) -> Arc<Mutex<Vec<u8>>> {
        let body = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&body);
        req.set_body_callback_with_max(
            move |chunk| {
                sink.lock().unwrap().extend_from_slice(chunk);
                Ok(())
            },
            512 * 1024,
        );
        body
    }

    fn get_devices<'a>(
        _route: ParsedRoute,
        stream: &'a mut Stream,
        req: &'a mut Request,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            stream.read(req).await?;
            let listed: Vec<serde_json::Value> = devices()
                .lock()
                .unwrap()
                .iter()
                .enumerate()
                .map(|(idx, name)| serde_json::json!({ "id:": idx, "name": name }))
                .collect();
            stream
                .write_response(
                    &Response::new(200)
                        .with_header("Content-Type", "application/json")
                        .with_body(serde_json::Value::Array(listed).to_string()),
                )
                .await
        })
    }

    fn post_devices<'a>(
        _route: ParsedRoute,
        stream: &'a mut Stream,
        req: &'a mut Request,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let body = collect_body(req);
            stream.read(req).await?;
            let body = body.lock().unwrap().clone();
            let names: Vec<String> =
                serde_json::from_slice(&body).map_err(|_| Error::Status(400))?;
            *devices().lock().unwrap() = names;
            stream.write_response(&Response::new(200)).await
        })
    }

    fn patch_device<'a>(
        route: ParsedRoute,
        stream: &'a mut Stream,
        req: &'a mut Request,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let body = collect_body(req);
            stream.read(req).await?;
            let idx: usize = route.captures["device"]
                .parse()
                .map_err(|_| Error::Status(400))?;
            let body = body.lock().unwrap().clone();
            let patch: serde_json::Value =
                serde_json::from_slice(&body).map_err(|_| Error::Status(400))?;
            let name = patch["name"].as_str().ok_or(Error::Status(400))?;
            {
                let mut devices = devices().lock().unwrap();
                let slot = devices.get_mut(idx).ok_or(Error::Status(400))?;
                *slot = name.to_string();
            }
            stream.write_response(&Response::new(200)).await
        })
    }

    let mut router = RestRouter::new("/v1/");
    router
        .route("devices")
        .add_method_handler("GET", session_handler(get_devices))
        .add_method_handler("POST", session_handler(post_devices));
    router
        .route("devices/{device}")
        .add_method_handler("GET", session_handler(get_devices))
        .add_method_handler("PATCH", session_handler(patch_device));
    let _ = ROUTER.set(router);

    Plugin::new("devices", 0, |req| {
        ROUTER
            .get()
            .expect("router registered")
            .create_handler(req.url(), req.method().as_str())
    })
}

// ------------------------------- tests ---------------------------------------

#[test]
fn keep_alive_request_loop() {
    let server = start_server(18081, vec![test_plugin()], |_| {});

    let mut conn = connect(18081);
    for i in 0..5 {
        conn.write_all(b"GET /test0 HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let res = read_response(&mut conn);
        assert_eq!(res.status, 200, "request {i}");
        assert_eq!(res.header("Content-Length"), Some("0"));
        assert_eq!(res.header("Connection"), Some("keep-alive"));
        assert_eq!(res.header("Keep-Alive"), Some("timeout=10"));
        assert!(res.body.is_empty());
    }

    server.shutdown();
}

#[test]
fn connection_close_is_honored() {
    let server = start_server(18082, vec![test_plugin()], |_| {});

    let mut conn = connect(18082);
    conn.write_all(b"GET /test0 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let res = read_response(&mut conn);
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Connection"), Some("close"));

    // the server closes; the next read sees EOF
    let mut rest = Vec::new();
    assert_eq!(conn.read_to_end(&mut rest).unwrap(), 0);

    server.shutdown();
}

#[test]
fn echo_reports_headers_and_body() {
    let server = start_server(18083, vec![test_plugin()], |_| {});

    let mut conn = connect(18083);
    conn.write_all(b"GET /echoTest HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello")
        .unwrap();
    let res = read_response(&mut conn);
    assert_eq!(res.status, 200);
    assert_eq!(
        res.header("Transfer-Encoding").map(str::to_ascii_lowercase),
        Some("chunked".to_string())
    );
    let body = String::from_utf8(res.body).unwrap();
    assert!(body.contains("~~~~ ContentLength: 5"), "{body}");
    assert!(body.contains("Host : x"), "{body}");
    assert!(body.contains("~~~~ Body:\nhello"), "{body}");

    server.shutdown();
}

#[test]
fn secure_only_rejects_plaintext() {
    let server = start_server(18084, vec![test_plugin()], |_| {});

    let mut conn = connect(18084);
    conn.write_all(b"GET /secureOnly HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let res = read_response(&mut conn);
    assert_eq!(res.status, 403);
    assert_eq!(res.header("ErrorKey1"), Some("Value1"));
    assert_eq!(res.header("ErrorKey2"), Some("Value2"));
    assert_eq!(res.header("Connection"), Some("close"));
    assert_eq!(res.body, b"Only secured connections allowed");

    server.shutdown();
}

#[test]
fn unclaimed_requests_get_503() {
    let server = start_server(18085, vec![test_plugin()], |_| {});

    let mut conn = connect(18085);
    conn.write_all(b"GET /does/not/exist HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let res = read_response(&mut conn);
    assert_eq!(res.status, 503);
    assert_eq!(res.header("Connection"), Some("close"));

    server.shutdown();
}

#[test]
fn expect_100_continue_flow() {
    let server = start_server(18086, vec![test_plugin()], |_| {});

    // precondition met: the server sends the bare continue preamble first
    let mut conn = connect(18086);
    conn.write_all(
        b"POST /testExpectation HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nX-Continue: 100\r\nContent-Length: 4\r\n\r\n",
    )
    .unwrap();
    let mut preamble = [0u8; 25];
    conn.read_exact(&mut preamble).unwrap();
    assert_eq!(&preamble, b"HTTP/1.1 100 Continue\r\n\r\n");
    conn.write_all(b"data").unwrap();
    let res = read_response(&mut conn);
    assert_eq!(res.status, 200);

    // precondition failed: the handler signals 417
    let mut conn = connect(18086);
    conn.write_all(
        b"POST /testExpectation HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\n",
    )
    .unwrap();
    let res = read_response(&mut conn);
    assert_eq!(res.status, 417);
    assert_eq!(res.header("Connection"), Some("close"));

    server.shutdown();
}

#[test]
fn devices_rest_flow() {
    let server = start_server(18087, vec![devices_plugin()], |_| {});

    let mut conn = connect(18087);
    let body = br#"["a","b","c"]"#;
    let mut request = format!(
        "POST /v1/devices HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(body);
    conn.write_all(&request).unwrap();
    assert_eq!(read_response(&mut conn).status, 200);

    let patch = br#"{"name":"D"}"#;
    let mut request = format!(
        "PATCH /v1/devices/1 HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
        patch.len()
    )
    .into_bytes();
    request.extend_from_slice(patch);
    conn.write_all(&request).unwrap();
    assert_eq!(read_response(&mut conn).status, 200);

    conn.write_all(b"GET /v1/devices HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let res = read_response(&mut conn);
    assert_eq!(res.status, 200);
    assert_eq!(
        String::from_utf8(res.body).unwrap(),
        r#"[{"id:":0,"name":"a"},{"id:":1,"name":"D"},{"id:":2,"name":"c"}]"#
    );

    // the route knows the path but not the verb
    conn.write_all(b"PUT /v1/devices/1 HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let res = read_response(&mut conn);
    assert_eq!(res.status, 405);
    assert_eq!(res.header("Allow"), Some("GET, PATCH"));

    server.shutdown();
}

#[test]
fn per_ip_connection_cap() {
    let server = start_server(18088, vec![test_plugin()], |config| {
        config.max_connections_per_ip = 3;
    });

    let conns: Vec<TcpStream> = (0..6).map(|_| connect(18088)).collect();
    thread::sleep(Duration::from_millis(200));

    let mut served = 0;
    for mut conn in conns {
        // rejected connections are already closed, the write may fail
        let _ = conn.write_all(b"GET /test0 HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut first = [0u8; 1];
        match conn.read(&mut first) {
            Ok(0) | Err(_) => {} // rejected by the cap
            Ok(_) => served += 1,
        }
    }
    assert!(served <= 3, "cap of 3 exceeded: {served} served");
    assert!(served >= 1, "no connection was served at all");

    server.shutdown();
}

#[test]
fn large_body_round_trip() {
    let server = start_server(18089, vec![test_plugin()], |_| {});

    let payload = reference_payload();
    let mut conn = connect(18089);
    conn.write_all(
        format!(
            "POST /testPPP HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
            payload.len()
        )
        .as_bytes(),
    )
    .unwrap();
    conn.write_all(payload).unwrap();

    let res = read_response(&mut conn);
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Length"), Some("52428800"));
    assert_eq!(res.body.len(), payload.len());
    assert!(res.body == payload, "echoed body differs");

    server.shutdown();
}

#[test]
fn server_status_endpoint() {
    let server = start_server(18090, vec![test_plugin()], |config| {
        config.server_status = true;
    });

    let mut conn = connect(18090);
    conn.write_all(b"GET /test0 HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    assert_eq!(read_response(&mut conn).status, 200);

    conn.write_all(b"GET /server_status HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let res = read_response(&mut conn);
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Refresh"), Some("5"));
    let body = String::from_utf8(res.body).unwrap();
    assert!(body.contains("Active sessions: "), "{body}");
    assert!(body.contains("Sessions peak: "), "{body}");
    assert!(body.contains("Uptime: "), "{body}");
    assert!(body.contains("Served sessions: "), "{body}");

    server.shutdown();
}
