// demos/testsuite.rs
//
// The exercise plugin: one endpoint per core behaviour (plain and
// chunked responses, body echo, expect/continue, worker offload,
// error signalling, RESTful routes). Run with
// `cargo run --example testsuite`.

use futures::future::BoxFuture;
use portico::{
    session_handler, ChunkedWriter, Config, Error, Handler, ParsedRoute, Plugin, Request,
    Response, RestRouter, Result, Server, Stream, ThreadWorker,
};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

static TEST_100_RESPONSE: &str = "100XXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXX\
XXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXX";

static TEST_50M_RESPONSE: OnceLock<Vec<u8>> = OnceLock::new();
static WORKER: OnceLock<ThreadWorker> = OnceLock::new();
static REST_ROUTER: OnceLock<RestRouter<Handler>> = OnceLock::new();

fn reference_payload() -> &'static [u8] {
    TEST_50M_RESPONSE.get_or_init(|| {
        (0..50 * 1024 * 1024_u32)
            .map(|i| 33 + (i % 93) as u8)
            .collect()
    })
}

fn test0<'a>(stream: &'a mut Stream, req: &'a mut Request) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        stream.read(req).await?;
        stream.write_response(&Response::new(200)).await
    })
}

fn test100<'a>(stream: &'a mut Stream, req: &'a mut Request) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        stream.read(req).await?;
        stream
            .write_response(&Response::new(200).with_body(TEST_100_RESPONSE))
            .await
    })
}

fn test100_chunked<'a>(stream: &'a mut Stream, req: &'a mut Request) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        stream.read(req).await?;
        stream
            .write_response(&Response::new(200).with_chunked_body())
            .await?;
        let mut chunked = ChunkedWriter::new(stream);
        chunked.write(TEST_100_RESPONSE.as_bytes()).await?;
        chunked.finish().await
    })
}

fn test50m<'a>(stream: &'a mut Stream, req: &'a mut Request) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        stream.read(req).await?;
        let payload = reference_payload();
        stream
            .write_response(&Response::new(200).with_content_length(payload.len() as u64))
            .await?;
        stream.write(payload).await
    })
}

/// One gathered write: response head plus fifty 1 MiB slices.
fn test50ms<'a>(stream: &'a mut Stream, req: &'a mut Request) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        stream.read(req).await?;
        let payload = reference_payload();
        let head = Response::new(200)
            .with_content_length(payload.len() as u64)
            .to_bytes(stream.keep_alive());
        let mut pieces: Vec<&[u8]> = vec![&head];
        pieces.extend(payload.chunks(1024 * 1024));
        stream.write_vectored(&pieces).await
    })
}

fn test_worker<'a>(stream: &'a mut Stream, req: &'a mut Request) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        stream.read(req).await?;
        stream
            .write_response(&Response::new(200).with_chunked_body())
            .await?;

        let wakeupper = stream.wakeupper();
        let busy = Arc::new(AtomicBool::new(false));
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let worker = WORKER.get().expect("worker pool initialized");

        let mut chunked = ChunkedWriter::new(stream);
        let mut sent = 0usize;
        while sent < 100_000 {
            busy.store(true, Ordering::Release);
            let task_busy = Arc::clone(&busy);
            let task_buffer = Arc::clone(&buffer);
            let task_wakeupper = Arc::clone(&wakeupper);
            worker.insert_task(move || {
                // simulate some heavy work
                std::thread::sleep(Duration::from_millis(15));
                let mut buffer = task_buffer.lock().unwrap();
                buffer.clear();
                buffer.extend((0..2000u32).map(|i| b'0' + (i % 10) as u8));
                task_busy.store(false, Ordering::Release);
                task_wakeupper.wake_up();
            });
            while busy.load(Ordering::Acquire) {
                chunked.yield_now().await?;
            }
            let chunk = buffer.lock().unwrap().clone();
            chunked.write(&chunk).await?;
            sent += chunk.len();
        }
        chunked.finish().await
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
        let mut text = String::new();
        let _ = writeln!(text, "~~~~ ContentLength: {content_length}");
        text.push_str("~~~~ Headers:\n");
        for (name, value) in req.headers() {
            let _ = writeln!(text, "{name} : {value}");
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

// PPP stands for post, put, patch
fn test_ppp<'a>(stream: &'a mut Stream, req: &'a mut Request) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let body = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&body);
        req.set_body_callback(move |chunk| {
            sink.lock().unwrap().extend_from_slice(chunk);
            Ok(())
        });
        stream.read(req).await?;

        let payload = reference_payload();
        let content_length = req.header("Content-Length").unwrap_or("");
        if content_length.parse::<usize>().ok() != Some(payload.len()) {
            return Err(Error::ErrorResponse(
                Response::new(400).with_body("Invalid body size"),
            ));
        }
        let body = body.lock().unwrap().clone();
        if body != payload {
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

fn throw_from_request_complete<'a>(
    _stream: &'a mut Stream,
    _req: &'a mut Request,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move { Err(Error::Status(412)) })
}

fn throw_from_body<'a>(stream: &'a mut Stream, req: &'a mut Request) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        req.set_body_callback(|_| {
            Err(Error::ErrorResponse(
                Response::new(400)
                    .with_body("Body too big, lose some weight")
                    .with_header("BodyKey1", "Value1")
                    .with_header("BodyKey2", "Value2"),
            ))
        });
        stream.read(req).await?;
        stream.write_response(&Response::new(200)).await
    })
}

fn throw_from_write_response<'a>(
    stream: &'a mut Stream,
    req: &'a mut Request,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        stream.read(req).await?;
        Err(Error::ErrorResponse(
            Response::new(409)
                .with_body("Throw from WriteResponse")
                .with_header("WriteRes1", "Value1")
                .with_header("WriteRes2", "Value2"),
        ))
    })
}

fn throw_after_write<'a>(stream: &'a mut Stream, req: &'a mut Request) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        stream.read(req).await?;
        stream
            .write_response(&Response::new(200).with_chunked_body())
            .await?;
        Err(Error::Unknown("Unexpected error".into()))
    })
}

fn rest_get<'a>(
    route: ParsedRoute,
    stream: &'a mut Stream,
    req: &'a mut Request,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        stream.read(req).await?;
        stream
            .write_response(
                &Response::new(200)
                    .with_header("Content-Type", "text/plain")
                    .with_chunked_body(),
            )
            .await?;
        let mut text = String::new();
        let _ = writeln!(text, "Got {} captured resources", route.captures.len());
        let _ = writeln!(text, "and {} queries", route.queries.len());
        let _ = writeln!(text, "All methods but OPTIONS {} ", route.allow);
        for (name, value) in &route.captures {
            let _ = writeln!(text, "Resource name: {name}  value: {value}");
        }
        for (name, value) in &route.queries {
            let _ = writeln!(text, "Query name: {name}  value: {value}");
        }
        let mut chunked = ChunkedWriter::new(stream);
        chunked.write(text.as_bytes()).await?;
        chunked.finish().await
    })
}

fn create_session(req: &Request) -> Result<Option<Handler>> {
    let handler: Handler = match req.url() {
        "/test0" => Box::new(test0),
        "/test100" => Box::new(test100),
        "/test100Chunked" => Box::new(test100_chunked),
        "/test50m" => Box::new(test50m),
        "/test50ms" => Box::new(test50ms),
        "/testWorker" => Box::new(test_worker),
        "/echoTest" => Box::new(echo_test),
        "/secureOnly" => Box::new(secure_only),
        "/testExpectation" => Box::new(test_expectation),
        "/testPPP" => Box::new(test_ppp),
        "/testThrowFromRequestComplete" => Box::new(throw_from_request_complete),
        "/testThrowFromBody" => Box::new(throw_from_body),
        "/testThrowFromWriteResponse" => Box::new(throw_from_write_response),
        "/testThrowFromWriteResponseAfterWrite" => Box::new(throw_after_write),
        url => {
            return match REST_ROUTER.get() {
                Some(router) => router.create_handler(url, req.method().as_str()),
                None => Ok(None),
            }
        }
    };
    Ok(Some(handler))
}

fn init_plugin() -> bool {
    let _ = reference_payload();
    let _ = WORKER.set(ThreadWorker::new(10));

    let mut router = RestRouter::new("/test/rest/v1/");
    router
        .route("customers")
        .add_method_handler("GET", session_handler(rest_get));
    router
        .route("customers/{customerId}")
        .add_method_handler("GET", session_handler(rest_get));
    router
        .route("customers/{customerId}/licenses")
        .add_method_handler("GET", session_handler(rest_get));
    router
        .route("customers/{customerId}/licenses/{licenseId}")
        .add_method_handler("GET", session_handler(rest_get));
    REST_ROUTER.set(router).is_ok()
}

fn main() -> Result<()> {
    env_logger::init();
    let plugin = Plugin::new("testsuite", 9_999_999, create_session)
        .with_init(|_conf| init_plugin());
    let server = Server::builder(Config::default()).plugin(plugin).build()?;
    server.run()
}
