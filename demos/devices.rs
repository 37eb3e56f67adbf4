// demos/devices.rs
//
// A small REST API over an in-memory device list, the shape a typical
// portico application takes. Run with `cargo run --example devices`:
//
//   POST   /v1/devices            ["a","b","c"]   replaces the list
//   GET    /v1/devices                            lists all devices
//   GET    /v1/devices/{device}                   lists one device
//   PATCH  /v1/devices/{device}   {"name":"D"}    renames one device
//   DELETE /v1/devices/{device}                   removes one device

use futures::future::BoxFuture;
use portico::{
    session_handler, Config, Error, Handler, ParsedRoute, Plugin, Request, Response, RestRouter,
    Result, Server, Stream,
};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

static DEVICES: RwLock<Vec<String>> = RwLock::new(Vec::new());
static ROUTER: OnceLock<RestRouter<Handler>> = OnceLock::new();

const MAX_BODY: u64 = 512 * 1024;

fn device_index(route: &ParsedRoute) -> Result<Option<usize>> {
    match route.captures.get("device") {
        Some(value) => value
            .parse::<usize>()
            .map(Some)
            .map_err(|_| Error::Status(400)),
        None => Ok(None),
    }
}

fn collect_body(req: &mut Request) -> Arc<Mutex<Vec<u8>>> {
    let body = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&body);
    req.set_body_callback_with_max(
        move |chunk| {
            sink.lock().unwrap().extend_from_slice(chunk);
            Ok(())
        },
        MAX_BODY,
    );
    body
}

fn device_json(idx: usize, name: &str) -> serde_json::Value {
    serde_json::json!({ "id:": idx, "name": name })
}

fn get_devices<'a>(
    route: ParsedRoute,
    stream: &'a mut Stream,
    req: &'a mut Request,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        stream.read(req).await?;

        let mut listed = serde_json::Value::Array(Vec::new());
        {
            let devices = DEVICES.read().unwrap();
            let items = listed.as_array_mut().expect("array value");
            match device_index(&route)? {
                Some(idx) => {
                    let name = devices.get(idx).ok_or(Error::Status(400))?;
                    items.push(device_json(idx, name));
                }
                None => {
                    for (idx, name) in devices.iter().enumerate() {
                        items.push(device_json(idx, name));
                    }
                }
            }
        } // don't hold the lock while sending

        stream
            .write_response(
                &Response::new(200)
                    .with_header("Content-Type", "application/json")
                    .with_body(listed.to_string()),
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
        *DEVICES.write().unwrap() = names;

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

        let idx = device_index(&route)?.ok_or(Error::Status(404))?;
        let body = body.lock().unwrap().clone();
        let patch: serde_json::Value =
            serde_json::from_slice(&body).map_err(|_| Error::Status(400))?;
        let name = patch
            .get("name")
            .and_then(serde_json::Value::as_str)
            .ok_or(Error::Status(400))?;
        {
            let mut devices = DEVICES.write().unwrap();
            let slot = devices.get_mut(idx).ok_or(Error::Status(400))?;
            *slot = name.to_string();
        }

        stream.write_response(&Response::new(200)).await
    })
}

fn delete_device<'a>(
    route: ParsedRoute,
    stream: &'a mut Stream,
    req: &'a mut Request,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        stream.read(req).await?;

        let idx = device_index(&route)?.ok_or(Error::Status(404))?;
        {
            let mut devices = DEVICES.write().unwrap();
            if idx >= devices.len() {
                return Err(Error::Status(400));
            }
            devices.remove(idx);
        }

        stream.write_response(&Response::new(200)).await
    })
}

/// CORS preflight: advertise the route's precomputed method list and echo
/// any requested headers back.
fn options_devices<'a>(
    route: ParsedRoute,
    stream: &'a mut Stream,
    req: &'a mut Request,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        stream.read(req).await?;
        let mut res =
            Response::new(200).with_header("Access-Control-Allow-Methods", route.allow.clone());
        if let Some(headers) = req.header("Access-Control-Request-Headers") {
            res.set_header("Access-Control-Allow-Headers", headers);
        }
        stream.write_response(&res).await
    })
}

fn create_session(req: &Request) -> Result<Option<Handler>> {
    match ROUTER.get() {
        Some(router) => router.create_handler(req.url(), req.method().as_str()),
        None => Ok(None),
    }
}

fn init_plugin() -> bool {
    log::info!("initializing device REST API");
    let mut router = RestRouter::new("/v1/");
    router
        .route("devices")
        .add_method_handler("GET", session_handler(get_devices))
        .add_method_handler("POST", session_handler(post_devices))
        .add_method_handler("OPTIONS", session_handler(options_devices));
    router
        .route("devices/{device}")
        .add_method_handler("GET", session_handler(get_devices))
        .add_method_handler("PATCH", session_handler(patch_device))
        .add_method_handler("DELETE", session_handler(delete_device))
        .add_method_handler("OPTIONS", session_handler(options_devices));
    ROUTER.set(router).is_ok()
}

fn main() -> Result<()> {
    env_logger::init();
    let plugin = Plugin::new("devices", 0, create_session).with_init(|_conf| init_plugin());
    let server = Server::builder(Config::default()).plugin(plugin).build()?;
    server.run()
}
