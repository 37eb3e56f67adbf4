//! portico is a plugin-oriented HTTP/1.1 application server. A small pool
//! of epoll reactors multiplexes many long-lived connections; each
//! connection runs a cooperative session flow that reads requests, picks
//! a handler by probing the registered plugins in order, and streams the
//! response back with keep-alive, chunked transfer and expect/continue
//! support.
//!
//! Handlers suspend inside [`Stream`] operations (or an explicit
//! [`Stream::yield_now`]) and resume when their reactor sees readiness, a
//! [`Wakeupper`] fires, or a deadline expires — in which case every
//! suspension point reports the error so the flow can unwind.
//!
//! ```no_run
//! use portico::{Config, Plugin, Request, Response, Server, Stream};
//! use futures::future::BoxFuture;
//!
//! fn hello<'a>(
//!     stream: &'a mut Stream,
//!     req: &'a mut Request,
//! ) -> BoxFuture<'a, portico::Result<()>> {
//!     Box::pin(async move {
//!         stream.read(req).await?;
//!         stream
//!             .write_response(&Response::new(200).with_body("hello"))
//!             .await
//!     })
//! }
//!
//! fn main() -> portico::Result<()> {
//!     let server = Server::builder(Config::default())
//!         .plugin(Plugin::new("hello", 0, |req| {
//!             Ok((req.url() == "/hello").then(|| Box::new(hello) as portico::Handler))
//!         }))
//!         .build()?;
//!     server.run()
//! }
//! ```

mod codec;
mod config;
mod error;
mod http;
mod plugin;
mod reactor;
mod restful;
mod server;
mod session;
mod stream;
pub mod util;
mod worker;

pub use config::{Config, Https, Privileges, Ssl};
pub use error::{Error, Result};
pub use http::{status_line, BodyFraming, Method, Request, Response, State};
pub use plugin::{Handler, Plugin, SessionHandler};
pub use restful::{session_handler, ParsedRoute, RestRoute, RestRouter};
pub use server::{Server, ServerBuilder};
pub use session::Wakeupper;
pub use stream::{ChunkedWriter, Stream};
pub use worker::ThreadWorker;

#[cfg(not(all(target_os = "linux", target_pointer_width = "64")))]
compile_error!("portico requires Linux on a 64-bit target.");
