// src/server/status.rs

use super::Stats;
use crate::error::Result;
use crate::http::{Request, Response};
use crate::plugin::{Plugin, SessionHandler};
use crate::stream::Stream;
use futures::future::BoxFuture;
use std::fmt::Write as _;
use std::sync::Arc;

/// Built-in `GET /server_status` endpoint, appended to the registry at
/// order `u32::MAX / 2` when enabled in the configuration.
pub(crate) fn server_status_plugin(stats: Arc<Stats>) -> Plugin {
    Plugin::new("server-status", u32::MAX / 2, move |req| {
        if req.url() == "/server_status" && req.method() == "GET" {
            Ok(Some(Box::new(StatusSession {
                stats: Arc::clone(&stats),
            }) as crate::plugin::Handler))
        } else {
            Ok(None)
        }
    })
}

struct StatusSession {
    stats: Arc<Stats>,
}

impl SessionHandler for StatusSession {
    fn call<'a>(
        self: Box<Self>,
        stream: &'a mut Stream,
        req: &'a mut Request,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            stream.read(req).await?;

            let active = self.stats.active_sessions();
            // the peak is only refreshed by the accept loop tick
            let peak = self.stats.peak_sessions().max(active);
            let served = self.stats.served_sessions();

            let mut seconds = self.stats.uptime().as_secs();
            let days = seconds / (60 * 60 * 24);
            seconds -= days * 60 * 60 * 24;
            let hours = seconds / (60 * 60);
            seconds -= hours * 60 * 60;
            let minutes = seconds / 60;
            seconds -= minutes * 60;

            let mut body = String::new();
            let _ = writeln!(body, "Active sessions: {active}");
            let _ = writeln!(body, "Sessions peak: {peak}");
            let _ = writeln!(
                body,
                "Uptime: {days} days, {hours} hours, {minutes} minutes and {seconds} seconds"
            );
            let _ = writeln!(body, "Served sessions: {served}");

            let res = Response::new(200)
                .with_header("Content-Type", "text/plain")
                .with_header("Refresh", "5")
                .with_body(body);
            stream.write_response(&res).await
        })
    }
}
