use crate::error::Result;
use crate::http::Request;
use crate::stream::Stream;
use futures::future::BoxFuture;
use std::path::Path;
use std::sync::Mutex;

/// One request's business logic. Move-once: the session loop consumes the
/// handler when it runs it.
pub trait SessionHandler: Send {
    fn call<'a>(
        self: Box<Self>,
        stream: &'a mut Stream,
        req: &'a mut Request,
    ) -> BoxFuture<'a, Result<()>>;
}

pub type Handler = Box<dyn SessionHandler>;

impl<F> SessionHandler for F
where
    F: for<'a> FnOnce(&'a mut Stream, &'a mut Request) -> BoxFuture<'a, Result<()>> + Send,
{
    fn call<'a>(
        self: Box<Self>,
        stream: &'a mut Stream,
        req: &'a mut Request,
    ) -> BoxFuture<'a, Result<()>> {
        (*self)(stream, req)
    }
}

/// Plugin probe: `Ok(None)` declines the request, `Ok(Some(_))` claims
/// it, and an error (e.g. the router's 405) aborts the session flow with
/// that error.
pub type CreateSessionFn = Box<dyn Fn(&Request) -> Result<Option<Handler>> + Send + Sync>;

/// A unit of functionality registered with the server at startup: a probe
/// (`create_session`) plus optional init/destroy hooks and an ordering
/// priority (lower order = earlier probe).
pub struct Plugin {
    name: String,
    order: u32,
    init: Mutex<Option<Box<dyn FnOnce(&Path) -> bool + Send>>>,
    create_session: CreateSessionFn,
    destroy: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Plugin {
    pub fn new<F>(name: impl Into<String>, order: u32, create_session: F) -> Self
    where
        F: Fn(&Request) -> Result<Option<Handler>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            order,
            init: Mutex::new(None),
            create_session: Box::new(create_session),
            destroy: Mutex::new(None),
        }
    }

    /// Called once with the configuration directory before the server
    /// starts accepting. Returning false drops the plugin.
    pub fn with_init<F>(self, init: F) -> Self
    where
        F: FnOnce(&Path) -> bool + Send + 'static,
    {
        *self.init.lock().unwrap() = Some(Box::new(init));
        self
    }

    /// Called once at server teardown.
    pub fn with_destroy<F>(self, destroy: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        *self.destroy.lock().unwrap() = Some(Box::new(destroy));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub(crate) fn init(&self, conf_dir: &Path) -> bool {
        let init = self.init.lock().unwrap().take();
        match init {
            Some(init) => init(conf_dir),
            None => true,
        }
    }

    pub(crate) fn create_session(&self, req: &Request) -> Result<Option<Handler>> {
        (self.create_session)(req)
    }

    pub(crate) fn destroy(&self) {
        if let Some(destroy) = self.destroy.lock().unwrap().take() {
            destroy();
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("order", &self.order)
            .finish()
    }
}
