// src/restful.rs
//
// RESTful routing over URL templates: literal segments and brace-enclosed
// captures, one handler factory per method. Matching is linear over the
// registered routes.

use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::plugin::{Handler, SessionHandler};
use crate::stream::Stream;
use crate::util::{split, unescape};
use futures::future::BoxFuture;
use std::collections::HashMap;

/// The outcome of a successful route match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRoute {
    /// Capture name to URL-decoded value.
    pub captures: HashMap<String, String>,
    /// Query string pairs, URL-decoded, in URL order.
    pub queries: Vec<(String, String)>,
    /// Precomputed comma-joined method list (all but OPTIONS), ready for
    /// `Allow` and CORS preflight headers.
    pub allow: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RoutePart {
    Literal(String),
    Capture(String),
}

type MethodHandler<T> = Box<dyn Fn(ParsedRoute) -> T + Send + Sync>;

/// One URL template with its per-method handler factories.
pub struct RestRoute<T> {
    parts: Vec<RoutePart>,
    methods: HashMap<String, MethodHandler<T>>,
    all_methods: String,
}

impl<T> RestRoute<T> {
    /// Registers (or replaces) the factory for `method`. Every method but
    /// OPTIONS joins the precomputed allow list on first registration.
    pub fn add_method_handler<F>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(ParsedRoute) -> T + Send + Sync + 'static,
    {
        let method = method.into();
        if !self.methods.contains_key(&method) && method != "OPTIONS" {
            if !self.all_methods.is_empty() {
                self.all_methods.push_str(", ");
            }
            self.all_methods.push_str(&method);
        }
        self.methods.insert(method, Box::new(handler));
        self
    }

    pub fn allow_list(&self) -> &str {
        &self.all_methods
    }

    /// Pairs capture segments with URL components; `Ok(None)` when the
    /// shape does not match, 405 when the shape matches but the verb has
    /// no handler.
    fn create_handler(
        &self,
        resources: &[&str],
        method: &str,
    ) -> Result<Option<(HashMap<String, String>, &MethodHandler<T>)>> {
        if resources.len() != self.parts.len() {
            return Ok(None);
        }
        let mut captures = HashMap::new();
        for (part, component) in self.parts.iter().zip(resources) {
            match part {
                RoutePart::Capture(name) => {
                    captures.insert(name.clone(), decode(component)?);
                }
                RoutePart::Literal(literal) => {
                    if literal != component {
                        return Ok(None);
                    }
                }
            }
        }
        match self.methods.get(method) {
            Some(handler) => Ok(Some((captures, handler))),
            None => Err(Error::MethodNotAllowed {
                allow: self.all_methods.clone(),
            }),
        }
    }
}

/// Router with an optional base path stripped off every URL before the
/// linear route scan.
pub struct RestRouter<T> {
    base: Vec<String>,
    routes: Vec<RestRoute<T>>,
}

impl<T> RestRouter<T> {
    pub fn new(base_url: &str) -> Self {
        Self {
            base: split(base_url, '/').into_iter().map(str::to_string).collect(),
            routes: Vec::new(),
        }
    }

    /// Returns the route for `template`, creating it on first use.
    /// Identical templates share one route.
    ///
    /// # Panics
    ///
    /// On a malformed template (an unterminated capture).
    pub fn route(&mut self, template: &str) -> &mut RestRoute<T> {
        let parts = parse_parts(template);
        if let Some(pos) = self.routes.iter().position(|r| r.parts == parts) {
            return &mut self.routes[pos];
        }
        self.routes.push(RestRoute {
            parts,
            methods: HashMap::new(),
            all_methods: String::new(),
        });
        self.routes.last_mut().expect("route was just pushed")
    }

    pub fn routes(&self) -> usize {
        self.routes.len()
    }

    pub fn base(&self) -> &[String] {
        &self.base
    }

    /// Matches `url` + `method` against the registered routes and invokes
    /// the winning factory with the populated [`ParsedRoute`].
    ///
    /// `Ok(None)` when no route matches; 405 with the allow list when a
    /// route matches but lacks the verb; 400 on malformed query strings.
    pub fn create_handler(&self, url: &str, method: &str) -> Result<Option<T>> {
        let (path, query) = match url.find('?') {
            Some(pos) => (&url[..pos], Some(&url[pos + 1..])),
            None => (url, None),
        };
        let resources = split(path, '/');
        if resources.len() < self.base.len() + 1 {
            return Ok(None);
        }
        for (base_part, component) in self.base.iter().zip(&resources) {
            if base_part.as_str() != *component {
                return Ok(None);
            }
        }
        let resources = &resources[self.base.len()..];

        for route in &self.routes {
            if let Some((captures, handler)) = route.create_handler(resources, method)? {
                let parsed = ParsedRoute {
                    captures,
                    queries: match query {
                        Some(query) => parse_query(query)?,
                        None => Vec::new(),
                    },
                    allow: route.all_methods.clone(),
                };
                return Ok(Some(handler(parsed)));
            }
        }
        Ok(None)
    }
}

fn parse_parts(template: &str) -> Vec<RoutePart> {
    split(template, '/')
        .into_iter()
        .map(|part| {
            if let Some(name) = part.strip_prefix('{') {
                let name = name
                    .strip_suffix('}')
                    .unwrap_or_else(|| panic!("unterminated capture in route template {template:?}"));
                RoutePart::Capture(name.to_string())
            } else {
                RoutePart::Literal(part.to_string())
            }
        })
        .collect()
}

/// `k=v&k=v` with both halves URL-decoded; a pair splitting into more
/// than two non-empty halves is a 400.
fn parse_query(query: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for pair in split(query, '&') {
        let halves = split(pair, '=');
        match halves.len() {
            1 => out.push((decode(halves[0])?, String::new())),
            2 => out.push((decode(halves[0])?, decode(halves[1])?)),
            _ => {
                return Err(Error::ErrorResponse(
                    Response::new(400).with_body("Invalid query strings"),
                ))
            }
        }
    }
    Ok(out)
}

fn decode(component: &str) -> Result<String> {
    unescape(component).map_err(|_| {
        Error::ErrorResponse(Response::new(400).with_body("Invalid query strings"))
    })
}

struct RouteSession<F> {
    route: ParsedRoute,
    f: F,
}

impl<F> SessionHandler for RouteSession<F>
where
    F: for<'a> FnOnce(ParsedRoute, &'a mut Stream, &'a mut Request) -> BoxFuture<'a, Result<()>>
        + Send,
{
    fn call<'a>(
        self: Box<Self>,
        stream: &'a mut Stream,
        req: &'a mut Request,
    ) -> BoxFuture<'a, Result<()>> {
        (self.f)(self.route, stream, req)
    }
}

/// Adapts a route-aware async function into a method handler factory for
/// a `RestRouter<Handler>`:
///
/// ```ignore
/// router.route("devices/{device}")
///     .add_method_handler("GET", session_handler(get_device));
/// ```
pub fn session_handler<F>(f: F) -> impl Fn(ParsedRoute) -> Handler + Send + Sync
where
    F: for<'a> Fn(ParsedRoute, &'a mut Stream, &'a mut Request) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync
        + Clone
        + 'static,
{
    move |route| {
        Box::new(RouteSession {
            route,
            f: f.clone(),
        }) as Handler
    }
}
