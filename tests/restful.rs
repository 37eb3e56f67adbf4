// tests/restful.rs

use portico::{Error, ParsedRoute, RestRouter};

// ------------------------------- types & utils -------------------------------

type Router = RestRouter<(usize, ParsedRoute)>;

fn add_route(router: &mut Router, template: &str, method: &str, id: usize) {
    router
        .route(template)
        .add_method_handler(method, move |route| (id, route));
}

fn lookup(router: &Router, url: &str, method: &str) -> Option<(usize, ParsedRoute)> {
    router
        .create_handler(url, method)
        .unwrap_or_else(|e| panic!("unexpected error for {url}: {e}"))
}

fn assert_match(router: &Router, url: &str, method: &str, expected_id: usize) -> ParsedRoute {
    let (id, route) = lookup(router, url, method)
        .unwrap_or_else(|| panic!("expected match for URL {url}"));
    assert_eq!(id, expected_id, "URL: {url}");
    route
}

fn assert_no_match(router: &Router, url: &str, method: &str) {
    assert!(
        lookup(router, url, method).is_none(),
        "expected no match for URL {url}"
    );
}

// ------------------------------- tests --------------------------------------

#[test]
fn base_url_normalization() {
    let router = Router::new("");
    assert!(router.base().is_empty());

    let router = Router::new("///");
    assert!(router.base().is_empty());

    let router = Router::new("///a/b//c///");
    assert_eq!(router.base(), ["a", "b", "c"]);
}

#[test]
fn identical_templates_share_one_route() {
    let mut router = Router::new("");
    add_route(&mut router, "/parents", "OPTIONS", 0);
    assert_eq!(router.routes(), 1);
    add_route(&mut router, "/parents", "GET", 1);
    assert_eq!(router.routes(), 1);
    add_route(&mut router, "/parents/{parent}", "GET", 2);
    assert_eq!(router.routes(), 2);
    add_route(&mut router, "parents/{parent}", "PUT", 3);
    assert_eq!(router.routes(), 2);
}

#[test]
fn literal_and_capture_matching() {
    let mut router = Router::new("");
    add_route(&mut router, "/parents", "GET", 0);
    add_route(&mut router, "/parents/{parent}", "GET", 1);
    add_route(&mut router, "/parents/{parent}/children/{child}", "GET", 2);

    let route = assert_match(&router, "/parents", "GET", 0);
    assert!(route.captures.is_empty());

    let route = assert_match(&router, "/parents/1234", "GET", 1);
    assert_eq!(route.captures["parent"], "1234");

    let route = assert_match(&router, "/parents/12/children/34", "GET", 2);
    assert_eq!(route.captures["parent"], "12");
    assert_eq!(route.captures["child"], "34");

    assert_no_match(&router, "/parents/12/children", "GET");
    assert_no_match(&router, "/children/12", "GET");
}

#[test]
fn lookup_is_idempotent_and_slash_insensitive() {
    let mut router = Router::new("/api/v1");
    add_route(&mut router, "items/{item}", "GET", 0);

    let urls = [
        "/api/v1/items/7?x=1&y=2",
        "//api///v1/items/7/?x=1&y=2",
        "api/v1/items/7?x=1&y=2",
    ];
    let first = assert_match(&router, urls[0], "GET", 0);
    for url in urls {
        for _ in 0..3 {
            let route = assert_match(&router, url, "GET", 0);
            assert_eq!(route, first, "URL: {url}");
        }
    }
}

#[test]
fn base_url_must_be_a_prefix() {
    let mut router = Router::new("/v1");
    add_route(&mut router, "devices", "GET", 0);

    assert_match(&router, "/v1/devices", "GET", 0);
    assert_no_match(&router, "/v2/devices", "GET");
    assert_no_match(&router, "/devices", "GET");
    assert_no_match(&router, "/v1", "GET");
}

#[test]
fn unknown_method_is_405_with_allow_list() {
    let mut router = Router::new("");
    add_route(&mut router, "/parents", "OPTIONS", 0);
    add_route(&mut router, "/parents", "GET", 1);
    add_route(&mut router, "/parents", "DELETE", 2);
    add_route(&mut router, "/parents", "POST", 3);

    let route = assert_match(&router, "/parents", "GET", 1);
    assert_eq!(route.allow, "GET, DELETE, POST");

    match router.create_handler("/parents", "PUT") {
        Err(Error::MethodNotAllowed { allow }) => assert_eq!(allow, "GET, DELETE, POST"),
        other => panic!("expected 405, got {other:?}"),
    }
}

#[test]
fn replacing_a_method_keeps_the_allow_list() {
    let mut router = Router::new("");
    add_route(&mut router, "/x", "GET", 0);
    add_route(&mut router, "/x", "PUT", 1);
    add_route(&mut router, "/x", "GET", 2);

    let route = assert_match(&router, "/x", "GET", 2);
    assert_eq!(route.allow, "GET, PUT");
}

#[test]
fn captures_are_url_decoded() {
    let mut router = Router::new("");
    add_route(&mut router, "/files/{name}", "GET", 0);

    let route = assert_match(&router, "/files/a%20b%2Fc+d", "GET", 0);
    assert_eq!(route.captures["name"], "a b/c d");
}

#[test]
fn query_strings_are_decoded_in_order() {
    let mut router = Router::new("");
    add_route(&mut router, "/q", "GET", 0);

    let route = assert_match(&router, "/q?b=2&a=%31&empty&c=x+y", "GET", 0);
    assert_eq!(
        route.queries,
        vec![
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
            ("empty".to_string(), String::new()),
            ("c".to_string(), "x y".to_string()),
        ]
    );
}

#[test]
fn malformed_query_pair_is_rejected() {
    let mut router = Router::new("");
    add_route(&mut router, "/q", "GET", 0);

    match router.create_handler("/q?a=b=c", "GET") {
        Err(Error::ErrorResponse(res)) => assert_eq!(res.status(), 400),
        other => panic!("expected 400, got {other:?}"),
    }
}
