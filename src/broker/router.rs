//! Topic routing
//!
//! Maps `(method, topic)` to a handler chain. Patterns are `/`-delimited;
//! a `:name` segment matches any one segment and binds it, and a trailing
//! `*` matches any remaining suffix (including nothing) and binds it under
//! the name `*`. Everything else must match byte for byte. Routes are
//! checked in registration order and the first match wins.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use super::context::Context;
use crate::error::Result;

/// Parameter name bound by a trailing wildcard
pub const WILDCARD_PARAM: &str = "*";

/// Broker event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Long-running producer for a topic with subscribers
    Pub,
    /// Admission check for a new subscription
    Sub,
    /// Cleanup after a subscription ends
    Unsub,
    /// One-shot request carrying an optional payload
    Msg,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Pub => "PUB",
            Method::Sub => "SUB",
            Method::Unsub => "UNSUB",
            Method::Msg => "MSG",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters bound by a route match
pub type Params = HashMap<String, String>;

/// Future returned by handlers and middleware
pub type HandlerFuture = BoxFuture<'static, Result<()>>;

/// A route endpoint
///
/// Implemented for any `Fn(Context) -> impl Future<Output = Result<()>>`.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, ctx: Context) -> HandlerFuture {
        Box::pin(self(ctx))
    }
}

/// A step run before the handler
///
/// Returning without calling `next.run(ctx)` (usually with an error)
/// short-circuits the chain.
pub trait Middleware: Send + Sync + 'static {
    fn handle(&self, ctx: Context, next: Next) -> HandlerFuture;
}

impl<F, Fut> Middleware for F
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, ctx: Context, next: Next) -> HandlerFuture {
        Box::pin(self(ctx, next))
    }
}

/// The remainder of a middleware chain
pub struct Next {
    chain: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    handler: Arc<dyn Handler>,
}

impl Next {
    /// Run the next middleware, or the handler once the chain is exhausted
    pub fn run(self, ctx: Context) -> HandlerFuture {
        match self.chain.get(self.index).cloned() {
            Some(middleware) => {
                let next = Next {
                    chain: self.chain,
                    index: self.index + 1,
                    handler: self.handler,
                };
                middleware.handle(ctx, next)
            }
            None => self.handler.call(ctx),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

fn parse_pattern(pattern: &str) -> Vec<Segment> {
    let parts: Vec<&str> = pattern.split('/').collect();
    let last = parts.len() - 1;
    parts
        .iter()
        .enumerate()
        .map(|(i, part)| {
            if i == last && *part == WILDCARD_PARAM {
                Segment::Wildcard
            } else if let Some(name) = part.strip_prefix(':') {
                Segment::Param(name.to_string())
            } else {
                Segment::Literal(part.to_string())
            }
        })
        .collect()
}

/// Path part of a topic, without any `?query` suffix
pub fn topic_path(topic: &str) -> &str {
    topic.split_once('?').map_or(topic, |(path, _)| path)
}

/// A registered route
pub struct Route {
    method: Method,
    pattern: String,
    segments: Vec<Segment>,
    handler: Arc<dyn Handler>,
    middleware: Vec<Arc<dyn Middleware>>,
    chain: Arc<[Arc<dyn Middleware>]>,
}

impl Route {
    fn new(
        method: Method,
        pattern: &str,
        handler: Arc<dyn Handler>,
        middleware: Vec<Arc<dyn Middleware>>,
    ) -> Self {
        let chain = Arc::from(middleware.clone());
        Self {
            method,
            pattern: pattern.to_string(),
            segments: parse_pattern(pattern),
            handler,
            middleware,
            chain,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Match a topic path against this route's pattern
    pub fn matches(&self, topic: &str) -> Option<Params> {
        let mut params = Params::new();
        let mut parts = topic_path(topic).split('/');

        for segment in &self.segments {
            match segment {
                Segment::Wildcard => {
                    let rest: Vec<&str> = parts.by_ref().collect();
                    params.insert(WILDCARD_PARAM.to_string(), rest.join("/"));
                    return Some(params);
                }
                Segment::Param(name) => {
                    let part = parts.next()?;
                    params.insert(name.clone(), part.to_string());
                }
                Segment::Literal(literal) => {
                    if parts.next()? != literal.as_str() {
                        return None;
                    }
                }
            }
        }

        // Segment counts must agree when there is no wildcard
        match parts.next() {
            Some(_) => None,
            None => Some(params),
        }
    }

    /// Run the route's middleware chain and handler
    pub fn run(&self, ctx: Context) -> HandlerFuture {
        Next {
            chain: Arc::clone(&self.chain),
            index: 0,
            handler: Arc::clone(&self.handler),
        }
        .run(ctx)
    }

    /// Put `middleware` ahead of this route's own middleware
    fn prepend(&mut self, middleware: &[Arc<dyn Middleware>]) {
        let chain: Vec<Arc<dyn Middleware>> = middleware
            .iter()
            .chain(self.middleware.iter())
            .cloned()
            .collect();
        self.chain = Arc::from(chain);
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .field("middleware", &self.chain.len())
            .finish()
    }
}

/// A successful route lookup
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    pub params: Params,
}

/// Ordered table of routes
#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route
    pub fn add(
        &mut self,
        method: Method,
        pattern: &str,
        handler: impl Handler,
        middleware: Vec<Arc<dyn Middleware>>,
    ) -> &Route {
        self.routes
            .push(Route::new(method, pattern, Arc::new(handler), middleware));
        &self.routes[self.routes.len() - 1]
    }

    /// Apply global middleware ahead of every route's own middleware
    pub(crate) fn apply_global(&mut self, middleware: &[Arc<dyn Middleware>]) {
        if middleware.is_empty() {
            return;
        }
        for route in &mut self.routes {
            route.prepend(middleware);
        }
    }

    /// Find the first route for `method` matching `topic`
    pub fn find(&self, method: Method, topic: &str) -> Option<RouteMatch<'_>> {
        self.routes
            .iter()
            .filter(|route| route.method == method)
            .find_map(|route| route.matches(topic).map(|params| RouteMatch { route, params }))
    }

    /// Registered routes in order
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn noop(_ctx: Context) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_param_binding() {
        let mut router = Router::new();
        router.add(Method::Sub, "/instruments/:id/cameras", noop, vec![]);

        let found = router.find(Method::Sub, "/instruments/42/cameras").unwrap();
        assert_eq!(found.route.pattern(), "/instruments/:id/cameras");
        assert_eq!(found.params.get("id").map(String::as_str), Some("42"));

        assert!(router.find(Method::Sub, "/instruments/42").is_none());
        assert!(router.find(Method::Sub, "/instruments/42/cameras/7").is_none());
        assert!(router.find(Method::Sub, "/instruments/42/controllers").is_none());
        // Same pattern, different method
        assert!(router.find(Method::Pub, "/instruments/42/cameras").is_none());
    }

    #[test]
    fn test_wildcard_suffix() {
        let mut router = Router::new();
        router.add(Method::Pub, "/video-streams/*", noop, vec![]);

        let found = router.find(Method::Pub, "/video-streams/a/b/c").unwrap();
        assert_eq!(found.params.get(WILDCARD_PARAM).map(String::as_str), Some("a/b/c"));

        let empty = router.find(Method::Pub, "/video-streams").unwrap();
        assert_eq!(empty.params.get(WILDCARD_PARAM).map(String::as_str), Some(""));

        assert!(router.find(Method::Pub, "/other-streams/a").is_none());
    }

    #[test]
    fn test_query_is_ignored_for_matching() {
        let mut router = Router::new();
        router.add(
            Method::Pub,
            "/video-streams/external-stream/source.mjpeg",
            noop,
            vec![],
        );

        let topic = "/video-streams/external-stream/source.mjpeg?url=http%3A%2F%2Fcam%2Fa";
        assert!(router.find(Method::Pub, topic).is_some());
        assert_eq!(topic_path(topic), "/video-streams/external-stream/source.mjpeg");
    }

    #[test]
    fn test_first_registered_wins() {
        let mut router = Router::new();
        router.add(Method::Msg, "/cameras/:id", noop, vec![]);
        router.add(Method::Msg, "/cameras/main", noop, vec![]);
        router.add(Method::Msg, "/cameras/*", noop, vec![]);

        for _ in 0..10 {
            let found = router.find(Method::Msg, "/cameras/main").unwrap();
            assert_eq!(found.route.pattern(), "/cameras/:id");
        }
    }

    #[test]
    fn test_literal_star_in_middle() {
        let mut router = Router::new();
        router.add(Method::Sub, "/a/*/c", noop, vec![]);

        assert!(router.find(Method::Sub, "/a/*/c").is_some());
        assert!(router.find(Method::Sub, "/a/b/c").is_none());
    }

    #[test]
    fn test_method_display() {
        assert_eq!(Method::Pub.to_string(), "PUB");
        assert_eq!(Method::Unsub.as_str(), "UNSUB");
    }
}
