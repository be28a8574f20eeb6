use async_trait::async_trait;

use crate::route::{Reply, RouteRequest};

/// One stage of a route's middleware chain.
///
/// Stages run in registration order before validation and dispatch. A
/// stage may mutate the request (attach `user`, rewrite headers) or
/// short-circuit with a [`Reply`], which is sent without invoking later
/// stages or the handler.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, req: &mut RouteRequest) -> Result<(), Reply>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct RequireHeader(&'static str);

    #[async_trait]
    impl Middleware for RequireHeader {
        async fn handle(&self, req: &mut RouteRequest) -> Result<(), Reply> {
            if req.headers.contains_key(self.0) {
                req.user = Some(json!({"via": self.0}));
                Ok(())
            } else {
                Err(Reply::ok(json!({"error": "unauthorized"})).with_status(401))
            }
        }
    }

    fn request() -> RouteRequest {
        RouteRequest {
            method: "GET".into(),
            path: "/x".into(),
            route: "/x".into(),
            url: "/x".into(),
            params: HashMap::new(),
            query: json!({}),
            body: json!(null),
            headers: HashMap::new(),
            user: None,
        }
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let mw = RequireHeader("authorization");
        let mut req = request();
        let reply = mw.handle(&mut req).await.unwrap_err();
        assert_eq!(reply.status, Some(401));
    }

    #[tokio::test]
    async fn middleware_can_mutate_request() {
        let mw = RequireHeader("authorization");
        let mut req = request();
        req.headers.insert("authorization".into(), "Bearer x".into());
        mw.handle(&mut req).await.unwrap();
        assert_eq!(req.user, Some(json!({"via": "authorization"})));
    }
}
