use std::{
    convert::Infallible,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{body::Body, extract::Request, response::IntoResponse, response::Response};
use tower::{Layer, Service};

use crate::errors::AgentError;

const SECRET_HEADER: &str = "x-agent-secret";

/// Constant-time equality, independent of where the first mismatching byte is, to avoid
/// leaking secret length/prefix through response timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Clone)]
pub struct AuthLayer {
    secret: Arc<String>,
}

impl AuthLayer {
    pub fn new(secret: String) -> Self {
        Self { secret: Arc::new(secret) }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware { inner, secret: self.secret.clone() }
    }
}

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    secret: Arc<String>,
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response, Error = Infallible> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let mut inner = self.inner.clone();
        let secret = self.secret.clone();
        Box::pin(async move {
            let authorized = req
                .headers()
                .get(SECRET_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(|value| constant_time_eq(value.as_bytes(), secret.as_bytes()))
                .unwrap_or(false);

            if authorized {
                return inner.call(req).await;
            }

            Ok(AgentError::Unauthorized.into_response())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_secrets_match() {
        assert!(constant_time_eq(b"s3cr3t", b"s3cr3t"));
    }

    #[test]
    fn different_lengths_never_match() {
        assert!(!constant_time_eq(b"short", b"much-longer-secret"));
    }

    #[test]
    fn single_byte_difference_fails() {
        assert!(!constant_time_eq(b"s3cr3t", b"s3cr3x"));
    }
}
