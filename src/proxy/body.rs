//! Body and response helpers shared by both proxy modes.

use super::error::ProxyError;
use crate::auth::{AUTH_SCHEME, AuthError};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited};
use hyper::body::Body;
use hyper::header::{CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::{Response, StatusCode};

/// Body type for everything the proxies send.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Create an empty body.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Create a body with content.
pub fn full_body(content: impl Into<Bytes>) -> ProxyBody {
    Full::new(content.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-text response with the given status.
pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// 502 response for upstream and signing failures.
pub fn bad_gateway(err: &ProxyError) -> Response<ProxyBody> {
    text_response(StatusCode::BAD_GATEWAY, format!("Bad gateway: {}\n", err))
}

/// 401 response for a rejected credential.
pub fn unauthorized(err: &AuthError) -> Response<ProxyBody> {
    let mut response = text_response(StatusCode::UNAUTHORIZED, format!("{}\n", err));
    response.headers_mut().insert(
        WWW_AUTHENTICATE,
        hyper::header::HeaderValue::from_static(AUTH_SCHEME),
    );
    response
}

/// Buffer a body, failing once it exceeds `limit` bytes.
pub async fn collect_body<B>(body: B, limit: usize) -> Result<Bytes, ProxyError>
where
    B: Body<Data = Bytes>,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    Limited::new(body, limit)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| ProxyError::Body(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_response() {
        let response = unauthorized(&AuthError::MissingCredential);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[WWW_AUTHENTICATE], "HMAC-SHA256");
    }

    #[test]
    fn test_bad_gateway_response() {
        let response = bad_gateway(&ProxyError::Timeout {
            addr: "api.example.com:443".to_string(),
            after: std::time::Duration::from_secs(10),
        });
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_collect_body_within_limit() {
        let body = Full::new(Bytes::from_static(b"hello"));
        assert_eq!(collect_body(body, 5).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_collect_body_over_limit() {
        let body = Full::new(Bytes::from_static(b"hello world"));
        assert!(matches!(collect_body(body, 5).await, Err(ProxyError::Body(_))));
    }
}
