//! 代理自身产生的错误响应
//!
//! 与上游 API 的错误格式保持一致，客户端可以按同样的方式解析。

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde_json::json;

use super::body::{box_body, BoxBody};

fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response<BoxBody> {
    let body = json!({
        "type": "error",
        "error": {
            "type": error_type,
            "message": message,
        }
    })
    .to_string();

    let mut response = Response::new(box_body(Full::new(Bytes::from(body))));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// 上游不可达或返回异常
pub fn bad_gateway(message: &str) -> Response<BoxBody> {
    error_response(StatusCode::BAD_GATEWAY, "proxy_upstream_error", message)
}

/// 代理内部错误
pub fn internal_error(message: &str) -> Response<BoxBody> {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "proxy_internal_error", message)
}
