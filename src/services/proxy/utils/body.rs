//! 响应体类型

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 代理统一使用的响应体类型（完整响应与流式响应共用）
pub type BoxBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn box_body<B>(body: B) -> BoxBody
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}
