//! 转发代理
//!
//! 客户端把 API 基础地址指向本代理；请求原样转发到上游，
//! 同时驱动采集流水线的请求/响应钩子。

mod proxy_instance;
pub mod utils;

pub use proxy_instance::ProxyInstance;
