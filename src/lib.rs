//! HTTP/HTTPS 流量捕获与持久化
//!
//! 消费中间人代理引擎上报的请求/响应事件，规范化为稳定的 JSON 结构，
//! 写入快照文件并合并到累计文件，供 mock server 回放或离线查看

pub mod capture;
pub mod common;
pub mod ingest;
pub mod model;
pub mod status;
