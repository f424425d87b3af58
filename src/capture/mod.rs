//! HTTP 流量捕获模块
//!
//! 把代理引擎上报的请求/响应规范化为捕获记录，缓冲后按数量、定时、信号
//! 三种方式触发保存，写入快照文件并合并到累计文件

pub mod addon;
pub mod buffer;
pub mod error;
pub mod normalizer;
pub mod policy;
pub mod record;
pub mod store;

pub use addon::CaptureAddon;
pub use buffer::CaptureBuffer;
pub use error::{CaptureError, PersistError};
pub use policy::{FlushHandle, FlushOutcome, FlushTrigger};
pub use record::{CaptureBatch, CaptureRecord};
pub use store::{CaptureStore, FlushReport};
