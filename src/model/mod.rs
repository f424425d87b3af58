//! 配置与代理引擎数据模型

pub mod config;
pub mod flow;
