//! obx-ports - 抽象 trait 层
//!
//! 定义消息模型与所有基础设施的抽象接口

mod handler;
mod lock;
mod message;
mod observer;
mod store;

pub use handler::*;
pub use lock::*;
pub use message::*;
pub use observer::*;
pub use store::*;
