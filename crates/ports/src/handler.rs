//! 消息处理器 trait 定义

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::MessageMetadata;

/// 类型化消息处理器
///
/// 处理器在批次事务内执行：通过 `tx` 进行的写入与批次一同提交，
/// 处理失败时由消息级 savepoint 撤销。
#[async_trait]
pub trait MessageHandler<Tx: Send>: Send + Sync + 'static {
    /// 负载类型，由 Dispatcher 从 `data` 反序列化
    type Payload: DeserializeOwned + Send;

    async fn handle(
        &self,
        tx: &mut Tx,
        payload: Self::Payload,
        metadata: &MessageMetadata,
    ) -> anyhow::Result<()>;

    /// 声明哪些失败原因应当永久丢弃消息而不是重试
    ///
    /// 错误策略链的丢弃策略会咨询这个判定。默认不丢弃。
    fn discard_on(&self, _cause: &anyhow::Error) -> bool {
        false
    }
}
