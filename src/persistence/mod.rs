// 持久化模块
//
// 上传会话缓存：按缓存键保存会话 URI 与数据首部
// - FileSessionStore：单个 JSON 文件，写入时先写临时文件再原子重命名
// - MemorySessionStore：进程内存，用于测试和不需要跨进程续传的场景

pub mod file_store;
pub mod memory_store;
pub mod types;

pub use file_store::FileSessionStore;
pub use memory_store::MemorySessionStore;
pub use types::{cache_key, SessionRecord};

use crate::error::Result;

/// 会话存储（键值接口）
///
/// 不同缓存键互不影响；同一键并发写入时后写者生效
pub trait SessionStore: Send + Sync {
    /// 读取会话记录
    fn get(&self, key: &str) -> Result<Option<SessionRecord>>;

    /// 写入会话记录
    fn set(&self, key: &str, record: &SessionRecord) -> Result<()>;

    /// 删除会话记录（不存在时不报错）
    fn delete(&self, key: &str) -> Result<()>;
}
