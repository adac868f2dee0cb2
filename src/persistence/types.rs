// 持久化数据类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 可续传会话记录
///
/// 新进程通过它接续上一次未完成的上传，而不是重新开始
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// 服务端分配的会话 URI
    pub uri: String,
    /// 数据首部（base64），用于续传时的内容一致性校验
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_chunk: Option<String>,
    /// 代次提示
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 最后更新时间
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(uri: impl Into<String>, generation: Option<i64>) -> Self {
        let now = Utc::now();
        Self {
            uri: uri.into(),
            first_chunk: None,
            generation,
            created_at: now,
            updated_at: now,
        }
    }

    /// 更新时间戳
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// 会话缓存键：`{bucket}/{object}[/{generation}]`
///
/// 不同对象的键天然不同，并发会话不会互相覆盖
pub fn cache_key(bucket: &str, object: &str, generation: Option<i64>) -> String {
    match generation {
        Some(generation) => format!("{}/{}/{}", bucket, object, generation),
        None => format!("{}/{}", bucket, object),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key() {
        assert_eq!(cache_key("b", "dir/o.txt", None), "b/dir/o.txt");
        assert_eq!(cache_key("b", "o", Some(17)), "b/o/17");
    }

    #[test]
    fn test_record_serialization_skips_empty() {
        let record = SessionRecord::new("https://upload/1", None);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["uri"], "https://upload/1");
        assert!(json.get("first_chunk").is_none());
        assert!(json.get("generation").is_none());

        let back: SessionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
