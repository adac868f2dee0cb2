// 存储 API 数据类型

use crate::error::{Result, TransferError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// 对象引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.name)
    }
}

/// 写入前置条件
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preconditions {
    pub if_generation_match: Option<i64>,
    pub if_generation_not_match: Option<i64>,
    pub if_metageneration_match: Option<i64>,
    pub if_metageneration_not_match: Option<i64>,
}

impl Preconditions {
    /// 是否足以保证重放安全
    ///
    /// 只有 match 类条件能让重复写入被服务端拒绝
    pub fn is_idempotent(&self) -> bool {
        self.if_generation_match.is_some() || self.if_metageneration_match.is_some()
    }

    /// 转换为查询参数
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(v) = self.if_generation_match {
            pairs.push(("ifGenerationMatch", v.to_string()));
        }
        if let Some(v) = self.if_generation_not_match {
            pairs.push(("ifGenerationNotMatch", v.to_string()));
        }
        if let Some(v) = self.if_metageneration_match {
            pairs.push(("ifMetagenerationMatch", v.to_string()));
        }
        if let Some(v) = self.if_metageneration_not_match {
            pairs.push(("ifMetagenerationNotMatch", v.to_string()));
        }
        pairs
    }
}

/// 客户提供的加密密钥（CSEK）
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    key: String,
    key_hash: String,
}

impl EncryptionKey {
    /// 原始密钥长度（AES-256）
    pub const KEY_LEN: usize = 32;

    /// 从原始密钥创建
    pub fn new(raw: &[u8]) -> Result<Self> {
        if raw.len() != Self::KEY_LEN {
            return Err(TransferError::InvalidArgument(format!(
                "加密密钥长度必须为 {} 字节，实际为 {} 字节",
                Self::KEY_LEN,
                raw.len()
            )));
        }
        let hash = Sha256::digest(raw);
        Ok(Self {
            key: BASE64.encode(raw),
            key_hash: BASE64.encode(hash),
        })
    }

    /// 从 base64 编码的密钥创建
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| TransferError::InvalidArgument(format!("加密密钥不是合法的 base64: {}", e)))?;
        Self::new(&raw)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn key_hash(&self) -> &str {
        &self.key_hash
    }

    /// 请求头
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            ("x-goog-encryption-algorithm", "AES256".to_string()),
            ("x-goog-encryption-key", self.key.clone()),
            ("x-goog-encryption-key-sha256", self.key_hash.clone()),
        ]
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key", &"***")
            .field("key_hash", &self.key_hash)
            .finish()
    }
}

/// 上传选项
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// 目标对象
    pub object: ObjectRef,
    /// 代次提示（参与会话缓存键）
    pub generation: Option<i64>,
    /// 写入前置条件
    pub preconditions: Preconditions,
    /// KMS 密钥名
    pub kms_key_name: Option<String>,
    /// 预定义 ACL
    pub predefined_acl: Option<String>,
    /// 内容类型
    pub content_type: Option<String>,
    /// 对象元数据（JSON 对象）
    pub metadata: Option<serde_json::Value>,
    /// 客户提供的加密密钥
    pub encryption: Option<EncryptionKey>,
    /// 内容总长度（未知时为 None）
    pub content_length: Option<u64>,
    /// 调用方手动提供的会话 URI
    pub uri: Option<String>,
    /// 分片大小（None 使用配置值）
    pub chunk_size: Option<u64>,
}

impl Default for ObjectRef {
    fn default() -> Self {
        Self::new("", "")
    }
}

impl UploadOptions {
    pub fn new(object: ObjectRef) -> Self {
        Self {
            object,
            ..Default::default()
        }
    }
}

/// 兼容字符串与数字两种表示的数值字段
fn string_or_number<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: fmt::Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr<T> {
        Number(T),
        Text(String),
    }

    match Option::<Repr<T>>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Repr::Number(v)) => Ok(Some(v)),
        Some(Repr::Text(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// 对象元数据
///
/// 服务端以字符串返回 64 位数值，这里统一规范为数值类型
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub size: Option<u64>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub generation: Option<i64>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub metageneration: Option<i64>,
    #[serde(default)]
    pub content_type: Option<String>,
    /// base64 编码的 CRC32C
    #[serde(default)]
    pub crc32c: Option<String>,
    #[serde(default)]
    pub md5_hash: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
}

/// 分片上传 / 偏移探测的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkResponse {
    /// 未完成，服务端已持久化到 offset（不含）
    Incomplete { offset: u64 },
    /// 上传完成
    Complete(ObjectMetadata),
}

/// 分段上传完成结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedMultipart {
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub etag: Option<String>,
}
