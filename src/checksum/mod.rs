// 完整性校验模块
//
// CRC32C（Castagnoli）流式累加器：
// - 跨缓冲区边界增量计算
// - 多种表示形式之间的相互校验（数值 / base64 / 4 字节缓冲区 / 其他累加器）
// - 独立区间校验值的代数合并（并行分片 -> 整体对象校验值）

pub mod crc32c;

pub use self::crc32c::{
    ChecksumError, Crc32c, Crc32cInput, Crc32cValidator, CRC32C_EMPTY_BASE64,
};
