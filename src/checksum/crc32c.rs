//! CRC32C 累加器
//!
//! 内部以无符号 32 位寄存器计算，对外数值表示为有符号 32 位补码
//! （约一半的输入会得到负数）。线上格式为 4 字节大端序的 base64 编码。

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::fmt;
use thiserror::Error;

/// 未处理任何字节时的 base64 编码
pub const CRC32C_EMPTY_BASE64: &str = "AAAAAA==";

/// CRC32C 字节长度
const CRC32C_BYTE_LEN: usize = 4;

/// 校验值构造错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChecksumError {
    /// 字节长度不是 4（或 32 位元素个数不是 1），携带实际字节长度
    #[error("CRC32C 初始值必须恰好为 4 字节，实际为 {0} 字节")]
    InvalidLength(usize),
    /// base64 无法解码
    #[error("CRC32C base64 解码失败: {0}")]
    InvalidEncoding(String),
}

/// 通用校验对象
///
/// 调用方可以提供自己的实现（例如硬件加速的校验器），
/// 与 [`Crc32c`] 之间以 base64 编码比较
pub trait Crc32cValidator: Send + Sync {
    /// 追加数据
    fn update(&mut self, data: &[u8]);
    /// base64 编码的当前值
    fn to_base64(&self) -> String;
}

/// `validate` / `from_input` 接受的输入形式
#[derive(Clone, Copy)]
pub enum Crc32cInput<'a> {
    /// 有符号 32 位数值
    Number(i32),
    /// base64 编码
    Base64(&'a str),
    /// 原始字节（期望 4 字节大端序）
    Buffer(&'a [u8]),
    /// 32 位元素视图（期望恰好 1 个元素）
    Words(&'a [u32]),
    /// 另一个累加器
    Checksum(&'a Crc32c),
    /// 通用校验对象
    Validator(&'a dyn Crc32cValidator),
}

impl From<i32> for Crc32cInput<'_> {
    fn from(value: i32) -> Self {
        Crc32cInput::Number(value)
    }
}

impl<'a> From<&'a str> for Crc32cInput<'a> {
    fn from(value: &'a str) -> Self {
        Crc32cInput::Base64(value)
    }
}

impl<'a> From<&'a String> for Crc32cInput<'a> {
    fn from(value: &'a String) -> Self {
        Crc32cInput::Base64(value.as_str())
    }
}

impl<'a> From<&'a [u8]> for Crc32cInput<'a> {
    fn from(value: &'a [u8]) -> Self {
        Crc32cInput::Buffer(value)
    }
}

impl<'a> From<&'a [u8; 4]> for Crc32cInput<'a> {
    fn from(value: &'a [u8; 4]) -> Self {
        Crc32cInput::Buffer(value)
    }
}

impl<'a> From<&'a [u32]> for Crc32cInput<'a> {
    fn from(value: &'a [u32]) -> Self {
        Crc32cInput::Words(value)
    }
}

impl<'a> From<&'a Crc32c> for Crc32cInput<'a> {
    fn from(value: &'a Crc32c) -> Self {
        Crc32cInput::Checksum(value)
    }
}

impl<'a> From<&'a dyn Crc32cValidator> for Crc32cInput<'a> {
    fn from(value: &'a dyn Crc32cValidator) -> Self {
        Crc32cInput::Validator(value)
    }
}

/// CRC32C 流式累加器
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Crc32c {
    crc: u32,
}

impl Crc32c {
    /// 创建空累加器
    pub fn new() -> Self {
        Self::default()
    }

    /// 计算一段数据的校验值
    pub fn of(data: &[u8]) -> Self {
        let mut crc = Self::new();
        crc.update(data);
        crc
    }

    /// 追加数据，O(n)
    pub fn update(&mut self, data: &[u8]) {
        self.crc = ::crc32c::crc32c_append(self.crc, data);
    }

    /// 4 字节大端序表示
    pub fn to_bytes(&self) -> [u8; 4] {
        self.crc.to_be_bytes()
    }

    /// base64 编码（线上传输格式）
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    /// 有符号 32 位数值表示
    pub fn value(&self) -> i32 {
        self.crc as i32
    }

    /// 无符号寄存器值
    pub fn as_u32(&self) -> u32 {
        self.crc
    }

    /// 与其他表示形式比较，编码逐位一致时返回 true
    ///
    /// 长度不对的缓冲区或无法解码的字符串视为不匹配，不报错
    pub fn validate<'a>(&self, other: impl Into<Crc32cInput<'a>>) -> bool {
        match other.into() {
            Crc32cInput::Number(n) => self.value() == n,
            Crc32cInput::Base64(s) => self.to_base64() == s,
            Crc32cInput::Buffer(b) => self.to_bytes().as_slice() == b,
            Crc32cInput::Words(w) => w.len() == 1 && w[0] == self.crc,
            Crc32cInput::Checksum(c) => c.crc == self.crc,
            Crc32cInput::Validator(v) => v.to_base64() == self.to_base64(),
        }
    }

    /// 从任意支持的表示形式构造一个独立的累加器
    pub fn from_input<'a>(source: impl Into<Crc32cInput<'a>>) -> Result<Self, ChecksumError> {
        match source.into() {
            Crc32cInput::Number(n) => Ok(Self::from_value(n)),
            Crc32cInput::Base64(s) => Self::from_base64(s),
            Crc32cInput::Buffer(b) => Self::from_bytes(b),
            Crc32cInput::Words(w) => Self::from_words(w),
            Crc32cInput::Checksum(c) => Ok(*c),
            Crc32cInput::Validator(v) => Self::from_base64(&v.to_base64()),
        }
    }

    /// 从有符号数值构造
    pub fn from_value(value: i32) -> Self {
        Self { crc: value as u32 }
    }

    /// 从 4 字节大端序缓冲区构造
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChecksumError> {
        let raw: [u8; CRC32C_BYTE_LEN] = bytes
            .try_into()
            .map_err(|_| ChecksumError::InvalidLength(bytes.len()))?;
        Ok(Self {
            crc: u32::from_be_bytes(raw),
        })
    }

    /// 从 32 位元素视图构造（必须恰好 1 个元素）
    pub fn from_words(words: &[u32]) -> Result<Self, ChecksumError> {
        match words {
            [crc] => Ok(Self { crc: *crc }),
            _ => Err(ChecksumError::InvalidLength(
                words.len() * CRC32C_BYTE_LEN,
            )),
        }
    }

    /// 从 base64 编码构造
    pub fn from_base64(encoded: &str) -> Result<Self, ChecksumError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| ChecksumError::InvalidEncoding(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// 合并紧随其后的区间
    ///
    /// 已知 CRC(A)（即 self）、CRC(B) 与 len(B)，得到 CRC(A‖B)，无需重新读取 A
    pub fn combine(&mut self, next: &Crc32c, next_len: u64) {
        if next_len == 0 {
            return;
        }
        self.crc = ::crc32c::crc32c_combine(self.crc, next.crc, next_len as usize);
    }

    /// 按顺序合并多个区间的校验值
    ///
    /// # 参数
    /// * `parts` - (区间校验值, 区间字节数)，必须按字节顺序排列
    pub fn combine_all<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = (Crc32c, u64)>,
    {
        parts
            .into_iter()
            .fold(Crc32c::new(), |mut acc, (crc, len)| {
                acc.combine(&crc, len);
                acc
            })
    }
}

impl Crc32cValidator for Crc32c {
    fn update(&mut self, data: &[u8]) {
        Crc32c::update(self, data);
    }

    fn to_base64(&self) -> String {
        Crc32c::to_base64(self)
    }
}

impl fmt::Display for Crc32c {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl From<Crc32c> for i32 {
    fn from(crc: Crc32c) -> Self {
        crc.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// 只实现 base64 的外部校验对象
    struct ForeignValidator(String);

    impl Crc32cValidator for ForeignValidator {
        fn update(&mut self, _data: &[u8]) {}

        fn to_base64(&self) -> String {
            self.0.clone()
        }
    }

    #[test]
    fn test_empty_input() {
        let crc = Crc32c::new();
        assert_eq!(crc.to_base64(), CRC32C_EMPTY_BASE64);
        assert_eq!(crc.value(), 0);
        assert_eq!(crc.to_bytes(), [0, 0, 0, 0]);

        let mut crc = Crc32c::new();
        crc.update(b"");
        assert_eq!(crc.to_string(), CRC32C_EMPTY_BASE64);
    }

    #[test]
    fn test_known_vectors() {
        let crc = Crc32c::of(b"123456789");
        assert_eq!(crc.as_u32(), 0xE306_9283);
        assert_eq!(crc.value(), -486_108_541);
        assert_eq!(crc.to_base64(), "4waSgw==");

        let crc = Crc32c::of(b"hello world");
        assert_eq!(crc.value(), -913_021_526);
        assert_eq!(crc.to_base64(), "yZRlqg==");
    }

    #[test]
    fn test_streaming_across_buffer_boundaries() {
        let mut crc = Crc32c::new();
        crc.update(b"hel");
        crc.update(b"lo wo");
        crc.update(b"rld");
        assert_eq!(crc, Crc32c::of(b"hello world"));
    }

    #[test]
    fn test_order_sensitive() {
        let mut ab = Crc32c::new();
        ab.update(b"hello");
        ab.update(b" world");

        let mut ba = Crc32c::new();
        ba.update(b" world");
        ba.update(b"hello");

        assert_ne!(ab, ba);
    }

    #[test]
    fn test_validate_all_representations() {
        let crc = Crc32c::of(b"data");
        let bytes = crc.to_bytes();
        let words = [crc.as_u32()];
        let other = Crc32c::of(b"data");
        let foreign = ForeignValidator("rth90Q==".to_string());

        assert!(crc.validate(-1_361_543_727));
        assert!(crc.validate("rth90Q=="));
        assert!(crc.validate(&bytes));
        assert!(crc.validate(&words[..]));
        assert!(crc.validate(&other));
        assert!(crc.validate(&foreign as &dyn Crc32cValidator));
    }

    #[test]
    fn test_validate_rejects_mismatch() {
        let crc = Crc32c::of(b"data");
        let wrong = Crc32c::of(b"other");
        let foreign = ForeignValidator(CRC32C_EMPTY_BASE64.to_string());

        assert!(!crc.validate(0));
        assert!(!crc.validate(CRC32C_EMPTY_BASE64));
        assert!(!crc.validate("not base64"));
        assert!(!crc.validate(&[0u8, 1, 2][..]));
        assert!(!crc.validate(&wrong));
        assert!(!crc.validate(&foreign as &dyn Crc32cValidator));
        assert!(!crc.validate(&[crc.as_u32(), 0][..]));
    }

    #[test]
    fn test_from_valid_sources() {
        let crc = Crc32c::of(b"hello");
        assert_eq!(Crc32c::from_input(crc.value()).unwrap(), crc);
        assert_eq!(Crc32c::from_input("mnG7TA==").unwrap(), crc);
        assert_eq!(Crc32c::from_input(&crc.to_bytes()).unwrap(), crc);
        assert_eq!(Crc32c::from_input(&[crc.as_u32()][..]).unwrap(), crc);
        assert_eq!(Crc32c::from_input(&crc).unwrap(), crc);
    }

    #[test]
    fn test_from_is_independent() {
        let original = Crc32c::of(b"hello");
        let mut copy = Crc32c::from_input(&original).unwrap();
        copy.update(b" world");
        assert_eq!(original, Crc32c::of(b"hello"));
        assert_eq!(copy, Crc32c::of(b"hello world"));
    }

    #[test]
    fn test_from_wrong_length_reports_size() {
        assert_eq!(
            Crc32c::from_bytes(&[1, 2, 3]),
            Err(ChecksumError::InvalidLength(3))
        );
        assert_eq!(
            Crc32c::from_bytes(&[0; 8]),
            Err(ChecksumError::InvalidLength(8))
        );
        assert_eq!(Crc32c::from_bytes(&[]), Err(ChecksumError::InvalidLength(0)));
        assert_eq!(
            Crc32c::from_words(&[1, 2]),
            Err(ChecksumError::InvalidLength(8))
        );
        // base64 解码后长度不对同样按长度报错
        assert_eq!(
            Crc32c::from_base64("AAAAAAAA"),
            Err(ChecksumError::InvalidLength(6))
        );
    }

    #[test]
    fn test_combine_two_ranges() {
        let mut a = Crc32c::of(b"hello");
        let b = Crc32c::of(b" world");
        a.combine(&b, 6);
        assert_eq!(a, Crc32c::of(b"hello world"));
    }

    #[test]
    fn test_combine_all_in_order() {
        let parts = [&b"12"[..], b"345", b"", b"6789"];
        let combined =
            Crc32c::combine_all(parts.iter().map(|p| (Crc32c::of(p), p.len() as u64)));
        assert_eq!(combined.as_u32(), 0xE306_9283);
    }

    proptest! {
        #[test]
        fn prop_combine_matches_concatenation(
            a in proptest::collection::vec(any::<u8>(), 0..512),
            b in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let mut whole = a.clone();
            whole.extend_from_slice(&b);

            let mut combined = Crc32c::of(&a);
            combined.combine(&Crc32c::of(&b), b.len() as u64);
            prop_assert_eq!(combined, Crc32c::of(&whole));
        }

        #[test]
        fn prop_roundtrip_through_every_encoding(value in any::<i32>()) {
            let crc = Crc32c::from_value(value);
            prop_assert_eq!(Crc32c::from_base64(&crc.to_base64()).unwrap(), crc);
            prop_assert_eq!(Crc32c::from_bytes(&crc.to_bytes()).unwrap(), crc);
            prop_assert_eq!(crc.value(), value);
        }
    }
}
