use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// 空闲扇区耗尽
    NoSpace,
    /// 超出索引树能覆盖的最大长度
    TooLarge,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSpace => f.write_str("no free sector left"),
            Self::TooLarge => f.write_str("length exceeds the block index"),
        }
    }
}

impl core::error::Error for Error {}
