use crate::message::{OptionNumber, Options};
use thiserror::Error as ThisError;

/// The value of a Block1 or Block2 option: which block of a body a message
/// carries, whether more follow, and the block size.
///
/// On the wire this is `NUM << 4 | M << 3 | SZX`, and the block size is
/// `2 ^ (SZX + 4)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub num: u32,
    pub more: bool,
    pub szx: u8,
}

/// The largest size exponent, for 1024 byte blocks. 7 is reserved.
pub const MAX_SZX: u8 = 6;

/// Block numbers are 20 bits wide.
const MAX_NUM: u32 = (1 << 20) - 1;

impl Block {
    pub const fn new(num: u32, more: bool, szx: u8) -> Self {
        Self { num, more, szx }
    }

    /// The block size for a size exponent.
    pub const fn size_of(szx: u8) -> usize {
        16 << szx
    }

    /// The size exponent for a block size, if the size is valid.
    pub fn szx_for(size: usize) -> Option<u8> {
        if !size.is_power_of_two() || !(16..=1024).contains(&size) {
            return None;
        }
        Some(size.trailing_zeros() as u8 - 4)
    }

    pub const fn size(self) -> usize {
        Self::size_of(self.szx)
    }

    /// The position of this block's first byte in the body.
    pub const fn offset(self) -> usize {
        self.num as usize * self.size()
    }

    pub fn from_value(value: u32) -> Result<Self, BlockError> {
        let szx = (value & 0x7) as u8;
        if szx > MAX_SZX {
            return Err(BlockError::ReservedSize);
        }
        let num = value >> 4;
        if num > MAX_NUM {
            return Err(BlockError::NumberTooLarge(num));
        }
        Ok(Self {
            num,
            more: value & 0x8 != 0,
            szx,
        })
    }

    pub fn to_value(self) -> u32 {
        (self.num << 4) | ((self.more as u32) << 3) | self.szx as u32
    }

    /// Reads the block option `number` from `options`, if present.
    pub fn read(options: &Options, number: OptionNumber) -> Option<Result<Self, BlockError>> {
        if !options.contains(number) {
            return None;
        }
        Some(
            options
                .get_uint(number)
                .ok_or(BlockError::TooLong)
                .and_then(Self::from_value),
        )
    }

    pub fn write(self, options: &mut Options, number: OptionNumber) {
        options.set_uint(number, self.to_value());
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    #[error("Block size exponent 7 is reserved")]
    ReservedSize,
    #[error("Block number {0} does not fit in 20 bits")]
    NumberTooLarge(u32),
    #[error("Block option value is longer than three bytes")]
    TooLong,
}
