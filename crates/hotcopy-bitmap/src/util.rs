use crate::{BitmapError, Result};

pub fn align_down_u64(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value - value % alignment
}

pub fn align_up_u64(value: u64, alignment: u64) -> Result<u64> {
    if alignment == 0 {
        return Err(BitmapError::OffsetOverflow);
    }
    let rem = value % alignment;
    if rem == 0 {
        return Ok(value);
    }
    value
        .checked_add(alignment - rem)
        .ok_or(BitmapError::OffsetOverflow)
}

pub(crate) fn div_ceil_u64(n: u64, d: u64) -> Result<u64> {
    if d == 0 {
        return Err(BitmapError::OffsetOverflow);
    }
    Ok(n.div_ceil(d))
}
