//! Block geometry of the redo stream and the `lsn` <-> `sn` translation.

use crate::types::{Lsn, Sn};

/// Size of one log block in bytes.
pub const LOG_BLOCK_SIZE: u64 = 512;
/// Bytes of framing at the start of each block.
pub const LOG_BLOCK_HDR_SIZE: u64 = 12;
/// Bytes of framing at the end of each block (checksum).
pub const LOG_BLOCK_TRL_SIZE: u64 = 4;
/// Payload bytes per block.
pub const LOG_BLOCK_DATA_SIZE: u64 = LOG_BLOCK_SIZE - LOG_BLOCK_HDR_SIZE - LOG_BLOCK_TRL_SIZE;
/// Lsn at which a freshly created log starts; the first block begins here.
pub const LOG_START_LSN: Lsn = Lsn(16 * LOG_BLOCK_SIZE);

/// First lsn that can carry payload in a fresh log.
pub const fn first_data_lsn() -> Lsn {
    Lsn(LOG_START_LSN.0 + LOG_BLOCK_HDR_SIZE)
}

/// Translates a payload sequence number into its position in the framed stream.
pub const fn sn_to_lsn(sn: Sn) -> Lsn {
    let blocks = sn.0 / LOG_BLOCK_DATA_SIZE;
    let rest = sn.0 % LOG_BLOCK_DATA_SIZE;
    Lsn(blocks * LOG_BLOCK_SIZE + rest + LOG_BLOCK_HDR_SIZE)
}

/// Translates a framed position back to the number of payload bytes before it.
///
/// Positions inside a block header map to the start of that block's payload and
/// positions inside a trailer map to its end, so the result never exceeds `lsn`.
pub const fn lsn_to_sn(lsn: Lsn) -> Sn {
    let blocks = lsn.0 / LOG_BLOCK_SIZE;
    let offset = lsn.0 % LOG_BLOCK_SIZE;
    let data = if offset < LOG_BLOCK_HDR_SIZE {
        0
    } else if offset - LOG_BLOCK_HDR_SIZE > LOG_BLOCK_DATA_SIZE {
        LOG_BLOCK_DATA_SIZE
    } else {
        offset - LOG_BLOCK_HDR_SIZE
    };
    Sn(blocks * LOG_BLOCK_DATA_SIZE + data)
}

/// Offset of `lsn` inside its block.
pub const fn block_offset(lsn: Lsn) -> u64 {
    lsn.0 % LOG_BLOCK_SIZE
}

/// Block number holding `lsn`.
pub const fn block_no(lsn: Lsn) -> u64 {
    lsn.0 / LOG_BLOCK_SIZE
}

/// True when `lsn` lies strictly inside a block's payload region, which is the
/// only place a checkpoint may be recorded.
pub const fn is_data_lsn(lsn: Lsn) -> bool {
    let offset = block_offset(lsn);
    offset >= LOG_BLOCK_HDR_SIZE && offset < LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE
}

/// Moves `lsn` off block framing so it can be recorded as a checkpoint.
///
/// A position on a boundary or inside a header steps back one block and forward
/// past the header; a position inside a trailer falls back to the start of its
/// own block's payload. The result is never above `lsn`. Returns `None` when
/// no such position exists below `lsn`.
pub fn align_checkpoint_lsn(lsn: Lsn) -> Option<Lsn> {
    let offset = block_offset(lsn);
    let base = lsn.align_down(LOG_BLOCK_SIZE);
    if offset < LOG_BLOCK_HDR_SIZE {
        base.0
            .checked_sub(LOG_BLOCK_SIZE)
            .map(|prev| Lsn(prev + LOG_BLOCK_HDR_SIZE))
    } else if offset >= LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE {
        Some(base + LOG_BLOCK_HDR_SIZE)
    } else {
        Some(lsn)
    }
}

/// Lsn reached after appending `len` payload bytes at `start`.
pub const fn advance(start: Lsn, len: u64) -> Lsn {
    sn_to_lsn(Sn(lsn_to_sn(start).0 + len))
}
