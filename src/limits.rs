//! Hard input limits. Anything above these is rejected as `InvalidInput`.

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_ROOM_CODE_LEN: usize = 32;
pub const MAX_OWNER_ID_LEN: usize = 256;
pub const MAX_PURPOSE_LEN: usize = 1_000;
pub const MAX_NOTE_LEN: usize = 2_000;
pub const MAX_PARTY_SIZE: u32 = 1_000;

/// Longest accepted JSON frame on the wire, in bytes.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Re-read attempts before `moderate_settled` gives up on a contended booking.
pub const MAX_SETTLE_ATTEMPTS: usize = 8;

/// Largest journal payload replay will allocate for. Longer length prefixes are treated as corruption.
pub const MAX_JOURNAL_ENTRY: usize = 1024 * 1024;
