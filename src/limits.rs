use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking may not be longer than 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;
/// Widest window accepted by a conflict query.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_SERVICES: usize = 10_000;
pub const MAX_BOOKINGS_PER_SERVICE: usize = 100_000;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 4_096;
pub const MAX_COMMENT_LEN: usize = 4_096;

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;
