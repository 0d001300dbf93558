//! Hard limits protecting a tenant's engine from unbounded input.

use crate::model::Ms;

pub const MAX_FACILITIES_PER_TENANT: usize = 10_000;
pub const MAX_BOOKINGS_PER_FACILITY: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 2_000;

/// 1970-01-01 — bookings before the epoch are malformed input.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01 — anything past this is malformed input.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking may span at most 30 days.
pub const MAX_RANGE_DURATION_MS: Ms = 30 * 24 * 3_600_000;

/// A single extension request may add at most 7 days.
pub const MAX_EXTENSION_MINUTES: i64 = 7 * 24 * 60;

/// A recurrence template may expand into at most one year of daily instances.
pub const MAX_RECURRENCE_INSTANCES: usize = 366;

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 256;
