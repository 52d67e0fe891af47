/// Hard limits that keep a single tenant from exhausting memory or WAL space.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_SALONS_PER_TENANT: usize = 10_000;
pub const MAX_SERVICES_PER_SALON: usize = 1_000;
pub const MAX_SUB_SERVICES_PER_SERVICE: usize = 100;
pub const MAX_APPOINTMENTS_PER_SALON: usize = 200_000;

/// Upper bound on parallel calendars per salon.
pub const MAX_CONCURRENT_SLOTS: u32 = 64;

/// Longest bookable service, one full day.
pub const MAX_SERVICE_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_BOOKING_HOURS: u32 = 24;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 2_000;

pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_PAGE_SIZE: u32 = 10;

pub const MIN_CALENDAR_YEAR: i32 = 2020;
pub const MAX_CALENDAR_YEAR: i32 = 2100;
