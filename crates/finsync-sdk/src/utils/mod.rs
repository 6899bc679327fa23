pub mod time;

pub use time::{elapsed_secs_since, millis_to_datetime, now_millis, now_rfc3339};
