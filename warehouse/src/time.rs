use time::OffsetDateTime;

pub trait TimeSource {
    // Return the current instant, in UTC
    fn current_time(&self) -> OffsetDateTime;
}

#[derive(Clone, Default)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}
