//! A small seam for injecting time, so tests can run against a fixed clock
//! instead of the wall clock.
use time::OffsetDateTime;

pub trait TimeSource: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Clone, Copy, Default)]
pub struct SystemTime;

impl TimeSource for SystemTime {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

#[cfg(test)]
#[derive(Clone, Copy)]
pub struct FixedTime(pub OffsetDateTime);

#[cfg(test)]
impl TimeSource for FixedTime {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}
