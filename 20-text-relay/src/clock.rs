use chrono::{Local, NaiveTime};

/// Source of wall-clock time for message timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveTime;
}

/// Local time of day.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveTime {
        Local::now().time()
    }
}

/// Always reports the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveTime {
        self.0
    }
}
