use std::fmt;
use time::Duration;

/// The price sampling resolutions the backends can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Granularity {
    Minute,
    FiveMinutes,
    FifteenMinutes,
    HalfHour,
    Hour,
    SixHours,
    TwelveHours,
    Day,
}

/// All granularities, finest first.
pub const GRANULARITIES: [Granularity; 8] = [
    Granularity::Minute,
    Granularity::FiveMinutes,
    Granularity::FifteenMinutes,
    Granularity::HalfHour,
    Granularity::Hour,
    Granularity::SixHours,
    Granularity::TwelveHours,
    Granularity::Day,
];

impl Granularity {
    /// The time between two consecutive samples at this resolution.
    pub fn period(&self) -> Duration {
        match self {
            Granularity::Minute => Duration::minutes(1),
            Granularity::FiveMinutes => Duration::minutes(5),
            Granularity::FifteenMinutes => Duration::minutes(15),
            Granularity::HalfHour => Duration::minutes(30),
            Granularity::Hour => Duration::hours(1),
            Granularity::SixHours => Duration::hours(6),
            Granularity::TwelveHours => Duration::hours(12),
            Granularity::Day => Duration::days(1),
        }
    }

    /// The interval label the aggregator API expects.
    pub fn label(&self) -> &'static str {
        match self {
            Granularity::Minute => "m1",
            Granularity::FiveMinutes => "m5",
            Granularity::FifteenMinutes => "m15",
            Granularity::HalfHour => "m30",
            Granularity::Hour => "h1",
            Granularity::SixHours => "h6",
            Granularity::TwelveHours => "h12",
            Granularity::Day => "d1",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.label().fmt(f)
    }
}
