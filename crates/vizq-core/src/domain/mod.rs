mod time_shift;
mod timestamp;

pub use time_shift::TimeShift;
pub use timestamp::UtcDateTime;
