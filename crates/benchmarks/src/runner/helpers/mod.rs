mod statistics;

pub use statistics::LatencyStats;
