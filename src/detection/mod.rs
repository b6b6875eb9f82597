//! 检测结果的跟踪与区域计数
//! Tracking and zone counting over per-frame detection results

pub mod counter;
pub mod tracker;
pub mod types;

pub use counter::ZoneCounter;
pub use tracker::Tracker;
pub use types::{Detection, Perf};
