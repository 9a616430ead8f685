pub mod tracker;

pub use tracker::QuorumTracker;
