//! Hashed timing wheel and the snapshot timer built on it

pub mod snapshot;
pub mod wheel;

pub use snapshot::{ SnapshotTimer, TimerExecutor };
pub use wheel::{ TimeoutId, TimingWheel };
