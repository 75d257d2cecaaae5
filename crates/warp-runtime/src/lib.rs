#![doc = "Cross-process time-warp detection engine."]

pub mod affinity;
pub mod clock;
pub mod detector;
pub mod reporter;
pub mod session;
pub mod shared;
pub mod spinlock;
pub mod state;
pub mod workers;

pub use affinity::*;
pub use clock::{Clock, SystemClock};
pub use detector::*;
pub use reporter::*;
pub use session::*;
pub use shared::*;
pub use spinlock::*;
pub use state::*;
pub use workers::*;
