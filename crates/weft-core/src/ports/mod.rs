//! Ports - seams to the outside world.
//!
//! Only time is abstracted for now; handlers are the other seam and live in
//! `registry`.

pub mod clock;

pub use self::clock::{Clock, ManualClock, SystemClock};
