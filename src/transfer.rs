//! Reliable chunk transfer engine.
//!
//! This module holds the per-connection protocol machinery: the EWMA RTT
//! estimator, the Reno congestion controller, the sliding-window sender,
//! the cumulative-ACK receiver, the WHOHAS/IHAVE/DENIED handshake planner,
//! and the connection table with upload admission. Everything here is a
//! pure state machine; the event loop in [`crate::engine`] owns the socket
//! and the clock.

pub mod congestion;
pub mod download;
pub mod handshake;
pub mod rtt;
pub mod table;
pub mod upload;

pub use congestion::{Phase, Reno};
pub use download::{DataOutcome, Download, DownloadStatus};
pub use handshake::{DownloadPlan, TickAction};
pub use rtt::RttEstimator;
pub use table::{Admission, ConnectionTable};
pub use upload::{AckOutcome, TimerFire, Upload};
