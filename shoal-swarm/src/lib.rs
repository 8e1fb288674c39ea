//! Piece scheduling, peer reputation and swarm coordination for the shoal
//! transfer engine. Storage lives in `shoal_storage`; this crate decides
//! what to request from whom, in what order, and who to stop trusting.

mod config;
mod error;
mod peer;
mod picker;
mod rate;
mod reputation;
mod scheduler;
mod swarm;

pub use config::Config;
pub use error::{is_cancelled, is_fatal, CancelError, Error, Result};
pub use peer::PeerLink;
pub use picker::PiecePicker;
pub use rate::RateMeter;
pub use reputation::{BadVerdict, PeerStats, ReputationBook};
pub use scheduler::PeerScheduler;
pub use swarm::{ConnEvent, Swarm, SwarmEvent, SwarmEventHandler, SwarmEventNotifier};

#[cfg(test)]
pub mod tests;
