//! Reliability core: outage detection, console notification and pairing.
//!
//! - [`MonitorSupervisor`] keeps at most one disconnection monitor per tenant.
//! - The monitor task polls the session registry and reminds the console
//!   until the tenant is healthy again.
//! - [`PairingWorkflow`] issues bounded pairing attempts within the tenant's
//!   current [`OutageEpisode`].

mod episode;
mod error;
mod monitor;
mod pairing;
mod supervisor;

pub use episode::{AttemptId, EpisodeStatus, OutageEpisode, PairingAttempt};
pub use error::{ReliabilityError, Result};
pub use pairing::PairingWorkflow;
pub use supervisor::MonitorSupervisor;
