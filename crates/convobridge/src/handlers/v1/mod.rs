//! V1 API handlers.

mod forward;
mod tenants;

pub use forward::{forward_inbound, forward_outbound};
pub use tenants::{
    get_monitor, invalidate_cache, run_command, start_monitor, start_pairing, stop_monitor,
};
