//! Pure pacing decisions: which account sends next, and how long to
//! wait before the next message. No I/O here; workers feed in rows and
//! persist whatever changes these functions decide.

mod delays;
mod selector;

pub use delays::{
    bump_on_flood, bump_on_peer_flood, decay_on_success, hour_factor, next_delay, typing_delay,
    PacingConfig,
};
pub use selector::{is_eligible, select_account};
