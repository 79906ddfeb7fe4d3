//! Session manager: at most one live Telegram client per account,
//! serialized across workers, plus the feedback rules that turn call
//! outcomes into account-row mutations.

pub mod live;
mod manager;

pub use live::LiveConnector;
pub use manager::{SessionLease, SessionManager};
