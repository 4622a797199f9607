pub mod accounts;
pub mod auth;
pub mod engine;
pub mod health;
pub mod ledger;
pub mod models;
pub mod refresher;
pub mod selector;
pub mod usage;

pub use engine::{Dialect, ProxyEngine, ProxyReply, ReplyBody};
pub use ledger::RateLimitLedger;
pub use models::{ModelEntry, ModelTable};
