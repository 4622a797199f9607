mod accounts;
mod proxy;

pub use accounts::accounts_router;
pub use proxy::{AppState, proxy_router};
