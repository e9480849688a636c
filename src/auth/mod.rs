//! auth - Access token storage, HTTP login/refresh and the keep-alive timer

mod client;
mod keep_alive;
mod token;

pub use client::{AuthClient, TokenRefresher};
pub use keep_alive::{check_once, CheckOutcome, KeepAliveConfig, TokenKeepAlive};
pub use token::{AuthToken, Clock, FileTokenStore, MemoryTokenStore, MonotonicClock, SystemClock, TokenStore};
