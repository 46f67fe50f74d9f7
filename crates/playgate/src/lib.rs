pub mod cache;
pub mod client_id;
pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod ratelimiter;
pub mod runfile;
pub mod safety;
pub mod sink;

pub use config::Config;
pub use handler::build_router;
