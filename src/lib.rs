pub mod chat;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod server;
pub mod translate;
pub mod upstream;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use logging::SharedLogger;
pub use server::{build_router, AppState};
pub use upstream::{ChunkStream, HttpUpstream, Upstream};
