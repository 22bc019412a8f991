//! exbridge server - per-connection sessions and the accept loop

pub mod session;
pub mod supervisor;

pub use session::{Session, SessionOptions};
pub use supervisor::BridgeServer;
