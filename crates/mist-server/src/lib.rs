pub mod net;
pub mod server;
pub mod service;

pub use net::{CallFate, FaultConfig, LossyNet};
pub use server::{KvServer, ServerStats};
pub use service::KvService;
