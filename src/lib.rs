pub mod relay;

pub use relay::actions::{Action, ActionFilter};
pub use relay::config::RelayConfig;
pub use relay::server::Relay;
pub use relay::session::{Session, SessionId, LOBBY};
