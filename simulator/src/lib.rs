//! Local backend for rochambeau.
//!
//! Runs the channel service, the bot peer and the hand contract in process,
//! and serves the matchmaking API the player uses to find a bot.

mod api;
pub use api::Api;
pub mod bot;
mod channel;
pub use channel::{LocalSession, Simulator, SimulatorConfig};
pub mod contract;
pub use contract::{HandContract, HAND_CONTRACT_CODE};
