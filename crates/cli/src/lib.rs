// courier-cli: client side of the relay connection protocol, plus the pieces
// the `courier` binary shares with it.

pub mod client;
pub mod exit_code;
pub mod output;
