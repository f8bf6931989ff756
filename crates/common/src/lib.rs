// courier-common: wire types shared by the push engine, the relay and its clients

pub mod config;
pub mod error;
pub mod payload;
pub mod protocol;
