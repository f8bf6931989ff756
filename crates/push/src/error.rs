use courier_common::payload::PayloadError;
use thiserror::Error;

use crate::broker::BrokerError;

#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("{0} is not running")]
    Stopped(&'static str),
    #[error("broker is enabled but no transport was supplied")]
    MissingTransport,
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
