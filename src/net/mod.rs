pub mod monitor;
pub mod throttle;

pub use monitor::{ConnectionGate, LivenessProbe};
pub use throttle::{StopReason, StopRetry, ThrottleConfig, Throttler};

use std::io::ErrorKind;

use crate::utils::errors::{Cancelled, NetworkLost, RetryExhausted};

/// Network-class test used by the connection gate: socket closed, dead
/// connection, engine closed, retry-limit exhausted, I/O deadline, EOF.
/// Context cancellation is explicitly not a network error.
pub fn is_network_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if cause.downcast_ref::<Cancelled>().is_some() {
            return false;
        }
    }

    for cause in err.chain() {
        if cause.downcast_ref::<NetworkLost>().is_some() {
            return true;
        }
        if cause.downcast_ref::<RetryExhausted>().is_some() {
            return true;
        }
        if let Some(stop) = cause.downcast_ref::<StopRetry>() {
            if stop.reason == StopReason::Network {
                return true;
            }
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::BrokenPipe
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::TimedOut
            ) {
                return true;
            }
        }
        if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
            if http.is_connect() || http.is_timeout() {
                return true;
            }
        }
    }

    false
}
