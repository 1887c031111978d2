//! Error kinds surfaced by the transport, the handlers and the tracker loop.

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Sensor addresses must be non-empty.
    #[error("invalid sensor address {0:?}")]
    InvalidAddress(String),

    /// The address was not among the visible devices for a whole search cycle.
    #[error("no sensor found with address {0}")]
    DeviceNotFound(String),

    #[error("could not connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    /// No registered handler recognised the device's services.
    #[error("unsupported sensor {0}: no handler matched its services")]
    UnsupportedSensor(String),

    #[error("service {0} not exposed by the device")]
    ServiceMissing(Uuid),

    #[error("characteristic {0} not found")]
    CharacteristicMissing(Uuid),

    #[error("could not subscribe to {uuid}: {reason}")]
    NotificationSubscribeFailed { uuid: Uuid, reason: String },

    /// Payload shorter than the decoder's format requires.
    #[error("malformed frame: expected at least {expected} bytes, got {actual}")]
    MalformedFrame { expected: usize, actual: usize },

    /// The link is gone: the notification stream ended or the device
    /// stopped answering reads.
    #[error("link to the sensor was lost")]
    Disconnected,

    #[error("BLE transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Whether the tracker should go back to searching after this error.
    ///
    /// [`Error::UnsupportedSensor`] and [`Error::InvalidAddress`] are
    /// structural: retrying cannot make a handler appear for the device.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Error::UnsupportedSensor(_) | Error::InvalidAddress(_))
    }
}

impl From<btleplug::Error> for Error {
    fn from(e: btleplug::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unsupported_sensor_is_terminal() {
        assert!(!Error::UnsupportedSensor("AA".into()).is_transient());
        assert!(!Error::InvalidAddress(String::new()).is_transient());
        assert!(Error::DeviceNotFound("AA".into()).is_transient());
        assert!(Error::Disconnected.is_transient());
        assert!(Error::CharacteristicMissing(Uuid::nil()).is_transient());
    }

    #[test]
    fn malformed_frame_message_names_sizes() {
        let e = Error::MalformedFrame { expected: 4, actual: 1 };
        assert_eq!(e.to_string(), "malformed frame: expected at least 4 bytes, got 1");
    }
}
