use lapin::protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError};
use lapin::Error as LapinError;

use crate::common::BackendError;

// Converting from lapin errors
impl From<LapinError> for BackendError {
    fn from(error: LapinError) -> Self {
        let error_text = error.to_string();

        match &error {
            LapinError::ProtocolError(amqp_error) => match amqp_error.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    BackendError::PreconditionFailed(error_text)
                }
                AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
                | AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)
                | AMQPErrorKind::Soft(AMQPSoftError::NOROUTE)
                | AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED)
                | AMQPErrorKind::Hard(AMQPHardError::INVALIDPATH) => {
                    BackendError::Rejected(error_text)
                }
                AMQPErrorKind::Hard(AMQPHardError::CONNECTIONFORCED) => {
                    BackendError::Unreachable(error_text)
                }
                _ => BackendError::ChannelClosed(error_text),
            },
            LapinError::IOError(_) | LapinError::InvalidConnectionState(_) => {
                BackendError::Unreachable(error_text)
            }
            _ => BackendError::ChannelClosed(error_text),
        }
    }
}
