//! Disconnect-reason classification.
//!
//! Typed `io::ErrorKind` values are the primary signal; substring matching
//! over the error text is the last resort for errors that only carry a
//! platform message.

use fleet::EndReason;

use crate::stream::copier::CopyErrorKind;

pub fn classify_copy(kind: &CopyErrorKind) -> EndReason {
    match kind {
        CopyErrorKind::Completed => EndReason::Completed,
        CopyErrorKind::EmptyTimeout => EndReason::Timeout,
        CopyErrorKind::Io(e) => classify_io(e),
    }
}

pub fn classify_io(error: &std::io::Error) -> EndReason {
    use std::io::ErrorKind;
    match error.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => EndReason::ClientDisconnected,
        ErrorKind::TimedOut => EndReason::Timeout,
        ErrorKind::UnexpectedEof => EndReason::Eof,
        ErrorKind::ConnectionAborted | ErrorKind::NotConnected => EndReason::ClosedConnection,
        ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable | ErrorKind::NetworkDown => {
            EndReason::NetworkError
        }
        _ => classify_message(&error.to_string()),
    }
}

fn classify_message(message: &str) -> EndReason {
    let lowered = message.to_lowercase();
    if lowered.contains("broken pipe") || lowered.contains("connection reset by peer") {
        EndReason::ClientDisconnected
    } else if lowered.contains("i/o timeout")
        || lowered.contains("deadline exceeded")
        || lowered.contains("timed out")
    {
        EndReason::Timeout
    } else if lowered.contains("use of closed network connection") {
        EndReason::ClosedConnection
    } else if lowered.contains("closed pipe") {
        EndReason::ClosedPipe
    } else if lowered.contains("unexpected eof") || lowered.contains("unexpected end of file") {
        EndReason::Eof
    } else if lowered.contains("no route to host") || lowered.contains("network is unreachable") {
        EndReason::NetworkError
    } else {
        EndReason::Error
    }
}
