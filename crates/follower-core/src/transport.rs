use crate::commands::Command;
use crate::error::TransportError;

/// A stateful command/response session with one instrument.
///
/// Implementations own their timeouts: a query that gets no reply in time
/// must fail with [`TransportError::Timeout`] rather than block forever.
pub trait Session: Send {
    fn query(&mut self, command: &str) -> Result<String, TransportError>;
    fn write(&mut self, command: &str) -> Result<(), TransportError>;

    fn query_command(&mut self, command: &Command) -> Result<String, TransportError> {
        self.query(&command.to_string())
    }

    fn send(&mut self, command: &Command) -> Result<(), TransportError> {
        self.write(&command.to_string())
    }
}

/// Opens sessions to instruments by address.
pub trait Connector {
    type Session: Session;

    fn connect(&self, address: &str) -> Result<Self::Session, TransportError>;
}

impl<S: Session + ?Sized> Session for Box<S> {
    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        (**self).query(command)
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        (**self).write(command)
    }
}
