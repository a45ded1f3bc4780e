//! Stream id allocation and requester machine construction.
//!
//! Clients allocate odd ids, servers even, both monotonically increasing.
//! Wraparound of the 31-bit space is an error surfaced to the connection.

use tokio::sync::{mpsc, oneshot};

use crate::error::{RSocketError, Result};
use crate::frame::{Payload, StreamId, MAX_STREAM_ID};

use super::machine::{StreamEvent, StreamStateMachine};

/// Which side of the connection this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiated the connection; allocates odd stream ids.
    Client,
    /// Accepted the connection; allocates even stream ids.
    Server,
}

/// Allocates stream ids and constructs requester-side state machines.
#[derive(Debug)]
pub struct StreamsFactory {
    role: Role,
    next_stream_id: StreamId,
}

impl StreamsFactory {
    /// Create a factory for the given role.
    pub fn new(role: Role) -> Self {
        let next_stream_id = match role {
            Role::Client => 1,
            Role::Server => 2,
        };
        Self {
            role,
            next_stream_id,
        }
    }

    /// Role this factory allocates for.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Allocate the next stream id.
    ///
    /// Fails with [`RSocketError::StreamIdExhausted`] once the 31-bit space
    /// wraps; the connection treats that as fatal.
    pub fn next_stream_id(&mut self) -> Result<StreamId> {
        let id = self.next_stream_id;
        if id > MAX_STREAM_ID {
            return Err(RSocketError::StreamIdExhausted);
        }
        self.next_stream_id += 2;
        Ok(id)
    }

    /// Whether `stream_id` is one the remote peer may initiate.
    pub fn is_valid_remote_stream_id(&self, stream_id: StreamId) -> bool {
        if stream_id == 0 || stream_id > MAX_STREAM_ID {
            return false;
        }
        match self.role {
            // peers of a client are servers: even ids
            Role::Client => stream_id % 2 == 0,
            Role::Server => stream_id % 2 == 1,
        }
    }

    /// Allocate an id and build the requester machine for request/response.
    #[allow(clippy::type_complexity)]
    pub fn create_request_response(
        &mut self,
    ) -> Result<(
        StreamId,
        StreamStateMachine,
        oneshot::Receiver<std::result::Result<Payload, RSocketError>>,
    )> {
        let id = self.next_stream_id()?;
        let (machine, rx) = StreamStateMachine::request_response_requester(id);
        Ok((id, machine, rx))
    }

    /// Allocate an id and build the requester machine for request/stream.
    pub fn create_request_stream(
        &mut self,
    ) -> Result<(StreamId, StreamStateMachine, mpsc::UnboundedReceiver<StreamEvent>)> {
        let id = self.next_stream_id()?;
        let (machine, rx) = StreamStateMachine::stream_requester(id);
        Ok((id, machine, rx))
    }

    /// Allocate an id and build the requester machine for request/channel.
    pub fn create_request_channel(
        &mut self,
    ) -> Result<(StreamId, StreamStateMachine, mpsc::UnboundedReceiver<StreamEvent>)> {
        let id = self.next_stream_id()?;
        let (machine, rx) = StreamStateMachine::channel_requester(id);
        Ok((id, machine, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_allocates_odd_monotonic() {
        let mut factory = StreamsFactory::new(Role::Client);
        assert_eq!(factory.next_stream_id().unwrap(), 1);
        assert_eq!(factory.next_stream_id().unwrap(), 3);
        assert_eq!(factory.next_stream_id().unwrap(), 5);
    }

    #[test]
    fn test_server_allocates_even_monotonic() {
        let mut factory = StreamsFactory::new(Role::Server);
        assert_eq!(factory.next_stream_id().unwrap(), 2);
        assert_eq!(factory.next_stream_id().unwrap(), 4);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let mut factory = StreamsFactory::new(Role::Client);
        factory.next_stream_id = MAX_STREAM_ID;
        assert_eq!(factory.next_stream_id().unwrap(), MAX_STREAM_ID);
        assert!(matches!(
            factory.next_stream_id(),
            Err(RSocketError::StreamIdExhausted)
        ));
    }

    #[test]
    fn test_remote_id_parity() {
        let client = StreamsFactory::new(Role::Client);
        assert!(client.is_valid_remote_stream_id(2));
        assert!(!client.is_valid_remote_stream_id(3));
        assert!(!client.is_valid_remote_stream_id(0));

        let server = StreamsFactory::new(Role::Server);
        assert!(server.is_valid_remote_stream_id(1));
        assert!(!server.is_valid_remote_stream_id(4));
    }

    #[test]
    fn test_create_requester_machines() {
        let mut factory = StreamsFactory::new(Role::Client);

        let (id, machine, _rx) = factory.create_request_response().unwrap();
        assert_eq!(id, 1);
        assert_eq!(machine.stream_id(), 1);

        let (id, machine, _rx) = factory.create_request_stream().unwrap();
        assert_eq!(id, 3);
        assert!(matches!(machine, StreamStateMachine::StreamRequester(_)));

        let (id, machine, _rx) = factory.create_request_channel().unwrap();
        assert_eq!(id, 5);
        assert!(matches!(machine, StreamStateMachine::ChannelRequester(_)));
    }
}
