//! Message envelopes, service ids and receipts
//!
//! A [`Message`] owns its payload. Every hand-off (outbox, mailbox, receipt,
//! sending queue) moves the envelope, so exactly one side ever drops the
//! payload bytes.

use std::fmt;

/// Identifier of a service slot.
///
/// Id 0 is the system target (scheduler control messages), id 1 is the root
/// service. Ids are recycled after delete.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ServiceId(u32);

impl ServiceId {
    /// Routing target for scheduler control messages
    pub const SYSTEM: ServiceId = ServiceId(0);

    /// The distinguished root service
    pub const ROOT: ServiceId = ServiceId(1);

    /// Create a ServiceId from a raw value
    pub const fn new(id: u32) -> Self {
        ServiceId(id)
    }

    /// Get the numeric id
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// True for the system id (also the "empty" sentinel of job slots)
    pub const fn is_system(self) -> bool {
        self.0 == 0
    }

    /// True for the root service
    pub const fn is_root(self) -> bool {
        self.0 == 1
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{:08x}", self.0)
    }
}

impl From<u32> for ServiceId {
    fn from(id: u32) -> Self {
        ServiceId(id)
    }
}

/// Request/response correlation number; 0 means fire-and-forget.
pub type Session = u32;

/// Kind of a message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Runtime-level message between services
    System,
    /// Request expecting a response with the same session
    Request,
    /// Response to a request (also used for timer expiry)
    Response,
    /// Error response
    Error,
    /// Notification; a dead service signals root with this type
    Signal,
    /// Idle notification
    Idle,
    /// Control message to SYSTEM: create a service slot (session = requested id)
    ScheduleNew,
    /// Control message to SYSTEM: delete a dead service (session = id)
    ScheduleDelete,
}

/// Opaque serialized payload.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Payload(Box<[u8]>);

impl Payload {
    /// Wrap serialized bytes
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        Payload(bytes.into())
    }

    /// Borrow the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a zero-length payload
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Take the bytes back out
    pub fn into_bytes(self) -> Box<[u8]> {
        self.0
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload(bytes.into_boxed_slice())
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload(bytes.into())
    }
}

/// An owned message envelope
#[derive(Debug, PartialEq, Eq)]
pub struct Message {
    /// Sender
    pub from: ServiceId,
    /// Destination (SYSTEM for scheduler control)
    pub to: ServiceId,
    /// Correlation number
    pub session: Session,
    /// Message kind
    pub kind: MessageType,
    /// Optional payload
    pub payload: Option<Payload>,
}

impl Message {
    /// Build a message without payload
    pub fn new(from: ServiceId, to: ServiceId, session: Session, kind: MessageType) -> Self {
        Self {
            from,
            to,
            session,
            kind,
            payload: None,
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// The termination notice a dead service sends to root
    pub fn signal_dead(from: ServiceId) -> Self {
        Self::new(from, ServiceId::ROOT, 0, MessageType::Signal)
    }

    /// Detach the payload, leaving `None`
    pub fn take_payload(&mut self) -> Option<Payload> {
        self.payload.take()
    }
}

/// Outcome of an outbound message, written into the sender's receipt slot.
#[derive(Debug, PartialEq, Eq)]
pub enum Receipt {
    /// Delivered into the target mailbox
    Done,
    /// Target dead/unknown or control message refused; the message comes back
    Error(Option<Message>),
    /// Target mailbox full; the sender must re-send this message
    Block(Message),
    /// Reply to a `ScheduleNew` control message
    Response(ServiceId),
}

impl Receipt {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Receipt::Done => "done",
            Receipt::Error(_) => "error",
            Receipt::Block(_) => "block",
            Receipt::Response(_) => "response",
        }
    }
}

/// What `pop_message` yields: receipts take priority over mailbox traffic.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// The pending receipt of this service's last send
    Receipt(Receipt),
    /// The next mailbox message
    Message(Message),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ids() {
        assert!(ServiceId::SYSTEM.is_system());
        assert!(ServiceId::ROOT.is_root());
        assert_eq!(ServiceId::new(7).as_u32(), 7);
        assert_eq!(ServiceId::new(0x1f).to_string(), ":0000001f");
    }

    #[test]
    fn test_payload_moves_with_message() {
        let mut msg = Message::new(ServiceId::new(2), ServiceId::new(3), 10, MessageType::Request)
            .with_payload(vec![1u8, 2, 3]);
        let payload = msg.take_payload().unwrap();
        assert_eq!(payload.as_bytes(), &[1, 2, 3]);
        assert!(msg.payload.is_none());
    }

    #[test]
    fn test_signal_dead_targets_root() {
        let msg = Message::signal_dead(ServiceId::new(9));
        assert_eq!(msg.to, ServiceId::ROOT);
        assert_eq!(msg.kind, MessageType::Signal);
        assert_eq!(msg.session, 0);
    }
}
