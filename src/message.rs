use crate::error::Error;
use crate::frame::OpCode;

/// The two kinds of data message the protocol knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
}

impl MessageType {
    pub(crate) fn opcode(self) -> OpCode {
        match self {
            MessageType::Text => OpCode::Text,
            MessageType::Binary => OpCode::Binary,
        }
    }
}

/// A fully assembled data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Text(_) => MessageType::Text,
            Message::Binary(_) => MessageType::Binary,
        }
    }

    /// The payload bytes, regardless of kind.
    pub fn into_data(self) -> Vec<u8> {
        match self {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
        }
    }

    pub fn as_data(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }

    /// The payload as text, validating UTF-8 for binary messages.
    pub fn into_text(self) -> Result<String, Error> {
        match self {
            Message::Text(text) => Ok(text),
            Message::Binary(data) => Ok(String::from_utf8(data)?),
        }
    }

    pub fn len(&self) -> usize {
        self.as_data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_data().is_empty()
    }

    /// Reassembles a drained message body, validating UTF-8 for text.
    pub(crate) fn assemble(kind: MessageType, data: Vec<u8>) -> Result<Message, Error> {
        match kind {
            MessageType::Text => Ok(Message::Text(String::from_utf8(data)?)),
            MessageType::Binary => Ok(Message::Binary(data)),
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Message {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Message {
        Message::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Message {
        Message::Binary(data)
    }
}
