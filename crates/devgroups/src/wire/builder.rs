//! Incremental builder for outgoing Device Groups messages.
//!
//! Growable buffer with the 512-byte wire cap enforced here, at the
//! builder, rather than down in whatever eventually writes the socket
//! (see Design Notes: "enforce the cap at the builder, not the writer").

use super::item::{Item, Value};
use super::message::MAX_PACKET_LEN;
use super::{MAGIC, MAX_GROUP_NAME_LEN};
use crate::error::BadFrame;

/// Builds one outgoing message, tag by tag.
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    /// Start a new message with the given flags, sequence number, and group
    /// name. Fails if the group name is too long to fit the wire format.
    pub fn new(flags: u16, seq: u16, group_name: &str) -> Result<Self, BadFrame> {
        if group_name.len() > MAX_GROUP_NAME_LEN {
            return Err(BadFrame::UnterminatedGroupName);
        }
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&flags.to_le_bytes());
        buf.extend_from_slice(&seq.to_le_bytes());
        buf.extend_from_slice(group_name.as_bytes());
        buf.push(0); // NUL terminator
        Self::check_len(&buf)?;
        Ok(Self { buf })
    }

    fn check_len(buf: &[u8]) -> Result<(), BadFrame> {
        // Leave room for the EOL terminator.
        if buf.len() + 1 > MAX_PACKET_LEN {
            return Err(BadFrame::TooLarge);
        }
        Ok(())
    }

    /// Append one item to the stream.
    pub fn append_item(&mut self, item: &Item) -> Result<(), BadFrame> {
        let mut encoded = Vec::with_capacity(6);
        encoded.push(item.tag);
        match &item.value {
            Value::U8(v) => encoded.push(*v),
            Value::U16(v) => encoded.extend_from_slice(&v.to_le_bytes()),
            Value::U32(v) => encoded.extend_from_slice(&v.to_le_bytes()),
            Value::Str(s) => {
                let bytes = s.as_bytes();
                if bytes.len() > 255 {
                    return Err(BadFrame::ItemOverrun);
                }
                encoded.push(bytes.len() as u8);
                encoded.extend_from_slice(bytes);
            }
            Value::Opaque(bytes) => {
                if bytes.len() > 255 {
                    return Err(BadFrame::ItemOverrun);
                }
                encoded.push(bytes.len() as u8);
                encoded.extend_from_slice(bytes);
            }
        }

        if self.buf.len() + encoded.len() + 1 > MAX_PACKET_LEN {
            return Err(BadFrame::TooLarge);
        }
        self.buf.extend_from_slice(&encoded);
        Ok(())
    }

    /// Current encoded length, including the header but not yet the EOL
    /// terminator.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Terminate the item stream and return the finished buffer.
    pub fn finish(mut self) -> Result<Vec<u8>, BadFrame> {
        self.buf.push(0); // EOL
        if self.buf.len() > MAX_PACKET_LEN {
            return Err(BadFrame::TooLarge);
        }
        Ok(self.buf)
    }
}
