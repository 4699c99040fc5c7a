//! Full-message encode/decode.

use super::builder::MessageBuilder;
use super::item::{width_of, Item, Value, Width};
use super::{flags, MAGIC, MAX_GROUP_NAME_LEN};
use crate::error::BadFrame;

/// Packets MUST NOT exceed this many bytes on the wire.
pub const MAX_PACKET_LEN: usize = 512;

/// A decoded (or about-to-be-encoded) Device Groups message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Flag bits, see [`super::flags`].
    pub flags: u16,
    /// Sequence number. Never 0 on the wire for a real message.
    pub seq: u16,
    /// Group name this message belongs to.
    pub group_name: String,
    /// Item stream, in wire order, terminated implicitly by EOL.
    pub items: Vec<Item>,
}

impl Message {
    /// Encode this message into a fresh buffer.
    ///
    /// A string/opaque item whose payload exceeds 255 bytes is dropped from
    /// the outgoing stream rather than failing the whole message (spec §7:
    /// `ItemTooLarge` "reject item during build, continue message"; callers
    /// that want to observe which items were dropped should pre-filter with
    /// [`Value::payload_len`] before constructing the `Message`, as
    /// `crate::engine` does). Returns [`BadFrame::TooLarge`] if the encoded
    /// packet would still exceed [`MAX_PACKET_LEN`] once the remaining items
    /// are written.
    pub fn encode(&self) -> Result<Vec<u8>, BadFrame> {
        let mut builder = MessageBuilder::new(self.flags, self.seq, &self.group_name)?;
        for item in &self.items {
            if matches!(item.value.payload_len(), Some(len) if len > 255) {
                continue;
            }
            builder.append_item(item)?;
        }
        builder.finish()
    }

    /// Split this message into one or more wire fragments, none exceeding
    /// [`MAX_PACKET_LEN`], all sharing `seq`. All but the last fragment carry
    /// `MORE_TO_COME`; the last is the commit a receiver applies against
    /// (spec §6: senders that need more than one packet "split into
    /// `UPDATE_MORE_TO_COME` fragments sharing one sequence number"). Items
    /// over the 255-byte payload cap are dropped as in [`Message::encode`].
    /// A message that fits in one packet comes back as a single fragment
    /// with `MORE_TO_COME` cleared, identical to what `encode` would build.
    pub fn encode_fragments(&self) -> Result<Vec<Vec<u8>>, BadFrame> {
        let items: Vec<&Item> = self
            .items
            .iter()
            .filter(|item| !matches!(item.value.payload_len(), Some(len) if len > 255))
            .collect();

        let mut chunks: Vec<Vec<&Item>> = vec![Vec::new()];
        let mut probe = MessageBuilder::new(self.flags, self.seq, &self.group_name)?;
        for item in items {
            match probe.append_item(item) {
                Ok(()) => chunks.last_mut().expect("at least one chunk").push(item),
                Err(BadFrame::TooLarge) => {
                    probe = MessageBuilder::new(self.flags, self.seq, &self.group_name)?;
                    probe.append_item(item)?;
                    chunks.push(vec![item]);
                }
                Err(e) => return Err(e),
            }
        }

        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut fragment_flags = self.flags & !flags::MORE_TO_COME;
                if i != last {
                    fragment_flags |= flags::MORE_TO_COME;
                }
                let mut builder = MessageBuilder::new(fragment_flags, self.seq, &self.group_name)?;
                for item in chunk {
                    builder.append_item(item)?;
                }
                builder.finish()
            })
            .collect()
    }

    /// Decode a message from a raw datagram.
    pub fn decode(data: &[u8]) -> Result<Self, BadFrame> {
        if data.len() > MAX_PACKET_LEN {
            return Err(BadFrame::TooLarge);
        }
        if data.len() < MAGIC.len() + 2 + 2 + 1 {
            return Err(BadFrame::Truncated);
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(BadFrame::BadMagic);
        }
        let mut cursor = MAGIC.len();

        let flags = u16::from_le_bytes([data[cursor], data[cursor + 1]]);
        cursor += 2;
        let seq = u16::from_le_bytes([data[cursor], data[cursor + 1]]);
        cursor += 2;

        let name_start = cursor;
        let nul_offset = data[name_start..]
            .iter()
            .take(MAX_GROUP_NAME_LEN + 1)
            .position(|&b| b == 0)
            .ok_or(BadFrame::UnterminatedGroupName)?;
        let group_name = String::from_utf8_lossy(&data[name_start..name_start + nul_offset])
            .into_owned();
        cursor = name_start + nul_offset + 1;

        let mut items = Vec::new();
        loop {
            if cursor >= data.len() {
                // Ran off the end without an EOL tag; treat as truncated body.
                break;
            }
            let tag = data[cursor];
            cursor += 1;
            if tag == 0 {
                break;
            }
            match width_of(tag) {
                Width::Eol => unreachable!("tag 0 handled above"),
                Width::U8 => {
                    let v = *data.get(cursor).ok_or(BadFrame::ItemOverrun)?;
                    cursor += 1;
                    items.push(Item::new(tag, Value::U8(v)));
                }
                Width::U16 => {
                    let bytes = data
                        .get(cursor..cursor + 2)
                        .ok_or(BadFrame::ItemOverrun)?;
                    let v = u16::from_le_bytes([bytes[0], bytes[1]]);
                    cursor += 2;
                    items.push(Item::new(tag, Value::U16(v)));
                }
                Width::U32 => {
                    let bytes = data
                        .get(cursor..cursor + 4)
                        .ok_or(BadFrame::ItemOverrun)?;
                    let v = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    cursor += 4;
                    items.push(Item::new(tag, Value::U32(v)));
                }
                Width::Str => {
                    let len = *data.get(cursor).ok_or(BadFrame::ItemOverrun)? as usize;
                    cursor += 1;
                    let bytes = data.get(cursor..cursor + len).ok_or(BadFrame::ItemOverrun)?;
                    let s = String::from_utf8_lossy(bytes).into_owned();
                    cursor += len;
                    items.push(Item::new(tag, Value::Str(s)));
                }
                Width::Opaque => {
                    let len = *data.get(cursor).ok_or(BadFrame::ItemOverrun)? as usize;
                    cursor += 1;
                    let bytes = data.get(cursor..cursor + len).ok_or(BadFrame::ItemOverrun)?;
                    cursor += len;
                    items.push(Item::new(tag, Value::Opaque(bytes.to_vec())));
                }
            }
        }

        Ok(Message {
            flags,
            seq,
            group_name,
            items,
        })
    }

    /// Does this message carry the given flag bit(s)?
    pub fn has_flag(&self, bit: u16) -> bool {
        self.flags & bit != 0
    }

    /// Build a bodyless ACK for `seq` in `group_name`.
    pub fn ack(group_name: &str, seq: u16) -> Self {
        Message {
            flags: flags::ACK,
            seq,
            group_name: group_name.to_string(),
            items: Vec::new(),
        }
    }

    /// Build a bodyless announcement heartbeat.
    pub fn announcement(group_name: &str, seq: u16) -> Self {
        Message {
            flags: flags::ANNOUNCEMENT,
            seq,
            group_name: group_name.to_string(),
            items: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::DgrItem;

    #[test]
    fn round_trip_empty_body() {
        let m = Message {
            flags: 0,
            seq: 1,
            group_name: "lab".to_string(),
            items: vec![],
        };
        let bytes = m.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), m);
    }

    #[test]
    fn round_trip_with_items() {
        let m = Message {
            flags: flags::FULL_STATUS,
            seq: 42,
            group_name: "lab".to_string(),
            items: vec![
                Item::new(DgrItem::POWER, Value::U32(1)),
                Item::new(DgrItem::LIGHT_BRI, Value::U8(200)),
                Item::new(DgrItem::COMMAND, Value::Str("Power1 On".to_string())),
            ],
        };
        let bytes = m.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), m);
    }

    #[test]
    fn scenario_single_item_power_update_wire_shape() {
        let m = Message {
            flags: 0,
            seq: 1,
            group_name: "lab".to_string(),
            items: vec![Item::new(DgrItem::POWER, Value::U32(1))],
        };
        let bytes = m.encode().unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(MAGIC);
        expected.extend_from_slice(&0u16.to_le_bytes());
        expected.extend_from_slice(&1u16.to_le_bytes());
        expected.extend_from_slice(b"lab\0");
        expected.push(DgrItem::POWER);
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.push(0); // EOL
        assert_eq!(bytes, expected);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut bytes = vec![b'X'; MAGIC.len()];
        bytes.extend_from_slice(&[0, 0, 1, 0, b'a', 0, 0]);
        assert_eq!(Message::decode(&bytes), Err(BadFrame::BadMagic));
    }

    #[test]
    fn decode_rejects_unterminated_group_name() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&[b'a'; 200]); // never terminated
        assert_eq!(
            Message::decode(&bytes),
            Err(BadFrame::UnterminatedGroupName)
        );
    }

    #[test]
    fn decode_rejects_oversized_packet() {
        let bytes = vec![0u8; MAX_PACKET_LEN + 1];
        assert_eq!(Message::decode(&bytes), Err(BadFrame::TooLarge));
    }

    #[test]
    fn decode_rejects_item_overrun() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(b"lab\0");
        bytes.push(DgrItem::POWER); // 32-bit item, but no value bytes follow
        assert_eq!(Message::decode(&bytes), Err(BadFrame::ItemOverrun));
    }

    #[test]
    fn encode_fragments_fits_small_message_in_one_packet() {
        let m = Message {
            flags: 0,
            seq: 1,
            group_name: "lab".to_string(),
            items: vec![Item::new(DgrItem::POWER, Value::U32(1))],
        };
        let fragments = m.encode_fragments().unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0], m.encode().unwrap());
        let decoded = Message::decode(&fragments[0]).unwrap();
        assert!(!decoded.has_flag(flags::MORE_TO_COME));
    }

    #[test]
    fn encode_fragments_splits_oversized_content_across_more_to_come_packets() {
        // Eight 150-byte string items blow past the 512-byte packet cap.
        let items: Vec<Item> = (192..200)
            .map(|tag| Item::new(tag, Value::Str("x".repeat(150))))
            .collect();
        let m = Message {
            flags: 0,
            seq: 9,
            group_name: "lab".to_string(),
            items: items.clone(),
        };

        let fragments = m.encode_fragments().unwrap();
        assert!(fragments.len() > 1, "expected content to need more than one packet");
        for bytes in &fragments {
            assert!(bytes.len() <= MAX_PACKET_LEN);
        }

        let mut reassembled = Vec::new();
        for (i, bytes) in fragments.iter().enumerate() {
            let decoded = Message::decode(bytes).unwrap();
            assert_eq!(decoded.seq, 9);
            let is_last = i == fragments.len() - 1;
            assert_eq!(decoded.has_flag(flags::MORE_TO_COME), !is_last);
            reassembled.extend(decoded.items);
        }
        assert_eq!(reassembled, items);
    }

    #[test]
    fn encode_drops_oversized_item_but_keeps_the_rest() {
        let m = Message {
            flags: 0,
            seq: 1,
            group_name: "lab".to_string(),
            items: vec![
                Item::new(DgrItem::COMMAND, Value::Str("a".repeat(256))),
                Item::new(DgrItem::POWER, Value::U32(1)),
            ],
        };
        let bytes = m.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.items, vec![Item::new(DgrItem::POWER, Value::U32(1))]);
    }
}
