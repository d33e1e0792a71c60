use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

use common::err::proxy_error::ProxyError;
use common::err::PResult;

use crate::command::Command;
use crate::{COMMAND_OFFSET, MAX_BODY_LENGTH, PACKET_HEADER_SIZE, STMT_ID_PAYLOAD_OFFSET};

/// One framed client-side packet: 3-byte little-endian payload length,
/// 1-byte sequence, payload. The frame is held as-is; accessors decode on
/// demand.
#[derive(Debug, Clone)]
pub struct RequestPacket {
    data: Bytes,
}

impl RequestPacket {
    pub fn new(data: Bytes) -> PResult<Self> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(ProxyError::MalformedPacket(format!(
                "packet of {} bytes is shorter than the header",
                data.len()
            )));
        }

        let declared = LittleEndian::read_u24(&data[0..3]) as usize;
        if declared != data.len() - PACKET_HEADER_SIZE {
            return Err(ProxyError::MalformedPacket(format!(
                "header declares {} payload bytes, buffer carries {}",
                declared,
                data.len() - PACKET_HEADER_SIZE
            )));
        }

        Ok(RequestPacket { data })
    }

    /// Frame a payload, computing the header.
    pub fn from_payload(seq: u8, payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= MAX_BODY_LENGTH);

        let mut data = BytesMut::with_capacity(PACKET_HEADER_SIZE + payload.len());
        let mut header = [0u8; 4];
        LittleEndian::write_u24(&mut header[0..3], payload.len() as u32);
        header[3] = seq;
        data.put_slice(&header);
        data.put_slice(payload);

        RequestPacket { data: data.freeze() }
    }

    /// A COM_QUERY carrying the given SQL text.
    pub fn com_query(sql: &str) -> Self {
        let mut payload = Vec::with_capacity(1 + sql.len());
        payload.push(u8::from(Command::Query));
        payload.extend_from_slice(sql.as_bytes());
        RequestPacket::from_payload(0, &payload)
    }

    /// A COM_STMT_PREPARE carrying the given SQL text.
    pub fn com_stmt_prepare(sql: &str) -> Self {
        let mut payload = Vec::with_capacity(1 + sql.len());
        payload.push(u8::from(Command::StmtPrepare));
        payload.extend_from_slice(sql.as_bytes());
        RequestPacket::from_payload(0, &payload)
    }

    /// A binary-protocol statement command that carries only an id
    /// (COM_STMT_CLOSE, COM_STMT_RESET, COM_STMT_FETCH, ...).
    pub fn com_stmt(command: Command, stmt_id: u32) -> Self {
        debug_assert!(command.is_ps_command());

        let mut payload = [0u8; 5];
        payload[0] = u8::from(command);
        LittleEndian::write_u32(&mut payload[1..5], stmt_id);
        RequestPacket::from_payload(0, &payload)
    }

    /// A COM_STMT_EXECUTE. When `param_count` is non-zero the packet
    /// carries a null bitmap and the new-params-bound byte that decides
    /// whether this execution is a continuation of the previous one.
    pub fn com_stmt_execute(stmt_id: u32, param_count: u16, new_params_bound: bool) -> Self {
        let mut payload = Vec::new();
        payload.push(u8::from(Command::StmtExecute));
        let mut id = [0u8; 4];
        LittleEndian::write_u32(&mut id, stmt_id);
        payload.extend_from_slice(&id);
        payload.push(0); // flags: CURSOR_TYPE_NO_CURSOR
        payload.extend_from_slice(&[1, 0, 0, 0]); // iteration count, always 1

        if param_count > 0 {
            let bitmap_len = (param_count as usize + 7) / 8;
            payload.extend(std::iter::repeat(0).take(bitmap_len));
            payload.push(u8::from(new_params_bound));
        }

        RequestPacket::from_payload(0, &payload)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn payload_len(&self) -> usize {
        LittleEndian::read_u24(&self.data[0..3]) as usize
    }

    pub fn seq(&self) -> u8 {
        self.data[3]
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[PACKET_HEADER_SIZE..]
    }

    /// A payload of exactly 0xFFFFFF announces a continuation packet.
    pub fn is_large(&self) -> bool {
        self.payload_len() == MAX_BODY_LENGTH
    }

    pub fn command(&self) -> Option<Command> {
        self.data
            .get(COMMAND_OFFSET)
            .and_then(|b| Command::try_from(*b).ok())
    }

    pub fn is_query(&self) -> bool {
        self.command() == Some(Command::Query)
    }

    /// SQL text of a COM_QUERY or COM_STMT_PREPARE. There is no terminator;
    /// the text runs to the end of the payload.
    pub fn sql(&self) -> Option<&[u8]> {
        match self.command() {
            Some(Command::Query) | Some(Command::StmtPrepare) => {
                Some(&self.payload()[1..])
            }
            _ => None,
        }
    }

    /// Statement id of a binary-protocol COM_STMT command.
    pub fn stmt_id(&self) -> Option<u32> {
        let command = self.command()?;
        if !command.is_ps_command() {
            return None;
        }

        let payload = self.payload();
        if payload.len() < STMT_ID_PAYLOAD_OFFSET + 4 {
            return None;
        }

        Some(LittleEndian::read_u32(
            &payload[STMT_ID_PAYLOAD_OFFSET..STMT_ID_PAYLOAD_OFFSET + 4],
        ))
    }

    /// For COM_STMT_EXECUTE with known parameter count: whether the packet
    /// carries fresh parameter metadata. An execution without it is a
    /// continuation of the previously executed statement.
    pub fn stmt_execute_params_bound(&self, param_count: u16) -> Option<bool> {
        if self.command() != Some(Command::StmtExecute) || param_count == 0 {
            return None;
        }

        let bitmap_len = (param_count as usize + 7) / 8;
        let bound_offset = 1 + 4 + 1 + 4 + bitmap_len;
        self.payload().get(bound_offset).map(|b| *b == 1)
    }
}

/// Split one complete packet off the front of a receive buffer, leaving
/// any trailing bytes in place. Returns None until the buffer holds the
/// whole frame; a packet of 0xFFFFFF payload bytes is complete on its own
/// and the continuation follows as the next frame.
pub fn split_packet(buffer: &mut BytesMut) -> Option<RequestPacket> {
    if buffer.len() < PACKET_HEADER_SIZE {
        return None;
    }

    let payload_len = LittleEndian::read_u24(&buffer[0..3]) as usize;
    let frame_len = PACKET_HEADER_SIZE + payload_len;
    if buffer.len() < frame_len {
        return None;
    }

    let frame = buffer.split_to(frame_len).freeze();
    Some(RequestPacket { data: frame })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frames_and_reads_back() {
        let packet = RequestPacket::com_query("SELECT 1");
        assert_eq!(packet.payload_len(), 9);
        assert_eq!(packet.seq(), 0);
        assert_eq!(packet.command(), Some(Command::Query));
        assert_eq!(packet.sql(), Some(&b"SELECT 1"[..]));
        assert!(!packet.is_large());
    }

    #[test]
    fn rejects_inconsistent_header() {
        let mut raw = RequestPacket::com_query("SELECT 1").as_bytes().to_vec();
        raw[0] = 2; // lie about the payload length
        assert!(RequestPacket::new(Bytes::from(raw)).is_err());
        assert!(RequestPacket::new(Bytes::from_static(&[0, 0])).is_err());
    }

    #[test]
    fn stmt_id_only_for_ps_commands() {
        let close = RequestPacket::com_stmt(Command::StmtClose, 77);
        assert_eq!(close.stmt_id(), Some(77));

        let query = RequestPacket::com_query("DEALLOCATE PREPARE ps1");
        assert_eq!(query.stmt_id(), None);
    }

    #[test]
    fn split_packet_respects_frame_boundaries() {
        let mut buffer = BytesMut::new();

        // Nothing to split from a partial header.
        buffer.extend_from_slice(&[9, 0]);
        assert!(split_packet(&mut buffer).is_none());
        buffer.clear();

        // Two packets arriving back to back, the second one truncated.
        let first = RequestPacket::com_query("SELECT 1");
        let second = RequestPacket::com_query("COMMIT");
        buffer.extend_from_slice(first.as_bytes());
        buffer.extend_from_slice(&second.as_bytes()[..5]);

        let packet = split_packet(&mut buffer).unwrap();
        assert_eq!(packet.sql(), Some(&b"SELECT 1"[..]));

        // The tail stays buffered until the rest arrives.
        assert!(split_packet(&mut buffer).is_none());
        buffer.extend_from_slice(&second.as_bytes()[5..]);
        let packet = split_packet(&mut buffer).unwrap();
        assert_eq!(packet.sql(), Some(&b"COMMIT"[..]));
        assert!(buffer.is_empty());
    }

    #[test]
    fn execute_metadata_flag() {
        let fresh = RequestPacket::com_stmt_execute(5, 2, true);
        assert_eq!(fresh.stmt_execute_params_bound(2), Some(true));

        let continuation = RequestPacket::com_stmt_execute(5, 2, false);
        assert_eq!(continuation.stmt_execute_params_bound(2), Some(false));

        // Without parameters there is no metadata to omit.
        let plain = RequestPacket::com_stmt_execute(5, 0, false);
        assert_eq!(plain.stmt_execute_params_bound(0), None);
    }
}
