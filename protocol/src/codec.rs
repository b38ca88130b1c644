//! Framing and unframing of protocol messages, plus the relay rewrite that
//! stamps a command packet with the originating player's conv.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    CodecError, Command, Message, MAX_PACKET_SIZE, MIN_PACKET_SIZE, MSG_ACCEPT, MSG_COMMAND,
    MSG_CONNECT, MSG_FINISH, MSG_HASH, MSG_START, MSG_STATE,
};

/// Decodes one framed message from `buffer`.
///
/// Returns the message together with the decode offset (header plus framed
/// payload). For command packets the bytes from the offset to the end of the
/// buffer are the opaque input trailer; the caller splices them through
/// unmodified.
pub fn decode_message(buffer: &[u8]) -> Result<(Message, usize), CodecError> {
    if buffer.len() < MIN_PACKET_SIZE || buffer.len() > MAX_PACKET_SIZE {
        return Err(CodecError::PacketSize);
    }

    let size = u16::from_be_bytes([buffer[1], buffer[2]]) as usize;
    let offset = MIN_PACKET_SIZE + size;
    if offset > buffer.len() {
        return Err(CodecError::PacketSize);
    }
    let payload = &buffer[MIN_PACKET_SIZE..offset];

    let message = match buffer[0] {
        MSG_CONNECT => Message::Connect(unmarshal(payload)?),
        MSG_ACCEPT => Message::Accept,
        MSG_STATE => Message::State(unmarshal(payload)?),
        MSG_START => Message::Start,
        MSG_FINISH => Message::Finish(unmarshal(payload)?),
        MSG_COMMAND => Message::Command(unmarshal(payload)?),
        MSG_HASH => Message::Hash(unmarshal(payload)?),
        _ => return Err(CodecError::PacketBroken),
    };
    Ok((message, offset))
}

fn unmarshal<'a, T: serde::Deserialize<'a>>(payload: &'a [u8]) -> Result<T, CodecError> {
    postcard::from_bytes(payload).map_err(|_| CodecError::PacketBroken)
}

/// Appends one framed message to `buffer`.
///
/// On an oversized message the buffer is cleared so a half-written frame can
/// never reach the wire.
pub fn encode_message(message: &Message, buffer: &mut BytesMut) -> Result<(), CodecError> {
    let (tag, payload) = match message {
        Message::Connect(connect) => (MSG_CONNECT, marshal(connect)?),
        Message::Accept => (MSG_ACCEPT, Vec::new()),
        Message::State(state) => (MSG_STATE, marshal(state)?),
        Message::Start => (MSG_START, Vec::new()),
        Message::Finish(finish) => (MSG_FINISH, marshal(finish)?),
        Message::Command(command) => (MSG_COMMAND, marshal(command)?),
        Message::Hash(hash) => (MSG_HASH, marshal(hash)?),
    };

    if MIN_PACKET_SIZE + payload.len() > MAX_PACKET_SIZE {
        buffer.clear();
        return Err(CodecError::MessageSize);
    }

    buffer.put_u8(tag);
    buffer.put_u16(payload.len() as u16);
    buffer.put_slice(&payload);
    Ok(())
}

fn marshal<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_stdvec(value).map_err(|_| CodecError::PacketBroken)
}

/// Rebuilds an inbound command packet for relaying: the conv field becomes
/// the originator's, the trailer bytes are carried over exactly once.
///
/// `offset` is the decode offset returned by [`decode_message`] for the
/// packet in `buffer`.
pub fn transform_command(
    command: &Command,
    offset: usize,
    buffer: &[u8],
    conv: u32,
) -> Result<Bytes, CodecError> {
    let rewritten = Command {
        frame: command.frame,
        conv,
    };
    let trailer = &buffer[offset..];

    let mut out = BytesMut::with_capacity(offset + trailer.len());
    encode_message(&Message::Command(rewritten), &mut out)?;
    out.put_slice(trailer);
    if out.len() > MAX_PACKET_SIZE {
        return Err(CodecError::MessageSize);
    }
    Ok(out.freeze())
}
