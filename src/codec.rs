//! Milter packet encoding and decoding.
//!
//! Every packet is framed as `[u32 length][u8 command][payload]` where the
//! length counts the command byte and the payload. String fields are
//! separated by NUL bytes; a trailing terminator on the last field is
//! optional when decoding and always written when encoding.

use crate::error::CodecError;
use crate::option::MilterOption;
use crate::protocol::{
    command, reply, ActionFlags, MacroStage, Phase, StepFlags, MAX_PACKET_SIZE,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tokio_util::codec::{Decoder, Encoder};

/// Macro names a filter wants to receive, per stage.
pub type MacroRequests = BTreeMap<MacroStage, Vec<String>>;

/// Address part of a connect packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectAddress {
    Unknown,
    Unix(String),
    Inet { port: u16, address: String },
    Inet6 { port: u16, address: String },
}

impl ConnectAddress {
    const FAMILY_UNKNOWN: u8 = b'U';
    const FAMILY_UNIX: u8 = b'L';
    const FAMILY_INET: u8 = b'4';
    const FAMILY_INET6: u8 = b'6';

    /// Parsed IP address, tolerating the `IPv6:` prefix some MTAs send.
    pub fn ip(&self) -> Option<std::net::IpAddr> {
        match self {
            ConnectAddress::Inet { address, .. } => address.parse().ok(),
            ConnectAddress::Inet6 { address, .. } => {
                let trimmed = address.strip_prefix("IPv6:").unwrap_or(address);
                trimmed.parse().ok()
            }
            _ => None,
        }
    }
}

/// Packets sent from the MTA side to a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Negotiate(MilterOption),
    DefineMacro {
        phase: Phase,
        macros: Vec<(String, String)>,
    },
    Connect {
        host: String,
        address: ConnectAddress,
    },
    Helo(String),
    EnvelopeFrom {
        address: String,
        parameters: Vec<String>,
    },
    EnvelopeRecipient {
        address: String,
        parameters: Vec<String>,
    },
    Data,
    Unknown(String),
    Header {
        name: String,
        value: String,
    },
    EndOfHeader,
    Body(Bytes),
    EndOfMessage(Bytes),
    Abort,
    Quit,
    QuitNewConnection,
}

impl Command {
    pub fn phase(&self) -> Phase {
        match self {
            Command::Negotiate(_) => Phase::Negotiate,
            Command::DefineMacro { phase, .. } => *phase,
            Command::Connect { .. } => Phase::Connect,
            Command::Helo(_) => Phase::Helo,
            Command::EnvelopeFrom { .. } => Phase::EnvelopeFrom,
            Command::EnvelopeRecipient { .. } => Phase::EnvelopeRecipient,
            Command::Data => Phase::Data,
            Command::Unknown(_) => Phase::Unknown,
            Command::Header { .. } => Phase::Header,
            Command::EndOfHeader => Phase::EndOfHeader,
            Command::Body(_) => Phase::Body,
            Command::EndOfMessage(_) => Phase::EndOfMessage,
            Command::Abort => Phase::Abort,
            Command::Quit | Command::QuitNewConnection => Phase::Quit,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::DefineMacro { .. } => "define-macro",
            Command::QuitNewConnection => "quit-new-connection",
            other => other.phase().as_str(),
        }
    }
}

/// Packets sent from a filter back to the MTA side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Negotiate {
        option: MilterOption,
        macro_requests: MacroRequests,
    },
    Continue,
    Reject,
    Discard,
    Accept,
    TemporaryFailure,
    Skip,
    Progress,
    Shutdown,
    ConnectionFailure,
    ReplyCode(String),
    AddHeader {
        name: String,
        value: String,
    },
    InsertHeader {
        index: u32,
        name: String,
        value: String,
    },
    ChangeHeader {
        index: u32,
        name: String,
        value: String,
    },
    ChangeFrom {
        from: String,
        parameters: Option<String>,
    },
    AddRecipient {
        recipient: String,
        parameters: Option<String>,
    },
    DeleteRecipient(String),
    ReplaceBody(Bytes),
    Quarantine(String),
    SetSymbolList {
        stage: MacroStage,
        symbols: Vec<String>,
    },
}

impl Reply {
    pub fn name(&self) -> &'static str {
        match self {
            Reply::Negotiate { .. } => "negotiate",
            Reply::Continue => "continue",
            Reply::Reject => "reject",
            Reply::Discard => "discard",
            Reply::Accept => "accept",
            Reply::TemporaryFailure => "temporary-failure",
            Reply::Skip => "skip",
            Reply::Progress => "progress",
            Reply::Shutdown => "shutdown",
            Reply::ConnectionFailure => "connection-failure",
            Reply::ReplyCode(_) => "reply-code",
            Reply::AddHeader { .. } => "add-header",
            Reply::InsertHeader { .. } => "insert-header",
            Reply::ChangeHeader { .. } => "change-header",
            Reply::ChangeFrom { .. } => "change-from",
            Reply::AddRecipient { .. } => "add-recipient",
            Reply::DeleteRecipient(_) => "delete-recipient",
            Reply::ReplaceBody(_) => "replace-body",
            Reply::Quarantine(_) => "quarantine",
            Reply::SetSymbolList { .. } => "set-symbol-list",
        }
    }
}

/// Outcome of a decode attempt on a buffer prefix.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<T> {
    Packet(T, usize),
    NeedMore,
}

fn put_string(dst: &mut BytesMut, value: &str) {
    dst.put_slice(value.as_bytes());
    dst.put_u8(0);
}

fn put_frame<F>(dst: &mut BytesMut, code: u8, payload: F)
where
    F: FnOnce(&mut BytesMut),
{
    let start = dst.len();
    dst.put_u32(0);
    dst.put_u8(code);
    payload(dst);
    let length = (dst.len() - start - 4) as u32;
    dst[start..start + 4].copy_from_slice(&length.to_be_bytes());
}

fn put_option(dst: &mut BytesMut, option: &MilterOption) {
    dst.put_u32(option.version);
    dst.put_u32(option.actions.bits());
    dst.put_u32(option.steps.bits());
}

pub fn encode_command(packet: &Command, dst: &mut BytesMut) {
    match packet {
        Command::Negotiate(option) => {
            put_frame(dst, command::NEGOTIATE, |dst| put_option(dst, option));
        }
        Command::DefineMacro { phase, macros } => {
            let context = phase.command_code().unwrap_or(command::UNKNOWN);
            put_frame(dst, command::DEFINE_MACRO, |dst| {
                dst.put_u8(context);
                for (name, value) in macros {
                    put_string(dst, name);
                    put_string(dst, value);
                }
            });
        }
        Command::Connect { host, address } => {
            put_frame(dst, command::CONNECT, |dst| {
                put_string(dst, host);
                match address {
                    ConnectAddress::Unknown => dst.put_u8(ConnectAddress::FAMILY_UNKNOWN),
                    ConnectAddress::Unix(path) => {
                        dst.put_u8(ConnectAddress::FAMILY_UNIX);
                        dst.put_u16(0);
                        put_string(dst, path);
                    }
                    ConnectAddress::Inet { port, address } => {
                        dst.put_u8(ConnectAddress::FAMILY_INET);
                        dst.put_u16(*port);
                        put_string(dst, address);
                    }
                    ConnectAddress::Inet6 { port, address } => {
                        dst.put_u8(ConnectAddress::FAMILY_INET6);
                        dst.put_u16(*port);
                        put_string(dst, address);
                    }
                }
            });
        }
        Command::Helo(name) => put_frame(dst, command::HELO, |dst| put_string(dst, name)),
        Command::EnvelopeFrom {
            address,
            parameters,
        } => put_frame(dst, command::ENVELOPE_FROM, |dst| {
            put_string(dst, address);
            parameters.iter().for_each(|p| put_string(dst, p));
        }),
        Command::EnvelopeRecipient {
            address,
            parameters,
        } => put_frame(dst, command::ENVELOPE_RECIPIENT, |dst| {
            put_string(dst, address);
            parameters.iter().for_each(|p| put_string(dst, p));
        }),
        Command::Data => put_frame(dst, command::DATA, |_| {}),
        Command::Unknown(line) => put_frame(dst, command::UNKNOWN, |dst| put_string(dst, line)),
        Command::Header { name, value } => put_frame(dst, command::HEADER, |dst| {
            put_string(dst, name);
            put_string(dst, value);
        }),
        Command::EndOfHeader => put_frame(dst, command::END_OF_HEADER, |_| {}),
        Command::Body(chunk) => put_frame(dst, command::BODY, |dst| dst.put_slice(chunk)),
        Command::EndOfMessage(chunk) => {
            put_frame(dst, command::END_OF_MESSAGE, |dst| dst.put_slice(chunk))
        }
        Command::Abort => put_frame(dst, command::ABORT, |_| {}),
        Command::Quit => put_frame(dst, command::QUIT, |_| {}),
        Command::QuitNewConnection => put_frame(dst, command::QUIT_NEW_CONNECTION, |_| {}),
    }
}

pub fn encode_reply(packet: &Reply, dst: &mut BytesMut) {
    match packet {
        Reply::Negotiate {
            option,
            macro_requests,
        } => put_frame(dst, reply::NEGOTIATE, |dst| {
            put_option(dst, option);
            for (stage, symbols) in macro_requests {
                dst.put_u32(*stage as u32);
                put_string(dst, &symbols.join(" "));
            }
        }),
        Reply::Continue => put_frame(dst, reply::CONTINUE, |_| {}),
        Reply::Reject => put_frame(dst, reply::REJECT, |_| {}),
        Reply::Discard => put_frame(dst, reply::DISCARD, |_| {}),
        Reply::Accept => put_frame(dst, reply::ACCEPT, |_| {}),
        Reply::TemporaryFailure => put_frame(dst, reply::TEMPORARY_FAILURE, |_| {}),
        Reply::Skip => put_frame(dst, reply::SKIP, |_| {}),
        Reply::Progress => put_frame(dst, reply::PROGRESS, |_| {}),
        Reply::Shutdown => put_frame(dst, reply::SHUTDOWN, |_| {}),
        Reply::ConnectionFailure => put_frame(dst, reply::CONNECTION_FAILURE, |_| {}),
        Reply::ReplyCode(text) => put_frame(dst, reply::REPLY_CODE, |dst| put_string(dst, text)),
        Reply::AddHeader { name, value } => put_frame(dst, reply::ADD_HEADER, |dst| {
            put_string(dst, name);
            put_string(dst, value);
        }),
        Reply::InsertHeader { index, name, value } => {
            put_frame(dst, reply::INSERT_HEADER, |dst| {
                dst.put_u32(*index);
                put_string(dst, name);
                put_string(dst, value);
            })
        }
        Reply::ChangeHeader { index, name, value } => {
            put_frame(dst, reply::CHANGE_HEADER, |dst| {
                dst.put_u32(*index);
                put_string(dst, name);
                put_string(dst, value);
            })
        }
        Reply::ChangeFrom { from, parameters } => put_frame(dst, reply::CHANGE_FROM, |dst| {
            put_string(dst, from);
            if let Some(parameters) = parameters {
                put_string(dst, parameters);
            }
        }),
        Reply::AddRecipient {
            recipient,
            parameters: None,
        } => put_frame(dst, reply::ADD_RECIPIENT, |dst| put_string(dst, recipient)),
        Reply::AddRecipient {
            recipient,
            parameters: Some(parameters),
        } => put_frame(dst, reply::ADD_RECIPIENT_WITH_PARAMETERS, |dst| {
            put_string(dst, recipient);
            put_string(dst, parameters);
        }),
        Reply::DeleteRecipient(recipient) => {
            put_frame(dst, reply::DELETE_RECIPIENT, |dst| put_string(dst, recipient))
        }
        Reply::ReplaceBody(chunk) => put_frame(dst, reply::REPLACE_BODY, |dst| dst.put_slice(chunk)),
        Reply::Quarantine(reason) => put_frame(dst, reply::QUARANTINE, |dst| put_string(dst, reason)),
        Reply::SetSymbolList { stage, symbols } => put_frame(dst, reply::SET_SYMBOL_LIST, |dst| {
            dst.put_u32(*stage as u32);
            put_string(dst, &symbols.join(" "));
        }),
    }
}

/// Splits one frame off the front of `src`.
fn frame(src: &[u8]) -> Result<Option<(u8, &[u8], usize)>, CodecError> {
    if src.len() < 4 {
        return Ok(None);
    }
    let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
    if length == 0 || length > MAX_PACKET_SIZE {
        return Err(CodecError::InvalidLength(length));
    }
    let total = 4 + length as usize;
    if src.len() < total {
        return Ok(None);
    }
    Ok(Some((src[4], &src[5..total], total)))
}

fn to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// NUL separated strings; a single trailing terminator is optional.
fn strings(payload: &[u8]) -> Vec<String> {
    let payload = payload.strip_suffix(&[0]).unwrap_or(payload);
    payload.split(|b| *b == 0).map(to_string).collect()
}

/// Reads one string field up to its terminator or the end of the payload.
fn take_string(payload: &mut &[u8]) -> String {
    match payload.iter().position(|b| *b == 0) {
        Some(end) => {
            let value = to_string(&payload[..end]);
            *payload = &payload[end + 1..];
            value
        }
        None => {
            let value = to_string(payload);
            *payload = &[];
            value
        }
    }
}

fn take_u32(payload: &mut &[u8], packet: &'static str) -> Result<u32, CodecError> {
    if payload.len() < 4 {
        return Err(CodecError::malformed(packet, "truncated 32-bit field"));
    }
    Ok(payload.get_u32())
}

fn take_option(payload: &mut &[u8], packet: &'static str) -> Result<MilterOption, CodecError> {
    let version = take_u32(payload, packet)?;
    let actions = take_u32(payload, packet)?;
    let steps = take_u32(payload, packet)?;
    Ok(MilterOption::new(
        version,
        ActionFlags::from_bits_retain(actions),
        StepFlags::from_bits_retain(steps),
    ))
}

fn take_stage(payload: &mut &[u8], packet: &'static str) -> Result<MacroStage, CodecError> {
    let raw = take_u32(payload, packet)?;
    MacroStage::from_u32(raw)
        .ok_or_else(|| CodecError::malformed(packet, format!("unknown macro stage {raw}")))
}

fn symbols(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

fn pair(payload: &[u8], packet: &'static str) -> Result<(String, String), CodecError> {
    let mut fields = strings(payload).into_iter();
    match (fields.next(), fields.next(), fields.next()) {
        (Some(name), Some(value), None) => Ok((name, value)),
        _ => Err(CodecError::malformed(packet, "expected name and value")),
    }
}

fn address_and_parameters(payload: &[u8], packet: &'static str) -> Result<(String, Vec<String>), CodecError> {
    if payload.is_empty() {
        return Err(CodecError::malformed(packet, "missing address"));
    }
    let mut fields = strings(payload);
    let address = fields.remove(0);
    Ok((address, fields))
}

fn indexed_header(mut payload: &[u8], packet: &'static str) -> Result<(u32, String, String), CodecError> {
    let index = take_u32(&mut payload, packet)?;
    let (name, value) = pair(payload, packet)?;
    Ok((index, name, value))
}

fn decode_connect(mut payload: &[u8]) -> Result<Command, CodecError> {
    let host = take_string(&mut payload);
    if payload.is_empty() {
        return Err(CodecError::malformed("connect", "missing address family"));
    }
    let family = payload.get_u8();
    let address = match family {
        ConnectAddress::FAMILY_UNKNOWN => ConnectAddress::Unknown,
        ConnectAddress::FAMILY_UNIX | ConnectAddress::FAMILY_INET | ConnectAddress::FAMILY_INET6 => {
            if payload.len() < 2 {
                return Err(CodecError::malformed("connect", "missing port"));
            }
            let port = payload.get_u16();
            let address = take_string(&mut payload);
            match family {
                ConnectAddress::FAMILY_UNIX => ConnectAddress::Unix(address),
                ConnectAddress::FAMILY_INET => ConnectAddress::Inet { port, address },
                _ => ConnectAddress::Inet6 { port, address },
            }
        }
        other => {
            return Err(CodecError::malformed(
                "connect",
                format!("unknown address family {other:#04x}"),
            ))
        }
    };
    Ok(Command::Connect { host, address })
}

fn decode_define_macro(payload: &[u8]) -> Result<Command, CodecError> {
    let (&context, rest) = payload
        .split_first()
        .ok_or_else(|| CodecError::malformed("define-macro", "missing macro context"))?;
    let phase = Phase::from_macro_context(context).ok_or_else(|| {
        CodecError::malformed("define-macro", format!("unknown macro context {context:#04x}"))
    })?;
    let mut macros = Vec::new();
    if !rest.is_empty() {
        let fields = strings(rest);
        if fields.len() % 2 != 0 {
            return Err(CodecError::malformed("define-macro", "macro without value"));
        }
        let mut fields = fields.into_iter();
        while let (Some(name), Some(value)) = (fields.next(), fields.next()) {
            if name.is_empty() {
                continue;
            }
            macros.push((name, value));
        }
    }
    Ok(Command::DefineMacro { phase, macros })
}

pub fn decode_command(src: &[u8]) -> Result<Decoded<Command>, CodecError> {
    let Some((code, payload, consumed)) = frame(src)? else {
        return Ok(Decoded::NeedMore);
    };
    let packet = match code {
        command::NEGOTIATE => {
            let mut payload = payload;
            // anything after the three words is reserved
            Command::Negotiate(take_option(&mut payload, "negotiate")?)
        }
        command::DEFINE_MACRO => decode_define_macro(payload)?,
        command::CONNECT => decode_connect(payload)?,
        command::HELO => Command::Helo(strings(payload).remove(0)),
        command::ENVELOPE_FROM => {
            let (address, parameters) = address_and_parameters(payload, "envelope-from")?;
            Command::EnvelopeFrom {
                address,
                parameters,
            }
        }
        command::ENVELOPE_RECIPIENT => {
            let (address, parameters) = address_and_parameters(payload, "envelope-recipient")?;
            Command::EnvelopeRecipient {
                address,
                parameters,
            }
        }
        command::DATA => Command::Data,
        command::UNKNOWN => Command::Unknown(strings(payload).remove(0)),
        command::HEADER => {
            let (name, value) = pair(payload, "header")?;
            Command::Header { name, value }
        }
        command::END_OF_HEADER => Command::EndOfHeader,
        command::BODY => Command::Body(Bytes::copy_from_slice(payload)),
        command::END_OF_MESSAGE => Command::EndOfMessage(Bytes::copy_from_slice(payload)),
        command::ABORT => Command::Abort,
        command::QUIT => Command::Quit,
        command::QUIT_NEW_CONNECTION => Command::QuitNewConnection,
        other => return Err(CodecError::UnknownCommand(other)),
    };
    Ok(Decoded::Packet(packet, consumed))
}

fn decode_macro_requests(mut payload: &[u8]) -> Result<MacroRequests, CodecError> {
    let mut requests = MacroRequests::new();
    while !payload.is_empty() {
        let stage = take_stage(&mut payload, "negotiate")?;
        let list = take_string(&mut payload);
        requests.entry(stage).or_default().extend(symbols(&list));
    }
    Ok(requests)
}

pub fn decode_reply(src: &[u8]) -> Result<Decoded<Reply>, CodecError> {
    let Some((code, payload, consumed)) = frame(src)? else {
        return Ok(Decoded::NeedMore);
    };
    let packet = match code {
        reply::NEGOTIATE => {
            let mut payload = payload;
            let option = take_option(&mut payload, "negotiate")?;
            Reply::Negotiate {
                option,
                macro_requests: decode_macro_requests(payload)?,
            }
        }
        reply::CONTINUE => Reply::Continue,
        reply::REJECT => Reply::Reject,
        reply::DISCARD => Reply::Discard,
        reply::ACCEPT => Reply::Accept,
        reply::TEMPORARY_FAILURE => Reply::TemporaryFailure,
        reply::SKIP => Reply::Skip,
        reply::PROGRESS => Reply::Progress,
        reply::SHUTDOWN => Reply::Shutdown,
        reply::CONNECTION_FAILURE => Reply::ConnectionFailure,
        reply::REPLY_CODE => Reply::ReplyCode(strings(payload).remove(0)),
        reply::ADD_HEADER => {
            let (name, value) = pair(payload, "add-header")?;
            Reply::AddHeader { name, value }
        }
        reply::INSERT_HEADER => {
            let (index, name, value) = indexed_header(payload, "insert-header")?;
            Reply::InsertHeader { index, name, value }
        }
        reply::CHANGE_HEADER => {
            let (index, name, value) = indexed_header(payload, "change-header")?;
            Reply::ChangeHeader { index, name, value }
        }
        reply::CHANGE_FROM => {
            let (from, mut rest) = address_and_parameters(payload, "change-from")?;
            Reply::ChangeFrom {
                from,
                parameters: if rest.is_empty() { None } else { Some(rest.remove(0)) },
            }
        }
        reply::ADD_RECIPIENT => Reply::AddRecipient {
            recipient: strings(payload).remove(0),
            parameters: None,
        },
        reply::ADD_RECIPIENT_WITH_PARAMETERS => {
            let (recipient, parameters) = pair(payload, "add-recipient")?;
            Reply::AddRecipient {
                recipient,
                parameters: Some(parameters),
            }
        }
        reply::DELETE_RECIPIENT => Reply::DeleteRecipient(strings(payload).remove(0)),
        reply::REPLACE_BODY => Reply::ReplaceBody(Bytes::copy_from_slice(payload)),
        reply::QUARANTINE => Reply::Quarantine(strings(payload).remove(0)),
        reply::SET_SYMBOL_LIST => {
            let mut payload = payload;
            let stage = take_stage(&mut payload, "set-symbol-list")?;
            Reply::SetSymbolList {
                stage,
                symbols: symbols(&take_string(&mut payload)),
            }
        }
        other => return Err(CodecError::UnknownReply(other)),
    };
    Ok(Decoded::Packet(packet, consumed))
}

/// Codec for the filter side of a connection: reads commands, writes replies.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilterCodec;

impl Decoder for FilterCodec {
    type Item = Command;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, CodecError> {
        match decode_command(src)? {
            Decoded::Packet(packet, consumed) => {
                src.advance(consumed);
                Ok(Some(packet))
            }
            Decoded::NeedMore => Ok(None),
        }
    }
}

impl Encoder<Reply> for FilterCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Reply, dst: &mut BytesMut) -> Result<(), CodecError> {
        encode_reply(&item, dst);
        Ok(())
    }
}

/// Codec for the MTA side of a connection: reads replies, writes commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct MtaCodec;

impl Decoder for MtaCodec {
    type Item = Reply;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>, CodecError> {
        match decode_reply(src)? {
            Decoded::Packet(packet, consumed) => {
                src.advance(consumed);
                Ok(Some(packet))
            }
            Decoded::NeedMore => Ok(None),
        }
    }
}

impl Encoder<Command> for MtaCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), CodecError> {
        encode_command(&item, dst);
        Ok(())
    }
}
