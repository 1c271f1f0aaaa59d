//! Low-level functions to manipulate TFTP packets and datagrams.
//!
//! A packet is a typed value; a datagram is the wire representation.
//! `parse_dgram` and `build_dgram` are symmetric: a packet built from
//! valid fields parses back to an equal packet.

use std::collections::BTreeMap;

use crate::error::ProvdError;

pub const OP_RRQ: u16 = 1;
pub const OP_WRQ: u16 = 2;
pub const OP_DATA: u16 = 3;
pub const OP_ACK: u16 = 4;
pub const OP_ERR: u16 = 5;
pub const OP_OACK: u16 = 6;

/// Not defined, see error message (if any)
pub const ERR_UNDEF: u16 = 0;
/// File not found
pub const ERR_FNF: u16 = 1;
/// Access violation
pub const ERR_ACCESS: u16 = 2;
/// Disk full or allocation exceeded
pub const ERR_ALLOC: u16 = 3;
/// Illegal TFTP operation
pub const ERR_ILL: u16 = 4;
/// Unknown transfer ID
pub const ERR_UNKNWN_TID: u16 = 5;
/// File already exists
pub const ERR_FEXIST: u16 = 6;
/// No such user
pub const ERR_NO_USER: u16 = 7;

/// Smallest/largest negotiable block size (RFC 2348).
pub const MIN_BLKSIZE: u16 = 8;
pub const MAX_BLKSIZE: u16 = 65464;

/// Alias kept for error construction ergonomics.
pub type PacketError = ProvdError;

fn packet_error(msg: impl Into<String>) -> ProvdError {
    ProvdError::Packet(msg.into())
}

/// A read or write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPacket {
    pub filename: String,
    /// Transfer mode, lowercased (`octet`, `netascii`, `mail`).
    pub mode: String,
    /// Negotiated options, names and values lowercased.
    pub options: BTreeMap<String, String>,
}

impl RequestPacket {
    /// The validated blksize option, when present.
    pub fn blksize(&self) -> Option<u16> {
        self.options.get("blksize").and_then(|v| v.parse().ok())
    }
}

/// A TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest(RequestPacket),
    WriteRequest(RequestPacket),
    Data { block_no: u16, data: Vec<u8> },
    Ack { block_no: u16 },
    Error { code: u16, message: String },
    Oack { options: BTreeMap<String, String> },
}

fn parse_option_blksize(value: &str) -> Result<String, ProvdError> {
    let blksize: u32 = value
        .parse()
        .map_err(|_| packet_error("invalid blksize value - not a number"))?;
    if blksize < MIN_BLKSIZE as u32 || blksize > MAX_BLKSIZE as u32 {
        return Err(packet_error("invalid blksize value - out of range"));
    }
    Ok(blksize.to_string())
}

fn parse_request(dgram: &[u8]) -> Result<RequestPacket, ProvdError> {
    // 'file\0mode\0' splits to ['file', 'mode', '']
    let tokens: Vec<&[u8]> = dgram.split(|&b| b == 0).collect();
    if tokens.len() < 3 {
        return Err(packet_error("too small"));
    }
    if dgram.last() != Some(&0) {
        return Err(packet_error("last dgram byte not null"));
    }
    if tokens.len() % 2 == 0 {
        return Err(packet_error("invalid number of field"));
    }

    let filename = String::from_utf8_lossy(tokens[0]).into_owned();
    let mode = String::from_utf8_lossy(tokens[1]).to_lowercase();

    let mut options = BTreeMap::new();
    let mut i = 2;
    while i + 1 < tokens.len() - 1 {
        let opt = String::from_utf8_lossy(tokens[i]).to_lowercase();
        let val = String::from_utf8_lossy(tokens[i + 1]).to_lowercase();
        if options.contains_key(&opt) {
            // an option may only be specified once
            return Err(packet_error("same option specified more than once"));
        }
        let val = match opt.as_str() {
            "blksize" => parse_option_blksize(&val)?,
            _ => val,
        };
        options.insert(opt, val);
        i += 2;
    }
    Ok(RequestPacket {
        filename,
        mode,
        options,
    })
}

fn parse_data(dgram: &[u8]) -> Result<Packet, ProvdError> {
    if dgram.len() < 2 {
        return Err(packet_error("too small"));
    }
    Ok(Packet::Data {
        block_no: u16::from_be_bytes([dgram[0], dgram[1]]),
        data: dgram[2..].to_vec(),
    })
}

fn parse_ack(dgram: &[u8]) -> Result<Packet, ProvdError> {
    if dgram.len() != 2 {
        return Err(packet_error("incorrect size"));
    }
    Ok(Packet::Ack {
        block_no: u16::from_be_bytes([dgram[0], dgram[1]]),
    })
}

fn parse_err(dgram: &[u8]) -> Result<Packet, ProvdError> {
    if dgram.len() < 3 {
        return Err(packet_error("too small"));
    }
    if dgram.last() != Some(&0) {
        return Err(packet_error("last datagram byte not null"));
    }
    let message = &dgram[2..dgram.len() - 1];
    if message.contains(&0) {
        return Err(packet_error("null byte in errmsg"));
    }
    Ok(Packet::Error {
        code: u16::from_be_bytes([dgram[0], dgram[1]]),
        message: String::from_utf8_lossy(message).into_owned(),
    })
}

fn parse_oack(dgram: &[u8]) -> Result<Packet, ProvdError> {
    if dgram.is_empty() {
        return Ok(Packet::Oack {
            options: BTreeMap::new(),
        });
    }
    if dgram.last() != Some(&0) {
        return Err(packet_error("last dgram byte not null"));
    }
    let tokens: Vec<&[u8]> = dgram[..dgram.len() - 1].split(|&b| b == 0).collect();
    if tokens.len() % 2 != 0 {
        return Err(packet_error("invalid number of field"));
    }
    let mut options = BTreeMap::new();
    for pair in tokens.chunks(2) {
        let opt = String::from_utf8_lossy(pair[0]).to_lowercase();
        let val = String::from_utf8_lossy(pair[1]).to_lowercase();
        if options.contains_key(&opt) {
            return Err(packet_error("same option specified more than once"));
        }
        options.insert(opt, val);
    }
    Ok(Packet::Oack { options })
}

/// Parse a datagram into a packet.
///
/// Fails with a `Packet` error when the datagram is malformed or carries
/// an unknown opcode.
pub fn parse_dgram(dgram: &[u8]) -> Result<Packet, ProvdError> {
    if dgram.len() < 2 {
        return Err(packet_error("too small"));
    }
    let opcode = u16::from_be_bytes([dgram[0], dgram[1]]);
    let payload = &dgram[2..];
    match opcode {
        OP_RRQ => Ok(Packet::ReadRequest(parse_request(payload)?)),
        OP_WRQ => Ok(Packet::WriteRequest(parse_request(payload)?)),
        OP_DATA => parse_data(payload),
        OP_ACK => parse_ack(payload),
        OP_ERR => parse_err(payload),
        OP_OACK => parse_oack(payload),
        _ => Err(packet_error("invalid opcode")),
    }
}

fn check_no_null(field: &str, what: &str) -> Result<(), ProvdError> {
    if field.as_bytes().contains(&0) {
        return Err(packet_error(format!("null byte in {what}")));
    }
    Ok(())
}

fn build_request(opcode: u16, request: &RequestPacket) -> Result<Vec<u8>, ProvdError> {
    check_no_null(&request.filename, "filename")?;
    check_no_null(&request.mode, "mode")?;
    let mut dgram = opcode.to_be_bytes().to_vec();
    dgram.extend_from_slice(request.filename.as_bytes());
    dgram.push(0);
    dgram.extend_from_slice(request.mode.as_bytes());
    dgram.push(0);
    for (opt, val) in &request.options {
        check_no_null(opt, "option/value")?;
        check_no_null(val, "option/value")?;
        dgram.extend_from_slice(opt.as_bytes());
        dgram.push(0);
        dgram.extend_from_slice(val.as_bytes());
        dgram.push(0);
    }
    Ok(dgram)
}

/// Build a datagram from a packet.
///
/// Fails with a `Packet` error when a field cannot be represented on the
/// wire (e.g. a null byte in an error message).
pub fn build_dgram(packet: &Packet) -> Result<Vec<u8>, ProvdError> {
    match packet {
        Packet::ReadRequest(request) => build_request(OP_RRQ, request),
        Packet::WriteRequest(request) => build_request(OP_WRQ, request),
        Packet::Data { block_no, data } => {
            let mut dgram = OP_DATA.to_be_bytes().to_vec();
            dgram.extend_from_slice(&block_no.to_be_bytes());
            dgram.extend_from_slice(data);
            Ok(dgram)
        }
        Packet::Ack { block_no } => {
            let mut dgram = OP_ACK.to_be_bytes().to_vec();
            dgram.extend_from_slice(&block_no.to_be_bytes());
            Ok(dgram)
        }
        Packet::Error { code, message } => {
            check_no_null(message, "errmsg")?;
            let mut dgram = OP_ERR.to_be_bytes().to_vec();
            dgram.extend_from_slice(&code.to_be_bytes());
            dgram.extend_from_slice(message.as_bytes());
            dgram.push(0);
            Ok(dgram)
        }
        Packet::Oack { options } => {
            let mut dgram = OP_OACK.to_be_bytes().to_vec();
            for (opt, val) in options {
                check_no_null(opt, "option/value")?;
                check_no_null(val, "option/value")?;
                dgram.extend_from_slice(opt.as_bytes());
                dgram.push(0);
                dgram.extend_from_slice(val.as_bytes());
                dgram.push(0);
            }
            Ok(dgram)
        }
    }
}

/// Shorthand for a new error packet.
pub fn err_packet(code: u16, message: impl Into<String>) -> Packet {
    Packet::Error {
        code,
        message: message.into(),
    }
}

/// Shorthand for a new data packet.
pub fn data_packet(block_no: u16, data: Vec<u8>) -> Packet {
    Packet::Data { block_no, data }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let dgram = build_dgram(&packet).unwrap();
        assert_eq!(parse_dgram(&dgram).unwrap(), packet);
    }

    #[test]
    fn test_roundtrip_requests() {
        roundtrip(Packet::ReadRequest(RequestPacket {
            filename: "0011223344aa.cfg".to_string(),
            mode: "octet".to_string(),
            options: BTreeMap::new(),
        }));
        let mut options = BTreeMap::new();
        options.insert("blksize".to_string(), "1468".to_string());
        roundtrip(Packet::ReadRequest(RequestPacket {
            filename: "firmware.bin".to_string(),
            mode: "octet".to_string(),
            options,
        }));
    }

    #[test]
    fn test_roundtrip_data_ack_err_oack() {
        roundtrip(Packet::Data {
            block_no: 0,
            data: vec![1, 2, 3],
        });
        roundtrip(Packet::Data {
            block_no: 65535,
            data: Vec::new(),
        });
        roundtrip(Packet::Ack { block_no: 42 });
        roundtrip(err_packet(ERR_FNF, "File not found"));
        let mut options = BTreeMap::new();
        options.insert("blksize".to_string(), "512".to_string());
        roundtrip(Packet::Oack { options });
    }

    #[test]
    fn test_parse_rrq_wire_format() {
        let dgram = b"\x00\x01foo.cfg\x00octet\x00";
        match parse_dgram(dgram).unwrap() {
            Packet::ReadRequest(request) => {
                assert_eq!(request.filename, "foo.cfg");
                assert_eq!(request.mode, "octet");
                assert!(request.options.is_empty());
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rrq_mode_case_insensitive() {
        let dgram = b"\x00\x01foo\x00OCTET\x00";
        match parse_dgram(dgram).unwrap() {
            Packet::ReadRequest(request) => assert_eq!(request.mode, "octet"),
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn test_parse_request_errors() {
        // too small
        assert!(parse_dgram(b"\x00\x01foo\x00").is_err());
        // last byte not null
        assert!(parse_dgram(b"\x00\x01foo\x00octet").is_err());
        // invalid number of fields (option name without value)
        assert!(parse_dgram(b"\x00\x01foo\x00octet\x00blksize\x00").is_err());
        // duplicated option
        assert!(
            parse_dgram(b"\x00\x01foo\x00octet\x00blksize\x00512\x00blksize\x00512\x00").is_err()
        );
    }

    #[test]
    fn test_blksize_boundaries() {
        let ok_min = b"\x00\x01f\x00octet\x00blksize\x008\x00";
        let ok_max = b"\x00\x01f\x00octet\x00blksize\x0065464\x00";
        let too_small = b"\x00\x01f\x00octet\x00blksize\x007\x00";
        let too_big = b"\x00\x01f\x00octet\x00blksize\x0065465\x00";
        let not_a_number = b"\x00\x01f\x00octet\x00blksize\x00abc\x00";

        match parse_dgram(ok_min).unwrap() {
            Packet::ReadRequest(request) => assert_eq!(request.blksize(), Some(8)),
            other => panic!("unexpected packet: {other:?}"),
        }
        match parse_dgram(ok_max).unwrap() {
            Packet::ReadRequest(request) => assert_eq!(request.blksize(), Some(65464)),
            other => panic!("unexpected packet: {other:?}"),
        }
        assert!(parse_dgram(too_small).is_err());
        assert!(parse_dgram(too_big).is_err());
        assert!(parse_dgram(not_a_number).is_err());
    }

    #[test]
    fn test_parse_invalid_opcode() {
        assert!(parse_dgram(b"\x00\x09whatever").is_err());
        assert!(parse_dgram(b"\x00").is_err());
    }

    #[test]
    fn test_parse_ack() {
        assert_eq!(
            parse_dgram(b"\x00\x04\x00\x2a").unwrap(),
            Packet::Ack { block_no: 42 }
        );
        assert!(parse_dgram(b"\x00\x04\x00").is_err());
        assert!(parse_dgram(b"\x00\x04\x00\x00\x00").is_err());
    }

    #[test]
    fn test_build_err_with_null_byte_fails() {
        let packet = err_packet(ERR_UNDEF, "bad\0msg");
        assert!(build_dgram(&packet).is_err());
    }

    #[test]
    fn test_error_wire_format() {
        let dgram = build_dgram(&err_packet(ERR_UNKNWN_TID, "Unknown TID")).unwrap();
        assert_eq!(&dgram[..4], b"\x00\x05\x00\x05");
        assert_eq!(dgram.last(), Some(&0));
    }
}
