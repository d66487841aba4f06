//! Hub link wire model, shared by the ship daemon (as a client of the hub)
//! and the hub daemon itself.
//!
//! Everything on this link is framed with the 8-byte big-endian gate header
//! and, once the session keys are installed, enciphered with RC4. The login
//! exchange travels in the clear; the nonces it carries feed the key
//! derivation.

use crate::error::{ErrorType, NetError, NetResult};
use crate::header::{HeaderForm, PacketHeader, GATE_HEADER_SIZE};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use std::net::Ipv4Addr;

/// Supported hub protocol revisions.
pub const PROTO_VER_MINIMUM: u32 = 1;
pub const PROTO_VER_MAXIMUM: u32 = 2;
pub const PROTO_VER_CURRENT: u32 = 2;

pub const TYPE_LOGIN: u16 = 0x0010;
pub const TYPE_COUNT: u16 = 0x0011;
pub const TYPE_DC: u16 = 0x0012;
pub const TYPE_PC: u16 = 0x0013;
pub const TYPE_PING: u16 = 0x0014;
pub const TYPE_CDATA: u16 = 0x0015;
pub const TYPE_CREQ: u16 = 0x0016;
pub const TYPE_GMLOGIN: u16 = 0x0017;
pub const TYPE_GCBAN: u16 = 0x0018;
pub const TYPE_IPBAN: u16 = 0x0019;
pub const TYPE_STATUS: u16 = 0x001A;

pub const FLAG_RESPONSE: u16 = 0x8000;
pub const FLAG_FAILURE: u16 = 0x4000;

pub const ERR_NO_ERROR: u32 = 0;
pub const ERR_BAD_ERROR: u32 = 1;
pub const ERR_LOGIN_BAD_PROTO: u32 = 2;
pub const ERR_LOGIN_BAD_KEY: u32 = 3;
pub const ERR_LOGIN_BAD_MENU: u32 = 4;
pub const ERR_LOGIN_INVAL_MENU: u32 = 5;
pub const ERR_GMLOGIN_NO_ACC: u32 = 6;
pub const ERR_GMLOGIN_NOT_GM: u32 = 7;
pub const ERR_BAN_NOT_GM: u32 = 8;
pub const ERR_BAN_BAD_TYPE: u32 = 9;
pub const ERR_CREQ_NO_DATA: u32 = 10;
pub const ERR_GAME_UNK_PACKET: u32 = 11;

pub const SHIP_FLAG_GMONLY: u32 = 0x0000_0001;
pub const SHIP_FLAG_PROXY: u32 = 0x0000_0002;

/// Inner game-packet opcodes the hub inspects inside forward envelopes.
pub const SHIP_GUILD_SEARCH_TYPE: u8 = 0x40;
pub const SHIP_DC_GUILD_REPLY_TYPE: u8 = 0x41;
pub const SHIP_SIMPLE_MAIL_TYPE: u8 = 0x81;

/// Character backups are fixed-size blobs.
pub const CHAR_DATA_SIZE: usize = 1052;

pub const SHIP_NAME_LEN: usize = 32;
const CREDENTIAL_LEN: usize = 32;

/// Assembles a complete gate packet: header, payload, zero padding up to
/// the 8-byte alignment. The header length field carries the unpadded size.
pub fn assemble(opcode: u16, flags: u16, payload: &[u8]) -> Vec<u8> {
    let len = (GATE_HEADER_SIZE + payload.len()) as u16;
    let padded = HeaderForm::Gate.padded_len(len);

    let mut pkt = vec![0u8; padded];

    HeaderForm::Gate.write(
        PacketHeader {
            opcode,
            flags,
            len,
        },
        &mut pkt[..GATE_HEADER_SIZE],
    );

    pkt[GATE_HEADER_SIZE..GATE_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    pkt
}

fn payload(pkt: &[u8]) -> NetResult<&[u8]> {
    if pkt.len() < GATE_HEADER_SIZE {
        return Err(NetError::Fatal(ErrorType::BadFrame));
    }

    Ok(&pkt[GATE_HEADER_SIZE..])
}

fn read_fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn write_fixed_str(target: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let count = bytes.len().min(target.len() - 1);
    target[..count].copy_from_slice(&bytes[..count]);

    for byte in target[count..].iter_mut() {
        *byte = 0;
    }
}

/// A menu code is zero (main menu) or two ASCII letters.
pub fn menu_code_valid(code: u16) -> bool {
    if code == 0 {
        return true;
    }

    let low = (code & 0xFF) as u8;
    let high = (code >> 8) as u8;

    low.is_ascii_alphabetic() && high.is_ascii_alphabetic()
}

/// Hub welcome: the first packet on a fresh ship connection, carrying the
/// two key-mixing nonces in the clear.
#[derive(Debug, Eq, PartialEq)]
pub struct Welcome {
    pub gate_nonce: [u8; 4],
    pub ship_nonce: [u8; 4],
}

impl Welcome {
    pub fn assemble(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(8);
        body.extend_from_slice(&self.gate_nonce);
        body.extend_from_slice(&self.ship_nonce);

        assemble(TYPE_LOGIN, 0, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<Welcome> {
        let mut stream = Cursor::new(payload(pkt)?);

        let mut welcome = Welcome {
            gate_nonce: [0; 4],
            ship_nonce: [0; 4],
        };

        stream.read_exact(&mut welcome.gate_nonce)?;
        stream.read_exact(&mut welcome.ship_nonce)?;

        Ok(welcome)
    }
}

/// Ship login, sent in the clear in response to the welcome.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ShipLogin {
    pub proto_ver: u32,
    pub key_idx: u16,
    pub menu_code: u16,
    pub flags: u32,
    pub external: Ipv4Addr,
    pub internal: Ipv4Addr,
    pub port: u16,
    pub clients: u16,
    pub games: u16,
    pub name: String,
}

impl ShipLogin {
    pub fn assemble(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(56);

        body.write_u32::<BigEndian>(self.proto_ver).unwrap();
        body.write_u16::<BigEndian>(self.key_idx).unwrap();
        body.write_u16::<BigEndian>(self.menu_code).unwrap();
        body.write_u32::<BigEndian>(self.flags).unwrap();
        body.write_u32::<BigEndian>(u32::from(self.external)).unwrap();
        body.write_u32::<BigEndian>(u32::from(self.internal)).unwrap();
        body.write_u16::<BigEndian>(self.port).unwrap();
        body.write_u16::<BigEndian>(self.clients).unwrap();
        body.write_u16::<BigEndian>(self.games).unwrap();
        body.write_u16::<BigEndian>(0).unwrap();

        let mut name = [0u8; SHIP_NAME_LEN];
        write_fixed_str(&mut name, &self.name);
        body.extend_from_slice(&name);

        assemble(TYPE_LOGIN, FLAG_RESPONSE, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<ShipLogin> {
        let body = payload(pkt)?;
        let mut stream = Cursor::new(body);

        let proto_ver = stream.read_u32::<BigEndian>()?;
        let key_idx = stream.read_u16::<BigEndian>()?;
        let menu_code = stream.read_u16::<BigEndian>()?;
        let flags = stream.read_u32::<BigEndian>()?;
        let external = Ipv4Addr::from(stream.read_u32::<BigEndian>()?);
        let internal = Ipv4Addr::from(stream.read_u32::<BigEndian>()?);
        let port = stream.read_u16::<BigEndian>()?;
        let clients = stream.read_u16::<BigEndian>()?;
        let games = stream.read_u16::<BigEndian>()?;
        let _reserved = stream.read_u16::<BigEndian>()?;

        let mut name = [0u8; SHIP_NAME_LEN];
        stream.read_exact(&mut name)?;

        Ok(ShipLogin {
            proto_ver,
            key_idx,
            menu_code,
            flags,
            external,
            internal,
            port,
            clients,
            games,
            name: read_fixed_str(&name),
        })
    }
}

/// Counter update, ship to hub.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Counts {
    pub ship_id: u16,
    pub clients: u16,
    pub games: u16,
}

impl Counts {
    pub fn assemble(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(6);

        body.write_u16::<BigEndian>(self.ship_id).unwrap();
        body.write_u16::<BigEndian>(self.clients).unwrap();
        body.write_u16::<BigEndian>(self.games).unwrap();

        assemble(TYPE_COUNT, 0, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<Counts> {
        let mut stream = Cursor::new(payload(pkt)?);

        Ok(Counts {
            ship_id: stream.read_u16::<BigEndian>()?,
            clients: stream.read_u16::<BigEndian>()?,
            games: stream.read_u16::<BigEndian>()?,
        })
    }
}

/// Fleet status broadcast: one ship appearing or disappearing.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ShipStatus {
    pub ship_id: u16,
    pub online: bool,
    pub external: Ipv4Addr,
    pub internal: Ipv4Addr,
    pub port: u16,
    pub flags: u32,
    pub menu_code: u16,
    pub name: String,
}

impl ShipStatus {
    pub fn assemble(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(52);

        body.write_u16::<BigEndian>(self.ship_id).unwrap();
        body.write_u8(self.online as u8).unwrap();
        body.write_u8(0).unwrap();
        body.write_u32::<BigEndian>(u32::from(self.external)).unwrap();
        body.write_u32::<BigEndian>(u32::from(self.internal)).unwrap();
        body.write_u16::<BigEndian>(self.port).unwrap();
        body.write_u16::<BigEndian>(self.menu_code).unwrap();
        body.write_u32::<BigEndian>(self.flags).unwrap();

        let mut name = [0u8; SHIP_NAME_LEN];
        write_fixed_str(&mut name, &self.name);
        body.extend_from_slice(&name);

        assemble(TYPE_STATUS, 0, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<ShipStatus> {
        let mut stream = Cursor::new(payload(pkt)?);

        let ship_id = stream.read_u16::<BigEndian>()?;
        let online = stream.read_u8()? != 0;
        let _pad = stream.read_u8()?;
        let external = Ipv4Addr::from(stream.read_u32::<BigEndian>()?);
        let internal = Ipv4Addr::from(stream.read_u32::<BigEndian>()?);
        let port = stream.read_u16::<BigEndian>()?;
        let menu_code = stream.read_u16::<BigEndian>()?;
        let flags = stream.read_u32::<BigEndian>()?;

        let mut name = [0u8; SHIP_NAME_LEN];
        stream.read_exact(&mut name)?;

        Ok(ShipStatus {
            ship_id,
            online,
            external,
            internal,
            port,
            flags,
            menu_code,
            name: read_fixed_str(&name),
        })
    }
}

/// Forward envelope: an inner game packet plus the id of the ship it
/// relates to (origin on the way in, target for guild replies).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Forward {
    pub ship_id: u32,
    pub inner: Vec<u8>,
}

impl Forward {
    /// The inner packet's opcode, which drives the fan-out policy.
    pub fn inner_opcode(&self) -> Option<u8> {
        self.inner.first().copied()
    }

    pub fn assemble(&self, envelope: u16) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 + self.inner.len());

        body.write_u32::<BigEndian>(self.ship_id).unwrap();
        body.extend_from_slice(&self.inner);

        assemble(envelope, 0, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<Forward> {
        let body = payload(pkt)?;
        let mut stream = Cursor::new(body);

        let ship_id = stream.read_u32::<BigEndian>()?;

        Ok(Forward {
            ship_id,
            inner: body[4..].to_vec(),
        })
    }
}

/// Character backup store.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CharData {
    pub guildcard: u32,
    pub slot: u32,
    pub data: Vec<u8>,
}

impl CharData {
    pub fn assemble(&self, flags: u16) -> Vec<u8> {
        debug_assert_eq!(self.data.len(), CHAR_DATA_SIZE);

        let mut body = Vec::with_capacity(8 + CHAR_DATA_SIZE);

        body.write_u32::<BigEndian>(self.guildcard).unwrap();
        body.write_u32::<BigEndian>(self.slot).unwrap();
        body.extend_from_slice(&self.data);

        assemble(TYPE_CDATA, flags, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<CharData> {
        let body = payload(pkt)?;

        if body.len() < 8 + CHAR_DATA_SIZE {
            return Err(NetError::Fatal(ErrorType::BadFrame));
        }

        let mut stream = Cursor::new(body);

        Ok(CharData {
            guildcard: stream.read_u32::<BigEndian>()?,
            slot: stream.read_u32::<BigEndian>()?,
            data: body[8..8 + CHAR_DATA_SIZE].to_vec(),
        })
    }
}

/// Character backup fetch.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CharReq {
    pub guildcard: u32,
    pub slot: u32,
}

impl CharReq {
    pub fn assemble(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(8);

        body.write_u32::<BigEndian>(self.guildcard).unwrap();
        body.write_u32::<BigEndian>(self.slot).unwrap();

        assemble(TYPE_CREQ, 0, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<CharReq> {
        let mut stream = Cursor::new(payload(pkt)?);

        Ok(CharReq {
            guildcard: stream.read_u32::<BigEndian>()?,
            slot: stream.read_u32::<BigEndian>()?,
        })
    }
}

/// GM authentication request, ship to hub.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GmLogin {
    pub guildcard: u32,
    pub block: u32,
    pub username: String,
    pub password: String,
}

impl GmLogin {
    pub fn assemble(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(8 + 2 * CREDENTIAL_LEN);

        body.write_u32::<BigEndian>(self.guildcard).unwrap();
        body.write_u32::<BigEndian>(self.block).unwrap();

        let mut username = [0u8; CREDENTIAL_LEN];
        write_fixed_str(&mut username, &self.username);
        body.extend_from_slice(&username);

        let mut password = [0u8; CREDENTIAL_LEN];
        write_fixed_str(&mut password, &self.password);
        body.extend_from_slice(&password);

        assemble(TYPE_GMLOGIN, 0, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<GmLogin> {
        let mut stream = Cursor::new(payload(pkt)?);

        let guildcard = stream.read_u32::<BigEndian>()?;
        let block = stream.read_u32::<BigEndian>()?;

        let mut username = [0u8; CREDENTIAL_LEN];
        stream.read_exact(&mut username)?;

        let mut password = [0u8; CREDENTIAL_LEN];
        stream.read_exact(&mut password)?;

        Ok(GmLogin {
            guildcard,
            block,
            username: read_fixed_str(&username),
            password: read_fixed_str(&password),
        })
    }
}

/// GM authentication verdict, hub to ship.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GmReply {
    pub guildcard: u32,
    pub block: u32,
    pub allowed: bool,
    pub privilege: u8,
}

impl GmReply {
    pub fn assemble(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(10);

        body.write_u32::<BigEndian>(self.guildcard).unwrap();
        body.write_u32::<BigEndian>(self.block).unwrap();
        body.write_u8(self.allowed as u8).unwrap();
        body.write_u8(self.privilege).unwrap();

        assemble(TYPE_GMLOGIN, FLAG_RESPONSE, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<GmReply> {
        let mut stream = Cursor::new(payload(pkt)?);

        Ok(GmReply {
            guildcard: stream.read_u32::<BigEndian>()?,
            block: stream.read_u32::<BigEndian>()?,
            allowed: stream.read_u8()? != 0,
            privilege: stream.read_u8()?,
        })
    }
}

/// Ban issuance request. The envelope type picks the target table:
/// `TYPE_GCBAN` bans a guildcard, `TYPE_IPBAN` an IPv4 address.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BanReq {
    pub req_gc: u32,
    pub target: u32,
    pub until: u32,
    pub reason: String,
}

impl BanReq {
    pub fn assemble(&self, ban_type: u16) -> Vec<u8> {
        let mut body = Vec::with_capacity(12 + self.reason.len());

        body.write_u32::<BigEndian>(self.req_gc).unwrap();
        body.write_u32::<BigEndian>(self.target).unwrap();
        body.write_u32::<BigEndian>(self.until).unwrap();
        body.write_all(self.reason.as_bytes()).unwrap();

        assemble(ban_type, 0, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<BanReq> {
        let body = payload(pkt)?;

        if body.len() < 12 {
            return Err(NetError::Fatal(ErrorType::BadFrame));
        }

        let mut stream = Cursor::new(body);

        let req_gc = stream.read_u32::<BigEndian>()?;
        let target = stream.read_u32::<BigEndian>()?;
        let until = stream.read_u32::<BigEndian>()?;

        Ok(BanReq {
            req_gc,
            target,
            until,
            reason: read_fixed_str(&body[12..]),
        })
    }
}

/// Typed error/acknowledgement reply. An `ERR_NO_ERROR` code with the
/// response flag doubles as a success acknowledgement.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorReply {
    pub code: u32,
    pub data: Vec<u8>,
}

impl ErrorReply {
    pub fn assemble(&self, reply_to: u16, flags: u16) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 + self.data.len());

        body.write_u32::<BigEndian>(self.code).unwrap();
        body.extend_from_slice(&self.data);

        assemble(reply_to, flags, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<ErrorReply> {
        let body = payload(pkt)?;
        let mut stream = Cursor::new(body);

        let code = stream.read_u32::<BigEndian>()?;

        Ok(ErrorReply {
            code,
            data: body[4..].to_vec(),
        })
    }
}

/// Ping packet; the response flag separates request from reply.
pub fn assemble_ping(response: bool) -> Vec<u8> {
    assemble(TYPE_PING, if response { FLAG_RESPONSE } else { 0 }, &[])
}
