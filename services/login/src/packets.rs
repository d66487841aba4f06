//! Client-facing packets the login flow needs. Everything is the 4-byte
//! client header followed by little-endian fields; the handheld variant
//! swaps the header layout but not the bodies.

use byteorder::{ByteOrder, LittleEndian};
use keel::version::ClientVersion;
use moor::error::{ErrorType, NetError, NetResult};
use moor::header::{HeaderForm, PacketHeader, CLIENT_HEADER_SIZE};
use std::net::Ipv4Addr;

pub const TYPE_WELCOME: u16 = 0x02;
pub const TYPE_REDIRECT: u16 = 0x19;
pub const TYPE_LOGIN: u16 = 0x93;
pub const TYPE_LOGIN_REPLY: u16 = 0x9A;

const BANNER_LEN: usize = 64;
const CREDENTIAL_LEN: usize = 32;

/// Fixed banner carried in the welcome packet; clients display nothing but
/// some builds require a non-empty field.
pub const WELCOME_BANNER: &[u8] = b"Port map. Login server. All rights reserved.";

/// Login failure codes carried in the reply packet.
pub const LOGIN_OK: u32 = 0;
pub const LOGIN_BAD_CREDENTIALS: u32 = 1;
pub const LOGIN_BANNED: u32 = 2;
pub const LOGIN_NO_SHIPS: u32 = 3;

pub fn header_form(version: ClientVersion) -> HeaderForm {
    if version.uses_pc_header() {
        HeaderForm::Pc
    } else {
        HeaderForm::Dc
    }
}

fn assemble(form: HeaderForm, opcode: u16, flags: u16, body: &[u8]) -> Vec<u8> {
    let len = (CLIENT_HEADER_SIZE + body.len()) as u16;
    let padded = form.padded_len(len);

    let mut pkt = vec![0u8; padded];

    form.write(
        PacketHeader {
            opcode,
            flags,
            len,
        },
        &mut pkt[..CLIENT_HEADER_SIZE],
    );

    pkt[CLIENT_HEADER_SIZE..CLIENT_HEADER_SIZE + body.len()].copy_from_slice(body);
    pkt
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

/// The welcome handshake: both cipher seeds, in the clear.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Welcome {
    pub server_seed: u32,
    pub client_seed: u32,
}

impl Welcome {
    pub fn assemble(&self, form: HeaderForm) -> Vec<u8> {
        let mut body = [0u8; BANNER_LEN + 8];

        body[..WELCOME_BANNER.len()].copy_from_slice(WELCOME_BANNER);
        LittleEndian::write_u32(&mut body[BANNER_LEN..BANNER_LEN + 4], self.server_seed);
        LittleEndian::write_u32(&mut body[BANNER_LEN + 4..], self.client_seed);

        assemble(form, TYPE_WELCOME, 0, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<Welcome> {
        let body = &pkt[CLIENT_HEADER_SIZE..];

        if body.len() < BANNER_LEN + 8 {
            return Err(NetError::Fatal(ErrorType::BadFrame));
        }

        Ok(Welcome {
            server_seed: LittleEndian::read_u32(&body[BANNER_LEN..BANNER_LEN + 4]),
            client_seed: LittleEndian::read_u32(&body[BANNER_LEN + 4..BANNER_LEN + 8]),
        })
    }
}

/// Credentials packet from the client.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Login {
    pub guildcard: u32,
    pub username: String,
    pub password: String,
    pub language: u8,
}

impl Login {
    pub fn assemble(&self, form: HeaderForm) -> Vec<u8> {
        let mut body = vec![0u8; 4 + 2 * CREDENTIAL_LEN + 4];

        LittleEndian::write_u32(&mut body[..4], self.guildcard);
        write_fixed_str(&mut body[4..4 + CREDENTIAL_LEN], &self.username);
        write_fixed_str(
            &mut body[4 + CREDENTIAL_LEN..4 + 2 * CREDENTIAL_LEN],
            &self.password,
        );
        body[4 + 2 * CREDENTIAL_LEN] = self.language;

        assemble(form, TYPE_LOGIN, 0, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<Login> {
        let body = &pkt[CLIENT_HEADER_SIZE..];

        if body.len() < 4 + 2 * CREDENTIAL_LEN + 4 {
            return Err(NetError::Fatal(ErrorType::BadFrame));
        }

        Ok(Login {
            guildcard: LittleEndian::read_u32(&body[..4]),
            username: read_fixed_str(&body[4..4 + CREDENTIAL_LEN]),
            password: read_fixed_str(&body[4 + CREDENTIAL_LEN..4 + 2 * CREDENTIAL_LEN]),
            language: body[4 + 2 * CREDENTIAL_LEN],
        })
    }
}

/// Login verdict. A zero status is followed by a redirect.
pub fn assemble_login_reply(form: HeaderForm, status: u32) -> Vec<u8> {
    let mut body = [0u8; 4];
    LittleEndian::write_u32(&mut body, status);

    assemble(form, TYPE_LOGIN_REPLY, 0, &body)
}

pub fn parse_login_reply(pkt: &[u8]) -> NetResult<u32> {
    let body = &pkt[CLIENT_HEADER_SIZE..];

    if body.len() < 4 {
        return Err(NetError::Fatal(ErrorType::BadFrame));
    }

    Ok(LittleEndian::read_u32(&body[..4]))
}

/// Redirect to a ship: address octets as they appear on the wire, then the
/// port.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Redirect {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Redirect {
    pub fn assemble(&self, form: HeaderForm) -> Vec<u8> {
        let mut body = [0u8; 8];

        body[..4].copy_from_slice(&self.addr.octets());
        LittleEndian::write_u16(&mut body[4..6], self.port);

        assemble(form, TYPE_REDIRECT, 0, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<Redirect> {
        let body = &pkt[CLIENT_HEADER_SIZE..];

        if body.len() < 8 {
            return Err(NetError::Fatal(ErrorType::BadFrame));
        }

        Ok(Redirect {
            addr: Ipv4Addr::new(body[0], body[1], body[2], body[3]),
            port: LittleEndian::read_u16(&body[4..6]),
        })
    }
}
