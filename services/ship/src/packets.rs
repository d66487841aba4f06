//! Client-facing packets the block and room machinery needs. Bodies are
//! little-endian; the header form tracks the client variant.

use byteorder::{ByteOrder, LittleEndian};
use keel::version::ClientVersion;
use keel::Guildcard;
use moor::error::{ErrorType, NetError, NetResult};
use moor::header::{HeaderForm, PacketHeader, CLIENT_HEADER_SIZE};
use std::net::Ipv4Addr;

pub const TYPE_TEXT_MSG: u16 = 0x01;
pub const TYPE_WELCOME: u16 = 0x02;
pub const TYPE_CHAT: u16 = 0x06;
pub const TYPE_INFO_REQ: u16 = 0x09;
pub const TYPE_MENU_SELECT: u16 = 0x10;
pub const TYPE_INFO_REPLY: u16 = 0x11;
pub const TYPE_REDIRECT: u16 = 0x19;
pub const TYPE_GUILD_SEARCH: u16 = 0x40;
pub const TYPE_GUILD_REPLY: u16 = 0x41;
pub const TYPE_GAME_COMMAND0: u16 = 0x60;
pub const TYPE_CHAR_DATA: u16 = 0x61;
pub const TYPE_GAME_COMMAND2: u16 = 0x62;
pub const TYPE_GAME_JOIN: u16 = 0x64;
pub const TYPE_LOBBY_JOIN: u16 = 0x67;
pub const TYPE_LOBBY_ADD_PLAYER: u16 = 0x68;
pub const TYPE_LOBBY_LEAVE: u16 = 0x69;
pub const TYPE_GAME_COMMANDD: u16 = 0x6D;
pub const TYPE_DONE_BURST: u16 = 0x6F;
pub const TYPE_SIMPLE_MAIL: u16 = 0x81;
pub const TYPE_LOBBY_CHANGE: u16 = 0x84;
pub const TYPE_BLOCK_LOGIN: u16 = 0x93;
pub const TYPE_GAME_CREATE: u16 = 0xC1;
pub const TYPE_BLACKLIST: u16 = 0xC6;
pub const TYPE_AUTOREPLY_SET: u16 = 0xC7;
pub const TYPE_AUTOREPLY_CLEAR: u16 = 0xC8;

const BANNER_LEN: usize = 64;
const NAME_LEN: usize = 16;

pub const WELCOME_BANNER: &[u8] = b"Port map. Block server. All rights reserved.";

pub fn header_form(version: ClientVersion) -> HeaderForm {
    if version.uses_pc_header() {
        HeaderForm::Pc
    } else {
        HeaderForm::Dc
    }
}

pub fn assemble(form: HeaderForm, opcode: u16, flags: u16, body: &[u8]) -> Vec<u8> {
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

fn body(pkt: &[u8]) -> NetResult<&[u8]> {
    if pkt.len() < CLIENT_HEADER_SIZE {
        return Err(NetError::Fatal(ErrorType::BadFrame));
    }

    Ok(&pkt[CLIENT_HEADER_SIZE..])
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

/// Rewrites a packet's header from one layout to the other, leaving the
/// body alone. Rooms hold packets in the console layout and convert per
/// recipient on the way out.
pub fn convert_header(pkt: &[u8], from: HeaderForm, to: HeaderForm) -> Vec<u8> {
    if from == to {
        return pkt.to_vec();
    }

    let header = from.parse(&pkt[..CLIENT_HEADER_SIZE]);

    let mut out = pkt.to_vec();
    to.write(header, &mut out[..CLIENT_HEADER_SIZE]);
    out
}

pub fn assemble_welcome(form: HeaderForm, server_seed: u32, client_seed: u32) -> Vec<u8> {
    let mut body = [0u8; BANNER_LEN + 8];

    body[..WELCOME_BANNER.len()].copy_from_slice(WELCOME_BANNER);
    LittleEndian::write_u32(&mut body[BANNER_LEN..BANNER_LEN + 4], server_seed);
    LittleEndian::write_u32(&mut body[BANNER_LEN + 4..], client_seed);

    assemble(form, TYPE_WELCOME, 0, &body)
}

/// Server notice shown in the chat window.
pub fn assemble_text(form: HeaderForm, msg: &str) -> Vec<u8> {
    let mut text = msg.as_bytes().to_vec();
    text.push(0);

    assemble(form, TYPE_TEXT_MSG, 0, &text)
}

/// Answer to an info request, shown in the info window.
pub fn assemble_info_reply(form: HeaderForm, msg: &str) -> Vec<u8> {
    let mut text = msg.as_bytes().to_vec();
    text.push(0);

    assemble(form, TYPE_INFO_REPLY, 0, &text)
}

pub fn assemble_redirect(form: HeaderForm, addr: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut body = [0u8; 8];

    body[..4].copy_from_slice(&addr.octets());
    LittleEndian::write_u16(&mut body[4..6], port);

    assemble(form, TYPE_REDIRECT, 0, &body)
}

/// Tells a client it has entered a lobby.
pub fn assemble_lobby_join(form: HeaderForm, lobby_id: u32, client_id: u8, leader_id: u8) -> Vec<u8> {
    let mut body = [0u8; 8];

    LittleEndian::write_u32(&mut body[..4], lobby_id);
    body[4] = client_id;
    body[5] = leader_id;

    assemble(form, TYPE_LOBBY_JOIN, 0, &body)
}

/// Announces a new member to a room.
pub fn assemble_lobby_add_player(
    form: HeaderForm,
    lobby_id: u32,
    client_id: u8,
    guildcard: Guildcard,
    level: u32,
    name: &str,
) -> Vec<u8> {
    let mut body = [0u8; 16 + NAME_LEN];

    LittleEndian::write_u32(&mut body[..4], lobby_id);
    body[4] = client_id;
    LittleEndian::write_u32(&mut body[8..12], guildcard);
    LittleEndian::write_u32(&mut body[12..16], level);
    write_fixed_str(&mut body[16..], name);

    assemble(form, TYPE_LOBBY_ADD_PLAYER, 0, &body)
}

/// Announces a departure, along with the (possibly new) leader.
pub fn assemble_lobby_leave(form: HeaderForm, client_id: u8, leader_id: u8) -> Vec<u8> {
    let body = [client_id, leader_id, 0, 0];

    assemble(form, TYPE_LOBBY_LEAVE, 0, &body)
}

/// Everything a client needs to spin up a game it just entered.
pub struct GameJoin {
    pub lobby_id: u32,
    pub client_id: u8,
    pub leader_id: u8,
    pub difficulty: u8,
    pub battle: bool,
    pub challenge: bool,
    pub episode: u8,
    pub section: u8,
    pub event: u8,
    pub rand_seed: u32,
    pub maps: [u32; 32],
}

impl GameJoin {
    pub fn assemble(&self, form: HeaderForm) -> Vec<u8> {
        let mut body = [0u8; 16 + 128];

        LittleEndian::write_u32(&mut body[..4], self.lobby_id);
        body[4] = self.client_id;
        body[5] = self.leader_id;
        body[6] = self.difficulty;
        body[7] = self.battle as u8;
        body[8] = self.challenge as u8;
        body[9] = self.episode;
        body[10] = self.section;
        body[11] = self.event;
        LittleEndian::write_u32(&mut body[12..16], self.rand_seed);

        for (i, map) in self.maps.iter().enumerate() {
            LittleEndian::write_u32(&mut body[16 + i * 4..20 + i * 4], *map);
        }

        assemble(form, TYPE_GAME_JOIN, 0, &body)
    }
}

/// Block login sent by a client arriving on a block.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BlockLogin {
    pub guildcard: Guildcard,
    pub language: u8,
    pub char_name: String,
}

impl BlockLogin {
    pub fn assemble(&self, form: HeaderForm) -> Vec<u8> {
        let mut body = [0u8; 8 + NAME_LEN];

        LittleEndian::write_u32(&mut body[..4], self.guildcard);
        body[4] = self.language;
        write_fixed_str(&mut body[8..], &self.char_name);

        assemble(form, TYPE_BLOCK_LOGIN, 0, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<BlockLogin> {
        let body = body(pkt)?;

        if body.len() < 8 + NAME_LEN {
            return Err(NetError::Fatal(ErrorType::BadFrame));
        }

        Ok(BlockLogin {
            guildcard: LittleEndian::read_u32(&body[..4]),
            language: body[4],
            char_name: read_fixed_str(&body[8..8 + NAME_LEN]),
        })
    }
}

/// Menu selection on the ship menu: the block the client wants.
pub fn assemble_menu_select(form: HeaderForm, item: u32) -> Vec<u8> {
    let mut body = [0u8; 4];
    LittleEndian::write_u32(&mut body, item);

    assemble(form, TYPE_MENU_SELECT, 0, &body)
}

pub fn parse_menu_select(pkt: &[u8]) -> NetResult<u32> {
    let body = body(pkt)?;

    if body.len() < 4 {
        return Err(NetError::Fatal(ErrorType::BadFrame));
    }

    Ok(LittleEndian::read_u32(&body[..4]))
}

/// Room-change request: the id of the room the client wants.
pub fn assemble_lobby_change(form: HeaderForm, lobby_id: u32) -> Vec<u8> {
    let mut body = [0u8; 4];
    LittleEndian::write_u32(&mut body, lobby_id);

    assemble(form, TYPE_LOBBY_CHANGE, 0, &body)
}

pub fn parse_lobby_change(pkt: &[u8]) -> NetResult<u32> {
    let body = body(pkt)?;

    if body.len() < 4 {
        return Err(NetError::Fatal(ErrorType::BadFrame));
    }

    Ok(LittleEndian::read_u32(&body[..4]))
}

/// Game creation request.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GameCreate {
    pub name: String,
    pub passwd: String,
    pub difficulty: u8,
    pub battle: bool,
    pub challenge: bool,
    pub episode: u8,
}

impl GameCreate {
    pub fn assemble(&self, form: HeaderForm) -> Vec<u8> {
        let mut body = [0u8; 2 * NAME_LEN + 4];

        write_fixed_str(&mut body[..NAME_LEN], &self.name);
        write_fixed_str(&mut body[NAME_LEN..2 * NAME_LEN], &self.passwd);
        body[2 * NAME_LEN] = self.difficulty;
        body[2 * NAME_LEN + 1] = self.battle as u8;
        body[2 * NAME_LEN + 2] = self.challenge as u8;
        body[2 * NAME_LEN + 3] = self.episode;

        assemble(form, TYPE_GAME_CREATE, 0, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<GameCreate> {
        let body = body(pkt)?;

        if body.len() < 2 * NAME_LEN + 4 {
            return Err(NetError::Fatal(ErrorType::BadFrame));
        }

        Ok(GameCreate {
            name: read_fixed_str(&body[..NAME_LEN]),
            passwd: read_fixed_str(&body[NAME_LEN..2 * NAME_LEN]),
            difficulty: body[2 * NAME_LEN],
            battle: body[2 * NAME_LEN + 1] != 0,
            challenge: body[2 * NAME_LEN + 2] != 0,
            episode: body[2 * NAME_LEN + 3],
        })
    }
}

/// Guild search: who is asking, who they are looking for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GuildSearch {
    pub searcher: Guildcard,
    pub target: Guildcard,
}

impl GuildSearch {
    pub fn assemble(&self, form: HeaderForm) -> Vec<u8> {
        let mut body = [0u8; 8];

        LittleEndian::write_u32(&mut body[..4], self.searcher);
        LittleEndian::write_u32(&mut body[4..8], self.target);

        assemble(form, TYPE_GUILD_SEARCH, 0, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<GuildSearch> {
        let body = body(pkt)?;

        if body.len() < 8 {
            return Err(NetError::Fatal(ErrorType::BadFrame));
        }

        Ok(GuildSearch {
            searcher: LittleEndian::read_u32(&body[..4]),
            target: LittleEndian::read_u32(&body[4..8]),
        })
    }
}

/// Where a found player is, sent back to the searcher.
pub fn assemble_guild_reply(
    form: HeaderForm,
    searcher: Guildcard,
    target: Guildcard,
    location: &str,
) -> Vec<u8> {
    let mut body = vec![0u8; 8 + 44];

    LittleEndian::write_u32(&mut body[..4], searcher);
    LittleEndian::write_u32(&mut body[4..8], target);
    write_fixed_str(&mut body[8..], location);

    assemble(form, TYPE_GUILD_REPLY, 0, &body)
}

/// Simple mail travels verbatim; only the addressee matters for routing.
pub fn mail_target(pkt: &[u8]) -> NetResult<Guildcard> {
    let body = body(pkt)?;

    if body.len() < 8 {
        return Err(NetError::Fatal(ErrorType::BadFrame));
    }

    Ok(LittleEndian::read_u32(&body[4..8]))
}

pub fn mail_sender(pkt: &[u8]) -> NetResult<Guildcard> {
    let body = body(pkt)?;

    if body.len() < 8 {
        return Err(NetError::Fatal(ErrorType::BadFrame));
    }

    Ok(LittleEndian::read_u32(&body[..4]))
}

/// Character record upload, sent on block login and after saves.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CharData {
    pub name: String,
    pub level: u32,
    pub ch_class: u8,
    pub c_rank_times: [u32; 9],
    pub items: Vec<[u32; 4]>,
}

impl CharData {
    pub fn assemble(&self, form: HeaderForm) -> Vec<u8> {
        let mut body = vec![0u8; NAME_LEN + 8 + 36 + 4 + self.items.len() * 16];

        write_fixed_str(&mut body[..NAME_LEN], &self.name);
        LittleEndian::write_u32(&mut body[NAME_LEN..NAME_LEN + 4], self.level);
        body[NAME_LEN + 4] = self.ch_class;

        for (i, time) in self.c_rank_times.iter().enumerate() {
            LittleEndian::write_u32(&mut body[NAME_LEN + 8 + i * 4..NAME_LEN + 12 + i * 4], *time);
        }

        let items_at = NAME_LEN + 8 + 36;
        LittleEndian::write_u32(&mut body[items_at..items_at + 4], self.items.len() as u32);

        for (i, item) in self.items.iter().enumerate() {
            for (j, word) in item.iter().enumerate() {
                let at = items_at + 4 + i * 16 + j * 4;
                LittleEndian::write_u32(&mut body[at..at + 4], *word);
            }
        }

        assemble(form, TYPE_CHAR_DATA, 0, &body)
    }

    pub fn parse(pkt: &[u8]) -> NetResult<CharData> {
        let body = body(pkt)?;

        if body.len() < NAME_LEN + 8 + 36 + 4 {
            return Err(NetError::Fatal(ErrorType::BadFrame));
        }

        let name = read_fixed_str(&body[..NAME_LEN]);
        let level = LittleEndian::read_u32(&body[NAME_LEN..NAME_LEN + 4]);
        let ch_class = body[NAME_LEN + 4];

        let mut c_rank_times = [0u32; 9];
        for (i, time) in c_rank_times.iter_mut().enumerate() {
            *time = LittleEndian::read_u32(&body[NAME_LEN + 8 + i * 4..NAME_LEN + 12 + i * 4]);
        }

        let items_at = NAME_LEN + 8 + 36;
        let item_count = LittleEndian::read_u32(&body[items_at..items_at + 4]) as usize;

        if body.len() < items_at + 4 + item_count * 16 {
            return Err(NetError::Fatal(ErrorType::BadFrame));
        }

        let mut items = Vec::with_capacity(item_count);

        for i in 0..item_count {
            let mut item = [0u32; 4];

            for (j, word) in item.iter_mut().enumerate() {
                let at = items_at + 4 + i * 16 + j * 4;
                *word = LittleEndian::read_u32(&body[at..at + 4]);
            }

            items.push(item);
        }

        Ok(CharData {
            name,
            level,
            ch_class,
            c_rank_times,
            items,
        })
    }
}

/// Blacklist upload: a fixed array of guildcards, zero-filled.
pub fn parse_blacklist(pkt: &[u8]) -> NetResult<[Guildcard; crate::client::BLACKLIST_SIZE]> {
    let body = body(pkt)?;

    if body.len() < 4 * crate::client::BLACKLIST_SIZE {
        return Err(NetError::Fatal(ErrorType::BadFrame));
    }

    let mut list = [0u32; crate::client::BLACKLIST_SIZE];

    for (i, entry) in list.iter_mut().enumerate() {
        *entry = LittleEndian::read_u32(&body[i * 4..i * 4 + 4]);
    }

    Ok(list)
}
