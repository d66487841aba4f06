//! In-memory backing store. Seeds load from a serde-friendly description,
//! so a small install can run straight off a JSON/TOML file the way the
//! account tooling emits them.

use crate::{AccountRow, Backing, OnlineShipRow, PersistResult, ShipKeyRow};
use chrono::Utc;
use hashbrown::HashMap;
use keel::Guildcard;
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use std::net::Ipv4Addr;

// Mirrors the `bans` schema; only the end date is consulted in-process.
#[allow(dead_code)]
#[derive(Debug, Clone, Eq, PartialEq)]
struct BanRow {
    id: u64,
    enddate: u64,
    setby: u32,
    reason: String,
}

#[derive(Default)]
struct Tables {
    accounts: Vec<AccountRow>,
    guildcards: HashMap<Guildcard, u32>,
    online_ships: HashMap<u16, OnlineShipRow>,
    ship_keys: HashMap<u16, ShipKeyRow>,
    characters: HashMap<(Guildcard, u32), Vec<u8>>,
    bans: HashMap<u64, BanRow>,
    guildcard_bans: Vec<(u64, Guildcard)>,
    ip_bans: Vec<(u64, Ipv4Addr)>,
    next_ban_id: u64,
}

/// The whole store sits behind one mutex; every operation is a handful of
/// map lookups, so contention is not a concern at these scales.
pub struct MemoryBacking {
    tables: Mutex<Tables>,
}

/// Seed data for a [`MemoryBacking`], loadable with serdeconv.
#[derive(Serialize, Deserialize, Default)]
pub struct Seed {
    #[serde(default)]
    pub accounts: Vec<SeedAccount>,
    #[serde(default)]
    pub guildcards: Vec<SeedGuildcard>,
    #[serde(default)]
    pub ship_keys: Vec<SeedShipKey>,
}

#[derive(Serialize, Deserialize)]
pub struct SeedAccount {
    pub account_id: u32,
    pub username: String,
    pub password: String,
    pub regtime: String,
    #[serde(default)]
    pub privlevel: u32,
}

#[derive(Serialize, Deserialize)]
pub struct SeedGuildcard {
    pub guildcard: Guildcard,
    pub account_id: u32,
}

#[derive(Serialize, Deserialize)]
pub struct SeedShipKey {
    pub idx: u16,
    /// Base64 of the 128 bytes of key material, as the key generator
    /// emits it.
    pub rc4key: String,
    #[serde(default)]
    pub main_menu: bool,
}

impl MemoryBacking {
    pub fn new() -> MemoryBacking {
        MemoryBacking {
            tables: Mutex::new(Tables {
                next_ban_id: 1,
                ..Tables::default()
            }),
        }
    }

    pub fn from_seed(seed: Seed) -> MemoryBacking {
        let backing = MemoryBacking::new();

        for account in seed.accounts {
            backing.add_account(AccountRow {
                account_id: account.account_id,
                username: account.username,
                password: account.password,
                regtime: account.regtime,
                privlevel: account.privlevel,
            });
        }

        for gc in seed.guildcards {
            backing.add_guildcard(gc.guildcard, gc.account_id);
        }

        for key in seed.ship_keys {
            let decoded = base64::decode(&key.rc4key).unwrap_or_default();

            let mut rc4key = [0u8; 128];
            let count = decoded.len().min(128);
            rc4key[..count].copy_from_slice(&decoded[..count]);

            backing.add_ship_key(ShipKeyRow {
                idx: key.idx,
                rc4key,
                main_menu: key.main_menu,
            });
        }

        backing
    }

    pub fn add_account(&self, row: AccountRow) {
        self.tables.lock().accounts.push(row);
    }

    pub fn add_guildcard(&self, guildcard: Guildcard, account_id: u32) {
        self.tables.lock().guildcards.insert(guildcard, account_id);
    }

    pub fn add_ship_key(&self, row: ShipKeyRow) {
        self.tables.lock().ship_keys.insert(row.idx, row);
    }
}

impl Backing for MemoryBacking {
    fn account_by_username(&self, username: &str) -> PersistResult<Option<AccountRow>> {
        let tables = self.tables.lock();

        Ok(tables
            .accounts
            .iter()
            .find(|row| row.username == username)
            .cloned())
    }

    fn account_id_for_guildcard(&self, guildcard: Guildcard) -> PersistResult<Option<u32>> {
        Ok(self.tables.lock().guildcards.get(&guildcard).copied())
    }

    fn gm_account(&self, account_id: u32, username: &str) -> PersistResult<Option<AccountRow>> {
        let tables = self.tables.lock();

        Ok(tables
            .accounts
            .iter()
            .find(|row| {
                row.account_id == account_id && row.username == username && row.privlevel > 0
            })
            .cloned())
    }

    fn privlevel_for_guildcard(&self, guildcard: Guildcard) -> PersistResult<Option<u32>> {
        let tables = self.tables.lock();

        let account_id = match tables.guildcards.get(&guildcard) {
            Some(id) => *id,
            None => return Ok(None),
        };

        Ok(tables
            .accounts
            .iter()
            .find(|row| row.account_id == account_id)
            .map(|row| row.privlevel))
    }

    fn guildcard_banned(&self, guildcard: Guildcard, now: u64) -> PersistResult<bool> {
        let tables = self.tables.lock();

        Ok(tables.guildcard_bans.iter().any(|(ban_id, gc)| {
            *gc == guildcard
                && tables
                    .bans
                    .get(ban_id)
                    .map(|ban| ban.enddate == 0 || ban.enddate > now)
                    .unwrap_or(false)
        }))
    }

    fn ip_banned(&self, addr: Ipv4Addr, now: u64) -> PersistResult<bool> {
        let tables = self.tables.lock();

        Ok(tables.ip_bans.iter().any(|(ban_id, banned)| {
            *banned == addr
                && tables
                    .bans
                    .get(ban_id)
                    .map(|ban| ban.enddate == 0 || ban.enddate > now)
                    .unwrap_or(false)
        }))
    }

    fn insert_ban(&self, enddate: u64, setby: u32, reason: &str) -> PersistResult<u64> {
        let mut tables = self.tables.lock();

        let id = tables.next_ban_id;
        tables.next_ban_id += 1;

        tables.bans.insert(
            id,
            BanRow {
                id,
                enddate,
                setby,
                reason: reason.to_string(),
            },
        );

        Ok(id)
    }

    fn insert_guildcard_ban(&self, ban_id: u64, guildcard: Guildcard) -> PersistResult<()> {
        self.tables.lock().guildcard_bans.push((ban_id, guildcard));
        Ok(())
    }

    fn insert_ip_ban(&self, ban_id: u64, addr: Ipv4Addr) -> PersistResult<()> {
        self.tables.lock().ip_bans.push((ban_id, addr));
        Ok(())
    }

    fn insert_online_ship(&self, row: &OnlineShipRow) -> PersistResult<()> {
        self.tables
            .lock()
            .online_ships
            .insert(row.ship_id, row.clone());
        Ok(())
    }

    fn remove_online_ship(&self, ship_id: u16) -> PersistResult<()> {
        self.tables.lock().online_ships.remove(&ship_id);
        Ok(())
    }

    fn update_ship_counts(&self, ship_id: u16, players: u16, games: u16) -> PersistResult<()> {
        let mut tables = self.tables.lock();

        if let Some(row) = tables.online_ships.get_mut(&ship_id) {
            row.players = players;
            row.games = games;
        }

        Ok(())
    }

    fn online_ships(&self) -> PersistResult<Vec<OnlineShipRow>> {
        let tables = self.tables.lock();

        let mut ships: Vec<_> = tables.online_ships.values().cloned().collect();
        ships.sort_by_key(|row| row.ship_id);

        Ok(ships)
    }

    fn ship_key(&self, idx: u16) -> PersistResult<Option<ShipKeyRow>> {
        Ok(self.tables.lock().ship_keys.get(&idx).cloned())
    }

    fn store_character(&self, guildcard: Guildcard, slot: u32, data: &[u8]) -> PersistResult<()> {
        let mut tables = self.tables.lock();

        // Delete-then-insert semantics; the map replace models it exactly.
        tables.characters.insert((guildcard, slot), data.to_vec());
        Ok(())
    }

    fn fetch_character(&self, guildcard: Guildcard, slot: u32) -> PersistResult<Option<Vec<u8>>> {
        Ok(self
            .tables
            .lock()
            .characters
            .get(&(guildcard, slot))
            .cloned())
    }
}

/// Timestamp helper for ban bookkeeping from operator tooling.
pub fn now_secs() -> u64 {
    Utc::now().timestamp() as u64
}
