//! In-room subcommand relay.
//!
//! The three game-command opcodes carry nested game state between members
//! of a room. While a room is bursting they are held back in the room's
//! queue and replayed once the burst completes.

use crate::client::Client;
use crate::lobby::{self, Lobby, LobbyFlags, RoomError};
use crate::packets;
use moor::header::HeaderForm;
use std::sync::Arc;

/// Entry point for one subcommand packet, already normalised to the
/// console header layout. Handles the burst interception before anything
/// is relayed.
pub fn handle_subcommand(client: &Arc<Client>, pkt: &[u8]) -> Result<(), RoomError> {
    let lobby = client.current_lobby().ok_or(RoomError::Internal)?;

    let header = HeaderForm::Dc.parse(&pkt[..moor::header::CLIENT_HEADER_SIZE]);

    {
        let mut state = lobby.lock();

        if state.flags.contains(LobbyFlags::BURSTING) {
            return lobby::enqueue_pkt_locked(&mut state, client, header.opcode, pkt);
        }
    }

    match header.opcode {
        packets::TYPE_GAME_COMMAND0 => handle_bcast(client, &lobby, pkt),
        packets::TYPE_GAME_COMMAND2 | packets::TYPE_GAME_COMMANDD => {
            handle_one(client, &lobby, pkt)
        }
        _ => Err(RoomError::Internal),
    }
}

/// Relays a broadcast subcommand to every other member.
pub fn handle_bcast(client: &Arc<Client>, lobby: &Arc<Lobby>, pkt: &[u8]) -> Result<(), RoomError> {
    let state = lobby.lock();

    lobby::send_pkt_locked(&state, Some(client), pkt, false);
    Ok(())
}

/// Relays a targeted subcommand to the member named in the header's flags
/// byte. A vanished target is not an error; the member may have just left.
pub fn handle_one(client: &Arc<Client>, lobby: &Arc<Lobby>, pkt: &[u8]) -> Result<(), RoomError> {
    let header = HeaderForm::Dc.parse(&pkt[..moor::header::CLIENT_HEADER_SIZE]);
    let target = header.flags as usize;

    let state = lobby.lock();

    if target >= state.clients.len() {
        return Err(RoomError::Internal);
    }

    if let Some(member) = state.clients[target].as_ref() {
        if !Arc::ptr_eq(member, client) {
            let out = packets::convert_header(pkt, HeaderForm::Dc, packets::header_form(member.version));
            drop(member.send(&out));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lobby::{add_to_any, send_pkt_locked};
    use crate::testutil::*;
    use keel::version::ClientVersion;
    use moor::header::CLIENT_HEADER_SIZE;

    fn cmd_bcast(tag: u8) -> Vec<u8> {
        packets::assemble(
            HeaderForm::Dc,
            packets::TYPE_GAME_COMMAND0,
            0,
            &[tag, 0, 0, 0],
        )
    }

    fn cmd_one(target: u8, tag: u8) -> Vec<u8> {
        packets::assemble(
            HeaderForm::Dc,
            packets::TYPE_GAME_COMMAND2,
            u16::from(target),
            &[tag, 0, 0, 0],
        )
    }

    #[test]
    fn test_bcast_skips_sender_and_blacklist() {
        let ship = test_ship();
        let block = test_block(&ship);

        let mut sender = make_client(ClientVersion::GcUs, 100, 10);
        let mut listener = make_client(ClientVersion::GcUs, 101, 10);
        let mut hater = make_client(ClientVersion::GcUs, 102, 10);

        add_to_any(&sender.client, &block).unwrap();
        add_to_any(&listener.client, &block).unwrap();
        add_to_any(&hater.client, &block).unwrap();

        hater.client.state.lock().blacklist[0] = 100;

        sender.drain();
        listener.drain();
        hater.drain();

        handle_subcommand(&sender.client, &cmd_bcast(0x55)).unwrap();

        assert_eq!(listener.drain(), vec![cmd_bcast(0x55)]);
        assert!(hater.drain().is_empty());
        assert!(sender.drain().is_empty());
    }

    #[test]
    fn test_bcast_ignores_ignore_list() {
        let ship = test_ship();
        let block = test_block(&ship);

        let sender = make_client(ClientVersion::GcUs, 100, 10);
        let mut muter = make_client(ClientVersion::GcUs, 101, 10);

        add_to_any(&sender.client, &block).unwrap();
        add_to_any(&muter.client, &block).unwrap();

        muter.client.state.lock().ignore_list[0] = 100;
        muter.drain();

        // Game state is relayed even to members who muted the sender;
        // only chat-style traffic honors the ignore list.
        handle_subcommand(&sender.client, &cmd_bcast(0x56)).unwrap();
        assert_eq!(muter.drain().len(), 1);
    }

    #[test]
    fn test_chat_broadcast_honors_ignore_list() {
        let ship = test_ship();
        let block = test_block(&ship);

        let sender = make_client(ClientVersion::GcUs, 100, 10);
        let mut muter = make_client(ClientVersion::GcUs, 101, 10);

        let lobby = add_to_any(&sender.client, &block).unwrap();
        add_to_any(&muter.client, &block).unwrap();

        muter.client.state.lock().ignore_list[0] = 100;
        muter.drain();

        let chat = packets::assemble(HeaderForm::Dc, packets::TYPE_CHAT, 0, &[0, 0, 0, 0]);

        let state = lobby.lock();
        send_pkt_locked(&state, Some(&sender.client), &chat, true);
        drop(state);

        assert!(muter.drain().is_empty());
    }

    #[test]
    fn test_targeted_subcommand_reaches_one_member() {
        let ship = test_ship();
        let block = test_block(&ship);

        let sender = make_client(ClientVersion::GcUs, 100, 10);
        let mut target = make_client(ClientVersion::GcUs, 101, 10);
        let mut bystander = make_client(ClientVersion::GcUs, 102, 10);

        add_to_any(&sender.client, &block).unwrap();
        add_to_any(&target.client, &block).unwrap();
        add_to_any(&bystander.client, &block).unwrap();

        target.drain();
        bystander.drain();

        let target_slot = target.client.state.lock().client_id as u8;

        handle_subcommand(&sender.client, &cmd_one(target_slot, 0x77)).unwrap();

        assert_eq!(target.drain().len(), 1);
        assert!(bystander.drain().is_empty());
    }

    #[test]
    fn test_header_layout_converted_per_recipient() {
        let ship = test_ship();
        let block = test_block(&ship);

        let sender = make_client(ClientVersion::GcUs, 100, 10);
        let mut handheld = make_client(ClientVersion::Pc, 101, 10);

        add_to_any(&sender.client, &block).unwrap();
        add_to_any(&handheld.client, &block).unwrap();
        handheld.drain();

        handle_subcommand(&sender.client, &cmd_bcast(0x99)).unwrap();

        let delivered = handheld.drain();
        assert_eq!(delivered.len(), 1);

        // The handheld layout leads with the length.
        let header = HeaderForm::Pc.parse(&delivered[0][..CLIENT_HEADER_SIZE]);
        assert_eq!(header.opcode, packets::TYPE_GAME_COMMAND0);
        assert_eq!(&delivered[0][CLIENT_HEADER_SIZE..], &[0x99, 0, 0, 0]);
    }
}
