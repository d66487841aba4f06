use crate::buffer::Buffer;
use crate::error::{ErrorType, NetError, NetResult};
use crate::header::{HeaderForm, PacketHeader};
use keel::crypto::Cipher;
use mio;
use mio::net::TcpStream;
use std::fs::File;
use std::io::Write;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// The two directions of an established stream cipher. `recv` deciphers
/// traffic arriving from the peer, `send` enciphers traffic leaving us.
pub struct CipherPair {
    pub recv: Cipher,
    pub send: Cipher,
}

/// A framed, optionally enciphered stream to one peer.
///
/// Until [`Session::install_ciphers`] runs, incoming packets are parsed as
/// plaintext (the welcome handshake and the hub's pre-login phase travel in
/// the clear) and only [`Session::queue_plain`] may send.
pub struct Session {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    form: HeaderForm,

    ciphers: Option<CipherPair>,
    hdr_read: bool,
    pending_len: usize,

    recv_buf: Buffer,
    send_buf: Buffer,

    packet_log: Option<File>,

    last_message: Instant,
    disconnected: bool,
}

impl Session {
    pub fn new(form: HeaderForm) -> Session {
        Session {
            stream: None,
            peer: None,
            form,
            ciphers: None,
            hdr_read: false,
            pending_len: 0,
            recv_buf: Buffer::new(),
            send_buf: Buffer::new(),
            packet_log: None,
            last_message: Instant::now(),
            disconnected: false,
        }
    }

    pub fn open(form: HeaderForm, stream: TcpStream, peer: SocketAddr) -> Session {
        let mut session = Session::new(form);
        session.stream = Some(stream);
        session.peer = Some(peer);
        session
    }

    /// Opens an outbound session. The connect is non-blocking; traffic is
    /// buffered until the socket reports writable.
    pub fn connect(form: HeaderForm, addr: &SocketAddr) -> NetResult<Session> {
        let stream = TcpStream::connect(addr)?;

        Ok(Session::open(form, stream, *addr))
    }

    #[inline]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[inline]
    pub fn form(&self) -> HeaderForm {
        self.form
    }

    #[inline]
    pub fn install_ciphers(&mut self, pair: CipherPair) {
        self.ciphers = Some(pair);
    }

    #[inline]
    pub fn has_ciphers(&self) -> bool {
        self.ciphers.is_some()
    }

    #[inline]
    pub fn mark_disconnected(&mut self) {
        self.disconnected = true;
    }

    #[inline]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.send_buf.is_empty()
    }

    #[inline]
    pub fn last_message_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_message)
    }

    /// Registers the underlying stream on the supplied poll.
    pub fn register(&self, token: mio::Token, poll: &mio::Poll) -> NetResult<()> {
        poll.register(
            self.stream.as_ref().expect("Can't register a detached session"),
            token,
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )
        .map_err(Into::into)
    }

    pub fn deregister(&self, poll: &mio::Poll) -> NetResult<()> {
        poll.deregister(self.stream.as_ref().expect("Can't deregister a detached session"))
            .map_err(Into::into)
    }

    /// Pulls all available bytes off the socket into the receive buffer and
    /// refreshes the last-message timestamp when anything arrived.
    pub fn receive(&mut self, now: Instant) -> NetResult<usize> {
        let stream = self.stream.as_ref().expect("Session must have a stream");

        let received = self.recv_buf.ingress(stream).map_err(NetError::from)?;

        if received > 0 {
            self.last_message = now;
        }

        Ok(received)
    }

    /// Extracts the next complete packet from the receive buffer,
    /// deciphering in place. Returns `Wait` until a full packet is
    /// buffered; call repeatedly until then.
    ///
    /// The header is deciphered exactly once per packet (stream ciphers are
    /// stateful, so a second pass would corrupt the stream); the
    /// header-read flag tracks that across ticks.
    pub fn next_packet(&mut self) -> NetResult<Vec<u8>> {
        let hsz = self.form.size();

        if self.recv_buf.len() < hsz {
            return Err(NetError::Wait);
        }

        if !self.hdr_read {
            if let Some(pair) = &mut self.ciphers {
                pair.recv.apply(&mut self.recv_buf.as_mut_slice()[..hsz]);
            }

            let header = self.form.parse(&self.recv_buf.as_slice()[..hsz]);

            if (header.len as usize) < hsz {
                return Err(NetError::Fatal(ErrorType::BadFrame));
            }

            self.pending_len = self.form.padded_len(header.len);
            self.hdr_read = true;
        }

        if self.recv_buf.len() < self.pending_len {
            return Err(NetError::Wait);
        }

        let pkt_len = self.pending_len;

        if let Some(pair) = &mut self.ciphers {
            pair.recv.apply(&mut self.recv_buf.as_mut_slice()[hsz..pkt_len]);
        }

        let packet = self.recv_buf.as_slice()[..pkt_len].to_vec();
        self.recv_buf.consume(pkt_len);
        self.hdr_read = false;

        if let Some(log) = &mut self.packet_log {
            dump_packet(log, &packet);
        }

        Ok(packet)
    }

    /// Starts dumping every received packet to `file`, for debugging one
    /// problem connection.
    pub fn set_packet_log(&mut self, file: File) {
        self.packet_log = Some(file);
    }

    pub fn clear_packet_log(&mut self) {
        self.packet_log = None;
    }

    /// Queues a packet without encryption. Only the welcome handshake and
    /// the hub's pre-login exchange use this.
    pub fn queue_plain(&mut self, packet: &[u8]) -> NetResult<()> {
        let padded = self.form.padded_len(packet.len() as u16);

        self.send_buf.extend(packet);
        self.send_buf.extend(&vec![0u8; padded - packet.len()]);

        Ok(())
    }

    /// Pads the packet to the header alignment, enciphers the whole buffer
    /// with the send-direction cipher and queues it.
    pub fn queue_packet(&mut self, packet: &[u8]) -> NetResult<()> {
        let pair = match &mut self.ciphers {
            Some(pair) => pair,
            None => return Err(NetError::Fatal(ErrorType::CipherMisuse)),
        };

        let padded = self.form.padded_len(packet.len() as u16);

        let mut out = Vec::with_capacity(padded);
        out.extend_from_slice(packet);
        out.resize(padded, 0);

        pair.send.apply(&mut out);
        self.send_buf.extend(&out);

        Ok(())
    }

    /// Pushes the send buffer to the socket. `Wait` leaves the remainder
    /// queued for the next writable tick.
    pub fn flush(&mut self) -> NetResult<usize> {
        if self.send_buf.is_empty() {
            return Ok(0);
        }

        let stream = self.stream.as_ref().expect("Session must have a stream");

        self.send_buf.egress(stream).map_err(Into::into)
    }

    /// True once [`Session::open`] gave this session a socket. Detached
    /// sessions exist only in tests.
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.stream.is_some()
    }

    /// Takes everything queued for send, wire-encoded. Used by tests to
    /// observe a handler's output without a socket.
    pub fn drain_pending(&mut self) -> Vec<u8> {
        let pending = self.send_buf.as_slice().to_vec();
        self.send_buf.release();
        pending
    }

    /// Feeds raw wire bytes into the receive buffer, as though they had
    /// arrived from the socket. The test-side twin of [`drain_pending`].
    pub fn feed(&mut self, bytes: &[u8]) {
        self.recv_buf.extend(bytes);
    }
}

/// Builds the parsed header for an already-assembled packet, convenience
/// for dispatch code that has the raw bytes in hand.
#[inline]
pub fn peek_header(form: HeaderForm, packet: &[u8]) -> PacketHeader {
    form.parse(&packet[..form.size()])
}

/// Sixteen-per-line hex dump of one deciphered packet. Write failures are
/// swallowed; the log is a debugging aid, not a transcript of record.
fn dump_packet(log: &mut File, packet: &[u8]) {
    for line in packet.chunks(16) {
        let mut text = String::with_capacity(3 * 16);

        for byte in line {
            text.push_str(&format!("{:02x} ", byte));
        }

        drop(writeln!(log, "{}", text.trim_end()));
    }

    drop(writeln!(log));
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel::crypto::{GcCipher, PcCipher};

    fn pc_pair(seed_recv: u32, seed_send: u32) -> CipherPair {
        CipherPair {
            recv: Cipher::Pc(PcCipher::new(seed_recv)),
            send: Cipher::Pc(PcCipher::new(seed_send)),
        }
    }

    fn make_packet(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 4 + payload.len()];
        let header = PacketHeader {
            opcode: u16::from(opcode),
            flags: 0,
            len: pkt.len() as u16,
        };
        HeaderForm::Dc.write(header, &mut pkt[..4]);
        pkt[4..].copy_from_slice(payload);
        pkt
    }

    /// Queue a packet on one session and feed its ciphertext into another
    /// with mirrored ciphers, as a remote peer would see it.
    fn transfer(from: &mut Session, to: &mut Session) {
        to.recv_buf.extend(from.send_buf.as_slice());
        from.send_buf.release();
    }

    fn mirrored_sessions(form: HeaderForm) -> (Session, Session) {
        let mut a = Session::new(form);
        let mut b = Session::new(form);

        a.install_ciphers(pc_pair(1111, 2222));
        b.install_ciphers(pc_pair(2222, 1111));

        (a, b)
    }

    #[test]
    fn test_plaintext_packet_extraction() {
        let mut session = Session::new(HeaderForm::Dc);

        let pkt = make_packet(0x60, &[1, 2, 3, 4]);
        session.recv_buf.extend(&pkt);

        assert_eq!(session.next_packet().unwrap(), pkt);
        assert_eq!(session.next_packet().unwrap_err(), NetError::Wait);
    }

    #[test]
    fn test_enciphered_roundtrip() {
        let (mut sender, mut receiver) = mirrored_sessions(HeaderForm::Dc);

        let pkt = make_packet(0x62, &[9, 9, 9, 9, 8, 8, 8, 8]);
        sender.queue_packet(&pkt).unwrap();

        // The ciphertext must not leak the plaintext header.
        assert_ne!(&sender.send_buf.as_slice()[..4], &pkt[..4]);

        transfer(&mut sender, &mut receiver);

        assert_eq!(receiver.next_packet().unwrap(), pkt);
    }

    #[test]
    fn test_multiple_packets_in_one_tick() {
        let (mut sender, mut receiver) = mirrored_sessions(HeaderForm::Dc);

        let first = make_packet(0x60, &[1, 1, 1, 1]);
        let second = make_packet(0x6D, &[2, 2, 2, 2, 3, 3, 3, 3]);

        sender.queue_packet(&first).unwrap();
        sender.queue_packet(&second).unwrap();
        transfer(&mut sender, &mut receiver);

        assert_eq!(receiver.next_packet().unwrap(), first);
        assert_eq!(receiver.next_packet().unwrap(), second);
        assert_eq!(receiver.next_packet().unwrap_err(), NetError::Wait);
    }

    #[test]
    fn test_split_packet_across_ticks() {
        let (mut sender, mut receiver) = mirrored_sessions(HeaderForm::Dc);

        let pkt = make_packet(0x60, &[5, 6, 7, 8, 9, 10, 11, 12]);
        sender.queue_packet(&pkt).unwrap();

        let cipher_bytes = sender.send_buf.as_slice().to_vec();

        // First tick: header plus one body byte.
        receiver.recv_buf.extend(&cipher_bytes[..5]);
        assert_eq!(receiver.next_packet().unwrap_err(), NetError::Wait);
        assert!(receiver.hdr_read);

        // Second tick: the remainder. The header must not be deciphered a
        // second time.
        receiver.recv_buf.extend(&cipher_bytes[5..]);
        assert_eq!(receiver.next_packet().unwrap(), pkt);
        assert!(!receiver.hdr_read);
    }

    #[test]
    fn test_undersized_length_is_bad_frame() {
        let mut session = Session::new(HeaderForm::Dc);

        // A header claiming a two-byte packet.
        session.recv_buf.extend(&[0x60, 0x00, 0x02, 0x00]);

        assert_eq!(
            session.next_packet().unwrap_err(),
            NetError::Fatal(ErrorType::BadFrame)
        );
    }

    #[test]
    fn test_send_before_handshake_is_cipher_misuse() {
        let mut session = Session::new(HeaderForm::Dc);

        let result = session.queue_packet(&make_packet(0x60, &[0, 0, 0, 0]));

        assert_eq!(result.unwrap_err(), NetError::Fatal(ErrorType::CipherMisuse));
    }

    #[test]
    fn test_queue_pads_to_alignment() {
        let mut session = Session::new(HeaderForm::Dc);
        session.install_ciphers(pc_pair(1, 2));

        // A 4-byte header plus 2 payload bytes: padded to 8 on the wire.
        let mut pkt = vec![0u8; 6];
        HeaderForm::Dc.write(
            PacketHeader {
                opcode: 0x06,
                flags: 0,
                len: 6,
            },
            &mut pkt[..4],
        );

        session.queue_packet(&pkt).unwrap();

        assert_eq!(session.send_buf.len(), 8);
    }

    #[test]
    fn test_gc_family_roundtrip() {
        let mut sender = Session::new(HeaderForm::Dc);
        let mut receiver = Session::new(HeaderForm::Dc);

        sender.install_ciphers(CipherPair {
            recv: Cipher::Gc(GcCipher::new(5)),
            send: Cipher::Gc(GcCipher::new(6)),
        });
        receiver.install_ciphers(CipherPair {
            recv: Cipher::Gc(GcCipher::new(6)),
            send: Cipher::Gc(GcCipher::new(5)),
        });

        let pkt = make_packet(0x60, &[0xAA; 16]);
        sender.queue_packet(&pkt).unwrap();
        transfer(&mut sender, &mut receiver);

        assert_eq!(receiver.next_packet().unwrap(), pkt);
    }

    #[test]
    fn test_plaintext_gate_phase() {
        // Hub sessions parse plaintext until the login installs RC4.
        let mut session = Session::new(HeaderForm::Gate);

        let mut pkt = vec![0u8; 16];
        HeaderForm::Gate.write(
            PacketHeader {
                opcode: 0x0010,
                flags: 0x8000,
                len: 16,
            },
            &mut pkt[..8],
        );

        session.recv_buf.extend(&pkt);

        assert_eq!(session.next_packet().unwrap(), pkt);
    }
}
