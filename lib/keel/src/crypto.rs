//! Wire ciphers and credential hashing.
//!
//! Client traffic uses one of two proprietary 32-bit-seeded keystream
//! generators depending on the console family. Both produce a stream of
//! 32-bit words which is XORed over the byte stream; the seeds travel in the
//! clear inside the welcome packet, so these are obfuscation layers rather
//! than real cryptography. They must match the generators baked into the
//! original clients exactly, so the schedules below are not to be "improved".
//!
//! The ship-to-hub link uses RC4 with per-direction keys derived from a
//! 128-byte shared secret mixed with per-session nonces (see
//! [`derive_session_key`]).

use byteorder::{ByteOrder, LittleEndian};
use md5::{Digest, Md5};
use rc4::consts::U64;
use rc4::{KeyInit, StreamCipher};
use sha2::Sha512;

/// Keystream generator used by the handheld-family clients: a 57-word
/// lagged-subtractive table refilled in blocks of 55 words.
pub struct PcCipher {
    stream: [u32; 57],
    pos: usize,
}

impl PcCipher {
    pub fn new(seed: u32) -> PcCipher {
        let mut stream = [0u32; 57];

        let mut esi: u32 = 1;
        let mut ebx: u32 = seed;
        let mut edi: u32 = 0x15;

        stream[56] = ebx;
        stream[55] = ebx;

        while edi <= 0x46E {
            let slot = (edi % 55) as usize;
            ebx = ebx.wrapping_sub(esi);
            edi += 0x15;
            stream[slot] = esi;
            esi = ebx;
            ebx = stream[slot];
        }

        let mut cipher = PcCipher { stream, pos: 56 };

        cipher.mix();
        cipher.mix();
        cipher.mix();
        cipher.mix();
        cipher.pos = 56;

        cipher
    }

    fn mix(&mut self) {
        for i in 1..25 {
            self.stream[i] = self.stream[i].wrapping_sub(self.stream[i + 31]);
        }

        for i in 25..56 {
            self.stream[i] = self.stream[i].wrapping_sub(self.stream[i - 24]);
        }
    }

    fn next_word(&mut self) -> u32 {
        if self.pos == 56 {
            self.mix();
            self.pos = 1;
        }

        let word = self.stream[self.pos];
        self.pos += 1;
        word
    }
}

/// Keystream generator used by the console-family clients (shared by the
/// card-game variant): a 521-word XOR table seeded through a bit-harvesting
/// LCG pass.
pub struct GcCipher {
    stream: [u32; 521],
    pos: usize,
}

impl GcCipher {
    pub fn new(seed: u32) -> GcCipher {
        let mut stream = [0u32; 521];

        let mut x = seed;
        let mut basekey: u32 = 0;
        let mut idx = 0;

        for _ in 0..17 {
            for _ in 0..32 {
                x = x.wrapping_mul(0x5D58_8B65).wrapping_add(1);
                basekey >>= 1;

                if x & 0x8000_0000 != 0 {
                    basekey |= 0x8000_0000;
                } else {
                    basekey &= 0x7FFF_FFFF;
                }
            }

            stream[idx] = basekey;
            idx += 1;
        }

        stream[16] = ((stream[0] >> 9) ^ (stream[16] << 23)) ^ stream[15];

        let (mut s1, mut s2, mut s3) = (0, 1, 16);

        while idx != 521 {
            stream[idx] = stream[s3]
                ^ (((stream[s1] << 23) & 0xFF80_0000) ^ ((stream[s2] >> 9) & 0x007F_FFFF));
            idx += 1;
            s1 += 1;
            s2 += 1;
            s3 += 1;
        }

        let mut cipher = GcCipher { stream, pos: 0 };

        cipher.mix();
        cipher.mix();
        cipher.mix();
        cipher.pos = 520;

        cipher
    }

    fn mix(&mut self) {
        for i in 0..32 {
            self.stream[i] ^= self.stream[i + 489];
        }

        for i in 32..521 {
            self.stream[i] = self.stream[i] ^ self.stream[i - 32];
        }

        self.pos = 0;
    }

    fn next_word(&mut self) -> u32 {
        self.pos += 1;

        if self.pos == 521 {
            self.mix();
        }

        self.stream[self.pos]
    }
}

/// RC4 stream for the ship-to-hub session, keyed with the 64-byte digest
/// produced by [`derive_session_key`].
pub struct Rc4Stream(rc4::Rc4<U64>);

impl Rc4Stream {
    pub fn new(key: &[u8; 64]) -> Rc4Stream {
        Rc4Stream(rc4::Rc4::new(key.into()))
    }

    #[inline]
    pub fn apply(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

/// A direction of an established wire cipher. Enciphering and deciphering
/// are the same operation for every family in use.
pub enum Cipher {
    Pc(PcCipher),
    Gc(GcCipher),
    Rc4(Rc4Stream),
}

impl Cipher {
    /// XOR the keystream over `data` in place. The word generators consume
    /// one 32-bit word per 4 bytes; a trailing partial word eats one final
    /// keystream word, matching the original stream alignment.
    pub fn apply(&mut self, data: &mut [u8]) {
        match self {
            Cipher::Rc4(rc4) => rc4.apply(data),
            Cipher::Pc(pc) => Self::apply_words(data, || pc.next_word()),
            Cipher::Gc(gc) => Self::apply_words(data, || gc.next_word()),
        }
    }

    fn apply_words<F: FnMut() -> u32>(data: &mut [u8], mut next_word: F) {
        let mut chunks = data.chunks_exact_mut(4);

        for chunk in &mut chunks {
            let word = LittleEndian::read_u32(chunk) ^ next_word();
            LittleEndian::write_u32(chunk, word);
        }

        let rem = chunks.into_remainder();

        if !rem.is_empty() {
            let mut word = [0u8; 4];
            LittleEndian::write_u32(&mut word, next_word());

            for (byte, key) in rem.iter_mut().zip(word.iter()) {
                *byte ^= key;
            }
        }
    }
}

/// Derives one direction's RC4 session key: the 4-byte nonce is repeated
/// over the 128-byte shared key, the result hashed with SHA-512, and the
/// first 64 bytes of the digest become the key.
pub fn derive_session_key(base: &[u8; 128], nonce: [u8; 4]) -> [u8; 64] {
    let mut mixed = *base;

    for chunk in mixed.chunks_exact_mut(4) {
        for (byte, n) in chunk.iter_mut().zip(nonce.iter()) {
            *byte ^= n;
        }
    }

    let digest = Sha512::digest(&mixed);
    let mut key = [0u8; 64];
    key.copy_from_slice(&digest);

    key
}

/// Account password hashing: lowercase hex MD5 of `password_regtime_salt`.
/// The same scheme covers interactive logins and GM authentication.
pub fn password_hash(password: &str, regtime: &str) -> String {
    let digest = Md5::digest(format!("{}_{}_salt", password, regtime).as_bytes());

    let mut hash = String::with_capacity(32);

    for byte in digest.iter() {
        hash.push_str(&format!("{:02x}", byte));
    }

    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keystream_pc(seed: u32, count: usize) -> Vec<u32> {
        let mut cipher = PcCipher::new(seed);
        (0..count).map(|_| cipher.next_word()).collect()
    }

    fn keystream_gc(seed: u32, count: usize) -> Vec<u32> {
        let mut cipher = GcCipher::new(seed);
        (0..count).map(|_| cipher.next_word()).collect()
    }

    #[test]
    fn test_pc_keystream_deterministic() {
        assert_eq!(keystream_pc(0xDEADBEEF, 200), keystream_pc(0xDEADBEEF, 200));
        assert_ne!(keystream_pc(0xDEADBEEF, 200), keystream_pc(0xDEADBEF0, 200));
    }

    #[test]
    fn test_gc_keystream_deterministic() {
        assert_eq!(keystream_gc(0x12345678, 1200), keystream_gc(0x12345678, 1200));
        assert_ne!(keystream_gc(0x12345678, 1200), keystream_gc(0x12345679, 1200));
    }

    #[test]
    fn test_pc_roundtrip() {
        let plain: Vec<u8> = (0..256u32).map(|item| item as u8).collect();
        let mut data = plain.clone();

        Cipher::Pc(PcCipher::new(0x00C0FFEE)).apply(&mut data);
        assert_ne!(&data[..], &plain[..]);

        Cipher::Pc(PcCipher::new(0x00C0FFEE)).apply(&mut data);
        assert_eq!(&data[..], &plain[..]);
    }

    #[test]
    fn test_gc_roundtrip() {
        // Long enough to force several table refills.
        let plain: Vec<u8> = (0..4 * 1200u32).map(|item| (item * 7) as u8).collect();
        let mut data = plain.clone();

        Cipher::Gc(GcCipher::new(0x0BADF00D)).apply(&mut data);
        assert_ne!(&data[..], &plain[..]);

        Cipher::Gc(GcCipher::new(0x0BADF00D)).apply(&mut data);
        assert_eq!(&data[..], &plain[..]);
    }

    #[test]
    fn test_partial_word_consumes_whole_word() {
        // A 6-byte apply and a 8-byte apply must leave the generator at the
        // same position: trailing bytes consume a full keystream word.
        let mut a = PcCipher::new(77);
        let mut b = PcCipher::new(77);

        Cipher::apply_words(&mut [0u8; 6], || a.next_word());
        Cipher::apply_words(&mut [0u8; 8], || b.next_word());

        assert_eq!(a.next_word(), b.next_word());
    }

    #[test]
    fn test_rc4_roundtrip() {
        let key = [0x5Au8; 64];
        let plain = b"an eight".to_vec();
        let mut data = plain.clone();

        Rc4Stream::new(&key).apply(&mut data);
        assert_ne!(&data[..], &plain[..]);

        Rc4Stream::new(&key).apply(&mut data);
        assert_eq!(&data[..], &plain[..]);
    }

    #[test]
    fn test_derive_session_key() {
        let mut base = [0u8; 128];
        for (i, byte) in base.iter_mut().enumerate() {
            *byte = i as u8;
        }

        let nonce = [0x00, 0x01, 0x02, 0x03];

        // The derivation is the digest of the nonce-mixed key, nothing else.
        let mut mixed = base;
        for chunk in mixed.chunks_exact_mut(4) {
            for (byte, n) in chunk.iter_mut().zip(nonce.iter()) {
                *byte ^= n;
            }
        }
        let expected = Sha512::digest(&mixed);

        assert_eq!(&derive_session_key(&base, nonce)[..], &expected[..]);

        // Distinct nonces must produce distinct directional keys.
        assert_ne!(
            &derive_session_key(&base, nonce)[..],
            &derive_session_key(&base, [0x04, 0x05, 0x06, 0x07])[..]
        );
    }

    #[test]
    fn test_derived_keys_drive_matching_rc4_streams() {
        let base = [0x3Cu8; 128];
        let nonce = [9, 8, 7, 6];

        let key = derive_session_key(&base, nonce);
        let plain = b"forwarded packet".to_vec();
        let mut data = plain.clone();

        Rc4Stream::new(&key).apply(&mut data);
        Rc4Stream::new(&derive_session_key(&base, nonce)).apply(&mut data);

        assert_eq!(&data[..], &plain[..]);
    }

    #[test]
    fn test_password_hash_shape() {
        let hash = password_hash("p", "1234");

        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hash, password_hash("p", "1234"));
        assert_ne!(hash, password_hash("q", "1234"));
        assert_ne!(hash, password_hash("p", "1235"));
    }
}
