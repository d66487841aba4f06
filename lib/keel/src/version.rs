//! Client build variants and the listener layout that identifies them.
//!
//! Which build a client runs is inferred from the port its connection
//! arrived on; the accepting listener is the source of truth, nothing in the
//! login packet overrides it.

/// One of the supported client builds.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientVersion {
    DcV1,
    DcV2,
    Pc,
    GcUs,
    GcEu60,
    GcEu50,
    GcJp10,
    GcJp11,
    Ep3,
}

/// The two keystream families clients speak.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CipherFamily {
    Pc,
    Gc,
}

/// Login listener ports, one per variant. The 60Hz European console build
/// ships with the handheld protocol and shares that port.
pub const PORT_DC: u16 = 9200;
pub const PORT_PC: u16 = 9300;
pub const PORT_GC_US: u16 = 9100;
pub const PORT_GC_EU_50: u16 = 9201;
pub const PORT_GC_JP_10: u16 = 9000;
pub const PORT_GC_JP_11: u16 = 9001;
pub const PORT_WEB: u16 = 10003;

pub const LOGIN_PORTS: [u16; 6] = [
    PORT_DC,
    PORT_PC,
    PORT_GC_US,
    PORT_GC_EU_50,
    PORT_GC_JP_10,
    PORT_GC_JP_11,
];

impl ClientVersion {
    /// The variant implied by the accepting login listener. Versions that
    /// cannot be told apart at accept time (v1 vs v2 on the shared port)
    /// start at the older one and are refined by the login packet contents.
    pub fn for_login_port(port: u16) -> Option<ClientVersion> {
        match port {
            PORT_DC => Some(ClientVersion::DcV1),
            PORT_PC => Some(ClientVersion::Pc),
            PORT_GC_US => Some(ClientVersion::GcUs),
            PORT_GC_EU_50 => Some(ClientVersion::GcEu50),
            PORT_GC_JP_10 => Some(ClientVersion::GcJp10),
            PORT_GC_JP_11 => Some(ClientVersion::GcJp11),
            _ => None,
        }
    }

    /// Every client variant frames packets with a 4-byte header; only the
    /// field layout inside it differs.
    #[inline]
    pub fn header_size(&self) -> usize {
        4
    }

    pub fn cipher_family(&self) -> CipherFamily {
        match self {
            ClientVersion::DcV1 | ClientVersion::DcV2 | ClientVersion::Pc => CipherFamily::Pc,
            _ => CipherFamily::Gc,
        }
    }

    /// Offset added to a ship's base port to reach the right per-variant
    /// listener.
    pub fn port_offset(&self) -> u16 {
        match self {
            ClientVersion::DcV1 | ClientVersion::DcV2 => 0,
            ClientVersion::Pc => 1,
            ClientVersion::GcUs
            | ClientVersion::GcEu60
            | ClientVersion::GcEu50
            | ClientVersion::GcJp10
            | ClientVersion::GcJp11 => 2,
            ClientVersion::Ep3 => 3,
        }
    }

    /// True for the variants that use the handheld wire header layout.
    pub fn uses_pc_header(&self) -> bool {
        *self == ClientVersion::Pc
    }

    /// The item validation table this variant's inventory is checked
    /// against in legit mode.
    pub fn item_version(&self) -> ItemVersion {
        match self {
            ClientVersion::DcV1 => ItemVersion::V1,
            ClientVersion::DcV2 | ClientVersion::Pc => ItemVersion::V2,
            _ => ItemVersion::Gc,
        }
    }
}

/// Item-limits table generations.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ItemVersion {
    V1,
    V2,
    Gc,
}

pub const LANG_COUNT: usize = 8;

/// Quest directory language codes, indexed by a client's language byte.
pub const LANGUAGE_CODES: [&str; LANG_COUNT] = ["jp", "en", "de", "fr", "sp", "cs", "ct", "kr"];

/// Short language tags shown in info replies.
pub const MINI_LANGUAGE_CODES: [&str; LANG_COUNT] = ["J", "E", "G", "F", "S", "CS", "CT", "K"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_port_mapping() {
        assert_eq!(ClientVersion::for_login_port(9200), Some(ClientVersion::DcV1));
        assert_eq!(ClientVersion::for_login_port(9300), Some(ClientVersion::Pc));
        assert_eq!(ClientVersion::for_login_port(9100), Some(ClientVersion::GcUs));
        assert_eq!(ClientVersion::for_login_port(9201), Some(ClientVersion::GcEu50));
        assert_eq!(ClientVersion::for_login_port(9000), Some(ClientVersion::GcJp10));
        assert_eq!(ClientVersion::for_login_port(9001), Some(ClientVersion::GcJp11));
        assert_eq!(ClientVersion::for_login_port(12345), None);
    }

    #[test]
    fn test_cipher_families() {
        assert_eq!(ClientVersion::DcV1.cipher_family(), CipherFamily::Pc);
        assert_eq!(ClientVersion::Pc.cipher_family(), CipherFamily::Pc);
        assert_eq!(ClientVersion::GcJp11.cipher_family(), CipherFamily::Gc);
        assert_eq!(ClientVersion::Ep3.cipher_family(), CipherFamily::Gc);
    }

    #[test]
    fn test_port_offsets_are_per_family() {
        assert_eq!(ClientVersion::DcV2.port_offset(), 0);
        assert_eq!(ClientVersion::Pc.port_offset(), 1);
        assert_eq!(ClientVersion::GcEu60.port_offset(), 2);
        assert_eq!(ClientVersion::Ep3.port_offset(), 3);
    }
}
