//! GM privilege bits carried on accounts and sessions.

use bitflags::bitflags;

bitflags! {
    pub struct Privilege: u32 {
        const LOCAL_GM    = 0x0000_0001;
        const GLOBAL_GM   = 0x0000_0002;
        const LOCAL_ROOT  = 0x0000_0004;
        const GLOBAL_ROOT = 0x0000_0008;
    }
}

impl Privilege {
    /// Sanity-checks a privilege set coming out of the account store.
    /// Global GM requires local GM, and the two root bits always travel
    /// together.
    pub fn is_sane(self) -> bool {
        if self.contains(Privilege::GLOBAL_GM) && !self.contains(Privilege::LOCAL_GM) {
            return false;
        }

        if self.contains(Privilege::GLOBAL_ROOT) != self.contains(Privilege::LOCAL_ROOT) {
            return false;
        }

        true
    }

    // The admin predicates. Privilege bits mean nothing on a session that
    // has not authenticated, so every check requires the logged-in flag.

    #[inline]
    pub fn local_gm(self, logged_in: bool) -> bool {
        logged_in && self.contains(Privilege::LOCAL_GM)
    }

    #[inline]
    pub fn global_gm(self, logged_in: bool) -> bool {
        logged_in && self.contains(Privilege::GLOBAL_GM)
    }

    #[inline]
    pub fn local_root(self, logged_in: bool) -> bool {
        logged_in && self.contains(Privilege::LOCAL_ROOT)
    }

    #[inline]
    pub fn global_root(self, logged_in: bool) -> bool {
        logged_in && self.contains(Privilege::GLOBAL_ROOT)
    }
}
