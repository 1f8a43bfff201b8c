//! Key ordering and flag types shared across the engine.
//!
//! Keys and values are raw byte strings. The only interpretation the engine
//! places on key bytes is the tree's [`KeyOrder`], which is chosen when the
//! tree is first populated and stored in the meta slots from then on.

use std::{
    cmp::Ordering,
    fmt,
    ops::{BitOr, BitOrAssign},
};

/// Comparator policy for a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyOrder {
    /// Lexicographic byte order.
    #[default]
    Forward,
    /// Descending byte order: iteration yields keys from largest to smallest.
    Reverse,
}

impl KeyOrder {
    /// Compares two keys under this order.
    #[inline]
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyOrder::Forward => a.cmp(b),
            KeyOrder::Reverse => b.cmp(a),
        }
    }

    /// Meta-slot flag bits for this order.
    pub(crate) fn to_flags(self) -> u16 {
        match self {
            KeyOrder::Forward => 0,
            KeyOrder::Reverse => META_FLAG_REVERSE_KEY,
        }
    }

    /// Decodes the order from meta-slot flag bits.
    pub(crate) fn from_flags(flags: u16) -> Self {
        if flags & META_FLAG_REVERSE_KEY != 0 { KeyOrder::Reverse } else { KeyOrder::Forward }
    }
}

/// Meta flag bit marking a reverse-ordered tree.
const META_FLAG_REVERSE_KEY: u16 = 0x0001;

/// Flags accepted when opening a database. Combine with `|`.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Skip fsync on commit. Commits stay atomic but may be lost on power failure.
    pub const NO_SYNC: OpenFlags = OpenFlags(0x01);
    /// Open without write access. Write transactions fail with [`Error::ReadOnly`].
    ///
    /// [`Error::ReadOnly`]: crate::Error::ReadOnly
    pub const READ_ONLY: OpenFlags = OpenFlags(0x02);
    /// Use [`KeyOrder::Reverse`] when the tree in this file is created.
    pub const REVERSE_KEY: OpenFlags = OpenFlags(0x04);

    /// No flags set.
    pub const fn empty() -> Self {
        OpenFlags(0)
    }

    /// Returns true if every bit of `other` is set in `self`.
    pub const fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw flag bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// The key order these flags request for a new tree.
    pub fn key_order(self) -> KeyOrder {
        if self.contains(OpenFlags::REVERSE_KEY) { KeyOrder::Reverse } else { KeyOrder::Forward }
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenFlags {
    fn bitor_assign(&mut self, rhs: OpenFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(OpenFlags::NO_SYNC) {
            names.push("NO_SYNC");
        }
        if self.contains(OpenFlags::READ_ONLY) {
            names.push("READ_ONLY");
        }
        if self.contains(OpenFlags::REVERSE_KEY) {
            names.push("REVERSE_KEY");
        }
        if names.is_empty() {
            write!(f, "OpenFlags(empty)")
        } else {
            write!(f, "OpenFlags({})", names.join(" | "))
        }
    }
}

/// Flags accepted by put operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PutFlags(u32);

impl PutFlags {
    /// Fail with [`Error::KeyExists`] instead of replacing an existing value.
    ///
    /// [`Error::KeyExists`]: crate::Error::KeyExists
    pub const NO_OVERWRITE: PutFlags = PutFlags(0x01);

    /// Replace existing values (the default).
    pub const fn empty() -> Self {
        PutFlags(0)
    }

    /// Returns true if every bit of `other` is set in `self`.
    pub const fn contains(self, other: PutFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PutFlags {
    type Output = PutFlags;

    fn bitor(self, rhs: PutFlags) -> PutFlags {
        PutFlags(self.0 | rhs.0)
    }
}
