use core::fmt;
use std::str::FromStr;

use data_encoding::Specification;
use rand::Rng as _;
use snafu::{OptionExt as _, Snafu};

use crate::Timestamp;
use crate::{array_type_define_public, array_type_impl_serde};

/// Crockford base32: sortable, case-stable, no `I`/`L`/`O`/`U`.
///
/// 16 bytes encode to exactly 26 symbols, and because the symbols are in
/// ascending ASCII order the encoded form sorts the same way as the bytes.
pub fn crockford_encoding() -> data_encoding::Encoding {
    let mut spec = Specification::new();
    spec.symbols.push_str("0123456789ABCDEFGHJKMNPQRSTVWXYZ");
    spec.encoding().expect("Valid base32 specification")
}

array_type_define_public!(
    /// Identifier of an addressable object (res).
    ///
    /// ULID-shaped: the first 6 bytes are the big-endian unix-millisecond
    /// creation time, the remaining 10 bytes are random. Ids therefore sort
    /// lexicographically by creation time, both as bytes and in their
    /// 26-character Crockford base32 string form.
    struct ResId, 16
);
array_type_impl_serde!(struct ResId, 16);

impl ResId {
    /// The self-referential root genus. Every genus (including `META`
    /// itself) has this as its `genus_id`.
    pub const META: Self = Self::sentinel(1);
    pub const LOG: Self = Self::sentinel(2);
    pub const ERROR: Self = Self::sentinel(3);
    pub const TASK: Self = Self::sentinel(4);
    pub const BRANCH: Self = Self::sentinel(5);
    pub const TAXONOMY: Self = Self::sentinel(6);
    pub const DEFAULT_TAXONOMY: Self = Self::sentinel(7);
    pub const SCIENCE: Self = Self::sentinel(8);
    pub const DEFAULT_SCIENCE: Self = Self::sentinel(9);
    pub const CRON_SCHEDULE: Self = Self::sentinel(10);
    pub const WORKSPACE: Self = Self::sentinel(11);
    pub const PALACE_ROOM: Self = Self::sentinel(12);
    pub const PALACE_SCROLL: Self = Self::sentinel(13);
    pub const PALACE_NPC: Self = Self::sentinel(14);

    const fn sentinel(tag: u8) -> Self {
        let mut bytes = [0u8; 16];
        bytes[15] = tag;
        Self(bytes)
    }

    /// All bootstrap sentinel ids, in bootstrap order.
    pub const SENTINELS: [Self; 14] = [
        Self::META,
        Self::LOG,
        Self::ERROR,
        Self::TASK,
        Self::BRANCH,
        Self::TAXONOMY,
        Self::DEFAULT_TAXONOMY,
        Self::SCIENCE,
        Self::DEFAULT_SCIENCE,
        Self::CRON_SCHEDULE,
        Self::WORKSPACE,
        Self::PALACE_ROOM,
        Self::PALACE_SCROLL,
        Self::PALACE_NPC,
    ];

    /// Sentinels have a zero timestamp prefix, which no generated id can
    /// have (generation started well after the epoch).
    pub fn is_sentinel(&self) -> bool {
        self.0[..15].iter().all(|b| *b == 0) && self.0[15] != 0
    }

    pub fn generate() -> Self {
        Self::generate_at(Timestamp::now())
    }

    pub fn generate_at(ts: Timestamp) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..6].copy_from_slice(&ts.as_millis().to_be_bytes()[2..]);
        let rand_part: [u8; 10] = rand::rng().random();
        bytes[6..].copy_from_slice(&rand_part);
        Self(bytes)
    }
}

impl fmt::Display for ResId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crockford_encoding().encode(self.as_slice()))
    }
}

#[derive(Debug, Snafu, Clone)]
pub enum ResIdParseError {
    #[snafu(display("Invalid id length {len}, expected 26 characters"))]
    InvalidLength { len: usize },
    #[snafu(display("Invalid base32 in id: {text:?}"))]
    InvalidEncoding { text: String },
}

impl FromStr for ResId {
    type Err = ResIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 26 {
            return InvalidLengthSnafu { len: s.len() }.fail();
        }
        let bytes = crockford_encoding()
            .decode(s.to_ascii_uppercase().as_bytes())
            .ok()
            .context(InvalidEncodingSnafu { text: s })?;
        let bytes: [u8; 16] = bytes.try_into().map_err(|_| {
            InvalidLengthSnafu { len: s.len() }.build()
        })?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_26_crockford_chars() {
        let id = ResId::generate();
        let s = id.to_string();
        assert_eq!(s.len(), 26);
        assert!(s
            .chars()
            .all(|c| "0123456789ABCDEFGHJKMNPQRSTVWXYZ".contains(c)));
    }

    #[test]
    fn roundtrips_through_string() {
        let id = ResId::generate();
        let parsed: ResId = id.to_string().parse().expect("Valid id");
        assert_eq!(id, parsed);
    }

    #[test]
    fn sorts_by_creation_time() {
        let a = ResId::generate_at(Timestamp::from_millis(1_000));
        let b = ResId::generate_at(Timestamp::from_millis(2_000));
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn sentinels_are_detected() {
        assert!(ResId::META.is_sentinel());
        assert!(ResId::CRON_SCHEDULE.is_sentinel());
        assert!(!ResId::ZERO.is_sentinel());
        assert!(!ResId::generate().is_sentinel());
    }

    #[test]
    fn rejects_bad_strings() {
        assert!("not-an-id".parse::<ResId>().is_err());
        assert!("IIIIIIIIIIIIIIIIIIIIIIIIII".parse::<ResId>().is_err());
    }
}
