use super::pair::{self, Pair};
use super::tag::{TYPE_DELETE, Tag};
use super::{read_u32_le, write_u32_le};

/// Global state: one pending move plus an orphan counter.
///
/// The value on disk is never stored whole. Every commit records the XOR
/// delta it introduces, folding all deltas at mount yields the state.
/// The tag size field counts orphans and the top bit flags "orphans exist".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GState {
    pub tag: u32,
    pub pair: Pair,
}

impl GState {
    pub const DISK_SIZE: usize = 12;

    pub fn xor(&mut self, other: &GState) {
        self.tag ^= other.tag;
        self.pair[0] ^= other.pair[0];
        self.pair[1] ^= other.pair[1];
    }

    pub fn xored(mut self, other: &GState) -> GState {
        self.xor(other);
        self
    }

    pub fn is_zero(&self) -> bool {
        self.tag == 0 && self.pair[0] == 0 && self.pair[1] == 0
    }

    pub fn has_orphans(&self) -> bool {
        Tag(self.tag).size() != 0
    }

    pub fn orphans(&self) -> u8 {
        Tag(self.tag).size() as u8
    }

    pub fn has_move(&self) -> bool {
        Tag(self.tag).type1() != 0
    }

    pub fn has_move_here(&self, pair: &Pair) -> bool {
        self.has_move() && pair::same(&self.pair, pair)
    }

    /// Id of the entry awaiting deletion by a pending move.
    pub fn move_id(&self) -> u16 {
        Tag(self.tag).id()
    }

    /// Adjust the orphan count, keeping the "orphans exist" bit in step.
    pub fn add_orphans(&mut self, delta: i8) {
        self.tag = self.tag.wrapping_add(delta as i32 as u32);
        self.tag = (self.tag & !0x8000_0000) | ((self.has_orphans() as u32) << 31);
    }

    /// Record (or with `None`, clear) the entry a move must delete.
    pub fn set_move(&mut self, target: Option<(u16, Pair)>) {
        self.tag &= !Tag::new(0x7ff, 0x3ff, 0).0;
        match target {
            Some((id, pair)) => {
                self.tag |= Tag::new(TYPE_DELETE, id, 0).0;
                self.pair = pair;
            }
            None => self.pair = [0, 0],
        }
    }

    pub fn parse(raw: &[u8]) -> GState {
        GState {
            tag: read_u32_le(raw, 0),
            pair: [read_u32_le(raw, 4), read_u32_le(raw, 8)],
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::DISK_SIZE] {
        let mut out = [0u8; Self::DISK_SIZE];
        write_u32_le(&mut out, 0, self.tag);
        write_u32_le(&mut out, 4, self.pair[0]);
        write_u32_le(&mut out, 8, self.pair[1]);
        out
    }
}
