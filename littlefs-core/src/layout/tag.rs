//! Metadata tag codec.
//!
//! A tag is a 32-bit record header laid out as
//!
//! ```text
//! [31]     invalid bit (set = not a live tag)
//! [30..28] broad type  (type1)
//! [27..20] chunk       (type extension, splice amount, tail split bit)
//! [19..10] id
//! [9..0]   payload size, 0x3ff marks a delete
//! ```
//!
//! On disk each tag is stored big-endian and XORed with the previous tag of
//! the same commit log, the first tag of a block is XORed with `0xffffffff`.

// ─── Bit fields ─────────────────────────────────────────────────────────────

const VALID_MASK: u32 = 0x8000_0000;
const TYPE1_MASK: u32 = 0x7000_0000;
const TYPE3_MASK: u32 = 0x7ff0_0000;
const CHUNK_MASK: u32 = 0x0ff0_0000;
const ID_MASK: u32 = 0x000f_fc00;
const SIZE_MASK: u32 = 0x0000_03ff;

const TYPE_SHIFT: u32 = 20;
const ID_SHIFT: u32 = 10;

/// Size value reserved for deletes.
pub const SIZE_DELETE: u32 = 0x3ff;

/// Id used by tags that do not belong to an entry.
pub const ID_NONE: u16 = 0x3ff;

// ─── Types ──────────────────────────────────────────────────────────────────

pub const TYPE_REG: u16 = 0x001;
pub const TYPE_DIR: u16 = 0x002;

pub const TYPE_SPLICE: u16 = 0x400;
pub const TYPE_NAME: u16 = 0x000;
pub const TYPE_STRUCT: u16 = 0x200;
pub const TYPE_USERATTR: u16 = 0x300;
pub const TYPE_FROM: u16 = 0x100;
pub const TYPE_TAIL: u16 = 0x600;
pub const TYPE_GLOBALS: u16 = 0x700;
pub const TYPE_CRC: u16 = 0x500;

pub const TYPE_CREATE: u16 = 0x401;
pub const TYPE_DELETE: u16 = 0x4ff;
pub const TYPE_SUPERBLOCK: u16 = 0x0ff;
pub const TYPE_DIRSTRUCT: u16 = 0x200;
pub const TYPE_CTZSTRUCT: u16 = 0x202;
pub const TYPE_INLINESTRUCT: u16 = 0x201;
pub const TYPE_SOFTTAIL: u16 = 0x600;
pub const TYPE_HARDTAIL: u16 = 0x601;
pub const TYPE_MOVESTATE: u16 = 0x7ff;

// in-memory only
pub const FROM_NOOP: u16 = 0x000;
pub const FROM_MOVE: u16 = 0x101;
pub const FROM_USERATTRS: u16 = 0x102;

/// Decoded metadata tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tag(pub u32);

impl Tag {
    /// Marker for "no tag found", equal to a signed -1.
    pub const NONE: Tag = Tag(0xffff_ffff);

    /// Pseudo tag skipped by every traversal.
    pub const NOOP: Tag = Tag(0);

    pub const fn new(ty: u16, id: u16, size: u32) -> Tag {
        Tag(((ty as u32) << TYPE_SHIFT) | ((id as u32) << ID_SHIFT) | size)
    }

    /// `new` when `cond` holds, otherwise a no-op attribute.
    pub const fn new_if(cond: bool, ty: u16, id: u16, size: u32) -> Tag {
        if cond { Tag::new(ty, id, size) } else { Tag::NOOP }
    }

    /// Tag delta that shifts the id field by `delta`, may be negative.
    pub const fn id_delta(delta: i32) -> u32 {
        (delta as u32) << ID_SHIFT
    }

    pub const fn is_valid(self) -> bool {
        self.0 & VALID_MASK == 0
    }

    pub const fn is_delete(self) -> bool {
        self.size() == SIZE_DELETE
    }

    pub const fn type1(self) -> u16 {
        ((self.0 & TYPE1_MASK) >> TYPE_SHIFT) as u16
    }

    pub const fn type3(self) -> u16 {
        ((self.0 & TYPE3_MASK) >> TYPE_SHIFT) as u16
    }

    pub const fn chunk(self) -> u8 {
        ((self.0 & CHUNK_MASK) >> TYPE_SHIFT) as u8
    }

    /// Change in entry count carried by a splice tag (+1 create, -1 delete).
    pub const fn splice(self) -> i8 {
        self.chunk() as i8
    }

    pub const fn id(self) -> u16 {
        ((self.0 & ID_MASK) >> ID_SHIFT) as u16
    }

    pub const fn size(self) -> u32 {
        self.0 & SIZE_MASK
    }

    /// Bytes the tag occupies on disk, header included. Deletes carry no payload.
    pub const fn dsize(self) -> u32 {
        4 + (self.0.wrapping_add(self.is_delete() as u32) & SIZE_MASK)
    }

    /// Same tag with the id field replaced.
    pub const fn with_id(self, id: u16) -> Tag {
        Tag((self.0 & !ID_MASK) | ((id as u32) << ID_SHIFT))
    }

    /// Shift the id by `delta` entries.
    pub const fn shift_id(self, delta: i32) -> Tag {
        Tag(self.0.wrapping_add(Tag::id_delta(delta)))
    }

    /// `mask & self == mask & other`.
    pub const fn matches(self, mask: Tag, other: Tag) -> bool {
        (self.0 & mask.0) == (other.0 & mask.0)
    }

    /// Decode a raw on-disk word given the previous tag of the log.
    pub fn decode(raw: [u8; 4], prev: Tag) -> Tag {
        Tag(u32::from_be_bytes(raw) ^ prev.0)
    }

    /// Encode against the previous tag, the invalid bit is never written.
    pub fn encode(self, prev: Tag) -> [u8; 4] {
        ((self.0 & !VALID_MASK) ^ prev.0).to_be_bytes()
    }
}
