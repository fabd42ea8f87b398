//! A slot is one glyph position in a shaped run: a node in the segment's
//! doubly-linked chain, plus an attachment tree overlaid on that chain
//! through the parent/child/sibling links.

use bitflags::bitflags;

use crate::face::{GID, Position};

slotmap::new_key_type! {
    /// Stable handle to a slot in its segment's arena. Keys survive
    /// insertion and deletion of other slots; a freed slot's key simply
    /// stops resolving.
    pub struct SlotKey;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct SlotFlags: u8 {
        /// Marked for removal by a rule; still chained until collected.
        const DELETED = 1;
        /// Insertion before this slot is forbidden.
        const INSERT_BLOCKED = 2;
        /// Temporary copy produced while a rule body runs.
        const COPIED = 4;
    }
}

/// Number of slot attribute codes the bytecode can address.
pub const NUM_ATTR_CODES: u8 = 77;

/// Slot attributes addressable from bytecode. The byte values are fixed
/// by the compiled rule format; codes this engine does not model decode
/// to [`SlotAttr::Unsupported`], which reads as 0 and ignores writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAttr {
    AdvX,
    AdvY,
    AttTo,
    AttX,
    AttY,
    AttXOff,
    AttYOff,
    AttWithX,
    AttWithY,
    AttWithXOff,
    AttWithYOff,
    AttLevel,
    Break,
    CompRef,
    Dir,
    Insert,
    PosX,
    PosY,
    ShiftX,
    ShiftY,
    UserDefnV1,
    MeasureSol,
    MeasureEol,
    JWidth,
    SegSplit,
    UserDefn,
    BidiLevel,
    Unsupported,
}

impl SlotAttr {
    pub fn from_byte(b: u8) -> SlotAttr {
        use SlotAttr::*;
        match b {
            0 => AdvX,
            1 => AdvY,
            2 => AttTo,
            3 => AttX,
            4 => AttY,
            6 => AttXOff,
            7 => AttYOff,
            8 => AttWithX,
            9 => AttWithY,
            11 => AttWithXOff,
            12 => AttWithYOff,
            13 => AttLevel,
            14 => Break,
            15 => CompRef,
            16 => Dir,
            17 => Insert,
            18 => PosX,
            19 => PosY,
            20 => ShiftX,
            21 => ShiftY,
            22 => UserDefnV1,
            23 => MeasureSol,
            24 => MeasureEol,
            29 => JWidth,
            54 => SegSplit,
            55 => UserDefn,
            56 => BidiLevel,
            // 5 and 10 are glyph-point attachment, 25..=53 the remaining
            // justification codes, 57.. collision data
            _ => Unsupported,
        }
    }
}

/// One glyph node. Chain and tree links are arena keys owned by the
/// enclosing [`Segment`](crate::segment::Segment).
#[derive(Debug, Clone)]
pub struct Slot {
    pub(crate) prev: Option<SlotKey>,
    pub(crate) next: Option<SlotKey>,
    pub(crate) glyph_id: GID,
    pub(crate) real_glyph_id: GID,
    /// Index of the character this slot was produced from.
    pub(crate) original: usize,
    /// First and last character indices this slot maps to.
    pub(crate) before: usize,
    pub(crate) after: usize,
    pub(crate) parent: Option<SlotKey>,
    pub(crate) child: Option<SlotKey>,
    pub(crate) sibling: Option<SlotKey>,
    pub(crate) position: Position,
    pub(crate) shift: Position,
    pub(crate) advance: Position,
    pub(crate) attach: Position,
    pub(crate) with: Position,
    pub(crate) just: f32,
    pub(crate) att_level: u8,
    pub(crate) bidi_level: u8,
    pub(crate) bidi_cls: i8,
    pub(crate) flags: SlotFlags,
    pub(crate) user_attrs: Vec<i16>,
}

impl Slot {
    pub(crate) fn new(num_user_attrs: u8) -> Self {
        Slot {
            prev: None,
            next: None,
            glyph_id: 0,
            real_glyph_id: 0,
            original: 0,
            before: 0,
            after: 0,
            parent: None,
            child: None,
            sibling: None,
            position: Position::default(),
            shift: Position::default(),
            advance: Position::default(),
            attach: Position::default(),
            with: Position::default(),
            just: 0.0,
            att_level: 0,
            bidi_level: 0,
            bidi_cls: -1,
            flags: SlotFlags::empty(),
            user_attrs: vec![0; num_user_attrs as usize],
        }
    }

    pub fn gid(&self) -> GID {
        self.glyph_id
    }

    pub fn next(&self) -> Option<SlotKey> {
        self.next
    }

    pub fn prev(&self) -> Option<SlotKey> {
        self.prev
    }

    pub fn parent(&self) -> Option<SlotKey> {
        self.parent
    }

    pub fn original(&self) -> usize {
        self.original
    }

    pub fn before(&self) -> usize {
        self.before
    }

    pub fn after(&self) -> usize {
        self.after
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn user_attr(&self, index: usize) -> i16 {
        self.user_attrs.get(index).copied().unwrap_or(0)
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(SlotFlags::DELETED)
    }

    pub(crate) fn mark_deleted(&mut self, deleted: bool) {
        self.flags.set(SlotFlags::DELETED, deleted);
    }

    pub fn is_copied(&self) -> bool {
        self.flags.contains(SlotFlags::COPIED)
    }

    pub(crate) fn mark_copied(&mut self, copied: bool) {
        self.flags.set(SlotFlags::COPIED, copied);
    }

    pub fn can_insert_before(&self) -> bool {
        !self.flags.contains(SlotFlags::INSERT_BLOCKED)
    }

    pub(crate) fn set_insert_before(&mut self, allowed: bool) {
        self.flags.set(SlotFlags::INSERT_BLOCKED, !allowed);
    }

    /// A base is a slot with no parent, i.e. the root of its attachment
    /// cluster.
    pub fn is_base(&self) -> bool {
        self.parent.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_toggle() {
        let mut s = Slot::new(2);
        assert!(!s.is_deleted());
        assert!(s.can_insert_before());
        s.mark_deleted(true);
        s.set_insert_before(false);
        assert!(s.is_deleted());
        assert!(!s.can_insert_before());
        s.mark_deleted(false);
        s.set_insert_before(true);
        assert!(!s.is_deleted());
        assert!(s.can_insert_before());
    }

    #[test]
    fn attr_byte_decoding() {
        assert_eq!(SlotAttr::from_byte(0), SlotAttr::AdvX);
        assert_eq!(SlotAttr::from_byte(2), SlotAttr::AttTo);
        assert_eq!(SlotAttr::from_byte(18), SlotAttr::PosX);
        assert_eq!(SlotAttr::from_byte(55), SlotAttr::UserDefn);
        assert_eq!(SlotAttr::from_byte(56), SlotAttr::BidiLevel);
        // glyph-point and collision codes decode but do nothing
        assert_eq!(SlotAttr::from_byte(5), SlotAttr::Unsupported);
        assert_eq!(SlotAttr::from_byte(60), SlotAttr::Unsupported);
    }

    #[test]
    fn user_attrs_default_to_zero() {
        let s = Slot::new(3);
        assert_eq!(s.user_attr(1), 0);
        assert_eq!(s.user_attr(9), 0);
    }
}
