//! A segment owns the slot chain for one run of text: the arena the
//! slots live in, the first/last links, per-character info and the
//! features the run was keyed with. Rule programs rewrite the chain
//! through a [`Machine`](crate::vm::Machine); the positioning pass here
//! turns the finished chain into glyph positions.

use std::rc::Rc;

use crate::face::{Face, FeatureValue, GlyphMetric, Position, Rect, Silf};
use crate::slot::{Slot, SlotAttr, SlotKey};
use crate::slot_map::SlotMap;

pub(crate) type SlotArena = slotmap::SlotMap<SlotKey, Slot>;

const REVERSE_BIT: u8 = 6;

/// Attachment chains deeper than this are treated as broken.
const MAX_ATTACH_DEPTH: u32 = 100;

/// Per-character bookkeeping, one entry per input character.
#[derive(Debug, Clone)]
pub struct CharInfo {
    pub char: char,
    pub break_weight: i16,
    pub flags: u8,
}

impl CharInfo {
    pub(crate) fn add_flags(&mut self, val: u8) {
        self.flags |= val;
    }
}

#[derive(Debug)]
pub struct Segment {
    arena: SlotArena,
    first: Option<SlotKey>,
    last: Option<SlotKey>,
    face: Rc<Face>,
    silf: Rc<Silf>,
    charinfo: Vec<CharInfo>,
    feats: Vec<FeatureValue>,
    pub num_glyphs: usize,
    /// Bit 0 is the paragraph direction (1 = rtl), bit 6 tracks whether
    /// the chain is currently reversed.
    dir: i8,
    positioning_runs: usize,
}

impl Segment {
    pub fn new(face: Rc<Face>, silf: Rc<Silf>, rtl: bool) -> Self {
        let feats = face
            .feature_ids
            .iter()
            .map(|&id| FeatureValue { id, value: 0 })
            .collect();
        Segment {
            arena: SlotArena::with_key(),
            first: None,
            last: None,
            face,
            silf,
            charinfo: Vec::new(),
            feats,
            num_glyphs: 0,
            dir: rtl as i8,
            positioning_runs: 0,
        }
    }

    pub fn face(&self) -> &Face {
        &self.face
    }

    pub fn silf(&self) -> &Silf {
        &self.silf
    }

    pub fn first(&self) -> Option<SlotKey> {
        self.first
    }

    pub fn last(&self) -> Option<SlotKey> {
        self.last
    }

    pub(crate) fn set_first(&mut self, k: Option<SlotKey>) {
        self.first = k;
    }

    pub(crate) fn set_last(&mut self, k: Option<SlotKey>) {
        self.last = k;
    }

    pub fn slot(&self, k: SlotKey) -> &Slot {
        &self.arena[k]
    }

    pub fn slot_mut(&mut self, k: SlotKey) -> &mut Slot {
        &mut self.arena[k]
    }

    /// Like [`Segment::slot`] but `None` for keys already freed.
    pub fn try_slot(&self, k: SlotKey) -> Option<&Slot> {
        self.arena.get(k)
    }

    pub fn char_info(&self, index: usize) -> Option<&CharInfo> {
        self.charinfo.get(index)
    }

    /// True while the chain runs opposite to the paragraph direction.
    pub fn curr_dir(&self) -> bool {
        ((self.dir >> REVERSE_BIT) ^ self.dir) & 1 != 0
    }

    pub(crate) fn new_slot(&mut self) -> SlotKey {
        self.arena.insert(Slot::new(self.silf.num_user_attrs))
    }

    /// Remove a slot from the arena, detaching it from its attachment
    /// cluster first. The caller is responsible for the chain links.
    pub fn free_slot(&mut self, k: SlotKey) {
        if self.last == Some(k) {
            self.last = self.arena[k].prev;
        }
        if self.first == Some(k) {
            self.first = self.arena[k].next;
        }
        if let Some(parent) = self.arena[k].parent {
            self.remove_child(parent, k);
        }
        while let Some(child) = self.arena[k].child {
            if self.arena[child].parent == Some(k) {
                self.arena[child].parent = None;
                self.remove_child(k, child);
            } else {
                self.arena[k].child = None;
            }
        }
        self.arena.remove(k);
    }

    /// Append a slot for character `ch` rendered as `gid`, recording its
    /// charinfo entry.
    pub fn push_glyph(&mut self, gid: u16, ch: char) -> SlotKey {
        let index = self.charinfo.len();
        let break_weight = self
            .face
            .glyph_attr(gid, self.silf.attr_break_weight as u16);
        self.charinfo.push(CharInfo {
            char: ch,
            break_weight,
            flags: 0,
        });

        let key = self.new_slot();
        self.set_glyph(key, gid);
        {
            let sl = &mut self.arena[key];
            sl.original = index;
            sl.before = index;
            sl.after = index;
        }
        match self.last {
            Some(last) => {
                self.arena[last].next = Some(key);
                self.arena[key].prev = Some(last);
            }
            None => self.first = Some(key),
        }
        self.last = Some(key);
        self.num_glyphs += 1;
        key
    }

    /// Install glyph `gid` in a slot, resolving its pseudo mapping and
    /// caching the advance.
    pub fn set_glyph(&mut self, k: SlotKey, gid: u16) {
        let (real, advance) = match self.face.glyph(gid) {
            None => (0, Position::default()),
            Some(glyph) => {
                let mut real = self.face.glyph_attr(gid, self.silf.attr_pseudo as u16) as u16;
                if real as usize > self.face.glyphs.len() {
                    real = 0;
                }
                let actual = if real != 0 {
                    self.face.glyph(real).unwrap_or(glyph)
                } else {
                    glyph
                };
                (real, Position::new(actual.advance.x, 0.0))
            }
        };
        let sl = &mut self.arena[k];
        sl.glyph_id = gid;
        sl.real_glyph_id = real;
        sl.bidi_cls = -1;
        sl.advance = advance;
    }

    fn slot_bidi_class(&mut self, k: SlotKey) -> i8 {
        let cached = self.arena[k].bidi_cls;
        if cached != -1 {
            return cached;
        }
        let gid = self.arena[k].glyph_id;
        let cls = self.face.glyph_attr(gid, self.silf.attr_directionality as u16) as i8;
        self.arena[k].bidi_cls = cls;
        cls
    }

    /// Reverse the chain in place, keeping runs of diacritics (bidi
    /// class 16) after the base they follow.
    pub fn reverse_slots(&mut self) {
        self.dir ^= 1 << REVERSE_BIT;
        if self.first == self.last {
            return; // 0 or 1 glyph runs
        }

        let mut curr = self.first;
        while let Some(c) = curr {
            if self.slot_bidi_class(c) != 16 {
                break;
            }
            curr = self.arena[c].next;
        }
        let Some(head) = curr else { return };
        let tfirst = self.arena[head].prev;
        let mut tlast = Some(head);
        let mut out: Option<SlotKey> = None;

        let mut curr = Some(head);
        while let Some(c) = curr {
            let next;
            if self.slot_bidi_class(c) == 16 {
                let mut d = self.arena[c].next;
                while let Some(dk) = d {
                    if self.slot_bidi_class(dk) != 16 {
                        break;
                    }
                    d = self.arena[dk].next;
                }
                let d = match d {
                    Some(dk) => self.arena[dk].prev,
                    None => self.last,
                };
                // out is set by the first non-diacritic slot
                let (Some(out_k), Some(d_k)) = (out, d) else {
                    break;
                };
                let p = self.arena[out_k].next;
                match p {
                    Some(pk) => self.arena[pk].prev = d,
                    None => tlast = d,
                }
                next = self.arena[d_k].next;
                self.arena[d_k].next = p;
                self.arena[c].prev = out;
                self.arena[out_k].next = Some(c);
            } else {
                if let Some(out_k) = out {
                    self.arena[out_k].prev = Some(c);
                }
                next = self.arena[c].next;
                self.arena[c].next = out;
                out = Some(c);
            }
            curr = next;
        }

        if let Some(out_k) = out {
            self.arena[out_k].prev = tfirst;
            match tfirst {
                Some(tf) => self.arena[tf].next = out,
                None => self.first = out,
            }
        }
        self.last = tlast;
    }

    /// Walk the (base) slots of `[start, end]` assigning positions, and
    /// return the total advance. `None` bounds default to the ends of
    /// the chain.
    pub fn position_slots(
        &mut self,
        start: Option<SlotKey>,
        end: Option<SlotKey>,
        is_rtl: bool,
    ) -> Position {
        self.positioning_runs += 1;
        let mut currpos = Position::default();
        let mut bbox = Rect::default();
        let reorder = self.curr_dir() != is_rtl;

        let (mut start, mut end) = (start, end);
        if reorder {
            self.reverse_slots();
            std::mem::swap(&mut start, &mut end);
        }
        let start = start.or(self.first);
        let end = end.or(self.last);

        if let (Some(start), Some(end)) = (start, end) {
            if is_rtl {
                let stop = self.arena[start].prev;
                let mut s = Some(end);
                while let Some(k) = s {
                    if s == stop {
                        break;
                    }
                    if self.arena[k].is_base() {
                        let mut cluster_min = currpos.x;
                        currpos =
                            self.finalise(k, currpos, &mut bbox, 0, &mut cluster_min, is_rtl, 0);
                    }
                    s = self.arena[k].prev;
                }
            } else {
                let stop = self.arena[end].next;
                let mut s = Some(start);
                while let Some(k) = s {
                    if s == stop {
                        break;
                    }
                    if self.arena[k].is_base() {
                        let mut cluster_min = currpos.x;
                        currpos =
                            self.finalise(k, currpos, &mut bbox, 0, &mut cluster_min, is_rtl, 0);
                    }
                    s = self.arena[k].next;
                }
            }
        }
        if reorder {
            self.reverse_slots();
        }
        currpos
    }

    /// How many times the positioning pass has run; attribute reads of
    /// positions trigger it at most once per rule execution.
    pub fn positioning_runs(&self) -> usize {
        self.positioning_runs
    }

    fn finalise(
        &mut self,
        k: SlotKey,
        base: Position,
        bbox: &mut Rect,
        attr_level: u8,
        cluster_min: &mut f32,
        rtl: bool,
        depth: u32,
    ) -> Position {
        if depth > MAX_ATTACH_DEPTH || (attr_level != 0 && self.arena[k].att_level > attr_level) {
            return Position::default();
        }

        let sl = &self.arena[k];
        let shift = Position::new(
            sl.shift.x * if rtl { -1.0 } else { 1.0 } + sl.just,
            sl.shift.y,
        );
        let t_advance = sl.advance.x + sl.just;
        let advance = sl.advance;
        let parent = sl.parent;
        let glyph_bbox = self.face.glyph(sl.glyph_id).map(|g| g.bbox);

        let mut res;
        let mut pos = base.add(shift);
        if parent.is_none() {
            res = base.add(Position::new(t_advance, advance.y));
            *cluster_min = pos.x;
        } else {
            let sl = &self.arena[k];
            pos = pos.add(sl.attach.sub(sl.with));
            let t_adv = if advance.x >= 0.5 {
                pos.x + t_advance - shift.x
            } else {
                0.0
            };
            res = Position::new(t_adv, 0.0);
            if (advance.x >= 0.5 || pos.x < 0.0) && pos.x < *cluster_min {
                *cluster_min = pos.x;
            }
        }
        self.arena[k].position = pos;

        if let Some(gb) = glyph_bbox {
            *bbox = bbox.widen(gb.add_position(pos));
        }

        let child = self.arena[k].child;
        if let Some(c) = child {
            if c != k && self.arena[c].parent == Some(k) {
                let t_res = self.finalise(c, pos, bbox, attr_level, cluster_min, rtl, depth + 1);
                if (parent.is_none() || advance.x >= 0.5) && t_res.x > res.x {
                    res = t_res;
                }
            }
        }

        let sibling = self.arena[k].sibling;
        if parent.is_some() {
            if let Some(sib) = sibling {
                if sib != k && self.arena[sib].parent == parent {
                    let t_res =
                        self.finalise(sib, base, bbox, attr_level, cluster_min, rtl, depth + 1);
                    if t_res.x > res.x {
                        res = t_res;
                    }
                }
            }
        }

        if parent.is_none() && *cluster_min < base.x {
            let adj = Position::new(self.arena[k].position.x - *cluster_min, 0.0);
            res = res.add(adj);
            self.arena[k].position = self.arena[k].position.add(adj);
            if let Some(c) = child {
                self.flood_shift(c, adj, 0);
            }
        }
        res
    }

    fn flood_shift(&mut self, k: SlotKey, adj: Position, depth: u32) {
        if depth > MAX_ATTACH_DEPTH {
            return;
        }
        self.arena[k].position = self.arena[k].position.add(adj);
        if let Some(c) = self.arena[k].child {
            self.flood_shift(c, adj, depth + 1);
        }
        if let Some(s) = self.arena[k].sibling {
            self.flood_shift(s, adj, depth + 1);
        }
    }

    pub fn glyph_metric(&mut self, k: SlotKey, metric: GlyphMetric, attr_level: u8, rtl: bool) -> i32 {
        if attr_level > 0 {
            let root = self.find_root(k);
            return self.cluster_metric(root, metric, attr_level, rtl);
        }
        match metric {
            GlyphMetric::Ascent => self.face.ascent,
            GlyphMetric::Descent => self.face.descent,
            _ => {
                let gid = self.arena[k].glyph_id;
                self.face.glyph(gid).map_or(0, |g| g.metric(metric))
            }
        }
    }

    /// Metric over a whole attachment cluster rooted at `k`.
    pub fn cluster_metric(&mut self, k: SlotKey, metric: GlyphMetric, attr_level: u8, rtl: bool) -> i32 {
        use GlyphMetric::*;
        let Some(glyph) = self.face.glyph(self.arena[k].glyph_id) else {
            return 0;
        };
        let mut bbox = glyph.bbox;
        let mut cluster_min = 0.0;
        let res = self.finalise(
            k,
            Position::default(),
            &mut bbox,
            attr_level,
            &mut cluster_min,
            rtl,
            0,
        );
        match metric {
            LsbMetric | BbLeft => bbox.bl.x as i32,
            RsbMetric => (res.x - bbox.tr.x) as i32,
            BbTop => bbox.tr.y as i32,
            BbBottom => bbox.bl.y as i32,
            BbRight => bbox.tr.x as i32,
            BbWidth => (bbox.tr.x - bbox.bl.x) as i32,
            BbHeight => (bbox.tr.y - bbox.bl.y) as i32,
            AdvWidth => res.x as i32,
            AdvHeight => res.y as i32,
            Ascent | Descent => 0,
        }
    }

    // ---- attachment tree ----

    pub(crate) fn remove_child(&mut self, base: SlotKey, ap: SlotKey) -> bool {
        if base == ap {
            return false;
        }
        let Some(child) = self.arena[base].child else {
            return false;
        };
        if child == ap {
            let next_sibling = self.arena[child].sibling;
            self.arena[child].sibling = None;
            self.arena[base].child = next_sibling;
            return true;
        }
        let mut p = Some(child);
        while let Some(pk) = p {
            let sib = self.arena[pk].sibling;
            if sib == Some(ap) {
                self.arena[pk].sibling = self.arena[ap].sibling;
                self.arena[ap].sibling = None;
                return true;
            }
            p = sib;
        }
        false
    }

    pub(crate) fn set_sibling(&mut self, base: SlotKey, ap: SlotKey) -> bool {
        if base == ap {
            return false;
        }
        match self.arena[base].sibling {
            Some(sib) if sib == ap => true,
            Some(sib) => self.set_sibling(sib, ap),
            None => {
                self.arena[base].sibling = Some(ap);
                true
            }
        }
    }

    pub(crate) fn set_child(&mut self, base: SlotKey, ap: SlotKey) -> bool {
        if base == ap {
            return false;
        }
        match self.arena[base].child {
            Some(child) if child == ap => true,
            Some(child) => self.set_sibling(child, ap),
            None => {
                self.arena[base].child = Some(ap);
                true
            }
        }
    }

    /// Root of `k`'s attachment cluster, with a depth guard against
    /// malformed parent cycles.
    pub fn find_root(&self, k: SlotKey) -> SlotKey {
        let mut root = k;
        let mut depth = 0;
        while let Some(p) = self.arena[root].parent {
            root = p;
            depth += 1;
            if depth > MAX_ATTACH_DEPTH {
                break;
            }
        }
        root
    }

    // ---- slot attributes ----

    pub fn slot_attr(&self, k: SlotKey, attr: SlotAttr, subindex: i32) -> i32 {
        use SlotAttr::*;
        let sl = &self.arena[k];
        match attr {
            AdvX => sl.advance.x as i32,
            AdvY => sl.advance.y as i32,
            AttTo => sl.parent.is_some() as i32,
            AttX => sl.attach.x as i32,
            AttY => sl.attach.y as i32,
            AttXOff | AttYOff | AttWithXOff | AttWithYOff => 0,
            AttWithX => sl.with.x as i32,
            AttWithY => sl.with.y as i32,
            AttLevel => sl.att_level as i32,
            Break => self
                .char_info(sl.original)
                .map_or(0, |ci| ci.break_weight as i32),
            CompRef => 0,
            Dir => (self.dir & 1) as i32,
            Insert => sl.can_insert_before() as i32,
            PosX => sl.position.x as i32,
            PosY => sl.position.y as i32,
            ShiftX => sl.shift.x as i32,
            ShiftY => sl.shift.y as i32,
            MeasureSol | MeasureEol => -1,
            JWidth => sl.just as i32,
            UserDefnV1 => sl.user_attr(0) as i32,
            UserDefn => {
                if (0..self.silf.num_user_attrs as i32).contains(&subindex) {
                    sl.user_attr(subindex as usize) as i32
                } else {
                    0
                }
            }
            SegSplit => self.char_info(sl.original).map_or(0, |ci| (ci.flags & 3) as i32),
            BidiLevel => sl.bidi_level as i32,
            Unsupported => 0,
        }
    }

    pub fn set_slot_attr(
        &mut self,
        map: &SlotMap,
        k: SlotKey,
        attr: SlotAttr,
        subindex: i32,
        value: i16,
    ) {
        use SlotAttr::*;
        let (attr, subindex) = if attr == UserDefnV1 {
            if self.silf.num_user_attrs == 0 {
                return;
            }
            (UserDefn, 0)
        } else {
            (attr, subindex)
        };
        match attr {
            AdvX => self.arena[k].advance.x = value as f32,
            AdvY => self.arena[k].advance.y = value as f32,
            AttTo => self.attach_to(map, k, subindex, value),
            AttX => self.arena[k].attach.x = value as f32,
            AttY => self.arena[k].attach.y = value as f32,
            AttWithX => self.arena[k].with.x = value as f32,
            AttWithY => self.arena[k].with.y = value as f32,
            AttLevel => self.arena[k].att_level = value as u8,
            Break => {
                let original = self.arena[k].original;
                if let Some(ci) = self.charinfo.get_mut(original) {
                    ci.break_weight = value;
                }
            }
            Insert => self.arena[k].set_insert_before(value != 0),
            ShiftX => self.arena[k].shift.x = value as f32,
            ShiftY => self.arena[k].shift.y = value as f32,
            JWidth => self.arena[k].just = value as f32,
            SegSplit => {
                let original = self.arena[k].original;
                if let Some(ci) = self.charinfo.get_mut(original) {
                    ci.add_flags((value & 3) as u8);
                }
            }
            UserDefn => {
                if (0..self.silf.num_user_attrs as i32).contains(&subindex) {
                    self.arena[k].user_attrs[subindex as usize] = value;
                }
            }
            // positions are computed, offsets and the rest read-only
            AttXOff | AttYOff | AttWithXOff | AttWithYOff | CompRef | Dir | PosX | PosY
            | MeasureSol | MeasureEol | BidiLevel | UserDefnV1 | Unsupported => {}
        }
    }

    /// `attach.to`: reparent `k` onto the window slot at `idx`, refusing
    /// self-attachment, attachment to a copy, and anything that would
    /// close a cycle.
    fn attach_to(&mut self, map: &SlotMap, k: SlotKey, subindex: i32, value: i16) {
        let idx = value as u16 as usize;
        if idx >= map.size() {
            return;
        }
        let Some(other) = map.get(idx) else { return };
        if other == k || Some(other) == self.arena[k].parent || self.arena[other].is_copied() {
            return;
        }
        if let Some(parent) = self.arena[k].parent {
            self.remove_child(parent, k);
            self.arena[k].parent = None;
        }
        let mut count = 0u32;
        let mut found_self = false;
        let mut p = Some(other);
        while let Some(pk) = p {
            count += 1;
            if pk == k {
                found_self = true;
            }
            if count > MAX_ATTACH_DEPTH {
                break;
            }
            p = self.arena[pk].parent;
        }
        let mut p = self.arena[k].child;
        while let Some(pk) = p {
            count += 1;
            if count > MAX_ATTACH_DEPTH {
                break;
            }
            p = self.arena[pk].child;
        }
        let mut p = self.arena[k].sibling;
        while let Some(pk) = p {
            count += 1;
            if count > MAX_ATTACH_DEPTH {
                break;
            }
            p = self.arena[pk].sibling;
        }
        if count < MAX_ATTACH_DEPTH && !found_self && self.set_child(other, k) {
            self.arena[k].parent = Some(other);
            if map.is_rtl != (idx as i32 > subindex) {
                let adv = self.arena[k].advance.x;
                self.arena[k].with = Position::new(adv, 0.0);
            } else {
                let adv = self.arena[other].advance.x;
                self.arena[k].attach = Position::new(adv, 0.0);
            }
        }
    }

    // ---- features ----

    pub fn feature(&self, index: usize) -> i32 {
        self.feats.get(index).map_or(0, |fv| fv.value as i32)
    }

    pub fn set_feature(&mut self, index: usize, value: i16) {
        if let Some(fv) = self.feats.get_mut(index) {
            fv.value = value;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::face::{ClassMap, Glyph};

    pub(crate) fn test_face(num_glyphs: u16) -> Rc<Face> {
        let glyphs = (0..num_glyphs)
            .map(|i| Glyph {
                advance: Position::new(10.0 * i as f32, 0.0),
                bbox: Rect::new(Position::new(1.0, -2.0), Position::new(8.0, 8.0)),
                attrs: vec![0; 4],
            })
            .collect();
        Rc::new(Face {
            glyphs,
            feature_ids: vec![0x6b_65_72_6e, 0x6c_69_67_61],
            ascent: 800,
            descent: -200,
        })
    }

    pub(crate) fn test_silf() -> Rc<Silf> {
        Rc::new(Silf {
            class_map: ClassMap {
                linear: vec![vec![3, 4, 5], vec![13, 14, 15]],
                lookups: vec![],
            },
            num_user_attrs: 4,
            attr_pseudo: 0,
            attr_break_weight: 1,
            attr_directionality: 2,
        })
    }

    /// An LTR segment of `n` slots with glyphs 1..=n.
    pub(crate) fn small_segment(n: u16) -> Segment {
        let mut seg = Segment::new(test_face(40), test_silf(), false);
        for i in 0..n {
            seg.push_glyph(i + 1, char::from_u32('a' as u32 + i as u32).unwrap());
        }
        seg
    }

    fn chain_keys(seg: &Segment) -> Vec<SlotKey> {
        let mut keys = Vec::new();
        let mut cur = seg.first();
        while let Some(k) = cur {
            keys.push(k);
            cur = seg.slot(k).next();
        }
        keys
    }

    #[test]
    fn push_glyph_builds_chain() {
        let seg = small_segment(3);
        let keys = chain_keys(&seg);
        assert_eq!(keys.len(), 3);
        assert_eq!(seg.num_glyphs, 3);
        assert_eq!(seg.slot(keys[0]).prev(), None);
        assert_eq!(seg.slot(keys[1]).prev(), Some(keys[0]));
        assert_eq!(seg.slot(keys[2]).next(), None);
        assert_eq!(seg.slot(keys[1]).gid(), 2);
        assert_eq!(seg.slot(keys[2]).original(), 2);
    }

    #[test]
    fn reverse_slots_round_trips() {
        let mut seg = small_segment(4);
        let forward = chain_keys(&seg);
        assert!(!seg.curr_dir());
        seg.reverse_slots();
        assert!(seg.curr_dir());
        let backward = chain_keys(&seg);
        let mut expect = forward.clone();
        expect.reverse();
        assert_eq!(backward, expect);
        seg.reverse_slots();
        assert_eq!(chain_keys(&seg), forward);
    }

    #[test]
    fn attach_and_detach_children() {
        let mut seg = small_segment(3);
        let keys = chain_keys(&seg);
        assert!(seg.set_child(keys[0], keys[1]));
        assert!(seg.set_child(keys[0], keys[2]));
        assert_eq!(seg.slot(keys[0]).child, Some(keys[1]));
        assert_eq!(seg.slot(keys[1]).sibling, Some(keys[2]));
        assert!(seg.remove_child(keys[0], keys[1]));
        assert_eq!(seg.slot(keys[0]).child, Some(keys[2]));
        assert!(!seg.set_child(keys[0], keys[0]));
    }

    #[test]
    fn attach_to_sets_parent_and_anchor() {
        let mut seg = small_segment(2);
        let keys = chain_keys(&seg);
        let mut map = SlotMap::new(false, 8);
        map.reset(None, 0);
        map.push_slot(Some(keys[0]));
        map.push_slot(Some(keys[1]));
        // subindex is the 0-based window position of the slot being attached
        seg.set_slot_attr(&map, keys[1], SlotAttr::AttTo, 1, 0);
        assert_eq!(seg.slot(keys[1]).parent(), Some(keys[0]));
        assert_eq!(seg.slot(keys[0]).child, Some(keys[1]));
        assert_eq!(seg.slot_attr(keys[1], SlotAttr::AttTo, 0), 1);
        // attaching to the earlier slot anchors at its advance
        assert_eq!(seg.slot(keys[1]).attach.x, 10.0);
        assert_eq!(seg.find_root(keys[1]), keys[0]);
    }

    #[test]
    fn attach_to_refuses_cycles() {
        let mut seg = small_segment(2);
        let keys = chain_keys(&seg);
        let mut map = SlotMap::new(false, 8);
        map.reset(None, 0);
        map.push_slot(Some(keys[0]));
        map.push_slot(Some(keys[1]));
        seg.set_slot_attr(&map, keys[1], SlotAttr::AttTo, 1, 0);
        // keys[0] may not attach to its own descendant
        seg.set_slot_attr(&map, keys[0], SlotAttr::AttTo, 0, 1);
        assert_eq!(seg.slot(keys[0]).parent(), None);
    }

    #[test]
    fn free_slot_detaches_tree() {
        let mut seg = small_segment(3);
        let keys = chain_keys(&seg);
        seg.set_child(keys[0], keys[1]);
        seg.slot_mut(keys[1]).parent = Some(keys[0]);
        seg.free_slot(keys[0]);
        assert!(seg.try_slot(keys[0]).is_none());
        assert_eq!(seg.slot(keys[1]).parent(), None);
        assert_eq!(seg.first(), Some(keys[1]));
    }

    #[test]
    fn positioning_accumulates_advances() {
        let mut seg = small_segment(3);
        let keys = chain_keys(&seg);
        let total = seg.position_slots(None, None, false);
        // glyphs 1..=3 advance 10, 20, 30
        assert_eq!(total.x, 60.0);
        assert_eq!(seg.slot(keys[0]).position().x, 0.0);
        assert_eq!(seg.slot(keys[1]).position().x, 10.0);
        assert_eq!(seg.slot(keys[2]).position().x, 30.0);
        assert_eq!(seg.positioning_runs(), 1);
    }

    #[test]
    fn attached_slot_positions_relative_to_base() {
        let mut seg = small_segment(2);
        let keys = chain_keys(&seg);
        let mut map = SlotMap::new(false, 8);
        map.reset(None, 0);
        map.push_slot(Some(keys[0]));
        map.push_slot(Some(keys[1]));
        seg.set_slot_attr(&map, keys[1], SlotAttr::AttTo, 1, 0);
        seg.set_slot_attr(&map, keys[1], SlotAttr::AttX, 0, 4);
        seg.set_slot_attr(&map, keys[1], SlotAttr::AttWithX, 0, 1);
        let total = seg.position_slots(None, None, false);
        // child sits at attach - with = 3 from its base
        assert_eq!(seg.slot(keys[1]).position().x, 3.0);
        assert_eq!(total.x, 23.0);
    }

    #[test]
    fn slot_attr_reads_and_writes() {
        let mut seg = small_segment(1);
        let k = seg.first().unwrap();
        let map = SlotMap::new(false, 8);
        seg.set_slot_attr(&map, k, SlotAttr::UserDefn, 2, -7);
        assert_eq!(seg.slot_attr(k, SlotAttr::UserDefn, 2), -7);
        // out of range subindex reads back 0 and ignores writes
        seg.set_slot_attr(&map, k, SlotAttr::UserDefn, 9, 5);
        assert_eq!(seg.slot_attr(k, SlotAttr::UserDefn, 9), 0);
        seg.set_slot_attr(&map, k, SlotAttr::AdvX, 0, 42);
        assert_eq!(seg.slot_attr(k, SlotAttr::AdvX, 0), 42);
        assert_eq!(seg.slot_attr(k, SlotAttr::Dir, 0), 0);
        seg.set_slot_attr(&map, k, SlotAttr::Break, 0, -30);
        assert_eq!(seg.slot_attr(k, SlotAttr::Break, 0), -30);
        assert_eq!(seg.slot_attr(k, SlotAttr::MeasureSol, 0), -1);
        assert_eq!(seg.slot_attr(k, SlotAttr::Unsupported, 0), 0);
    }

    #[test]
    fn features_read_back() {
        let mut seg = small_segment(1);
        assert_eq!(seg.feature(0), 0);
        seg.set_feature(1, 3);
        assert_eq!(seg.feature(1), 3);
        assert_eq!(seg.feature(9), 0);
    }

    #[test]
    fn glyph_metrics_through_segment() {
        let mut seg = small_segment(2);
        let k = seg.first().unwrap();
        assert_eq!(seg.glyph_metric(k, GlyphMetric::AdvWidth, 0, false), 10);
        assert_eq!(seg.glyph_metric(k, GlyphMetric::Ascent, 0, false), 800);
        assert_eq!(seg.cluster_metric(k, GlyphMetric::AdvWidth, 0, false), 10);
    }
}
