//! Read-only font-side data the shaping machine consumes: glyphs with
//! metrics and attributes, glyph classes and feature defaults.
//!
//! Building these tables from a binary font is a loader concern and lives
//! outside this crate; here they are plain structs a caller fills in.

/// Glyph identifier.
pub type GID = u16;

/// A 2D offset or absolute position in design units.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Position { x, y }
    }

    pub fn add(self, other: Position) -> Position {
        Position::new(self.x + other.x, self.y + other.y)
    }

    pub fn sub(self, other: Position) -> Position {
        Position::new(self.x - other.x, self.y - other.y)
    }
}

/// Axis-aligned bounding box, bottom-left and top-right corners.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    pub bl: Position,
    pub tr: Position,
}

impl Rect {
    pub fn new(bl: Position, tr: Position) -> Self {
        Rect { bl, tr }
    }

    pub fn add_position(self, pos: Position) -> Rect {
        Rect::new(self.bl.add(pos), self.tr.add(pos))
    }

    /// Smallest rect covering both `self` and `other`.
    pub fn widen(self, other: Rect) -> Rect {
        Rect::new(
            Position::new(self.bl.x.min(other.bl.x), self.bl.y.min(other.bl.y)),
            Position::new(self.tr.x.max(other.tr.x), self.tr.y.max(other.tr.y)),
        )
    }
}

/// The per-glyph and whole-cluster measurements the machine can query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GlyphMetric {
    LsbMetric = 0,
    RsbMetric = 1,
    BbTop = 2,
    BbBottom = 3,
    BbLeft = 4,
    BbRight = 5,
    BbHeight = 6,
    BbWidth = 7,
    AdvWidth = 8,
    AdvHeight = 9,
    Ascent = 10,
    Descent = 11,
}

impl GlyphMetric {
    pub fn from_byte(b: u8) -> Option<GlyphMetric> {
        // discriminants are contiguous from 0
        if b <= GlyphMetric::Descent as u8 {
            Some(unsafe { std::mem::transmute::<u8, GlyphMetric>(b) })
        } else {
            None
        }
    }
}

/// One glyph's metrics and its numbered attribute array.
#[derive(Debug, Clone, Default)]
pub struct Glyph {
    pub advance: Position,
    pub bbox: Rect,
    pub attrs: Vec<i16>,
}

impl Glyph {
    /// Attribute by index, 0 when the glyph does not carry it.
    pub fn attr(&self, index: u16) -> i16 {
        self.attrs.get(index as usize).copied().unwrap_or(0)
    }

    pub(crate) fn metric(&self, metric: GlyphMetric) -> i32 {
        use GlyphMetric::*;
        match metric {
            LsbMetric => self.bbox.bl.x as i32,
            RsbMetric => (self.advance.x - self.bbox.tr.x) as i32,
            BbTop => self.bbox.tr.y as i32,
            BbBottom => self.bbox.bl.y as i32,
            BbLeft => self.bbox.bl.x as i32,
            BbRight => self.bbox.tr.x as i32,
            BbHeight => (self.bbox.tr.y - self.bbox.bl.y) as i32,
            BbWidth => (self.bbox.tr.x - self.bbox.bl.x) as i32,
            AdvWidth => self.advance.x as i32,
            AdvHeight => self.advance.y as i32,
            Ascent | Descent => 0,
        }
    }
}

/// Glyph classes: a run of linear classes (glyph lists indexed by position)
/// followed by lookup classes (sorted glyph -> index pairs).
#[derive(Debug, Clone, Default)]
pub struct ClassMap {
    pub linear: Vec<Vec<GID>>,
    pub lookups: Vec<Vec<(GID, u16)>>,
}

impl ClassMap {
    pub fn num_classes(&self) -> u16 {
        (self.linear.len() + self.lookups.len()) as u16
    }

    /// Index of `gid` within class `cid`, -1 when absent.
    pub fn find_class_index(&self, cid: u16, gid: GID) -> i32 {
        let cid = cid as usize;
        if cid < self.linear.len() {
            self.linear[cid]
                .iter()
                .position(|&g| g == gid)
                .map_or(-1, |i| i as i32)
        } else {
            match self.lookups.get(cid - self.linear.len()) {
                Some(lookup) => lookup
                    .iter()
                    .find(|&&(g, _)| g == gid)
                    .map_or(-1, |&(_, idx)| idx as i32),
                None => -1,
            }
        }
    }

    /// Glyph at `index` within class `cid`, 0 when absent.
    pub fn get_class_glyph(&self, cid: u16, index: i32) -> GID {
        if index < 0 {
            return 0;
        }
        let cid = cid as usize;
        if cid < self.linear.len() {
            self.linear[cid].get(index as usize).copied().unwrap_or(0)
        } else {
            match self.lookups.get(cid - self.linear.len()) {
                Some(lookup) => lookup
                    .iter()
                    .find(|&&(_, idx)| idx as i32 == index)
                    .map_or(0, |&(g, _)| g),
                None => 0,
            }
        }
    }
}

/// A feature a run was shaped with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureValue {
    pub id: u32,
    pub value: i16,
}

/// The font-wide glyph store plus the feature identifiers it defines,
/// in the order features are numbered by compiled rules.
#[derive(Debug, Clone, Default)]
pub struct Face {
    pub glyphs: Vec<Glyph>,
    pub feature_ids: Vec<u32>,
    pub ascent: i32,
    pub descent: i32,
}

impl Face {
    pub fn glyph(&self, gid: GID) -> Option<&Glyph> {
        self.glyphs.get(gid as usize)
    }

    pub fn glyph_attr(&self, gid: GID, attr: u16) -> i16 {
        self.glyph(gid).map_or(0, |g| g.attr(attr))
    }

    /// Number of glyph attributes the face carries, taken as the widest
    /// attribute array in the store.
    pub fn num_attributes(&self) -> u16 {
        self.glyphs.iter().map(|g| g.attrs.len()).max().unwrap_or(0) as u16
    }
}

/// Shaping-table constants the machine needs: class maps, how many user
/// attributes each slot carries, and which glyph attributes hold the
/// pseudo-glyph mapping, break weight and directionality.
#[derive(Debug, Clone, Default)]
pub struct Silf {
    pub class_map: ClassMap,
    pub num_user_attrs: u8,
    pub attr_pseudo: u8,
    pub attr_break_weight: u8,
    pub attr_directionality: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_classes() -> ClassMap {
        ClassMap {
            linear: vec![vec![10, 11, 12], vec![20, 21]],
            lookups: vec![vec![(30, 0), (35, 1), (40, 2)]],
        }
    }

    #[test]
    fn linear_class_roundtrip() {
        let cm = sample_classes();
        assert_eq!(cm.num_classes(), 3);
        assert_eq!(cm.find_class_index(0, 11), 1);
        assert_eq!(cm.get_class_glyph(0, 1), 11);
        assert_eq!(cm.find_class_index(1, 99), -1);
        assert_eq!(cm.get_class_glyph(1, 7), 0);
    }

    #[test]
    fn lookup_class_roundtrip() {
        let cm = sample_classes();
        assert_eq!(cm.find_class_index(2, 35), 1);
        assert_eq!(cm.get_class_glyph(2, 2), 40);
        assert_eq!(cm.find_class_index(2, 34), -1);
        assert_eq!(cm.find_class_index(9, 34), -1);
        assert_eq!(cm.get_class_glyph(9, 0), 0);
    }

    #[test]
    fn glyph_metrics() {
        let g = Glyph {
            advance: Position::new(500.0, 0.0),
            bbox: Rect::new(Position::new(20.0, -100.0), Position::new(450.0, 700.0)),
            attrs: vec![3, 0, 8],
        };
        assert_eq!(g.metric(GlyphMetric::AdvWidth), 500);
        assert_eq!(g.metric(GlyphMetric::LsbMetric), 20);
        assert_eq!(g.metric(GlyphMetric::RsbMetric), 50);
        assert_eq!(g.metric(GlyphMetric::BbHeight), 800);
        assert_eq!(g.attr(2), 8);
        assert_eq!(g.attr(3), 0);
    }
}
