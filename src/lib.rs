//! A stack-machine interpreter for compiled smart-font shaping rules.
//!
//! Shaping rules arrive as bytecode programs compiled against a window
//! into a segment's slot chain. [`vm::code::Code`] validates and loads a
//! program once; a [`vm::Machine`] then executes it any number of times
//! against a [`segment::Segment`] through a [`slot_map::SlotMap`]
//! window, substituting, inserting, deleting, attaching and positioning
//! glyph slots as the program directs.
//!
//! Loading is the only fallible step. A loaded program cannot crash the
//! engine: rules that misbehave at run time abort quietly and leave the
//! segment in a consistent state.

pub mod error;
pub mod face;
pub mod segment;
pub mod slot;
pub mod slot_map;
pub mod vm;

pub use error::CodeError;
pub use face::{ClassMap, Face, FeatureValue, Glyph, GlyphMetric, Position, Rect, Silf};
pub use segment::{CharInfo, Segment};
pub use slot::{Slot, SlotAttr, SlotKey};
pub use slot_map::{SlotMap, MAX_SLOTS};
pub use vm::code::{Code, CodeContext, Opcode};
pub use vm::{Machine, Stack, STACK_MAX};
