//! The rule interpreter: a bounded operand stack, per-execution
//! registers and a dispatch loop over loaded [`Code`].
//!
//! Execution never fails. A rule that goes wrong at run time (division
//! by zero, walking off the window, exhausting the growth budget) aborts
//! gracefully: the cursor jumps to the end of the segment, a sentinel 1
//! is pushed so constraints read as satisfied, and the loop stops.

pub mod code;

use crate::face::GlyphMetric;
use crate::segment::Segment;
use crate::slot::{SlotAttr, SlotKey};
use crate::slot_map::SlotMap;
use code::{Code, Opcode};

/// Operand stack capacity.
pub const STACK_MAX: usize = 1 << 10;
/// Scratch entries above `STACK_MAX` so the instruction that fills the
/// stack can still complete before the loop stops.
const STACK_GUARD: usize = 2;

const ENGINE_VERSION: i32 = 0x0003_0000;

/// Fixed-size operand stack of 32-bit values.
pub struct Stack {
    vals: [i32; STACK_MAX + STACK_GUARD],
    top: usize,
}

impl Stack {
    fn new() -> Self {
        Stack {
            vals: [0; STACK_MAX + STACK_GUARD],
            top: 0,
        }
    }

    fn push(&mut self, v: i32) {
        self.vals[self.top] = v;
        self.top += 1;
    }

    fn pop(&mut self) -> i32 {
        self.top -= 1;
        self.vals[self.top]
    }

    /// Value a return instruction would produce, 0 on an empty stack.
    pub fn ret_value(&self) -> i32 {
        if self.top == 0 { 0 } else { self.vals[self.top - 1] }
    }

    pub fn depth(&self) -> usize {
        self.top
    }

    fn has_headroom(&self) -> bool {
        self.top < STACK_MAX
    }

    fn clear(&mut self) {
        self.top = 0;
    }
}

/// What the dispatch loop should do after one instruction.
enum Step {
    Continue,
    /// A return instruction ran; the value is on the stack.
    Return,
    /// The rule aborted; the die sentinel is on the stack.
    Fail,
}

/// Registers of one program execution.
struct RegBank {
    /// Current slot under the cursor.
    is: Option<SlotKey>,
    /// Raw index of the cursor into the window's slot array.
    map_idx: usize,
    /// Window index of the first rule slot, 1 + precontext.
    mapb: usize,
    ip: usize,
    /// Cursor into the program's argument buffer.
    data: usize,
    direction: bool,
    positioned: bool,
}

/// A machine executes programs against one segment through one rule
/// window. The stack persists across runs the way rule matching expects:
/// constraints and actions of a rule share it.
pub struct Machine<'s> {
    seg: &'s mut Segment,
    map: &'s mut SlotMap,
    stack: Stack,
}

macro_rules! binop {
    ($self:ident, $method:ident) => {{
        let a = $self.stack.pop();
        let b = $self.stack.pop();
        $self.stack.push(b.$method(a));
        Step::Continue
    }};
}

macro_rules! cmpop {
    ($self:ident, $op:tt) => {{
        let a = $self.stack.pop();
        let b = $self.stack.pop();
        $self.stack.push((b $op a) as i32);
        Step::Continue
    }};
}

impl<'s> Machine<'s> {
    pub fn new(seg: &'s mut Segment, map: &'s mut SlotMap) -> Self {
        Machine {
            seg,
            map,
            stack: Stack::new(),
        }
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn reset_stack(&mut self) {
        self.stack.clear();
    }

    pub fn segment(&mut self) -> &mut Segment {
        self.seg
    }

    pub fn slot_map(&mut self) -> &mut SlotMap {
        self.map
    }

    /// Run `program` with the cursor on window entry `map_idx` (raw,
    /// 1-based like the window itself). Returns the value a return
    /// instruction left on the stack and the final cursor index.
    pub fn run(&mut self, program: &Code, map_idx: usize) -> (i32, usize) {
        let mut reg = RegBank {
            is: self.map.slots.get(map_idx).copied().flatten(),
            map_idx,
            mapb: 1 + self.map.pre_context as usize,
            ip: 0,
            data: 0,
            direction: self.map.is_rtl,
            positioned: false,
        };

        while reg.ip < program.instrs.len() {
            let op = program.instrs[reg.ip];
            log::trace!("{op} ip={} depth={}", reg.ip, self.stack.top);
            match self.exec(op, program, &mut reg) {
                Step::Continue => {
                    if !self.stack.has_headroom() {
                        break;
                    }
                }
                Step::Return | Step::Fail => break,
            }
            reg.ip += 1;
        }

        if reg.map_idx < self.map.slots.len() {
            self.map.slots[reg.map_idx] = reg.is;
        }
        (self.stack.ret_value(), reg.map_idx)
    }

    /// Abort the current rule: jump past everything and leave a sentinel
    /// truth value for whoever inspects the stack.
    fn die(&mut self, reg: &mut RegBank) -> Step {
        reg.is = self.seg.last();
        self.stack.push(1);
        Step::Fail
    }

    /// Window slot at `offset` from the cursor. Loading has checked the
    /// static bounds; a shorter live window just yields `None`.
    fn slot_at(&self, reg: &RegBank, offset: i8) -> Option<SlotKey> {
        let idx = reg.map_idx.checked_add_signed(offset as isize)?;
        self.map.slots.get(idx).copied().flatten()
    }

    fn take_args<'a>(&self, program: &'a Code, reg: &mut RegBank, n: usize) -> &'a [u8] {
        let args = &program.args[reg.data..reg.data + n];
        reg.data += n;
        args
    }

    /// Reposition the chain before a positioned-attribute access, once
    /// per execution.
    fn ensure_positioned(&mut self, reg: &mut RegBank, attr: SlotAttr) {
        if (attr == SlotAttr::PosX || attr == SlotAttr::PosY) && !reg.positioned {
            let begin = self.map.begin();
            let end = self.map.end_minus_1();
            let dir = self.seg.curr_dir();
            self.seg.position_slots(begin, end, dir);
            reg.positioned = true;
        }
    }

    fn exec(&mut self, op: Opcode, program: &Code, reg: &mut RegBank) -> Step {
        use Opcode::*;
        match op {
            Nop => Step::Continue,
            PushByte => {
                let v = self.take_args(program, reg, 1)[0] as i8;
                self.stack.push(v as i32);
                Step::Continue
            }
            PushByteU => {
                let v = self.take_args(program, reg, 1)[0];
                self.stack.push(v as i32);
                Step::Continue
            }
            PushShort => {
                let a = self.take_args(program, reg, 2);
                self.stack.push(i16::from_be_bytes([a[0], a[1]]) as i32);
                Step::Continue
            }
            PushShortU => {
                let a = self.take_args(program, reg, 2);
                self.stack.push(u16::from_be_bytes([a[0], a[1]]) as i32);
                Step::Continue
            }
            PushLong => {
                let a = self.take_args(program, reg, 4);
                self.stack.push(i32::from_be_bytes([a[0], a[1], a[2], a[3]]));
                Step::Continue
            }
            Add => binop!(self, wrapping_add),
            Sub => binop!(self, wrapping_sub),
            Mul => binop!(self, wrapping_mul),
            Div => {
                let b = self.stack.pop();
                let a = self.stack.pop();
                if b == 0 || (a == i32::MIN && b == -1) {
                    return self.die(reg);
                }
                self.stack.push(a / b);
                Step::Continue
            }
            Min => binop!(self, min),
            Max => binop!(self, max),
            Neg => {
                let v = self.stack.pop();
                self.stack.push(v.wrapping_neg());
                Step::Continue
            }
            Trunc8 => {
                let v = self.stack.pop();
                self.stack.push(v as u8 as i32);
                Step::Continue
            }
            Trunc16 => {
                let v = self.stack.pop();
                self.stack.push(v as u16 as i32);
                Step::Continue
            }
            Cond => {
                let f = self.stack.pop();
                let t = self.stack.pop();
                let c = self.stack.pop();
                self.stack.push(if c != 0 { t } else { f });
                Step::Continue
            }
            And => {
                let a = self.stack.pop() != 0;
                let b = self.stack.pop() != 0;
                self.stack.push((b && a) as i32);
                Step::Continue
            }
            Or => {
                let a = self.stack.pop() != 0;
                let b = self.stack.pop() != 0;
                self.stack.push((b || a) as i32);
                Step::Continue
            }
            Not => {
                let v = self.stack.pop();
                self.stack.push((v == 0) as i32);
                Step::Continue
            }
            Equal => cmpop!(self, ==),
            NotEq => cmpop!(self, !=),
            Less => cmpop!(self, <),
            Gtr => cmpop!(self, >),
            LessEq => cmpop!(self, <=),
            GtrEq => cmpop!(self, >=),
            Next | CopyNext => {
                // window indices start at 1
                if reg.map_idx as isize - 1 >= self.map.size() as isize {
                    return self.die(reg);
                }
                if let Some(is) = reg.is {
                    if Some(is) == self.map.highwater {
                        self.map.highpassed = true;
                    }
                    reg.is = self.seg.slot(is).next();
                }
                reg.map_idx += 1;
                Step::Continue
            }
            PutGlyph8bitObs => {
                let class = self.take_args(program, reg, 1)[0] as u16;
                if let Some(is) = reg.is {
                    let gid = self.seg.silf().class_map.get_class_glyph(class, 0);
                    self.seg.set_glyph(is, gid);
                }
                Step::Continue
            }
            PutGlyph => {
                let a = self.take_args(program, reg, 2);
                let class = u16::from_be_bytes([a[0], a[1]]);
                if let Some(is) = reg.is {
                    let gid = self.seg.silf().class_map.get_class_glyph(class, 0);
                    self.seg.set_glyph(is, gid);
                }
                Step::Continue
            }
            PutSubs8bitObs => {
                let a = self.take_args(program, reg, 3);
                let (offset, input, output) = (a[0] as i8, a[1] as u16, a[2] as u16);
                self.put_subs(reg, offset, input, output);
                Step::Continue
            }
            PutSubs => {
                let a = self.take_args(program, reg, 5);
                let offset = a[0] as i8;
                let input = u16::from_be_bytes([a[1], a[2]]);
                let output = u16::from_be_bytes([a[3], a[4]]);
                self.put_subs(reg, offset, input, output);
                Step::Continue
            }
            PutCopy => {
                let offset = self.take_args(program, reg, 1)[0] as i8;
                self.put_copy(reg, offset)
            }
            Insert => self.insert(reg),
            Delete => self.delete(reg),
            Assoc => {
                let num = program.args[reg.data] as usize;
                let offsets = self.take_args(program, reg, num + 1)[1..].to_vec();
                self.assoc(reg, &offsets);
                Step::Continue
            }
            CntxtItem => {
                let a = self.take_args(program, reg, 3);
                let (is_arg, iskip, dskip) = (a[0] as i8, a[1] as usize, a[2] as usize);
                if reg.mapb.checked_add_signed(is_arg as isize) != Some(reg.map_idx) {
                    reg.ip += iskip;
                    reg.data += dskip;
                    self.stack.push(1);
                }
                Step::Continue
            }
            AttrSet => {
                let attr = SlotAttr::from_byte(self.take_args(program, reg, 1)[0]);
                let val = self.stack.pop();
                if let Some(is) = reg.is {
                    self.seg.set_slot_attr(self.map, is, attr, 0, val as i16);
                }
                Step::Continue
            }
            AttrAdd | AttrSub => {
                let attr = SlotAttr::from_byte(self.take_args(program, reg, 1)[0]);
                let val = self.stack.pop();
                self.ensure_positioned(reg, attr);
                if let Some(is) = reg.is {
                    let old = self.seg.slot_attr(is, attr, 0);
                    let new = if op == AttrAdd { val.wrapping_add(old) } else { old.wrapping_sub(val) };
                    self.seg.set_slot_attr(self.map, is, attr, 0, new as i16);
                }
                Step::Continue
            }
            AttrSetSlot => {
                let attr = SlotAttr::from_byte(self.take_args(program, reg, 1)[0]);
                let offset = (reg.map_idx as i32 - 1) * (attr == SlotAttr::AttTo) as i32;
                let val = self.stack.pop() + offset;
                if let Some(is) = reg.is {
                    self.seg.set_slot_attr(self.map, is, attr, offset, val as i16);
                }
                Step::Continue
            }
            IAttrSetSlot => {
                let a = self.take_args(program, reg, 2);
                let (attr, idx) = (SlotAttr::from_byte(a[0]), a[1] as i32);
                let offset = (reg.map_idx as i32 - 1) * (attr == SlotAttr::AttTo) as i32;
                let val = self.stack.pop() + offset;
                if let Some(is) = reg.is {
                    self.seg.set_slot_attr(self.map, is, attr, idx, val as i16);
                }
                Step::Continue
            }
            IAttrSet => {
                let a = self.take_args(program, reg, 2);
                let (attr, idx) = (SlotAttr::from_byte(a[0]), a[1] as i32);
                let val = self.stack.pop();
                if let Some(is) = reg.is {
                    self.seg.set_slot_attr(self.map, is, attr, idx, val as i16);
                }
                Step::Continue
            }
            IAttrAdd | IAttrSub => {
                let a = self.take_args(program, reg, 2);
                let (attr, idx) = (SlotAttr::from_byte(a[0]), a[1] as i32);
                let val = self.stack.pop();
                self.ensure_positioned(reg, attr);
                if let Some(is) = reg.is {
                    let old = self.seg.slot_attr(is, attr, idx);
                    let new = if op == IAttrAdd { val.wrapping_add(old) } else { old.wrapping_sub(val) };
                    self.seg.set_slot_attr(self.map, is, attr, idx, new as i16);
                }
                Step::Continue
            }
            PushSlotAttr => {
                let a = self.take_args(program, reg, 2);
                let (attr, offset) = (SlotAttr::from_byte(a[0]), a[1] as i8);
                self.ensure_positioned(reg, attr);
                if let Some(slot) = self.slot_at(reg, offset) {
                    let v = self.seg.slot_attr(slot, attr, 0);
                    self.stack.push(v);
                }
                Step::Continue
            }
            PushISlotAttr => {
                let a = self.take_args(program, reg, 3);
                let (attr, offset, idx) = (SlotAttr::from_byte(a[0]), a[1] as i8, a[2] as i32);
                self.ensure_positioned(reg, attr);
                if let Some(slot) = self.slot_at(reg, offset) {
                    let v = self.seg.slot_attr(slot, attr, idx);
                    self.stack.push(v);
                }
                Step::Continue
            }
            PushGlyphAttrObs => {
                let a = self.take_args(program, reg, 2);
                let (gattr, offset) = (a[0] as u16, a[1] as i8);
                if let Some(slot) = self.slot_at(reg, offset) {
                    let gid = self.seg.slot(slot).gid();
                    self.stack.push(self.seg.face().glyph_attr(gid, gattr) as i32);
                }
                Step::Continue
            }
            PushGlyphAttr => {
                let a = self.take_args(program, reg, 3);
                let gattr = u16::from_be_bytes([a[0], a[1]]);
                let offset = a[2] as i8;
                if let Some(slot) = self.slot_at(reg, offset) {
                    let gid = self.seg.slot(slot).gid();
                    self.stack.push(self.seg.face().glyph_attr(gid, gattr) as i32);
                }
                Step::Continue
            }
            PushAttToGattrObs => {
                let a = self.take_args(program, reg, 2);
                let (gattr, offset) = (a[0] as u16, a[1] as i8);
                if let Some(slot) = self.slot_at(reg, offset) {
                    let slot = self.seg.slot(slot).parent().unwrap_or(slot);
                    let gid = self.seg.slot(slot).gid();
                    self.stack.push(self.seg.face().glyph_attr(gid, gattr) as i32);
                }
                Step::Continue
            }
            PushAttToGlyphAttr => {
                let a = self.take_args(program, reg, 3);
                let gattr = u16::from_be_bytes([a[0], a[1]]);
                let offset = a[2] as i8;
                if let Some(slot) = self.slot_at(reg, offset) {
                    let slot = self.seg.slot(slot).parent().unwrap_or(slot);
                    let gid = self.seg.slot(slot).gid();
                    self.stack.push(self.seg.face().glyph_attr(gid, gattr) as i32);
                }
                Step::Continue
            }
            PushGlyphMetric => {
                let a = self.take_args(program, reg, 3);
                let (metric, offset, level) = (a[0], a[1] as i8, a[2]);
                if let (Some(slot), Some(metric)) =
                    (self.slot_at(reg, offset), GlyphMetric::from_byte(metric))
                {
                    let v = self.seg.glyph_metric(slot, metric, level, reg.direction);
                    self.stack.push(v);
                }
                Step::Continue
            }
            PushAttToGlyphMetric => {
                let a = self.take_args(program, reg, 3);
                let (metric, offset, level) = (a[0], a[1] as i8, a[2]);
                if let (Some(slot), Some(metric)) =
                    (self.slot_at(reg, offset), GlyphMetric::from_byte(metric))
                {
                    let slot = self.seg.slot(slot).parent().unwrap_or(slot);
                    let v = self.seg.glyph_metric(slot, metric, level, reg.direction);
                    self.stack.push(v);
                }
                Step::Continue
            }
            PushFeat => {
                let a = self.take_args(program, reg, 2);
                let (feat, offset) = (a[0] as usize, a[1] as i8);
                if self.slot_at(reg, offset).is_some() {
                    self.stack.push(self.seg.feature(feat));
                }
                Step::Continue
            }
            SetFeat => {
                let a = self.take_args(program, reg, 2);
                let (feat, offset) = (a[0] as usize, a[1] as i8);
                if self.slot_at(reg, offset).is_some() {
                    let val = self.stack.pop();
                    self.seg.set_feature(feat, val as i16);
                }
                Step::Continue
            }
            PopRet => {
                let v = self.stack.pop();
                self.stack.push(v);
                Step::Return
            }
            RetZero => {
                self.stack.push(0);
                Step::Return
            }
            RetTrue => {
                self.stack.push(1);
                Step::Return
            }
            PushProcState => {
                self.take_args(program, reg, 1);
                self.stack.push(1);
                Step::Continue
            }
            PushVersion => {
                self.stack.push(ENGINE_VERSION);
                Step::Continue
            }
            BitOr => {
                let a = self.stack.pop();
                let b = self.stack.pop();
                self.stack.push(b | a);
                Step::Continue
            }
            BitAnd => {
                let a = self.stack.pop();
                let b = self.stack.pop();
                self.stack.push(b & a);
                Step::Continue
            }
            BitNot => {
                let v = self.stack.pop();
                self.stack.push(!v);
                Step::Continue
            }
            BitSet => {
                let a = self.take_args(program, reg, 4);
                let mask = u16::from_be_bytes([a[0], a[1]]) as i32;
                let value = u16::from_be_bytes([a[2], a[3]]) as i32;
                let v = self.stack.pop();
                self.stack.push((v & !mask) | value);
                Step::Continue
            }
            TempCopy => self.temp_copy(reg),
            // rejected at load time
            NextN | PushIGlyphAttr | PutSubs2 | PutSubs3 => Step::Continue,
        }
    }

    fn put_subs(&mut self, reg: &mut RegBank, offset: i8, input: u16, output: u16) {
        let Some(slot) = self.slot_at(reg, offset) else {
            return;
        };
        let Some(is) = reg.is else { return };
        let gid = self.seg.slot(slot).gid();
        let class_map = &self.seg.silf().class_map;
        let index = class_map.find_class_index(input, gid);
        let out_gid = class_map.get_class_glyph(output, index);
        self.seg.set_glyph(is, out_gid);
    }

    /// Overwrite the current slot with the state of another window slot,
    /// keeping our chain links and charinfo identity.
    fn put_copy(&mut self, reg: &mut RegBank, offset: i8) -> Step {
        let Some(is) = reg.is else { return Step::Continue };
        if self.seg.slot(is).is_deleted() {
            return Step::Continue;
        }
        if let Some(src) = self.slot_at(reg, offset) {
            if src != is {
                let dst = self.seg.slot(is);
                if dst.parent().is_some() || dst.child.is_some() {
                    return self.die(reg);
                }
                let prev = dst.prev();
                let next = dst.next();
                let mut user_attrs = dst.user_attrs.clone();

                let mut copy = self.seg.slot(src).clone();
                for (dst_ua, src_ua) in user_attrs.iter_mut().zip(&copy.user_attrs) {
                    *dst_ua = *src_ua;
                }
                copy.child = None;
                copy.sibling = None;
                copy.user_attrs = user_attrs;
                copy.prev = prev;
                copy.next = next;
                let parent = copy.parent;
                *self.seg.slot_mut(is) = copy;
                if let Some(p) = parent {
                    self.seg.slot_mut(p).child = Some(is);
                }
            }
        }
        self.seg.slot_mut(is).mark_copied(false);
        self.seg.slot_mut(is).mark_deleted(false);
        Step::Continue
    }

    /// Insert a fresh slot before the cursor and make it current. Dies
    /// when the growth budget is spent.
    fn insert(&mut self, reg: &mut RegBank) -> Step {
        if self.map.dec_max() <= 0 {
            return self.die(reg);
        }
        let new = self.seg.new_slot();

        let mut iss = reg.is;
        while let Some(k) = iss {
            if !self.seg.slot(k).is_deleted() {
                break;
            }
            iss = self.seg.slot(k).next();
        }
        match iss {
            None => match self.seg.last() {
                Some(last) => {
                    self.seg.slot_mut(last).next = Some(new);
                    let before = self.seg.slot(last).before();
                    let sl = self.seg.slot_mut(new);
                    sl.prev = Some(last);
                    sl.before = before;
                    self.seg.set_last(Some(new));
                }
                None => {
                    self.seg.set_first(Some(new));
                    self.seg.set_last(Some(new));
                }
            },
            Some(next) => match self.seg.slot(next).prev() {
                Some(prev) => {
                    self.seg.slot_mut(prev).next = Some(new);
                    let before = self.seg.slot(prev).after();
                    let sl = self.seg.slot_mut(new);
                    sl.prev = Some(prev);
                    sl.before = before;
                }
                None => {
                    let before = self.seg.slot(next).before();
                    let sl = self.seg.slot_mut(new);
                    sl.prev = None;
                    sl.before = before;
                    self.seg.set_first(Some(new));
                }
            },
        }
        self.seg.slot_mut(new).next = iss;
        match iss {
            Some(next) => {
                self.seg.slot_mut(next).prev = Some(new);
                let (original, after) = {
                    let sl = self.seg.slot(next);
                    (sl.original(), sl.before())
                };
                let sl = self.seg.slot_mut(new);
                sl.original = original;
                sl.after = after;
            }
            None => {
                if let Some(prev) = self.seg.slot(new).prev() {
                    let (original, after) = {
                        let sl = self.seg.slot(prev);
                        (sl.original(), sl.after())
                    };
                    let sl = self.seg.slot_mut(new);
                    sl.original = original;
                    sl.after = after;
                }
            }
        }
        if reg.is == self.map.highwater {
            self.map.highpassed = false;
        }
        reg.is = Some(new);
        self.seg.num_glyphs += 1;
        if reg.map_idx != 0 {
            reg.map_idx -= 1;
        }
        Step::Continue
    }

    /// Unlink and mark the current slot deleted. The arena entry stays
    /// until garbage collection.
    fn delete(&mut self, reg: &mut RegBank) -> Step {
        let Some(is) = reg.is else { return self.die(reg) };
        if self.seg.slot(is).is_deleted() {
            return self.die(reg);
        }
        self.seg.slot_mut(is).mark_deleted(true);
        let prev = self.seg.slot(is).prev();
        let next = self.seg.slot(is).next();
        match prev {
            Some(p) => self.seg.slot_mut(p).next = next,
            None => self.seg.set_first(next),
        }
        match next {
            Some(n) => self.seg.slot_mut(n).prev = prev,
            None => self.seg.set_last(prev),
        }
        if Some(is) == self.map.highwater {
            self.map.highwater = next;
        }
        self.seg.num_glyphs -= 1;
        Step::Continue
    }

    /// Point the current slot's character range at the given input
    /// slots: before becomes the earliest, after the latest.
    fn assoc(&mut self, reg: &mut RegBank, offsets: &[u8]) {
        let mut min: Option<usize> = None;
        let mut max: Option<usize> = None;
        for &off in offsets {
            if let Some(k) = self.slot_at(reg, off as i8) {
                let sl = self.seg.slot(k);
                if min.is_none_or(|m| sl.before() < m) {
                    min = Some(sl.before());
                }
                if max.is_none_or(|m| sl.after() > m) {
                    max = Some(sl.after());
                }
            }
        }
        if let (Some(min), Some(max), Some(is)) = (min, max, reg.is) {
            let sl = self.seg.slot_mut(is);
            sl.before = min;
            sl.after = max;
        }
    }

    /// Clone the current slot into a fresh arena entry marked as a copy
    /// and substitute it into the window, freezing the state later
    /// references will see.
    fn temp_copy(&mut self, reg: &mut RegBank) -> Step {
        let Some(is) = reg.is else { return self.die(reg) };
        let mut copy = self.seg.slot(is).clone();
        copy.mark_copied(true);
        let new = self.seg.new_slot();
        *self.seg.slot_mut(new) = copy;
        if reg.map_idx < self.map.slots.len() {
            self.map.slots[reg.map_idx] = Some(new);
        }
        Step::Continue
    }
}
