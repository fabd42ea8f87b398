//! Bytecode loading and validation.
//!
//! A rule program arrives as a raw byte stream of interleaved opcodes and
//! operands. [`Code::new`] decodes it once into an instruction vector plus
//! a flat argument buffer, rejecting anything the machine could not run
//! safely: unknown or unimplemented opcodes, truncated operands, slot and
//! class references outside the declared bounds, and programs whose stack
//! discipline would underflow. Context items are decoded recursively so
//! their on-disk byte skip can be split into an instruction skip and a
//! data skip. A final analysis pass inserts [`Opcode::TempCopy`] in front
//! of slots that are both modified and referenced later, so constraints
//! see the pre-rule state.

use std::fmt;

use crate::error::CodeError;
use crate::slot::NUM_ATTR_CODES;

/// Marker in the parameter-size table for variable-length operand lists.
const VAR_ARGS: u8 = 0xff;

/// Highest glyph metric byte accepted by the loader.
const MAX_METRIC: u16 = 11;

/// Slot attribute bytes that take the user-attribute form.
const ATTR_COMP_REF: u8 = 15;
const ATTR_USER_DEFN: u8 = 55;

/// Machine opcodes. Byte values on disk run from 0 up to (but not
/// including) [`Opcode::TempCopy`], which only the load-time analysis may
/// emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    PushByte,
    PushByteU,
    PushShort,
    PushShortU,
    PushLong,
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Neg,
    Trunc8,
    Trunc16,
    Cond,
    And,
    Or,
    Not,
    Equal,
    NotEq,
    Less,
    Gtr,
    LessEq,
    GtrEq,
    Next,
    NextN,
    CopyNext,
    PutGlyph8bitObs,
    PutSubs8bitObs,
    PutCopy,
    Insert,
    Delete,
    Assoc,
    CntxtItem,
    AttrSet,
    AttrAdd,
    AttrSub,
    AttrSetSlot,
    IAttrSetSlot,
    PushSlotAttr,
    PushGlyphAttrObs,
    PushGlyphMetric,
    PushFeat,
    PushAttToGattrObs,
    PushAttToGlyphMetric,
    PushISlotAttr,
    PushIGlyphAttr,
    PopRet,
    RetZero,
    RetTrue,
    IAttrSet,
    IAttrAdd,
    IAttrSub,
    PushProcState,
    PushVersion,
    PutSubs,
    PutSubs2,
    PutSubs3,
    PutGlyph,
    PushGlyphAttr,
    PushAttToGlyphAttr,
    BitOr,
    BitAnd,
    BitNot,
    BitSet,
    SetFeat,
    TempCopy,
}

impl Opcode {
    pub const MAX_OPCODE: u8 = Opcode::TempCopy as u8;

    /// Decode an on-disk opcode byte. `TempCopy` is private and never
    /// decodes.
    pub fn from_byte(b: u8) -> Option<Opcode> {
        if b < Self::MAX_OPCODE {
            // discriminants are contiguous from 0
            Some(unsafe { std::mem::transmute::<u8, Opcode>(b) })
        } else {
            None
        }
    }

    /// Operand bytes this opcode consumes, or [`VAR_ARGS`].
    fn param_size(self) -> u8 {
        use Opcode::*;
        match self {
            PushByte | PushByteU | NextN | PutGlyph8bitObs | PutCopy | AttrSet | AttrAdd
            | AttrSub | AttrSetSlot | PushProcState => 1,
            PushShort | PushShortU | CntxtItem | IAttrSetSlot | PushSlotAttr
            | PushGlyphAttrObs | PushFeat | PushAttToGattrObs | IAttrSet | IAttrAdd | IAttrSub
            | PutGlyph | SetFeat => 2,
            PutSubs8bitObs | PushGlyphMetric | PushAttToGlyphMetric | PushISlotAttr
            | PushIGlyphAttr | PushGlyphAttr | PushAttToGlyphAttr => 3,
            PushLong | BitSet => 4,
            PutSubs => 5,
            Assoc => VAR_ARGS,
            _ => 0,
        }
    }

    pub fn is_return(self) -> bool {
        matches!(self, Opcode::PopRet | Opcode::RetZero | Opcode::RetTrue)
    }

    /// Whether this opcode has an implementation on the given side.
    /// Mutating opcodes only exist in rule actions; `CntxtItem` only in
    /// constraints. A few opcodes are reserved and run nowhere.
    fn has_impl(self, constraint: bool) -> bool {
        use Opcode::*;
        match self {
            NextN | PushIGlyphAttr | PutSubs2 | PutSubs3 => false,
            CntxtItem => constraint,
            Next | CopyNext | PutGlyph8bitObs | PutSubs8bitObs | PutCopy | Insert | Delete
            | Assoc | AttrSet | AttrAdd | AttrSub | AttrSetSlot | IAttrSetSlot | IAttrSet
            | IAttrAdd | IAttrSub | PutSubs | PutGlyph | SetFeat | TempCopy => !constraint,
            _ => true,
        }
    }

    fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Nop => "NOP",
            PushByte => "PUSH_BYTE",
            PushByteU => "PUSH_BYTE_U",
            PushShort => "PUSH_SHORT",
            PushShortU => "PUSH_SHORT_U",
            PushLong => "PUSH_LONG",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Min => "MIN",
            Max => "MAX",
            Neg => "NEG",
            Trunc8 => "TRUNC8",
            Trunc16 => "TRUNC16",
            Cond => "COND",
            And => "AND",
            Or => "OR",
            Not => "NOT",
            Equal => "EQUAL",
            NotEq => "NOT_EQ",
            Less => "LESS",
            Gtr => "GTR",
            LessEq => "LESS_EQ",
            GtrEq => "GTR_EQ",
            Next => "NEXT",
            NextN => "NEXT_N",
            CopyNext => "COPY_NEXT",
            PutGlyph8bitObs => "PUT_GLYPH_8BIT_OBS",
            PutSubs8bitObs => "PUT_SUBS_8BIT_OBS",
            PutCopy => "PUT_COPY",
            Insert => "INSERT",
            Delete => "DELETE",
            Assoc => "ASSOC",
            CntxtItem => "CNTXT_ITEM",
            AttrSet => "ATTR_SET",
            AttrAdd => "ATTR_ADD",
            AttrSub => "ATTR_SUB",
            AttrSetSlot => "ATTR_SET_SLOT",
            IAttrSetSlot => "IATTR_SET_SLOT",
            PushSlotAttr => "PUSH_SLOT_ATTR",
            PushGlyphAttrObs => "PUSH_GLYPH_ATTR_OBS",
            PushGlyphMetric => "PUSH_GLYPH_METRIC",
            PushFeat => "PUSH_FEAT",
            PushAttToGattrObs => "PUSH_ATT_TO_GATTR_OBS",
            PushAttToGlyphMetric => "PUSH_ATT_TO_GLYPH_METRIC",
            PushISlotAttr => "PUSH_ISLOT_ATTR",
            PushIGlyphAttr => "PUSH_IGLYPH_ATTR",
            PopRet => "POP_RET",
            RetZero => "RET_ZERO",
            RetTrue => "RET_TRUE",
            IAttrSet => "IATTR_SET",
            IAttrAdd => "IATTR_ADD",
            IAttrSub => "IATTR_SUB",
            PushProcState => "PUSH_PROC_STATE",
            PushVersion => "PUSH_VERSION",
            PutSubs => "PUT_SUBS",
            PutSubs2 => "PUT_SUBS2",
            PutSubs3 => "PUT_SUBS3",
            PutGlyph => "PUT_GLYPH",
            PushGlyphAttr => "PUSH_GLYPH_ATTR",
            PushAttToGlyphAttr => "PUSH_ATT_TO_GLYPH_ATTR",
            BitOr => "BITOR",
            BitAnd => "BITAND",
            BitNot => "BITNOT",
            BitSet => "BITSET",
            SetFeat => "SET_FEAT",
            TempCopy => "TEMP_COPY",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bounds a program is validated against: the shaping table the rule was
/// compiled for tells us how many classes, glyph attributes, features and
/// per-slot user attributes exist.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeContext {
    pub num_classes: u16,
    pub num_attributes: u16,
    pub num_features: u16,
    pub num_user_attrs: u8,
}

/// A validated rule program.
#[derive(Debug, Clone, Default)]
pub struct Code {
    pub(crate) instrs: Vec<Opcode>,
    /// Operands for `instrs`, concatenated in instruction order.
    pub(crate) args: Vec<u8>,
    /// Largest rule-relative slot index the program touches.
    pub max_ref: i32,
    pub constraint: bool,
    /// Program may delete slots (or leaves temporary copies behind).
    pub deletes: bool,
    /// Program may substitute glyphs.
    pub modifies: bool,
}

impl Code {
    /// Decode and validate `bytecode`. `pre_context` and `rule_length`
    /// describe the window the rule was compiled against.
    pub fn new(
        is_constraint: bool,
        bytecode: &[u8],
        pre_context: u8,
        rule_length: u16,
        context: &CodeContext,
    ) -> Result<Code, CodeError> {
        Code::decode(is_constraint, bytecode, pre_context, rule_length, context)
            .inspect_err(|e| log::warn!("rule program rejected: {e}"))
    }

    fn decode(
        is_constraint: bool,
        bytecode: &[u8],
        pre_context: u8,
        rule_length: u16,
        context: &CodeContext,
    ) -> Result<Code, CodeError> {
        if bytecode.is_empty() {
            return Ok(Code {
                constraint: is_constraint,
                ..Code::default()
            });
        }
        let limits = Limits {
            pre_context: pre_context as u16,
            rule_length,
            classes: context.num_classes,
            glyf_attrs: context.num_attributes,
            features: context.num_features,
            num_user_attrs: context.num_user_attrs,
        };
        let mut dec = Decoder::new(is_constraint, limits);
        let last = dec.load(bytecode)?;

        if dec.code.instrs.is_empty() {
            return Ok(dec.code);
        }
        if !last.is_some_and(Opcode::is_return) {
            return Err(CodeError::MissingReturn);
        }
        dec.apply_analysis();
        Ok(dec.code)
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn instruction_count(&self) -> usize {
        self.instrs.len()
    }
}

const NUM_CONTEXTS: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
struct CtxtInfo {
    code_ref: u8,
    changed: bool,
    referenced: bool,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    pre_context: u16,
    rule_length: u16,
    classes: u16,
    glyf_attrs: u16,
    features: u16,
    num_user_attrs: u8,
}

impl Limits {
    /// Subindex bound for indexed attribute opcodes, per attribute byte.
    fn attr_subindex_limit(&self, attr: u8) -> u16 {
        match attr {
            ATTR_COMP_REF => 255,
            0..=29 => 1,
            ATTR_USER_DEFN => self.num_user_attrs as u16,
            _ => 0,
        }
    }
}

struct Decoder {
    code: Code,
    /// Conservative lower bound on stack occupancy.
    stack_depth: i32,
    out_index: i32,
    out_length: i32,
    slot_ref: i32,
    in_ctxt_item: bool,
    contexts: [CtxtInfo; NUM_CONTEXTS],
    max: Limits,
}

fn valid_upto(limit: u16, x: u16) -> Result<(), CodeError> {
    if limit != 0 && x < limit {
        Ok(())
    } else {
        Err(CodeError::OutOfRangeData)
    }
}

impl Decoder {
    fn new(is_constraint: bool, max: Limits) -> Decoder {
        let (out_index, out_length) = if is_constraint {
            (0, 1)
        } else {
            (max.pre_context as i32, max.rule_length as i32)
        };
        Decoder {
            code: Code {
                constraint: is_constraint,
                ..Code::default()
            },
            stack_depth: 0,
            out_index,
            out_length,
            slot_ref: 0,
            in_ctxt_item: false,
            contexts: [CtxtInfo::default(); NUM_CONTEXTS],
            max,
        }
    }

    /// Walk the byte stream, validating and emitting each instruction.
    /// Returns the last opcode seen.
    fn load(&mut self, mut bc: &[u8]) -> Result<Option<Opcode>, CodeError> {
        let mut last = None;
        while !bc.is_empty() {
            let opc = self.fetch_opcode(bc[0], &bc[1..])?;
            bc = &bc[1..];
            self.analyse_opcode(opc, bc);
            bc = self.emit_opcode(opc, bc)?;
            last = Some(opc);
        }
        Ok(last)
    }

    fn validate_opcode(&self, byte: u8, bc: &[u8]) -> Result<Opcode, CodeError> {
        let Some(opc) = Opcode::from_byte(byte) else {
            return Err(CodeError::InvalidOpcode(byte));
        };
        if !opc.has_impl(self.code.constraint) {
            return Err(CodeError::UnimplementedOpcode(opc));
        }
        let mut param_size = opc.param_size();
        if param_size == VAR_ARGS {
            if bc.is_empty() {
                return Err(CodeError::ArgumentsExhausted);
            }
            param_size = bc[0] + 1;
        }
        if bc.len() < param_size as usize {
            return Err(CodeError::ArgumentsExhausted);
        }
        Ok(opc)
    }

    /// Sanity-check one opcode and its operands as far as statically
    /// possible. `bc` starts at the operands.
    fn fetch_opcode(&mut self, byte: u8, bc: &[u8]) -> Result<Opcode, CodeError> {
        use Opcode::*;
        let opc = self.validate_opcode(byte, bc)?;
        match opc {
            PushByte | PushByteU | PushShort | PushShortU | PushLong | PushIGlyphAttr
            | PushProcState | PushVersion => self.stack_depth += 1,
            Add | Sub | Mul | Div | Min | Max | And | Or | Equal | NotEq | Less | Gtr
            | LessEq | GtrEq | BitOr | BitAnd => {
                self.stack_depth -= 1;
                if self.stack_depth <= 0 {
                    return Err(CodeError::UnderfullStack);
                }
            }
            Neg | Trunc8 | Trunc16 | Not | BitNot | BitSet => {
                if self.stack_depth <= 0 {
                    return Err(CodeError::UnderfullStack);
                }
            }
            Cond => {
                self.stack_depth -= 2;
                if self.stack_depth <= 0 {
                    return Err(CodeError::UnderfullStack);
                }
            }
            Next | CopyNext => {
                self.out_index += 1;
                if self.out_index < -1
                    || self.out_index > self.out_length
                    || self.slot_ref > self.max.rule_length as i32
                {
                    return Err(CodeError::OutOfRangeData);
                }
            }
            PutGlyph8bitObs => {
                valid_upto(self.max.classes, bc[0] as u16)?;
                self.test_context()?;
            }
            PutSubs8bitObs => {
                self.test_ref(bc[0])?;
                valid_upto(self.max.classes, bc[1] as u16)?;
                valid_upto(self.max.classes, bc[2] as u16)?;
                self.test_context()?;
            }
            PutCopy => {
                self.test_ref(bc[0])?;
                self.test_context()?;
            }
            Insert => {
                self.out_length += 1;
                if self.out_index < 0 {
                    self.out_index += 1;
                }
                if self.out_index < -1 || self.out_index >= self.out_length {
                    return Err(CodeError::OutOfRangeData);
                }
            }
            Delete => {
                if self.out_index < self.max.pre_context as i32 {
                    return Err(CodeError::OutOfRangeData);
                }
                self.out_index -= 1;
                self.out_length -= 1;
                if self.out_index < -1 || self.out_index > self.out_length {
                    return Err(CodeError::OutOfRangeData);
                }
            }
            Assoc => {
                if bc[0] == 0 {
                    return Err(CodeError::OutOfRangeData);
                }
                for i in 1..=bc[0] as usize {
                    self.test_ref(bc[i])?;
                }
                self.test_context()?;
            }
            CntxtItem => {
                valid_upto(
                    self.max.rule_length,
                    (self.max.pre_context as i32 + bc[0] as i8 as i32) as u16,
                )?;
                if bc.len() < 2 + bc[1] as usize {
                    return Err(CodeError::JumpPastEnd);
                }
                if self.in_ctxt_item {
                    return Err(CodeError::NestedContextItem);
                }
            }
            AttrSet | AttrAdd | AttrSub | AttrSetSlot => {
                self.stack_depth -= 1;
                if self.stack_depth < 0 {
                    return Err(CodeError::UnderfullStack);
                }
                valid_upto(NUM_ATTR_CODES as u16, bc[0] as u16)?;
                if bc[0] == ATTR_USER_DEFN {
                    // user attributes take the indexed opcodes
                    return Err(CodeError::OutOfRangeData);
                }
                self.test_context()?;
            }
            IAttrSetSlot | IAttrSet | IAttrAdd | IAttrSub => {
                self.stack_depth -= 1;
                if self.stack_depth < 0 {
                    return Err(CodeError::UnderfullStack);
                }
                valid_upto(NUM_ATTR_CODES as u16, bc[0] as u16)?;
                valid_upto(self.max.attr_subindex_limit(bc[0]), bc[1] as u16)?;
                self.test_context()?;
            }
            PushSlotAttr => {
                self.stack_depth += 1;
                valid_upto(NUM_ATTR_CODES as u16, bc[0] as u16)?;
                self.test_ref(bc[1])?;
                if bc[0] == ATTR_USER_DEFN {
                    return Err(CodeError::OutOfRangeData);
                }
            }
            PushGlyphAttrObs | PushAttToGattrObs => {
                self.stack_depth += 1;
                valid_upto(self.max.glyf_attrs, bc[0] as u16)?;
                self.test_ref(bc[1])?;
            }
            PushGlyphMetric | PushAttToGlyphMetric => {
                self.stack_depth += 1;
                valid_upto(MAX_METRIC, bc[0] as u16)?;
                self.test_ref(bc[1])?;
                // bc[2] is the attachment level, any value is fine
            }
            PushFeat => {
                self.stack_depth += 1;
                valid_upto(self.max.features, bc[0] as u16)?;
                self.test_ref(bc[1])?;
            }
            PushISlotAttr => {
                self.stack_depth += 1;
                valid_upto(NUM_ATTR_CODES as u16, bc[0] as u16)?;
                self.test_ref(bc[1])?;
                valid_upto(self.max.attr_subindex_limit(bc[0]), bc[2] as u16)?;
            }
            PopRet => {
                self.stack_depth -= 1;
                if self.stack_depth < 0 {
                    return Err(CodeError::UnderfullStack);
                }
            }
            PutSubs => {
                self.test_ref(bc[0])?;
                valid_upto(self.max.classes, u16::from_be_bytes([bc[1], bc[2]]))?;
                valid_upto(self.max.classes, u16::from_be_bytes([bc[3], bc[4]]))?;
                self.test_context()?;
            }
            PutGlyph => {
                valid_upto(self.max.classes, u16::from_be_bytes([bc[0], bc[1]]))?;
                self.test_context()?;
            }
            PushGlyphAttr | PushAttToGlyphAttr => {
                self.stack_depth += 1;
                valid_upto(self.max.glyf_attrs, u16::from_be_bytes([bc[0], bc[1]]))?;
                self.test_ref(bc[2])?;
            }
            SetFeat => {
                valid_upto(self.max.features, bc[0] as u16)?;
                self.test_ref(bc[1])?;
            }
            Nop | NextN | RetZero | RetTrue | PutSubs2 | PutSubs3 | TempCopy => {}
        }
        Ok(opc)
    }

    fn test_context(&self) -> Result<(), CodeError> {
        if self.out_index >= self.out_length
            || self.out_index < 0
            || self.slot_ref >= NUM_CONTEXTS as i32 - 1
        {
            Err(CodeError::OutOfRangeData)
        } else {
            Ok(())
        }
    }

    fn test_ref(&self, index: u8) -> Result<(), CodeError> {
        let index = index as i8 as i32;
        if self.code.constraint && !self.in_ctxt_item {
            if index > 0 || -index > self.max.pre_context as i32 {
                return Err(CodeError::OutOfRangeData);
            }
        } else {
            let loc = self.slot_ref + self.max.pre_context as i32 + index;
            if self.max.rule_length == 0 || loc >= self.max.rule_length as i32 || loc < 0 {
                return Err(CodeError::OutOfRangeData);
            }
        }
        Ok(())
    }

    /// Record which window slots each instruction changes or references,
    /// feeding the TEMP_COPY insertion pass.
    fn analyse_opcode(&mut self, opc: Opcode, args: &[u8]) {
        use Opcode::*;
        match opc {
            Delete => self.code.deletes = true,
            Assoc => self.set_changed(0),
            PutGlyph8bitObs | PutGlyph => {
                self.code.modifies = true;
                self.set_changed(0);
            }
            AttrSet | AttrAdd | AttrSub | AttrSetSlot | IAttrSetSlot | IAttrSet | IAttrAdd
            | IAttrSub => self.set_noref(0),
            Next | CopyNext => {
                self.slot_ref += 1;
                self.contexts[self.slot_ref as usize] = CtxtInfo {
                    code_ref: (self.code.instrs.len() + 1) as u8,
                    ..CtxtInfo::default()
                };
            }
            Insert => {
                if self.slot_ref >= 0 {
                    self.slot_ref -= 1;
                }
                self.code.modifies = true;
            }
            PutSubs8bitObs | PutSubs => {
                self.code.modifies = true;
                self.set_changed(0);
                if args[0] != 0 {
                    self.set_changed(0);
                }
                self.set_ref(args[0] as i8);
            }
            PutCopy => {
                if args[0] != 0 {
                    self.set_changed(0);
                    self.code.modifies = true;
                }
                self.set_ref(args[0] as i8);
            }
            PushGlyphAttrObs | PushSlotAttr | PushGlyphMetric | PushAttToGattrObs
            | PushAttToGlyphMetric | PushISlotAttr | PushFeat | SetFeat => {
                self.set_ref(args[1] as i8)
            }
            PushAttToGlyphAttr | PushGlyphAttr => self.set_ref(args[2] as i8),
            _ => {}
        }
    }

    fn set_ref(&mut self, arg: i8) {
        let index = arg as i32 + self.slot_ref;
        if !(0..NUM_CONTEXTS as i32).contains(&index) {
            return;
        }
        self.contexts[index as usize].referenced = true;
        if index > self.code.max_ref {
            self.code.max_ref = index;
        }
    }

    fn set_noref(&mut self, index: i32) {
        let index = index + self.slot_ref;
        if !(0..NUM_CONTEXTS as i32).contains(&index) {
            return;
        }
        if index > self.code.max_ref {
            self.code.max_ref = index;
        }
    }

    fn set_changed(&mut self, index: i32) {
        let index = index + self.slot_ref;
        if !(0..NUM_CONTEXTS as i32).contains(&index) {
            return;
        }
        self.contexts[index as usize].changed = true;
        if index > self.code.max_ref {
            self.code.max_ref = index;
        }
    }

    /// Append the instruction and its operands. A context item triggers a
    /// recursive decode of its body so the on-disk byte skip can be
    /// rewritten into (instruction skip, data skip).
    fn emit_opcode<'a>(&mut self, opc: Opcode, mut bc: &'a [u8]) -> Result<&'a [u8], CodeError> {
        let mut param_size = opc.param_size();
        if param_size == VAR_ARGS {
            param_size = bc[0] + 1;
        }

        self.code.instrs.push(opc);
        if param_size != 0 {
            self.code.args.extend_from_slice(&bc[..param_size as usize]);
            bc = &bc[param_size as usize..];
        }

        if opc == Opcode::CntxtItem {
            self.in_ctxt_item = true;
            self.slot_ref = self.code.args[self.code.args.len() - 2] as i8 as i32;
            self.out_index = self.max.pre_context as i32 + self.slot_ref;
            self.out_length = self.max.rule_length as i32;

            let instr_skip_index = self.code.args.len() - 1;
            let instr_skip = self.code.args[instr_skip_index];
            self.code.args.push(0); // data skip, filled below

            let instrs_before = self.code.instrs.len();
            self.load(&bc[..instr_skip as usize])?;
            let nb_opcodes = (self.code.instrs.len() - instrs_before) as u8;
            self.code.args[instr_skip_index] = nb_opcodes;
            self.code.args[instr_skip_index + 1] = instr_skip - nb_opcodes;

            bc = &bc[instr_skip as usize..];

            self.out_length = 1;
            self.out_index = 0;
            self.slot_ref = 0;
            self.in_ctxt_item = false;
        }
        Ok(bc)
    }

    /// Insert TEMP_COPY before the first change of every slot that a
    /// later instruction reads, so reads see the pre-rule glyph.
    fn apply_analysis(&mut self) {
        if self.code.constraint {
            return;
        }
        let mut tempcount = 0usize;
        for i in 0..self.slot_ref.max(0) as usize {
            let c = self.contexts[i];
            if !c.referenced || !c.changed {
                continue;
            }
            self.code
                .instrs
                .insert(c.code_ref as usize + tempcount, Opcode::TempCopy);
            self.code.deletes = true;
            tempcount += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CodeContext {
        CodeContext {
            num_classes: 10,
            num_attributes: 16,
            num_features: 4,
            num_user_attrs: 4,
        }
    }

    const RET: u8 = Opcode::PopRet as u8;

    #[test]
    fn empty_program_loads() {
        let code = Code::new(false, &[], 0, 2, &ctx()).unwrap();
        assert!(code.is_empty());
        assert!(!code.deletes);
    }

    #[test]
    fn simple_program_loads() {
        let bc = [
            Opcode::PushByte as u8,
            5,
            Opcode::PushByte as u8,
            3,
            Opcode::Equal as u8,
            RET,
        ];
        let code = Code::new(false, &bc, 0, 2, &ctx()).unwrap();
        assert_eq!(
            code.instrs,
            vec![
                Opcode::PushByte,
                Opcode::PushByte,
                Opcode::Equal,
                Opcode::PopRet
            ]
        );
        assert_eq!(code.args, vec![5, 3]);
        assert!(!code.modifies);
    }

    #[test]
    fn unknown_opcode_rejected() {
        let err = Code::new(false, &[0xf0], 0, 2, &ctx()).unwrap_err();
        assert_eq!(err, CodeError::InvalidOpcode(0xf0));
    }

    #[test]
    fn unimplemented_side_rejected() {
        // NEXT has no constraint implementation
        let err = Code::new(true, &[Opcode::Next as u8, RET], 0, 2, &ctx()).unwrap_err();
        assert_eq!(err, CodeError::UnimplementedOpcode(Opcode::Next));
        // NEXT_N is reserved on both sides
        let err = Code::new(false, &[Opcode::NextN as u8, 1, RET], 0, 2, &ctx()).unwrap_err();
        assert_eq!(err, CodeError::UnimplementedOpcode(Opcode::NextN));
    }

    #[test]
    fn truncated_operands_rejected() {
        let err = Code::new(false, &[Opcode::PushShort as u8, 0x12], 0, 2, &ctx()).unwrap_err();
        assert_eq!(err, CodeError::ArgumentsExhausted);
    }

    #[test]
    fn missing_return_rejected() {
        let err = Code::new(false, &[Opcode::PushByte as u8, 1], 0, 2, &ctx()).unwrap_err();
        assert_eq!(err, CodeError::MissingReturn);
    }

    #[test]
    fn underfull_stack_rejected() {
        let err = Code::new(false, &[Opcode::Add as u8, RET], 0, 2, &ctx()).unwrap_err();
        assert_eq!(err, CodeError::UnderfullStack);
        let bc = [Opcode::PushByte as u8, 1, Opcode::Add as u8, RET];
        assert_eq!(
            Code::new(false, &bc, 0, 2, &ctx()).unwrap_err(),
            CodeError::UnderfullStack
        );
    }

    #[test]
    fn class_bounds_checked() {
        let bc = [Opcode::PutGlyph8bitObs as u8, 99, Opcode::RetTrue as u8];
        assert_eq!(
            Code::new(false, &bc, 0, 2, &ctx()).unwrap_err(),
            CodeError::OutOfRangeData
        );
        let bc = [Opcode::PutGlyph8bitObs as u8, 9, Opcode::RetTrue as u8];
        let code = Code::new(false, &bc, 0, 2, &ctx()).unwrap();
        assert!(code.modifies);
    }

    #[test]
    fn slot_refs_checked() {
        // slot -3 is before the window of a rule with no precontext
        let bc = [
            Opcode::PutCopy as u8,
            (-3i8) as u8,
            Opcode::RetTrue as u8,
        ];
        assert_eq!(
            Code::new(false, &bc, 0, 2, &ctx()).unwrap_err(),
            CodeError::OutOfRangeData
        );
    }

    #[test]
    fn nested_context_item_rejected() {
        // a context item whose body opens another context item
        let bc = [
            Opcode::CntxtItem as u8,
            0,
            4,
            Opcode::CntxtItem as u8,
            0,
            0,
            Opcode::RetTrue as u8,
            Opcode::RetTrue as u8,
        ];
        assert_eq!(
            Code::new(true, &bc, 1, 2, &ctx()).unwrap_err(),
            CodeError::NestedContextItem
        );
    }

    #[test]
    fn context_item_skips_are_rewritten() {
        // body: PUSH_BYTE 42 (2 bytes, 1 instruction)
        let bc = [
            Opcode::CntxtItem as u8,
            0,
            2,
            Opcode::PushByte as u8,
            42,
            RET,
        ];
        let code = Code::new(true, &bc, 1, 2, &ctx()).unwrap();
        assert_eq!(
            code.instrs,
            vec![Opcode::CntxtItem, Opcode::PushByte, Opcode::PopRet]
        );
        // args: slot offset, instruction skip, data skip, then the body's
        assert_eq!(code.args, vec![0, 1, 1, 42]);
    }

    #[test]
    fn temp_copy_inserted_for_changed_then_referenced_slot() {
        let bc = [
            Opcode::PutGlyph8bitObs as u8,
            1,
            Opcode::Next as u8,
            Opcode::PushSlotAttr as u8,
            0, // adv.x
            (-1i8) as u8,
            RET,
        ];
        let code = Code::new(false, &bc, 0, 2, &ctx()).unwrap();
        assert_eq!(
            code.instrs,
            vec![
                Opcode::TempCopy,
                Opcode::PutGlyph8bitObs,
                Opcode::Next,
                Opcode::PushSlotAttr,
                Opcode::PopRet
            ]
        );
        assert!(code.deletes);
        assert!(code.modifies);
    }

    #[test]
    fn user_attr_must_use_indexed_ops() {
        let bc = [
            Opcode::PushByte as u8,
            1,
            Opcode::AttrSet as u8,
            55, // user attribute byte
            Opcode::RetTrue as u8,
        ];
        assert_eq!(
            Code::new(false, &bc, 0, 2, &ctx()).unwrap_err(),
            CodeError::OutOfRangeData
        );
        // the indexed form is fine, within the declared user attr count
        let bc = [
            Opcode::PushByte as u8,
            1,
            Opcode::IAttrSet as u8,
            55,
            2,
            Opcode::RetTrue as u8,
        ];
        Code::new(false, &bc, 0, 2, &ctx()).unwrap();
        let bc = [
            Opcode::PushByte as u8,
            1,
            Opcode::IAttrSet as u8,
            55,
            9,
            Opcode::RetTrue as u8,
        ];
        assert_eq!(
            Code::new(false, &bc, 0, 2, &ctx()).unwrap_err(),
            CodeError::OutOfRangeData
        );
    }

    #[test]
    fn next_past_rule_end_rejected() {
        let bc = [
            Opcode::Next as u8,
            Opcode::Next as u8,
            Opcode::Next as u8,
            Opcode::RetTrue as u8,
        ];
        assert_eq!(
            Code::new(false, &bc, 0, 2, &ctx()).unwrap_err(),
            CodeError::OutOfRangeData
        );
    }
}
