//! The SSA intermediate representation built by the function lowerer.
//!
//! Basic blocks reference each other in phi slots and terminators. These
//! references are not Rust references: blocks are stored in a `PrimaryMap`
//! owned by their function, and a [`Block`] is a `u32` index into that map.
//! This keeps the CFG mutable while it is under construction and keeps the
//! in-memory representation compact. There is a separate index type per
//! entity so we don't lose type safety.

use core::fmt;
use cranelift_entity::entity_impl;

use crate::types::TypeRef;

/// An opaque reference to a basic block in a function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to a named global symbol in a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Global(u32);
entity_impl!(Global, "gsym");

/// A register class: the type of a temporary.
///
/// Aggregates and `void` have no class; they are represented as
/// `Option<Class>` being `None`. Pointers are always [`Class::L`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Class {
    /// 32-bit integer.
    W,
    /// 64-bit integer.
    L,
    /// 32-bit float.
    S,
    /// 64-bit float.
    D,
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::W => "w",
            Self::L => "l",
            Self::S => "s",
            Self::D => "d",
        })
    }
}

/// An extended type, used in memory layout and data definitions.
///
/// Extends the register classes with the sub-word widths.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DataClass {
    /// Byte.
    B,
    /// Half-word (16 bits).
    H,
    /// Word (32 bits).
    W,
    /// Long (64 bits).
    L,
    /// Single-precision float.
    S,
    /// Double-precision float.
    D,
}

impl fmt::Display for DataClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::B => "b",
            Self::H => "h",
            Self::W => "w",
            Self::L => "l",
            Self::S => "s",
            Self::D => "d",
        })
    }
}

/// The closed instruction opcode table.
///
/// Every opcode maps to one QBE mnemonic; the two call opcodes share the
/// `call` spelling and differ only in how their argument list is printed.
/// [`Opcode::Arg`] is a pseudo-instruction: the arguments of a call follow
/// it contiguously and are folded into the call's parenthesized list at
/// emission time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Opcode {
    Add,
    Sub,
    Mul,
    Div,
    Udiv,
    Rem,
    Urem,
    Or,
    Xor,
    And,
    Sar,
    Shr,
    Shl,
    Storeb,
    Storeh,
    Storew,
    Storel,
    Stores,
    Stored,
    Loadsb,
    Loadub,
    Loadsh,
    Loaduh,
    Loadw,
    Loadl,
    Loads,
    Loadd,
    Ceqw,
    Ceql,
    Ceqs,
    Ceqd,
    Cnew,
    Cnel,
    Cnes,
    Cned,
    Csltw,
    Csltl,
    Cultw,
    Cultl,
    Clts,
    Cltd,
    Csgtw,
    Csgtl,
    Cugtw,
    Cugtl,
    Cgts,
    Cgtd,
    Cslew,
    Cslel,
    Culew,
    Culel,
    Cles,
    Cled,
    Csgew,
    Csgel,
    Cugew,
    Cugel,
    Cges,
    Cged,
    Extsb,
    Extub,
    Extsh,
    Extuh,
    Extsw,
    Extuw,
    Exts,
    Truncd,
    Stosi,
    Dtosi,
    Swtof,
    Sltof,
    Alloc4,
    Alloc8,
    Alloc16,
    Call,
    Vacall,
    Vastart,
    Vaarg,
    Arg,
}

impl Opcode {
    /// The QBE mnemonic of this opcode.
    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Udiv => "udiv",
            Rem => "rem",
            Urem => "urem",
            Or => "or",
            Xor => "xor",
            And => "and",
            Sar => "sar",
            Shr => "shr",
            Shl => "shl",
            Storeb => "storeb",
            Storeh => "storeh",
            Storew => "storew",
            Storel => "storel",
            Stores => "stores",
            Stored => "stored",
            Loadsb => "loadsb",
            Loadub => "loadub",
            Loadsh => "loadsh",
            Loaduh => "loaduh",
            Loadw => "loadw",
            Loadl => "loadl",
            Loads => "loads",
            Loadd => "loadd",
            Ceqw => "ceqw",
            Ceql => "ceql",
            Ceqs => "ceqs",
            Ceqd => "ceqd",
            Cnew => "cnew",
            Cnel => "cnel",
            Cnes => "cnes",
            Cned => "cned",
            Csltw => "csltw",
            Csltl => "csltl",
            Cultw => "cultw",
            Cultl => "cultl",
            Clts => "clts",
            Cltd => "cltd",
            Csgtw => "csgtw",
            Csgtl => "csgtl",
            Cugtw => "cugtw",
            Cugtl => "cugtl",
            Cgts => "cgts",
            Cgtd => "cgtd",
            Cslew => "cslew",
            Cslel => "cslel",
            Culew => "culew",
            Culel => "culel",
            Cles => "cles",
            Cled => "cled",
            Csgew => "csgew",
            Csgel => "csgel",
            Cugew => "cugew",
            Cugel => "cugel",
            Cges => "cges",
            Cged => "cged",
            Extsb => "extsb",
            Extub => "extub",
            Extsh => "extsh",
            Extuh => "extuh",
            Extsw => "extsw",
            Extuw => "extuw",
            Exts => "exts",
            Truncd => "truncd",
            Stosi => "stosi",
            Dtosi => "dtosi",
            Swtof => "swtof",
            Sltof => "sltof",
            Alloc4 => "alloc4",
            Alloc8 => "alloc8",
            Alloc16 => "alloc16",
            Call => "call",
            Vacall => "call",
            Vastart => "vastart",
            Vaarg => "vaarg",
            Arg => "arg",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// A value operand.
///
/// Values are small and `Copy`: constants carry their payload inline,
/// everything else is a handle resolved at emission time. An absent value
/// ("unset" in the data model) is `Option<Value>` being `None`; lowering in
/// a terminated block propagates `None` without side effects.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    /// A named global symbol.
    Global(Global),
    /// A 64-bit integer or pointer constant.
    IntConst(u64),
    /// A single-precision float constant. The payload is kept in double
    /// precision; only the printed sigil differs.
    FltConst(f64),
    /// A double-precision float constant.
    DblConst(f64),
    /// A function-local SSA temporary. Ids are dense and start at 1.
    Temp(u32),
    /// A named aggregate type, valid once the type has been emitted.
    Type(TypeRef),
    /// A block label.
    Label(Block),
}

impl Value {
    /// The payload of an integer constant, if that is what this value is.
    pub fn as_int_const(self) -> Option<u64> {
        match self {
            Self::IntConst(i) => Some(i),
            _ => None,
        }
    }
}

/// A bit-field window: the number of padding bits above the low bit and
/// above the high bit of the field, within its aligned storage unit.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct BitField {
    pub before: u32,
    pub after: u32,
}

impl BitField {
    /// Whether the window selects the whole storage unit.
    pub fn is_empty(self) -> bool {
        self.before == 0 && self.after == 0
    }
}

/// An lvalue: a value of class `l` locating the object in memory, plus a
/// bit-field window (zeroed for non-bit-field lvalues).
#[derive(Clone, Copy, Debug)]
pub struct LValue {
    pub addr: Option<Value>,
    pub bits: BitField,
}

impl LValue {
    /// An lvalue designating a whole object at `addr`.
    pub fn new(addr: Option<Value>) -> Self {
        Self {
            addr,
            bits: BitField::default(),
        }
    }
}

/// A single instruction.
///
/// `res` is present iff the instruction produces a value; stores, `arg`
/// markers and void calls have a class of `None` and no result.
#[derive(Clone, Debug)]
pub struct Inst {
    pub op: Opcode,
    pub class: Option<Class>,
    pub res: Option<Value>,
    pub args: [Option<Value>; 2],
}

/// A block terminator. A block without one falls through to the next block
/// in emission order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Terminator {
    /// Unconditional jump.
    Jmp(Block),
    /// Branch to the first block if the value is nonzero, else the second.
    Jnz(Option<Value>, Block, Block),
    /// Return, with an optional value.
    Ret(Option<Value>),
}

/// The phi slot at the head of a block.
///
/// The slot is filled piecemeal while the surrounding control flow is under
/// construction: the incoming blocks may be recorded before their values
/// exist, and the result temporary is issued last. A block emits a phi iff
/// `res` is set. Merge points constructed by the lowerer always have
/// exactly two predecessors.
#[derive(Clone, Default, Debug)]
pub struct Phi {
    pub class: Option<Class>,
    pub res: Option<Value>,
    pub blk: [Option<Block>; 2],
    pub val: [Option<Value>; 2],
}

/// The contents of a basic block.
///
/// The label pairs a display name with a module-wide id, so every label in
/// a translation unit is unique even when names repeat.
#[derive(Clone)]
pub struct BlockData {
    pub name: String,
    pub id: u32,
    pub insts: Vec<Inst>,
    pub phi: Phi,
    pub term: Option<Terminator>,
}

impl BlockData {
    pub(crate) fn new(name: &str, id: u32) -> Self {
        Self {
            name: name.to_string(),
            id,
            insts: Vec::new(),
            phi: Phi::default(),
            term: None,
        }
    }
}
