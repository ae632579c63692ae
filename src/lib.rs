//! IR generation for a C compiler, targeting the QBE intermediate
//! language.
//!
//! The front end hands this crate typed, semantically analyzed syntax:
//! expressions, declarations, initializer runs and statement-level
//! directives (labels, jumps, switch dispatch). The back-end lowers each
//! function body to a control-flow graph of basic blocks holding SSA-style
//! instructions with explicit phi nodes, then serializes the translation
//! unit as textual SSA assembly.
//!
//! The usual flow:
//!
//! - create a [`Module`] around an output sink;
//! - populate its type and declaration arenas (the front end's job);
//! - for each function definition, build a [`Func`], feed it expressions
//!   and control flow, then call [`Module::emit_func`];
//! - emit file-scope objects with [`Module::emit_data`].
//!
//! Dropping the [`Func`] releases every block, instruction and value it
//! allocated; globals, types and interned strings live as long as the
//! module.

pub mod ast;
pub mod errors;
pub mod func;
pub mod ir;
pub mod module;
pub mod tree;
pub mod types;

mod emit;
mod lower;

pub use crate::ast::{
    BinaryOp, Builtin, Constant, DeclData, DeclKind, DeclRef, Expr, ExprKind, IncDecOp, Init,
    Linkage, UnaryOp,
};
pub use crate::errors::{CodegenError, CodegenResult};
pub use crate::func::Func;
pub use crate::ir::{BitField, Block, Class, LValue, Opcode, Terminator, Value};
pub use crate::module::Module;
pub use crate::tree::SwitchCases;
pub use crate::types::{Member, Param, TypeData, TypeKind, TypeProps, TypeQual, TypeRef, Types};
