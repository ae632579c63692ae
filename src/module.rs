//! The per-translation-unit context.
//!
//! A [`Module`] owns everything that outlives a single function: the type
//! store, the declaration and global-symbol arenas, the string-literal
//! intern table, the module-wide counters behind label and private-symbol
//! suffixes, and the output sink. Functions borrow the module mutably while
//! they are being lowered and emitted.

use std::collections::HashMap;
use std::io;

use cranelift_entity::{EntityRef, PrimaryMap};

use crate::ast::{DeclData, DeclKind, DeclRef, Linkage};
use crate::ir::{Global, Value};
use crate::types::{TypeQual, Types};

/// A named global symbol. A nonzero `id` marks the symbol private: it is
/// printed with a `.L` prefix and the id as a suffix so distinct statics
/// with the same source name stay distinct.
pub(crate) struct GlobalData {
    pub name: String,
    pub id: u32,
}

/// The translation-unit context. All emission goes through the sink it was
/// created with; tests capture output in a `Vec<u8>`.
pub struct Module<'a> {
    pub types: Types,
    pub decls: PrimaryMap<DeclRef, DeclData>,
    pub(crate) globals: PrimaryMap<Global, GlobalData>,
    strings: HashMap<Box<[u8]>, DeclRef>,
    pub(crate) out: &'a mut dyn io::Write,
    next_label: u32,
    next_private: u32,
    pub(crate) next_type: u32,
}

impl<'a> Module<'a> {
    pub fn new(out: &'a mut dyn io::Write) -> Self {
        Self {
            types: Types::new(),
            decls: PrimaryMap::new(),
            globals: PrimaryMap::new(),
            strings: HashMap::new(),
            out,
            next_label: 0,
            next_private: 0,
            next_type: 0,
        }
    }

    /// Allocate a named global value. Private symbols get a fresh numeric
    /// suffix; external ones are identified by name alone.
    pub fn global(&mut self, name: &str, private: bool) -> Value {
        let id = if private {
            self.next_private += 1;
            self.next_private
        } else {
            0
        };
        Value::Global(self.globals.push(GlobalData {
            name: name.to_string(),
            id,
        }))
    }

    /// The symbol name of an external global value, if that is what `v` is.
    pub fn global_name(&self, v: Value) -> Option<&str> {
        match v {
            Value::Global(g) if self.globals[g].id == 0 => Some(&self.globals[g].name),
            _ => None,
        }
    }

    /// The declaration backing a string literal. Identical literals share
    /// one private global; its data is emitted by the driver at the end of
    /// the translation unit.
    pub fn string_decl(&mut self, data: &[u8]) -> DeclRef {
        if let Some(&d) = self.strings.get(data) {
            return d;
        }
        let ty = self.types.array_of(self.types.char_ty, data.len() as u64);
        let value = self.global("string", true);
        let mut decl = DeclData::new(DeclKind::Object, ty, TypeQual::CONST, Linkage::Intern);
        decl.value = Some(value);
        let d = self.decls.push(decl);
        self.strings.insert(data.into(), d);
        d
    }

    /// The interned string literals in a stable order, for end-of-unit data
    /// emission.
    pub fn string_literals(&self) -> Vec<(&[u8], DeclRef)> {
        let mut all: Vec<(&[u8], DeclRef)> = self
            .strings
            .iter()
            .map(|(data, &d)| (&data[..], d))
            .collect();
        all.sort_by_key(|&(_, d)| d.index());
        all
    }

    pub(crate) fn new_label_id(&mut self) -> u32 {
        self.next_label += 1;
        self.next_label
    }
}
