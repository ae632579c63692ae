//! The function builder.
//!
//! A [`Func`] owns the CFG of one function while it is being lowered: the
//! block arena, the emission order, the goto map and the temporary counter.
//! It borrows the [`Module`] for everything module-wide (types, decls,
//! label ids, the output sink for inline type and data definitions).
//!
//! The builder maintains two invariants the emitter relies on. A block
//! records at most one terminator; setting a second one is a no-op. And
//! once the tail block is terminated, appending an instruction is a no-op
//! returning `None`, so lowering that continues past a `return` produces no
//! stray instructions.

use std::collections::HashMap;

use cranelift_entity::PrimaryMap;
use log::debug;

use crate::ast::{DeclData, DeclKind, DeclRef, Linkage};
use crate::errors::{CodegenError, CodegenResult};
use crate::ir::{
    BitField, Block, BlockData, Class, Inst, LValue, Opcode, Terminator, Value,
};
use crate::module::Module;
use crate::types::{TypeKind, TypeProps, TypeQual, TypeRef, Types};

/// A function under construction.
pub struct Func {
    pub(crate) decl: DeclRef,
    pub(crate) name: String,
    pub(crate) ty: TypeRef,
    pub(crate) blocks: PrimaryMap<Block, BlockData>,
    /// Emission order; `label` appends to it.
    pub(crate) order: Vec<Block>,
    pub(crate) start: Block,
    pub(crate) tail: Block,
    gotos: HashMap<String, Block>,
    next_temp: u32,
    /// One-shot slot for `__func__`; cleared when the data definition is
    /// emitted on first reference.
    pub(crate) namedecl: Option<DeclRef>,
    params: Vec<DeclRef>,
    pub(crate) param_values: Vec<Value>,
}

impl Func {
    /// Begin a function definition: create the start and body blocks, bind
    /// the parameters, and prepare the lazy `__func__` declaration.
    ///
    /// Parameters of aggregate type are bound to their incoming address
    /// directly; scalars get stack storage. In a definition without a
    /// prototype a parameter arrives with its promoted type and is
    /// converted back to the declared type before the store.
    pub fn new(module: &mut Module, decl: DeclRef, name: &str, ty: TypeRef) -> CodegenResult<Func> {
        let TypeKind::Func {
            ret,
            params,
            prototype,
            ..
        } = &module.types[ty].kind
        else {
            return Err(CodegenError::Internal(format!(
                "definition of '{name}' without a function type"
            )));
        };
        let (ret, params, prototype) = (*ret, params.clone(), *prototype);
        debug!("lowering function '{}'", name);

        if module.decls[decl].value.is_none() {
            let private = module.decls[decl].linkage == Linkage::Intern;
            let v = module.global(name, private);
            module.decls[decl].value = Some(v);
        }

        let mut blocks = PrimaryMap::new();
        let start = blocks.push(BlockData::new("start", module.new_label_id()));
        let mut f = Func {
            decl,
            name: name.to_string(),
            ty,
            blocks,
            order: vec![start],
            start,
            tail: start,
            gotos: HashMap::new(),
            next_temp: 0,
            namedecl: None,
            params: Vec::with_capacity(params.len()),
            param_values: Vec::with_capacity(params.len()),
        };

        module.emit_type(ret)?;
        for p in &params {
            if p.name.is_empty() {
                return Err(CodegenError::Diagnostic(format!(
                    "parameter name omitted in definition of function '{name}'"
                )));
            }
            let pt = if prototype {
                p.ty
            } else {
                module.types.promote(p.ty)
            };
            module.emit_type(pt)?;
            let v = f.temp();
            f.param_values.push(v);
            let d = module
                .decls
                .push(DeclData::new(DeclKind::Object, p.ty, p.qual, Linkage::None));
            if module.types[p.ty].emit_id.is_some() {
                // Aggregates are passed by reference in the textual SSA;
                // the incoming temporary already is the object's address.
                module.decls[d].value = Some(v);
            } else {
                let arg = if p.ty == pt {
                    Some(v)
                } else {
                    f.convert(module, p.ty, pt, Some(v))?
                };
                f.init(module, d, None)?;
                let lval = LValue::new(module.decls[d].value);
                f.store(&module.types, p.ty, TypeQual::empty(), lval, arg)?;
            }
            f.params.push(d);
        }

        let len = name.len() as u64 + 1;
        let char_ty = module.types.char_ty;
        let fname_ty = module.types.array_of(char_ty, len);
        let mut nd = DeclData::new(DeclKind::Object, fname_ty, TypeQual::CONST, Linkage::None);
        nd.value = Some(module.global("__func__", true));
        f.namedecl = Some(module.decls.push(nd));

        let body = f.new_block(module, "body");
        f.label(body);
        Ok(f)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The C type of the function.
    pub fn func_type(&self) -> TypeRef {
        self.ty
    }

    /// The parameter declarations, in order, for the front end to bind in
    /// its scope.
    pub fn params(&self) -> &[DeclRef] {
        &self.params
    }

    /// The declaration behind `__func__`, for the front end to bind in the
    /// function's scope. `None` once its datum has been emitted.
    pub fn name_decl(&self) -> Option<DeclRef> {
        self.namedecl
    }

    /// Create a block. It is not part of the emission order until `label`
    /// places it.
    pub fn new_block(&mut self, module: &mut Module, name: &str) -> Block {
        self.blocks.push(BlockData::new(name, module.new_label_id()))
    }

    /// Append `b` to the emission order and make it the tail.
    pub fn label(&mut self, b: Block) {
        self.order.push(b);
        self.tail = b;
    }

    /// Terminate the tail block with an unconditional jump, unless it
    /// already has a terminator.
    pub fn jmp(&mut self, to: Block) {
        let tail = &mut self.blocks[self.tail];
        if tail.term.is_none() {
            tail.term = Some(Terminator::Jmp(to));
        }
    }

    /// Terminate the tail block with a conditional branch, unless it
    /// already has a terminator.
    pub fn jnz(&mut self, cond: Option<Value>, nonzero: Block, zero: Block) {
        let tail = &mut self.blocks[self.tail];
        if tail.term.is_none() {
            tail.term = Some(Terminator::Jnz(cond, nonzero, zero));
        }
    }

    /// Terminate the tail block with a return, unless it already has a
    /// terminator.
    pub fn ret(&mut self, v: Option<Value>) {
        let tail = &mut self.blocks[self.tail];
        if tail.term.is_none() {
            tail.term = Some(Terminator::Ret(v));
        }
    }

    /// The target block of a goto label. Forward references and the label
    /// statement itself share the block keyed by the identifier.
    pub fn goto_label(&mut self, module: &mut Module, name: &str) -> Block {
        if let Some(&b) = self.gotos.get(name) {
            return b;
        }
        let b = self.new_block(module, name);
        self.gotos.insert(name.to_string(), b);
        b
    }

    /// Append an instruction to the tail block and return its result. A
    /// fresh temporary is issued iff the instruction has a class and is not
    /// an `arg` marker. If the tail block is terminated nothing is
    /// appended and the result is `None`.
    pub fn inst(
        &mut self,
        op: Opcode,
        class: Option<Class>,
        arg0: Option<Value>,
        arg1: Option<Value>,
    ) -> Option<Value> {
        if self.blocks[self.tail].term.is_some() {
            return None;
        }
        let res = if class.is_some() && op != Opcode::Arg {
            Some(self.temp())
        } else {
            None
        };
        self.blocks[self.tail].insts.push(Inst {
            op,
            class,
            res,
            args: [arg0, arg1],
        });
        res
    }

    /// Issue a fresh temporary.
    pub(crate) fn temp(&mut self) -> Value {
        self.next_temp += 1;
        Value::Temp(self.next_temp)
    }

    /// Allocate stack storage for a declaration and record its address.
    /// The alloca lands in the start block so it dominates every use, no
    /// matter where the declaration appears in the source.
    pub(crate) fn alloc(&mut self, module: &mut Module, d: DeclRef) -> CodegenResult<()> {
        let ty = module.decls[d].ty;
        let t = &module.types[ty];
        debug_assert!(!t.incomplete);
        debug_assert!(t.size > 0);
        let (size, natural) = (t.size, t.align);
        let align = match module.decls[d].align {
            0 => {
                module.decls[d].align = natural;
                natural
            }
            a if a < natural => {
                return Err(CodegenError::Diagnostic(format!(
                    "object requires alignment {natural}, which is stricter than {a}"
                )))
            }
            a => a,
        };
        let op = match align {
            1 | 2 | 4 => Opcode::Alloc4,
            8 => Opcode::Alloc8,
            16 => Opcode::Alloc16,
            _ => {
                return Err(CodegenError::Internal(format!(
                    "invalid alignment: {align}"
                )))
            }
        };
        let res = self.temp();
        self.blocks[self.start].insts.push(Inst {
            op,
            class: Some(Class::L),
            res: Some(res),
            args: [Some(Value::IntConst(size)), None],
        });
        module.decls[d].value = Some(res);
        Ok(())
    }

    /// Shift a loaded storage unit so that the addressed bit-field lands in
    /// the low bits, sign- or zero-extended per the underlying type.
    pub(crate) fn extract_bits(
        &mut self,
        types: &Types,
        ty: TypeRef,
        v: Option<Value>,
        b: BitField,
    ) -> Option<Value> {
        let t = &types[ty];
        let class = if t.size <= 4 { Class::W } else { Class::L };
        let mut v = v;
        let mut bits = b.after;
        if bits != 0 {
            // Sub-word units are loaded into a full word; discard the
            // word's padding along with the field's high padding.
            bits += (((t.size + 3) & !3) - t.size) as u32 * 8;
            v = self.inst(Opcode::Shl, Some(class), v, Some(Value::IntConst(bits.into())));
        }
        bits += b.before;
        if bits != 0 {
            let op = if types.is_signed(ty) {
                Opcode::Sar
            } else {
                Opcode::Shr
            };
            v = self.inst(op, Some(class), v, Some(Value::IntConst(bits.into())));
        }
        v
    }

    /// Copy `size` bytes between aggregates, `align` bytes at a time.
    fn copy(
        &mut self,
        dst: Option<Value>,
        src: Option<Value>,
        size: u64,
        align: u32,
    ) -> CodegenResult<()> {
        let (load, store) = match align {
            1 => (Opcode::Loadub, Opcode::Storeb),
            2 => (Opcode::Loaduh, Opcode::Storeh),
            4 => (Opcode::Loadw, Opcode::Storew),
            8 => (Opcode::Loadl, Opcode::Storel),
            _ => {
                return Err(CodegenError::Internal(format!(
                    "invalid alignment {align}"
                )))
            }
        };
        let inc = Some(Value::IntConst(align.into()));
        let (mut dst, mut src) = (dst, src);
        let mut off = 0u64;
        loop {
            let tmp = self.inst(load, Some(Class::L), src, None);
            self.inst(store, None, tmp, dst);
            off += u64::from(align);
            if off >= size {
                break;
            }
            src = self.inst(Opcode::Add, Some(Class::L), src, inc);
            dst = self.inst(Opcode::Add, Some(Class::L), dst, inc);
        }
        Ok(())
    }

    /// Store `v` into `lval` as type `ty`. Aggregates are copied; stores
    /// through a bit-field window read, mask and rewrite the whole storage
    /// unit. Returns the value an assignment expression yields: for
    /// bit-fields that is the stored-as-observed readback.
    pub(crate) fn store(
        &mut self,
        types: &Types,
        ty: TypeRef,
        qual: TypeQual,
        lval: LValue,
        v: Option<Value>,
    ) -> CodegenResult<Option<Value>> {
        if qual.contains(TypeQual::VOLATILE) {
            return Err(CodegenError::Diagnostic(
                "volatile store is not yet supported".to_string(),
            ));
        }
        if qual.contains(TypeQual::CONST) {
            return Err(CodegenError::Diagnostic(
                "cannot store to 'const' object".to_string(),
            ));
        }
        debug_assert!(
            lval.bits.is_empty() || types[ty].props.contains(TypeProps::INT)
        );
        let mut r = v;
        match types[ty].kind {
            TypeKind::Struct { .. } | TypeKind::Union { .. } | TypeKind::Array { .. } => {
                let (size, align) = (types[ty].size, types[ty].align);
                self.copy(lval.addr, v, size, align)?;
            }
            _ => {
                let ty = match types[ty].kind {
                    TypeKind::Pointer { .. } => types.ulong_ty,
                    _ => ty,
                };
                debug_assert!(types[ty].props.contains(TypeProps::SCALAR));
                let repr = types.repr(ty)?.ok_or_else(|| {
                    CodegenError::Internal("store to a classless type".to_string())
                })?;
                let mut v = v;
                let bits = lval.bits.before + lval.bits.after;
                if bits != 0 {
                    let width = types[ty].size * 8;
                    let mask = (u64::MAX >> (64 - width + u64::from(bits)))
                        << lval.bits.before;
                    v = self.inst(
                        Opcode::Shl,
                        Some(repr.class),
                        v,
                        Some(Value::IntConst(lval.bits.before.into())),
                    );
                    r = self.extract_bits(types, ty, v, lval.bits);
                    v = self.inst(Opcode::And, Some(repr.class), v, Some(Value::IntConst(mask)));
                    let loaded = self.inst(repr.load, Some(repr.class), lval.addr, None);
                    let keep =
                        self.inst(Opcode::And, Some(repr.class), loaded, Some(Value::IntConst(!mask)));
                    v = self.inst(Opcode::Or, Some(repr.class), v, keep);
                }
                self.inst(repr.store, None, v, lval.addr);
            }
        }
        Ok(r)
    }

    /// Load the value designated by `lval` as type `ty`. Aggregates load as
    /// their address.
    pub(crate) fn load(
        &mut self,
        types: &Types,
        ty: TypeRef,
        lval: LValue,
    ) -> CodegenResult<Option<Value>> {
        match types[ty].kind {
            TypeKind::Struct { .. } | TypeKind::Union { .. } | TypeKind::Array { .. } => {
                Ok(lval.addr)
            }
            _ => {
                let repr = types.repr(ty)?.ok_or_else(|| {
                    CodegenError::Internal("load of a classless type".to_string())
                })?;
                let v = self.inst(repr.load, Some(repr.class), lval.addr, None);
                Ok(self.extract_bits(types, ty, v, lval.bits))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{DeclData, DeclKind, Linkage};
    use crate::module::Module;

    fn func_with<'a, 'm>(module: &'a mut Module<'m>) -> Func {
        let void = module.types.void_ty;
        let fty = module.types.func_type(void, Vec::new(), false, true);
        let d = module
            .decls
            .push(DeclData::new(DeclKind::Func, fty, TypeQual::empty(), Linkage::Extern));
        Func::new(module, d, "f", fty).unwrap()
    }

    #[test]
    fn terminators_are_one_shot() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let mut f = func_with(&mut module);
        let other = f.new_block(&mut module, "other");
        f.jmp(other);
        f.ret(None);
        assert_eq!(f.blocks[f.tail].term, Some(Terminator::Jmp(other)));
    }

    #[test]
    fn no_instructions_after_terminator() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let mut f = func_with(&mut module);
        let a = f.inst(
            Opcode::Add,
            Some(Class::W),
            Some(Value::IntConst(1)),
            Some(Value::IntConst(2)),
        );
        assert!(a.is_some());
        f.ret(None);
        let before = f.blocks[f.tail].insts.len();
        let b = f.inst(
            Opcode::Add,
            Some(Class::W),
            Some(Value::IntConst(1)),
            Some(Value::IntConst(2)),
        );
        assert_eq!(b, None);
        assert_eq!(f.blocks[f.tail].insts.len(), before);
    }

    #[test]
    fn temps_are_dense() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let mut f = func_with(&mut module);
        for i in 1..=5u32 {
            let v = f.inst(
                Opcode::Add,
                Some(Class::W),
                Some(Value::IntConst(0)),
                Some(Value::IntConst(i.into())),
            );
            assert_eq!(v, Some(Value::Temp(i)));
        }
        // Stores produce no result and burn no id.
        f.inst(Opcode::Storew, None, Some(Value::IntConst(0)), Some(Value::Temp(1)));
        let v = f.inst(Opcode::Add, Some(Class::W), Some(Value::Temp(5)), None);
        assert_eq!(v, Some(Value::Temp(6)));
    }

    #[test]
    fn goto_labels_collapse_by_name() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let mut f = func_with(&mut module);
        let a = f.goto_label(&mut module, "L");
        let b = f.goto_label(&mut module, "L");
        let c = f.goto_label(&mut module, "M");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn allocas_land_in_the_start_block() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let mut f = func_with(&mut module);
        let int = module.types.int_ty;
        let d = module
            .decls
            .push(DeclData::new(DeclKind::Object, int, TypeQual::empty(), Linkage::None));
        // The tail is the body block by now, not the start block.
        assert_ne!(f.tail, f.start);
        f.alloc(&mut module, d).unwrap();
        let start = &f.blocks[f.start];
        assert_eq!(start.insts.last().unwrap().op, Opcode::Alloc4);
        assert_eq!(module.decls[d].value, start.insts.last().unwrap().res);
        assert_eq!(module.decls[d].align, 4);
    }

    #[test]
    fn stricter_declared_alignment_is_diagnosed() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let mut f = func_with(&mut module);
        let int = module.types.int_ty;
        let mut dd = DeclData::new(DeclKind::Object, int, TypeQual::empty(), Linkage::None);
        dd.align = 2;
        let d = module.decls.push(dd);
        assert!(matches!(
            f.alloc(&mut module, d),
            Err(CodegenError::Diagnostic(_))
        ));
    }
}
