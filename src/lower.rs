//! Lowering of expressions, initializers and switch dispatch.
//!
//! Lowering is post-order: sub-expressions are evaluated left to right,
//! except for the short-circuit and conditional operators, which build
//! explicit control flow. Every entry point takes the module because
//! lowering can emit type definitions (and the `__func__` datum) into the
//! output stream as a side effect.

use std::io::Write;

use smallvec::SmallVec;

use crate::ast::{
    Builtin, Constant, DeclData, DeclKind, DeclRef, Expr, ExprKind, IncDecOp, Init, Linkage,
    UnaryOp,
};
use crate::errors::{CodegenError, CodegenResult};
use crate::func::Func;
use crate::ir::{BitField, Block, Class, LValue, Opcode, Value};
use crate::module::Module;
use crate::tree::{CaseNode, SwitchCases};
use crate::types::{TypeKind, TypeProps, TypeQual, TypeRef};

use crate::ast::BinaryOp as B;
use crate::ir::Opcode as Op;

impl Func {
    /// Lower an expression to a value. `None` means the expression has no
    /// value: it has type `void`, or it sits in unreachable code where the
    /// builder suppresses instruction emission.
    pub fn expr(&mut self, module: &mut Module, e: &Expr) -> CodegenResult<Option<Value>> {
        match &e.kind {
            ExprKind::Ident(d) => {
                let d = *d;
                match module.decls[d].kind {
                    DeclKind::Object => {
                        let lval = LValue::new(module.decls[d].value);
                        let ty = module.decls[d].ty;
                        self.load(&module.types, ty, lval)
                    }
                    DeclKind::Const => Ok(module.decls[d].value),
                    kind => Err(CodegenError::Unsupported(format!(
                        "unimplemented declaration kind {kind:?}"
                    ))),
                }
            }
            ExprKind::Const(c) => {
                let t = &module.types[e.ty];
                match c {
                    Constant::Int(i)
                        if t.props.contains(TypeProps::INT)
                            || matches!(t.kind, TypeKind::Pointer { .. }) =>
                    {
                        Ok(Some(Value::IntConst(*i)))
                    }
                    Constant::Float(x) if t.props.contains(TypeProps::FLOAT) => {
                        Ok(Some(if t.size == 4 {
                            Value::FltConst(*x)
                        } else {
                            Value::DblConst(*x)
                        }))
                    }
                    _ => Err(CodegenError::Internal(
                        "constant does not match its type".to_string(),
                    )),
                }
            }
            ExprKind::Bitfield { .. } | ExprKind::Compound { .. } => {
                let lval = self.lval(module, e)?;
                self.load(&module.types, e.ty, lval)
            }
            ExprKind::IncDec { op, post, base } => {
                let lval = self.lval(module, base)?;
                let l = self.load(&module.types, base.ty, lval)?;
                let t = &module.types[e.ty];
                let step = match &t.kind {
                    TypeKind::Pointer { base } => Value::IntConst(module.types[*base].size),
                    _ if t.props.contains(TypeProps::INT) => Value::IntConst(1),
                    _ if t.props.contains(TypeProps::FLOAT) => {
                        if t.size == 4 {
                            Value::FltConst(1.0)
                        } else {
                            Value::DblConst(1.0)
                        }
                    }
                    _ => {
                        return Err(CodegenError::Internal(
                            "increment of a non-scalar".to_string(),
                        ))
                    }
                };
                let class = module.types.class_of(e.ty)?;
                let op = match op {
                    IncDecOp::Inc => Op::Add,
                    IncDecOp::Dec => Op::Sub,
                };
                let v = self.inst(op, class, l, Some(step));
                let v = self.store(&module.types, e.ty, e.qual, lval, v)?;
                Ok(if *post { l } else { v })
            }
            ExprKind::Call { callee, args } => {
                let fnty = match module.types[callee.ty].kind {
                    TypeKind::Pointer { base } => base,
                    _ => callee.ty,
                };
                let variadic = matches!(
                    module.types[fnty].kind,
                    TypeKind::Func { variadic: true, .. }
                );
                let op = if variadic { Op::Vacall } else { Op::Call };
                let mut argvals: SmallVec<[Option<Value>; 8]> = SmallVec::new();
                for arg in args {
                    module.emit_type(arg.ty)?;
                    argvals.push(self.expr(module, arg)?);
                }
                module.emit_type(e.ty)?;
                let callee_v = self.expr(module, callee)?;
                let class = module.types.class_of(e.ty)?;
                let tv = module.types.type_value(e.ty);
                let v = self.inst(op, class, callee_v, tv);
                for (arg, &av) in args.iter().zip(argvals.iter()) {
                    let class = module.types.class_of(arg.ty)?;
                    let tv = module.types.type_value(arg.ty);
                    self.inst(Op::Arg, class, av, tv);
                }
                Ok(v)
            }
            ExprKind::Unary { op, base } => match op {
                UnaryOp::Addr => Ok(self.lval(module, base)?.addr),
                UnaryOp::Deref => {
                    let p = self.expr(module, base)?;
                    self.load(&module.types, e.ty, LValue::new(p))
                }
            },
            ExprKind::Cast { base } => {
                let l = self.expr(module, base)?;
                self.convert(module, e.ty, base.ty, l)
            }
            ExprKind::Binary { op, lhs, rhs } => self.binary(module, e, *op, lhs, rhs),
            ExprKind::Cond { cond, then, els } => {
                let bt = self.new_block(module, "cond_true");
                let bf = self.new_block(module, "cond_false");
                let bj = self.new_block(module, "cond_join");

                let v = self.expr(module, cond)?;
                self.jnz(v, bt, bf);

                self.label(bt);
                self.blocks[bj].phi.val[0] = self.expr(module, then)?;
                self.blocks[bj].phi.blk[0] = Some(self.tail);
                self.jmp(bj);

                self.label(bf);
                self.blocks[bj].phi.val[1] = self.expr(module, els)?;
                self.blocks[bj].phi.blk[1] = Some(self.tail);

                self.label(bj);
                if matches!(module.types[e.ty].kind, TypeKind::Void) {
                    return Ok(None);
                }
                let res = self.temp();
                self.blocks[bj].phi.res = Some(res);
                self.blocks[bj].phi.class = module.types.class_of(e.ty)?;
                Ok(Some(res))
            }
            ExprKind::Assign { lhs, rhs } => {
                let r = self.expr(module, rhs)?;
                if let ExprKind::Temp(slot) = &lhs.kind {
                    slot.set(r);
                    Ok(r)
                } else {
                    let lval = self.lval(module, lhs)?;
                    self.store(&module.types, lhs.ty, lhs.qual, lval, r)
                }
            }
            ExprKind::Comma { exprs } => {
                let (last, rest) = exprs.split_last().ok_or_else(|| {
                    CodegenError::Internal("empty comma expression".to_string())
                })?;
                for e in rest {
                    self.expr(module, e)?;
                }
                self.expr(module, last)
            }
            ExprKind::Builtin(b) => match b {
                Builtin::VaStart(base) => {
                    let l = self.expr(module, base)?;
                    self.inst(Op::Vastart, None, l, None);
                    Ok(None)
                }
                Builtin::VaArg(base) => {
                    if !module.types[e.ty].props.contains(TypeProps::SCALAR) {
                        return Err(CodegenError::Unsupported(
                            "va_arg with non-scalar type is not yet supported".to_string(),
                        ));
                    }
                    let l = self.expr(module, base)?;
                    let class = module.types.class_of(e.ty)?;
                    Ok(self.inst(Op::Vaarg, class, l, None))
                }
                Builtin::VaEnd => Ok(None),
                Builtin::Alloca(base) => {
                    let l = self.expr(module, base)?;
                    Ok(self.inst(Op::Alloc16, Some(Class::L), l, None))
                }
            },
            ExprKind::Temp(slot) => {
                debug_assert!(slot.get().is_some(), "temporary used before assignment");
                Ok(slot.get())
            }
            ExprKind::String(_) => Err(CodegenError::Unsupported(
                "unimplemented expression kind".to_string(),
            )),
        }
    }

    /// Lower an expression that designates an object.
    pub fn lval(&mut self, module: &mut Module, e: &Expr) -> CodegenResult<LValue> {
        let (e, bits) = match &e.kind {
            ExprKind::Bitfield { base, bits } => (base.as_ref(), *bits),
            _ => (e, BitField::default()),
        };
        let addr = match &e.kind {
            ExprKind::Ident(d) => {
                let d = *d;
                match module.decls[d].kind {
                    DeclKind::Object | DeclKind::Func => {}
                    _ => {
                        return Err(CodegenError::Diagnostic(
                            "identifier is not an object or function".to_string(),
                        ))
                    }
                }
                if self.namedecl == Some(d) {
                    // First reference to __func__: emit its datum now and
                    // retire the one-shot slot.
                    let v = module.decls[d].value.ok_or_else(|| {
                        CodegenError::Internal("__func__ has no symbol".to_string())
                    })?;
                    write!(module.out, "data ")?;
                    module.write_value(None, v)?;
                    writeln!(module.out, " = {{ b \"{}\", b 0 }}", self.name)?;
                    self.namedecl = None;
                }
                module.decls[d].value
            }
            ExprKind::String(data) => {
                let d = module.string_decl(data);
                module.decls[d].value
            }
            ExprKind::Compound { init } => {
                let d = module.decls.push(DeclData::new(
                    DeclKind::Object,
                    e.ty,
                    e.qual,
                    Linkage::None,
                ));
                self.init(module, d, Some(init))?;
                module.decls[d].value
            }
            ExprKind::Unary {
                op: UnaryOp::Deref,
                base,
            } => self.expr(module, base)?,
            ExprKind::Unary { .. } => {
                return Err(CodegenError::Diagnostic(
                    "expression is not an object".to_string(),
                ))
            }
            _ => {
                if matches!(
                    module.types[e.ty].kind,
                    TypeKind::Struct { .. } | TypeKind::Union { .. }
                ) {
                    self.expr(module, e)?
                } else {
                    return Err(CodegenError::Diagnostic(
                        "expression is not an object".to_string(),
                    ));
                }
            }
        };
        Ok(LValue { addr, bits })
    }

    fn binary(
        &mut self,
        module: &mut Module,
        e: &Expr,
        op: B,
        lhs: &Expr,
        rhs: &Expr,
    ) -> CodegenResult<Option<Value>> {
        let l = self.expr(module, lhs)?;
        if let B::LogAnd | B::LogOr = op {
            let br = self.new_block(module, "logic_right");
            let bj = self.new_block(module, "logic_join");
            if op == B::LogOr {
                self.jnz(l, bj, br);
            } else {
                self.jnz(l, br, bj);
            }
            self.blocks[bj].phi.val[0] = l;
            self.blocks[bj].phi.blk[0] = Some(self.tail);
            self.label(br);
            let r = self.expr(module, rhs)?;
            self.blocks[bj].phi.val[1] = r;
            self.blocks[bj].phi.blk[1] = Some(self.tail);
            self.label(bj);
            let res = self.temp();
            self.blocks[bj].phi.res = Some(res);
            self.blocks[bj].phi.class = Some(Class::W);
            return Ok(Some(res));
        }
        let r = self.expr(module, rhs)?;

        // Pointer operands behave as unsigned long; the semantic analyzer
        // has already scaled any pointer arithmetic.
        let t = match module.types[lhs.ty].kind {
            TypeKind::Pointer { .. } => module.types.ulong_ty,
            _ => lhs.ty,
        };
        let td = &module.types[t];
        let int = td.props.contains(TypeProps::INT);
        let flt = td.props.contains(TypeProps::FLOAT);
        let signed = module.types.is_signed(t);
        let narrow = td.size <= 4;
        // Comparison opcodes split by (float, signedness, operand width).
        let pick = |fs: Op, sw: Op, uw: Op, fd: Op, sl: Op, ul: Op| {
            if narrow {
                if flt {
                    fs
                } else if signed {
                    sw
                } else {
                    uw
                }
            } else if flt {
                fd
            } else if signed {
                sl
            } else {
                ul
            }
        };
        let op = match op {
            B::Mul => Op::Mul,
            B::Div => {
                if !int || signed {
                    Op::Div
                } else {
                    Op::Udiv
                }
            }
            B::Rem => {
                if signed {
                    Op::Rem
                } else {
                    Op::Urem
                }
            }
            B::Add => Op::Add,
            B::Sub => Op::Sub,
            B::Shl => Op::Shl,
            B::Shr => {
                if signed {
                    Op::Sar
                } else {
                    Op::Shr
                }
            }
            B::Or => Op::Or,
            B::And => Op::And,
            B::Xor => Op::Xor,
            B::Lt => pick(Op::Clts, Op::Csltw, Op::Cultw, Op::Cltd, Op::Csltl, Op::Cultl),
            B::Gt => pick(Op::Cgts, Op::Csgtw, Op::Cugtw, Op::Cgtd, Op::Csgtl, Op::Cugtl),
            B::Le => pick(Op::Cles, Op::Cslew, Op::Culew, Op::Cled, Op::Cslel, Op::Culel),
            B::Ge => pick(Op::Cges, Op::Csgew, Op::Cugew, Op::Cged, Op::Csgel, Op::Cugel),
            B::Eq => {
                if narrow {
                    if flt {
                        Op::Ceqs
                    } else {
                        Op::Ceqw
                    }
                } else if flt {
                    Op::Ceqd
                } else {
                    Op::Ceql
                }
            }
            B::Ne => {
                if narrow {
                    if flt {
                        Op::Cnes
                    } else {
                        Op::Cnew
                    }
                } else if flt {
                    Op::Cned
                } else {
                    Op::Cnel
                }
            }
            B::LogAnd | B::LogOr => unreachable!("handled above"),
        };
        let class = module.types.class_of(e.ty)?;
        Ok(self.inst(op, class, l, r))
    }

    /// Convert a scalar value between two types.
    pub(crate) fn convert(
        &mut self,
        module: &mut Module,
        dst: TypeRef,
        src: TypeRef,
        l: Option<Value>,
    ) -> CodegenResult<Option<Value>> {
        let mut src = src;
        let mut dst = dst;
        if matches!(module.types[src].kind, TypeKind::Pointer { .. }) {
            src = module.types.ulong_ty;
        }
        if matches!(module.types[dst].kind, TypeKind::Pointer { .. }) {
            dst = module.types.ulong_ty;
        }
        if matches!(module.types[dst].kind, TypeKind::Void) {
            return Ok(None);
        }
        let sp = module.types[src].props;
        let dp = module.types[dst].props;
        if !sp.contains(TypeProps::REAL) || !dp.contains(TypeProps::REAL) {
            return Err(CodegenError::Internal("unsupported conversion".to_string()));
        }
        let ssize = module.types[src].size;
        let dsize = module.types[dst].size;
        let ssigned = module.types.is_signed(src);

        let mut l = l;
        let mut r = None;
        let class;
        let op;
        if matches!(module.types[dst].kind, TypeKind::Bool) {
            class = Class::W;
            if sp.contains(TypeProps::INT) {
                r = Some(Value::IntConst(0));
                op = match ssize {
                    1 => {
                        l = self.inst(Op::Extub, Some(Class::W), l, None);
                        Op::Cnew
                    }
                    2 => {
                        l = self.inst(Op::Extuh, Some(Class::W), l, None);
                        Op::Cnew
                    }
                    4 => Op::Cnew,
                    8 => Op::Cnel,
                    _ => {
                        return Err(CodegenError::Internal(
                            "unknown bool conversion".to_string(),
                        ))
                    }
                };
            } else {
                debug_assert!(sp.contains(TypeProps::FLOAT));
                match ssize {
                    4 => {
                        op = Op::Cnes;
                        r = Some(Value::FltConst(0.0));
                    }
                    8 => {
                        op = Op::Cned;
                        r = Some(Value::DblConst(0.0));
                    }
                    _ => {
                        return Err(CodegenError::Internal(
                            "unknown bool conversion".to_string(),
                        ))
                    }
                }
            }
        } else if dp.contains(TypeProps::INT) {
            class = if dsize == 8 { Class::L } else { Class::W };
            if sp.contains(TypeProps::INT) {
                if dsize <= ssize {
                    return Ok(l);
                }
                op = match ssize {
                    4 => {
                        if ssigned {
                            Op::Extsw
                        } else {
                            Op::Extuw
                        }
                    }
                    2 => {
                        if ssigned {
                            Op::Extsh
                        } else {
                            Op::Extuh
                        }
                    }
                    1 => {
                        if ssigned {
                            Op::Extsb
                        } else {
                            Op::Extub
                        }
                    }
                    _ => {
                        return Err(CodegenError::Internal(
                            "unknown int conversion".to_string(),
                        ))
                    }
                };
            } else {
                if !module.types.is_signed(dst) {
                    let src_class = if ssize == 8 { Class::D } else { Class::S };
                    return Ok(self.ftou(module, class, src_class, l));
                }
                op = if ssize == 8 { Op::Dtosi } else { Op::Stosi };
            }
        } else {
            class = if dsize == 8 { Class::D } else { Class::S };
            if sp.contains(TypeProps::INT) {
                if !ssigned {
                    let src_class = if ssize == 8 { Class::L } else { Class::W };
                    return Ok(self.utof(module, class, src_class, l));
                }
                op = if ssize == 8 { Op::Sltof } else { Op::Swtof };
            } else {
                debug_assert!(sp.contains(TypeProps::FLOAT));
                if ssize == dsize {
                    return Ok(l);
                }
                op = if ssize < dsize { Op::Exts } else { Op::Truncd };
            }
        }
        Ok(self.inst(op, Some(class), l, r))
    }

    /// Unsigned integer to float. The target SSA only converts signed
    /// integers, so a 64-bit value with its top bit set goes through a
    /// halve-and-double detour, rounding to odd so no precision is lost
    /// twice.
    fn utof(
        &mut self,
        module: &mut Module,
        dst: Class,
        src: Class,
        v: Option<Value>,
    ) -> Option<Value> {
        if src == Class::W {
            let v = self.inst(Op::Extuw, Some(Class::L), v, None);
            return self.inst(Op::Sltof, Some(dst), v, None);
        }

        let join = self.new_block(module, "utof_join");
        let small = self.new_block(module, "utof_small");
        let big_blk = self.new_block(module, "utof_big");
        self.blocks[join].phi.blk = [Some(small), Some(big_blk)];

        let big = self.inst(Op::Csltl, Some(Class::W), v, Some(Value::IntConst(0)));
        self.jnz(big, big_blk, small);

        self.label(small);
        self.blocks[join].phi.val[0] = self.inst(Op::Sltof, Some(dst), v, None);
        self.jmp(join);

        self.label(big_blk);
        let odd = self.inst(Op::And, Some(Class::L), v, Some(Value::IntConst(1)));
        let v = self.inst(Op::Shr, Some(Class::L), v, Some(Value::IntConst(1)));
        let v = self.inst(Op::Or, Some(Class::L), v, odd); // round to odd
        let v = self.inst(Op::Sltof, Some(dst), v, None);
        self.blocks[join].phi.val[1] = self.inst(Op::Add, Some(dst), v, v);

        self.label(join);
        let res = self.temp();
        self.blocks[join].phi.res = Some(res);
        self.blocks[join].phi.class = Some(dst);
        Some(res)
    }

    /// Float to unsigned integer: values beyond the signed range are
    /// rebased below it and the sign bit is patched back in.
    fn ftou(
        &mut self,
        module: &mut Module,
        dst: Class,
        src: Class,
        v: Option<Value>,
    ) -> Option<Value> {
        let op = if src == Class::S { Op::Stosi } else { Op::Dtosi };
        if dst == Class::W {
            return self.inst(op, Some(Class::L), v, None);
        }

        let join = self.new_block(module, "ftou_join");
        let small = self.new_block(module, "ftou_small");
        let big_blk = self.new_block(module, "ftou_big");
        self.blocks[join].phi.blk = [Some(small), Some(big_blk)];

        let top = (1u64 << 63) as f64;
        let maxflt = Some(if src == Class::S {
            Value::FltConst(top)
        } else {
            Value::DblConst(top)
        });
        let maxint = Some(Value::IntConst(1u64 << 63));

        let cmp = if src == Class::S { Op::Cges } else { Op::Cged };
        let big = self.inst(cmp, Some(Class::W), v, maxflt);
        self.jnz(big, big_blk, small);

        self.label(small);
        self.blocks[join].phi.val[0] = self.inst(op, Some(dst), v, None);
        self.jmp(join);

        self.label(big_blk);
        let v = self.inst(Op::Sub, Some(src), v, maxflt);
        let v = self.inst(op, Some(dst), v, None);
        self.blocks[join].phi.val[1] = self.inst(Op::Xor, Some(dst), v, maxint);

        self.label(join);
        let res = self.temp();
        self.blocks[join].phi.res = Some(res);
        self.blocks[join].phi.class = Some(dst);
        Some(res)
    }

    /// Synthesize zero stores over `[offset, end)`, using the widest
    /// power-of-two store the running alignment allows.
    fn zero(&mut self, addr: Option<Value>, align: u32, offset: u64, end: u64) {
        fn store_op(width: u64) -> Opcode {
            match width {
                1 => Op::Storeb,
                2 => Op::Storeh,
                4 => Op::Storew,
                8 => Op::Storel,
                _ => unreachable!("zero store of width {width}"),
            }
        }
        let align = u64::from(align.min(8));
        let zero = Some(Value::IntConst(0));
        let mut offset = offset;
        let mut a = 1u64;
        while offset < end {
            if (align - (offset & (align - 1))) & a != 0 {
                let tmp = if offset != 0 {
                    self.inst(Op::Add, Some(Class::L), addr, Some(Value::IntConst(offset)))
                } else {
                    addr
                };
                self.inst(store_op(a), None, zero, tmp);
                offset += a;
            }
            if a < align {
                a <<= 1;
            }
        }
    }

    /// Allocate a declared object and lower its initializer, if any. Bytes
    /// not covered by an initializer run are zeroed, including padding
    /// between runs.
    pub fn init(
        &mut self,
        module: &mut Module,
        d: DeclRef,
        init: Option<&[Init]>,
    ) -> CodegenResult<()> {
        self.alloc(module, d)?;
        let Some(inits) = init else {
            return Ok(());
        };
        let addr = module.decls[d].value;
        let ty = module.decls[d].ty;
        let (align, size) = (module.types[ty].align, module.types[ty].size);
        let char_ty = module.types.char_ty;
        let mut offset = 0u64;
        let mut max = 0u64;
        for cur in inits {
            self.zero(addr, align, offset, cur.start);
            let mut dst = LValue {
                addr,
                bits: cur.bits,
            };
            if let ExprKind::String(data) = &cur.expr.kind {
                let n = (data.len() as u64).min(cur.end - cur.start);
                for i in 0..n {
                    dst.addr = self.inst(
                        Op::Add,
                        Some(Class::L),
                        addr,
                        Some(Value::IntConst(cur.start + i)),
                    );
                    let byte = Some(Value::IntConst(u64::from(data[i as usize])));
                    self.store(&module.types, char_ty, TypeQual::empty(), dst, byte)?;
                }
                offset = cur.start + n;
            } else {
                if offset < cur.end && !cur.bits.is_empty() {
                    // A bit-field store rewrites its whole storage unit, so
                    // the unit must be zeroed up front.
                    self.zero(addr, align, offset, cur.end);
                }
                dst.addr = addr;
                // The downstream memory optimizer does not treat `ptr + 0`
                // as `ptr`, so skip the add at offset zero.
                if cur.start > 0 {
                    dst.addr = self.inst(
                        Op::Add,
                        Some(Class::L),
                        addr,
                        Some(Value::IntConst(cur.start)),
                    );
                }
                let src = self.expr(module, &cur.expr)?;
                self.store(&module.types, cur.expr.ty, TypeQual::empty(), dst, src)?;
                offset = cur.end;
            }
            max = max.max(offset);
        }
        self.zero(addr, align, max, size);
        Ok(())
    }

    /// Lower a `switch` dispatch: a binary search over the case tree, with
    /// an equality test and an unsigned-order split per node. Unsigned
    /// order is correct because case keys were normalized to the
    /// controlling type's bit pattern during semantic analysis.
    pub fn switch(
        &mut self,
        module: &mut Module,
        v: Option<Value>,
        cases: &SwitchCases,
        default: Block,
    ) -> CodegenResult<()> {
        let class = module.types.class_of(cases.ty)?.ok_or_else(|| {
            CodegenError::Internal("switch on a classless type".to_string())
        })?;
        self.case_search(module, class, v, cases.root(), default);
        Ok(())
    }

    fn case_search(
        &mut self,
        module: &mut Module,
        class: Class,
        v: Option<Value>,
        node: Option<&CaseNode>,
        default: Block,
    ) {
        let Some(c) = node else {
            self.jmp(default);
            return;
        };
        let ne = self.new_block(module, "switch_ne");
        let lt = self.new_block(module, "switch_lt");
        let gt = self.new_block(module, "switch_gt");

        let key = Some(Value::IntConst(c.key));
        let eq_op = if class == Class::W { Op::Ceqw } else { Op::Ceql };
        let res = self.inst(eq_op, Some(Class::W), v, key);
        self.jnz(res, c.body, ne);
        self.label(ne);
        let lt_op = if class == Class::W { Op::Cultw } else { Op::Cultl };
        let res = self.inst(lt_op, Some(Class::W), v, key);
        self.jnz(res, lt, gt);
        self.label(lt);
        self.case_search(module, class, v, c.child(0), default);
        self.label(gt);
        self.case_search(module, class, v, c.child(1), default);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Member, Param};

    fn define(module: &mut Module, name: &str, ret: TypeRef, params: Vec<Param>) -> Func {
        let fty = module.types.func_type(ret, params, false, true);
        let d = module.decls.push(DeclData::new(
            DeclKind::Func,
            fty,
            TypeQual::empty(),
            Linkage::Extern,
        ));
        Func::new(module, d, name, fty).unwrap()
    }

    fn param(name: &str, ty: TypeRef) -> Param {
        Param {
            name: name.to_string(),
            ty,
            qual: TypeQual::empty(),
        }
    }

    fn object(module: &mut Module, ty: TypeRef) -> DeclRef {
        module.decls.push(DeclData::new(
            DeclKind::Object,
            ty,
            TypeQual::empty(),
            Linkage::None,
        ))
    }

    fn local(module: &mut Module, f: &mut Func, ty: TypeRef) -> DeclRef {
        let d = object(module, ty);
        f.init(module, d, None).unwrap();
        d
    }

    fn ident(module: &Module, d: DeclRef) -> Expr {
        Expr::new(ExprKind::Ident(d), module.decls[d].ty)
    }

    fn int_const(module: &Module, i: u64) -> Expr {
        Expr::new(ExprKind::Const(Constant::Int(i)), module.types.int_ty)
    }

    fn whole(start: u64, end: u64, expr: Expr) -> Init {
        Init {
            start,
            end,
            bits: BitField::default(),
            expr,
        }
    }

    #[test]
    fn pointer_deref_load() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let int = module.types.int_ty;
        let pint = module.types.pointer_to(int);
        let void = module.types.void_ty;
        let mut f = define(&mut module, "f", void, Vec::new());

        let p = local(&mut module, &mut f, pint);
        let x = object(&mut module, int);
        let deref = Expr::new(
            ExprKind::Unary {
                op: UnaryOp::Deref,
                base: Box::new(ident(&module, p)),
            },
            int,
        );
        f.init(&mut module, x, Some(&[whole(0, 4, deref)])).unwrap();
        module.emit_func(&mut f, false).unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "function $f() {\n\
             @start.1\n\
             \t%.1 =l alloc8 8\n\
             \t%.2 =l alloc4 4\n\
             @body.2\n\
             \t%.3 =l loadl %.1\n\
             \t%.4 =w loadw %.3\n\
             \tstorew %.4, %.2\n\
             \tret\n\
             }\n"
        );
    }

    #[test]
    fn unsigned_long_to_double() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let ulong = module.types.ulong_ty;
        let dbl = module.types.double_ty;
        let void = module.types.void_ty;
        let mut f = define(&mut module, "f", void, Vec::new());

        let u = local(&mut module, &mut f, ulong);
        let d = object(&mut module, dbl);
        let cast = Expr::new(
            ExprKind::Cast {
                base: Box::new(ident(&module, u)),
            },
            dbl,
        );
        f.init(&mut module, d, Some(&[whole(0, 8, cast)])).unwrap();
        module.emit_func(&mut f, false).unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "function $f() {\n\
             @start.1\n\
             \t%.1 =l alloc8 8\n\
             \t%.2 =l alloc8 8\n\
             @body.2\n\
             \t%.3 =l loadl %.1\n\
             \t%.4 =w csltl %.3, 0\n\
             \tjnz %.4, @utof_big.5, @utof_small.4\n\
             @utof_small.4\n\
             \t%.5 =d sltof %.3\n\
             \tjmp @utof_join.3\n\
             @utof_big.5\n\
             \t%.6 =l and %.3, 1\n\
             \t%.7 =l shr %.3, 1\n\
             \t%.8 =l or %.7, %.6\n\
             \t%.9 =d sltof %.8\n\
             \t%.10 =d add %.9, %.9\n\
             @utof_join.3\n\
             \t%.11 =d phi @utof_small.4 %.5, @utof_big.5 %.10\n\
             \tstored %.11, %.2\n\
             \tret\n\
             }\n"
        );
    }

    #[test]
    fn unsigned_int_to_float_uses_signed_path() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let uint = module.types.uint_ty;
        let flt = module.types.float_ty;
        let void = module.types.void_ty;
        let mut f = define(&mut module, "f", void, Vec::new());

        let u = local(&mut module, &mut f, uint);
        let d = object(&mut module, flt);
        let cast = Expr::new(
            ExprKind::Cast {
                base: Box::new(ident(&module, u)),
            },
            flt,
        );
        f.init(&mut module, d, Some(&[whole(0, 4, cast)])).unwrap();
        module.emit_func(&mut f, false).unwrap();

        let text = String::from_utf8(buf).unwrap();
        // A 32-bit unsigned value zero-extends and converts directly; no
        // extra control flow.
        assert!(text.contains("extuw"));
        assert!(text.contains("sltof"));
        assert!(!text.contains("utof_join"));
    }

    #[test]
    fn double_to_unsigned_long() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let ulong = module.types.ulong_ty;
        let dbl = module.types.double_ty;
        let void = module.types.void_ty;
        let mut f = define(&mut module, "f", void, Vec::new());

        let d = local(&mut module, &mut f, dbl);
        let u = object(&mut module, ulong);
        let cast = Expr::new(
            ExprKind::Cast {
                base: Box::new(ident(&module, d)),
            },
            ulong,
        );
        f.init(&mut module, u, Some(&[whole(0, 8, cast)])).unwrap();
        module.emit_func(&mut f, false).unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("cged %.3, d_9.2233720368547758e+18"));
        assert!(text.contains("%.8 =l xor %.7, 9223372036854775808"));
        assert!(text.contains("@ftou_join.3\n\t%.9 =l phi @ftou_small.4 %.5, @ftou_big.5 %.8"));
    }

    #[test]
    fn switch_three_cases_searches_from_the_median() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let int = module.types.int_ty;
        let void = module.types.void_ty;
        let mut f = define(&mut module, "f", void, vec![param("v", int)]);

        let b1 = f.new_block(&mut module, "case_1");
        let b5 = f.new_block(&mut module, "case_5");
        let b7 = f.new_block(&mut module, "case_7");
        let bdef = f.new_block(&mut module, "default");
        let mut cases = SwitchCases::new(int);
        cases.add(1, b1).unwrap();
        cases.add(5, b5).unwrap();
        cases.add(7, b7).unwrap();

        let v = ident(&module, f.params()[0]);
        let v = f.expr(&mut module, &v).unwrap();
        f.switch(&mut module, v, &cases, bdef).unwrap();
        for b in [b1, b5, b7, bdef] {
            f.label(b);
            f.ret(None);
        }
        module.emit_func(&mut f, false).unwrap();

        let text = String::from_utf8(buf).unwrap();
        let eq5 = text.find("ceqw %.3, 5").expect("root compare");
        let eq1 = text.find("ceqw %.3, 1").expect("left compare");
        let eq7 = text.find("ceqw %.3, 7").expect("right compare");
        assert!(eq5 < eq1 && eq1 < eq7);
        assert_eq!(text.matches("ceqw").count(), 3);
        assert_eq!(text.matches("cultw").count(), 3);
        // Four empty subtrees fall back to the default label.
        assert_eq!(text.matches("jmp @default.6").count(), 4);
        assert!(text.contains("jnz %.4, @case_5.4, @switch_ne.7"));
    }

    #[test]
    fn bit_field_store_masks_and_reads_back() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let uint = module.types.uint_ty;
        let void = module.types.void_ty;
        let members = vec![
            Member {
                ty: uint,
                offset: 0,
                bits: BitField { before: 0, after: 29 },
            },
            Member {
                ty: uint,
                offset: 0,
                bits: BitField { before: 3, after: 24 },
            },
        ];
        let s_ty = module.types.struct_type(Some("s"), members, 4, 4);
        let mut f = define(&mut module, "f", void, Vec::new());

        let s = local(&mut module, &mut f, s_ty);
        let assign = Expr::new(
            ExprKind::Assign {
                lhs: Box::new(Expr::new(
                    ExprKind::Bitfield {
                        base: Box::new(ident(&module, s)),
                        bits: BitField { before: 3, after: 24 },
                    },
                    uint,
                )),
                rhs: Box::new(Expr::new(ExprKind::Const(Constant::Int(7)), uint)),
            },
            uint,
        );
        let r = f.expr(&mut module, &assign).unwrap();
        // The assignment yields the readback of the stored field.
        assert_eq!(r, Some(Value::Temp(4)));
        module.emit_func(&mut f, false).unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "function $f() {\n\
             @start.1\n\
             \t%.1 =l alloc4 4\n\
             @body.2\n\
             \t%.2 =w shl 7, 3\n\
             \t%.3 =w shl %.2, 24\n\
             \t%.4 =w shr %.3, 27\n\
             \t%.5 =w and %.2, 248\n\
             \t%.6 =w loadw %.1\n\
             \t%.7 =w and %.6, 18446744073709551367\n\
             \t%.8 =w or %.5, %.7\n\
             \tstorew %.8, %.1\n\
             \tret\n\
             }\n"
        );
    }

    #[test]
    fn short_circuit_and() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let int = module.types.int_ty;
        let void = module.types.void_ty;
        let mut f = define(
            &mut module,
            "f",
            void,
            vec![param("a", int), param("b", int)],
        );

        let r = object(&mut module, int);
        let and = Expr::new(
            ExprKind::Binary {
                op: B::LogAnd,
                lhs: Box::new(ident(&module, f.params()[0])),
                rhs: Box::new(ident(&module, f.params()[1])),
            },
            int,
        );
        f.init(&mut module, r, Some(&[whole(0, 4, and)])).unwrap();
        module.emit_func(&mut f, false).unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "function $f(w %.1, w %.3) {\n\
             @start.1\n\
             \t%.2 =l alloc4 4\n\
             \tstorew %.1, %.2\n\
             \t%.4 =l alloc4 4\n\
             \tstorew %.3, %.4\n\
             \t%.5 =l alloc4 4\n\
             @body.2\n\
             \t%.6 =w loadw %.2\n\
             \tjnz %.6, @logic_right.3, @logic_join.4\n\
             @logic_right.3\n\
             \t%.7 =w loadw %.4\n\
             @logic_join.4\n\
             \t%.8 =w phi @body.2 %.6, @logic_right.3 %.7\n\
             \tstorew %.8, %.5\n\
             \tret\n\
             }\n"
        );
    }

    #[test]
    fn goto_forward_and_backward_share_one_block() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let int = module.types.int_ty;
        let void = module.types.void_ty;
        let mut f = define(&mut module, "f", void, Vec::new());

        let x = local(&mut module, &mut f, int);
        let fwd = f.goto_label(&mut module, "L");
        f.jmp(fwd);
        let label = f.goto_label(&mut module, "L");
        assert_eq!(fwd, label);
        f.label(label);
        let assign = Expr::new(
            ExprKind::Assign {
                lhs: Box::new(ident(&module, x)),
                rhs: Box::new(int_const(&module, 1)),
            },
            int,
        );
        f.expr(&mut module, &assign).unwrap();
        let back = f.goto_label(&mut module, "L");
        assert_eq!(back, label);
        f.jmp(back);
        module.emit_func(&mut f, false).unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.matches("\n@L.3\n").count(), 1); // labeled once
        assert_eq!(text.matches("\tjmp @L.3\n").count(), 2);
    }

    #[test]
    fn narrowing_casts_are_free() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let int = module.types.int_ty;
        let ch = module.types.char_ty;
        let void = module.types.void_ty;
        let mut f = define(&mut module, "f", void, Vec::new());

        let x = local(&mut module, &mut f, int);
        let c = object(&mut module, ch);
        let cast = Expr::new(
            ExprKind::Cast {
                base: Box::new(ident(&module, x)),
            },
            ch,
        );
        f.init(&mut module, c, Some(&[whole(0, 1, cast)])).unwrap();
        module.emit_func(&mut f, false).unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("ext"));
        assert!(text.contains("storeb"));
    }

    #[test]
    fn widening_follows_signedness() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let long = module.types.long_ty;
        let ch = module.types.char_ty;
        let uch = module.types.uchar_ty;
        let void = module.types.void_ty;
        let mut f = define(&mut module, "f", void, Vec::new());

        let sc = local(&mut module, &mut f, ch);
        let uc = local(&mut module, &mut f, uch);
        for src in [sc, uc] {
            let l = object(&mut module, long);
            let cast = Expr::new(
                ExprKind::Cast {
                    base: Box::new(ident(&module, src)),
                },
                long,
            );
            f.init(&mut module, l, Some(&[whole(0, 8, cast)])).unwrap();
        }
        module.emit_func(&mut f, false).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("=l extsb"));
        assert!(text.contains("=l extub"));
    }

    #[test]
    fn variadic_call_prints_ellipsis() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let int = module.types.int_ty;
        let dbl = module.types.double_ty;
        let void = module.types.void_ty;

        let gty = module
            .types
            .func_type(int, vec![param("x", int)], true, true);
        let pgty = module.types.pointer_to(gty);
        let mut gd = DeclData::new(DeclKind::Func, gty, TypeQual::empty(), Linkage::Extern);
        gd.value = Some(module.global("g", false));
        let g = module.decls.push(gd);

        let mut f = define(&mut module, "f", void, Vec::new());
        let callee = Expr::new(
            ExprKind::Unary {
                op: UnaryOp::Addr,
                base: Box::new(Expr::new(ExprKind::Ident(g), gty)),
            },
            pgty,
        );
        let call = Expr::new(
            ExprKind::Call {
                callee: Box::new(callee),
                args: vec![
                    int_const(&module, 42),
                    Expr::new(ExprKind::Const(Constant::Float(3.5)), dbl),
                ],
            },
            int,
        );
        f.expr(&mut module, &call).unwrap();
        module.emit_func(&mut f, false).unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("\t%.1 =w call $g(w 42, d d_3.5, ...)\n"));
    }

    #[test]
    fn conditional_builds_a_diamond_with_phi() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let int = module.types.int_ty;
        let void = module.types.void_ty;
        let mut f = define(&mut module, "f", void, vec![param("c", int)]);

        let x = object(&mut module, int);
        let cond = Expr::new(
            ExprKind::Cond {
                cond: Box::new(ident(&module, f.params()[0])),
                then: Box::new(int_const(&module, 1)),
                els: Box::new(int_const(&module, 2)),
            },
            int,
        );
        f.init(&mut module, x, Some(&[whole(0, 4, cond)])).unwrap();
        module.emit_func(&mut f, false).unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("jnz %.4, @cond_true.3, @cond_false.4"));
        assert!(text.contains("\tjmp @cond_join.5\n"));
        assert!(text.contains("=w phi @cond_true.3 1, @cond_false.4 2"));
    }

    #[test]
    fn sparse_initializer_zero_fills_gaps() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let int = module.types.int_ty;
        let void = module.types.void_ty;
        let arr = module.types.array_of(int, 3);
        let mut f = define(&mut module, "f", void, Vec::new());

        let a = object(&mut module, arr);
        // arr[1] = 9, everything else zeroed.
        let nine = int_const(&module, 9);
        f.init(&mut module, a, Some(&[whole(4, 8, nine)])).unwrap();
        module.emit_func(&mut f, false).unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "function $f() {\n\
             @start.1\n\
             \t%.1 =l alloc4 12\n\
             @body.2\n\
             \tstorew 0, %.1\n\
             \t%.2 =l add %.1, 4\n\
             \tstorew 9, %.2\n\
             \t%.3 =l add %.1, 8\n\
             \tstorew 0, %.3\n\
             \tret\n\
             }\n"
        );
    }

    #[test]
    fn string_initializer_stores_bytes() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let ch = module.types.char_ty;
        let void = module.types.void_ty;
        let arr = module.types.array_of(ch, 4);
        let mut f = define(&mut module, "f", void, Vec::new());

        let a = object(&mut module, arr);
        let s = Expr::new(ExprKind::String(b"hi\0".to_vec().into_boxed_slice()), arr);
        f.init(&mut module, a, Some(&[whole(0, 4, s)])).unwrap();
        module.emit_func(&mut f, false).unwrap();

        let text = String::from_utf8(buf).unwrap();
        // Three stored bytes, then the trailing byte zeroed.
        assert!(text.contains("storeb 104")); // 'h'
        assert!(text.contains("storeb 105")); // 'i'
        assert!(text.contains("storeb 0, %.4"));
        assert_eq!(text.matches("storeb").count(), 4);
    }

    #[test]
    fn unprototyped_parameters_convert_from_their_promoted_type() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let flt = module.types.float_ty;
        let void = module.types.void_ty;
        let fty = module
            .types
            .func_type(void, vec![param("x", flt)], false, false);
        let d = module.decls.push(DeclData::new(
            DeclKind::Func,
            fty,
            TypeQual::empty(),
            Linkage::Extern,
        ));
        let mut f = Func::new(&mut module, d, "f", fty).unwrap();
        module.emit_func(&mut f, false).unwrap();

        let text = String::from_utf8(buf).unwrap();
        // The parameter arrives as a double and narrows to the declared
        // float before being spilled.
        assert!(text.contains("\t%.2 =s truncd %.1\n"));
        assert!(text.contains("\tstores %.2, %.3\n"));
        // The declared class still shows in the signature.
        assert!(text.contains("function $f(s %.1)"));
    }

    #[test]
    fn func_name_datum_is_emitted_once() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let ch = module.types.char_ty;
        let void = module.types.void_ty;
        let pch = module.types.pointer_to(ch);
        let mut f = define(&mut module, "f", void, Vec::new());

        let nd = f.name_decl().unwrap();
        let name_ty = module.decls[nd].ty;
        let addr = Expr::new(
            ExprKind::Unary {
                op: UnaryOp::Addr,
                base: Box::new(Expr::new(ExprKind::Ident(nd), name_ty)),
            },
            pch,
        );
        f.expr(&mut module, &addr).unwrap();
        f.expr(&mut module, &addr).unwrap();
        module.emit_func(&mut f, false).unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text.matches("data $.L__func__.1 = { b \"f\", b 0 }\n").count(),
            1
        );
    }

    #[test]
    fn missing_return_is_synthesized() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let int = module.types.int_ty;
        let void = module.types.void_ty;
        let mut f = define(&mut module, "main", int, Vec::new());
        module.emit_func(&mut f, true).unwrap();
        let mut g = define(&mut module, "other", void, Vec::new());
        module.emit_func(&mut g, false).unwrap();
        let text = String::from_utf8(buf).unwrap();
        // main falls off the end returning 0; anything else returns void.
        assert!(text.contains("function w $main() {\n@start.1\n@body.2\n\tret 0\n}\n"));
        assert!(text.contains("function $other() {\n@start.3\n@body.4\n\tret\n}\n"));
    }

    #[test]
    fn comma_discards_all_but_the_last_value() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let int = module.types.int_ty;
        let void = module.types.void_ty;
        let mut f = define(&mut module, "f", void, Vec::new());

        let comma = Expr::new(
            ExprKind::Comma {
                exprs: vec![int_const(&module, 1), int_const(&module, 2)],
            },
            int,
        );
        let v = f.expr(&mut module, &comma).unwrap();
        assert_eq!(v, Some(Value::IntConst(2)));
    }

    #[test]
    fn assignment_through_a_temp_slot_binds_it() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let int = module.types.int_ty;
        let void = module.types.void_ty;
        let mut f = define(&mut module, "f", void, Vec::new());

        let assign = Expr::new(
            ExprKind::Assign {
                lhs: Box::new(Expr::new(ExprKind::Temp(Default::default()), int)),
                rhs: Box::new(int_const(&module, 3)),
            },
            int,
        );
        let v = f.expr(&mut module, &assign).unwrap();
        assert_eq!(v, Some(Value::IntConst(3)));
        let ExprKind::Assign { lhs, .. } = &assign.kind else {
            unreachable!();
        };
        let ExprKind::Temp(slot) = &lhs.kind else {
            unreachable!();
        };
        assert_eq!(slot.get(), Some(Value::IntConst(3)));
    }

    #[test]
    fn increments_scale_by_the_pointee() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let long = module.types.long_ty;
        let plong = module.types.pointer_to(long);
        let void = module.types.void_ty;
        let mut f = define(&mut module, "f", void, Vec::new());

        let p = local(&mut module, &mut f, plong);
        let inc = Expr::new(
            ExprKind::IncDec {
                op: IncDecOp::Inc,
                post: false,
                base: Box::new(ident(&module, p)),
            },
            plong,
        );
        f.expr(&mut module, &inc).unwrap();
        module.emit_func(&mut f, false).unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("=l add %.2, 8"));
        assert!(text.contains("storel"));
    }

    #[test]
    fn post_increment_yields_the_old_value() {
        let mut buf = Vec::new();
        let mut module = Module::new(&mut buf);
        let int = module.types.int_ty;
        let void = module.types.void_ty;
        let mut f = define(&mut module, "f", void, Vec::new());

        let x = local(&mut module, &mut f, int);
        let mk = |module: &Module, post| {
            Expr::new(
                ExprKind::IncDec {
                    op: IncDecOp::Inc,
                    post,
                    base: Box::new(ident(module, x)),
                },
                int,
            )
        };
        let post = mk(&module, true);
        let pre = mk(&module, false);
        let old = f.expr(&mut module, &post).unwrap();
        assert_eq!(old, Some(Value::Temp(2))); // the loaded value
        let new = f.expr(&mut module, &pre).unwrap();
        assert_eq!(new, Some(Value::Temp(5))); // the incremented value
    }
}
