//! Textual emission of the QBE dialect.
//!
//! Sigils: `%` temporary, `$` global, `:` named type, `@` label. Private
//! globals carry a `.L` prefix and a numeric suffix. The spellings here are
//! normative for the downstream consumer: class letters, opcode mnemonics,
//! the parenthesized argument list of calls, `, ...` on variadic calls and
//! signatures, and `align N` on data definitions.

use core::fmt;
use std::io::Write;

use log::debug;

use crate::ast::{Constant, DeclRef, Expr, ExprKind, Init, Linkage, UnaryOp};
use crate::errors::{CodegenError, CodegenResult};
use crate::func::Func;
use crate::ir::{Opcode, Terminator, Value};
use crate::module::Module;
use crate::types::{TypeKind, TypeProps, TypeRef};

fn align_up(x: u64, n: u64) -> u64 {
    (x + n - 1) & !(n - 1)
}

/// Render a float the way `printf("%.17g")` would: up to 17 significant
/// digits, trailing zeros trimmed, scientific notation outside
/// `[1e-4, 1e17)`.
fn fmt_g17(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if x == 0.0 {
        return if x.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    let sci = format!("{x:.16e}");
    let (mant, exp) = sci.split_once('e').expect("scientific float format");
    let exp: i32 = exp.parse().expect("float exponent");
    if !(-4..17).contains(&exp) {
        let mant = mant.trim_end_matches('0').trim_end_matches('.');
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{mant}e{sign}{:02}", exp.abs())
    } else {
        let prec = (16 - exp).max(0) as usize;
        let fixed = format!("{x:.prec$}");
        if fixed.contains('.') {
            fixed.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            fixed
        }
    }
}

impl Module<'_> {
    pub(crate) fn write_value(&mut self, f: Option<&Func>, v: Value) -> CodegenResult<()> {
        match v {
            Value::IntConst(i) => write!(self.out, "{i}")?,
            Value::FltConst(x) => write!(self.out, "s_{}", fmt_g17(x))?,
            Value::DblConst(x) => write!(self.out, "d_{}", fmt_g17(x))?,
            Value::Temp(id) => write!(self.out, "%.{id}")?,
            Value::Global(g) => {
                let gd = &self.globals[g];
                if gd.id != 0 {
                    write!(self.out, "$.L{}.{}", gd.name, gd.id)?;
                } else {
                    write!(self.out, "${}", gd.name)?;
                }
            }
            Value::Type(ty) => {
                let id = self.types[ty].emit_id.ok_or_else(|| {
                    CodegenError::Internal("reference to an unemitted type".to_string())
                })?;
                let tag = match &self.types[ty].kind {
                    TypeKind::Struct { tag, .. } | TypeKind::Union { tag, .. } => {
                        tag.as_deref().unwrap_or("")
                    }
                    _ => "",
                };
                write!(self.out, ":{tag}.{id}")?;
            }
            Value::Label(b) => {
                let f = f.ok_or_else(|| {
                    CodegenError::Internal("label reference outside a function".to_string())
                })?;
                let bd = &f.blocks[b];
                write!(self.out, "@{}.{}", bd.name, bd.id)?;
            }
        }
        Ok(())
    }

    /// Print an instruction class: the named type when the companion
    /// operand carries one, otherwise the class letter.
    fn write_class<C: fmt::Display>(
        &mut self,
        class: Option<C>,
        tv: Option<Value>,
    ) -> CodegenResult<()> {
        if let Some(v @ Value::Type(_)) = tv {
            self.write_value(None, v)
        } else if let Some(c) = class {
            write!(self.out, "{c}")?;
            Ok(())
        } else {
            Err(CodegenError::Internal(
                "type has no QBE representation".to_string(),
            ))
        }
    }

    /// Emit the definition of a named aggregate type, once. Nested
    /// aggregates are emitted before their users. Struct members that share
    /// an 8-byte storage unit (adjacent bit-fields) collapse into a single
    /// field represented by the member with the widest storage unit.
    pub fn emit_type(&mut self, ty: TypeRef) -> CodegenResult<()> {
        let t = &self.types[ty];
        if t.emit_id.is_some()
            || !matches!(t.kind, TypeKind::Struct { .. } | TypeKind::Union { .. })
        {
            return Ok(());
        }
        self.next_type += 1;
        let id = self.next_type;
        self.types[ty].emit_id = Some(id);
        let (is_struct, members) = match &self.types[ty].kind {
            TypeKind::Struct { members, .. } => (true, members.clone()),
            TypeKind::Union { members, .. } => (false, members.clone()),
            _ => unreachable!(),
        };
        for m in &members {
            let mut sub = m.ty;
            while let TypeKind::Array { elem, .. } = self.types[sub].kind {
                sub = elem;
            }
            self.emit_type(sub)?;
        }
        write!(self.out, "type ")?;
        self.write_value(None, Value::Type(ty))?;
        write!(self.out, " = {{ ")?;
        let mut i = 0;
        while i < members.len() {
            let mi = if is_struct {
                let mut rep = i;
                let mut j = i + 1;
                while j < members.len() {
                    if members[j].offset >= align_up(members[rep].offset + 1, 8) {
                        break;
                    }
                    if members[j].offset <= members[rep].offset {
                        rep = j;
                    }
                    j += 1;
                }
                rep
            } else {
                write!(self.out, "{{ ")?;
                i
            };
            let mut count = 1u64;
            let mut sub = members[mi].ty;
            while let TypeKind::Array { elem, len } = self.types[sub].kind {
                count *= len;
                sub = elem;
            }
            let data = self.types.repr(sub)?.map(|r| r.data);
            let tv = self.types.type_value(sub);
            self.write_class(data, tv)?;
            if count > 1 {
                write!(self.out, " {count}")?;
            }
            if is_struct {
                write!(self.out, ", ")?;
                // Subsequent members contained in the same storage unit are
                // already covered by the representative.
                let off = members[mi].offset + self.types[members[mi].ty].size;
                let mut j = mi + 1;
                while j < members.len() && members[j].offset < off {
                    j += 1;
                }
                i = j;
            } else {
                write!(self.out, " }} ")?;
                i += 1;
            }
        }
        writeln!(self.out, "}}")?;
        Ok(())
    }

    /// Emit a function. If the final block has no terminator a return is
    /// synthesized: `main` returns 0, anything else returns void.
    pub fn emit_func(&mut self, f: &mut Func, global: bool) -> CodegenResult<()> {
        debug!("emitting function '{}'", f.name());
        if f.blocks[f.tail].term.is_none() {
            let v = if f.name() == "main" {
                Some(Value::IntConst(0))
            } else {
                None
            };
            f.ret(v);
        }
        if global {
            writeln!(self.out, "export")?;
        }
        write!(self.out, "function ")?;
        let (ret, params, variadic) = match &self.types[f.ty].kind {
            TypeKind::Func {
                ret,
                params,
                variadic,
                ..
            } => (*ret, params.clone(), *variadic),
            _ => {
                return Err(CodegenError::Internal(
                    "emitting a function without a function type".to_string(),
                ))
            }
        };
        if !matches!(self.types[ret].kind, TypeKind::Void) {
            let class = self.types.class_of(ret)?;
            let tv = self.types.type_value(ret);
            self.write_class(class, tv)?;
            write!(self.out, " ")?;
        }
        let fv = self.decls[f.decl].value.ok_or_else(|| {
            CodegenError::Internal("function definition without a symbol".to_string())
        })?;
        self.write_value(None, fv)?;
        write!(self.out, "(")?;
        for (i, p) in params.iter().enumerate() {
            if i > 0 {
                write!(self.out, ", ")?;
            }
            let class = self.types.class_of(p.ty)?;
            let tv = self.types.type_value(p.ty);
            self.write_class(class, tv)?;
            write!(self.out, " ")?;
            self.write_value(Some(f), f.param_values[i])?;
        }
        if variadic {
            write!(self.out, ", ...")?;
        }
        writeln!(self.out, ") {{")?;
        for idx in 0..f.order.len() {
            let b = f.order[idx];
            self.write_value(Some(f), Value::Label(b))?;
            writeln!(self.out)?;
            if let Some(res) = f.blocks[b].phi.res {
                let phi = f.blocks[b].phi.clone();
                let class = phi.class.ok_or_else(|| {
                    CodegenError::Internal("phi without a class".to_string())
                })?;
                write!(self.out, "\t")?;
                self.write_value(Some(f), res)?;
                write!(self.out, " ={class} phi ")?;
                for k in 0..2 {
                    if k > 0 {
                        write!(self.out, ", ")?;
                    }
                    let blk = phi.blk[k].ok_or_else(|| {
                        CodegenError::Internal("phi with a missing predecessor".to_string())
                    })?;
                    self.write_value(Some(f), Value::Label(blk))?;
                    write!(self.out, " ")?;
                    let val = phi.val[k].ok_or_else(|| {
                        CodegenError::Internal("phi with a missing value".to_string())
                    })?;
                    self.write_value(Some(f), val)?;
                }
                writeln!(self.out)?;
            }
            let n = f.blocks[b].insts.len();
            let mut i = 0;
            while i < n {
                let inst = f.blocks[b].insts[i].clone();
                write!(self.out, "\t")?;
                if let Some(res) = inst.res {
                    self.write_value(Some(f), res)?;
                    write!(self.out, " =")?;
                    self.write_class(inst.class, inst.args[1])?;
                    write!(self.out, " ")?;
                }
                write!(self.out, "{} ", inst.op.mnemonic())?;
                let a0 = inst.args[0].ok_or_else(|| {
                    CodegenError::Internal("instruction without an operand".to_string())
                })?;
                self.write_value(Some(f), a0)?;
                i += 1;
                match inst.op {
                    Opcode::Call | Opcode::Vacall => {
                        write!(self.out, "(")?;
                        let mut first = true;
                        while i < n && f.blocks[b].insts[i].op == Opcode::Arg {
                            let arg = f.blocks[b].insts[i].clone();
                            if !first {
                                write!(self.out, ", ")?;
                            }
                            first = false;
                            self.write_class(arg.class, arg.args[1])?;
                            write!(self.out, " ")?;
                            let v = arg.args[0].ok_or_else(|| {
                                CodegenError::Internal(
                                    "argument marker without a value".to_string(),
                                )
                            })?;
                            self.write_value(Some(f), v)?;
                            i += 1;
                        }
                        if inst.op == Opcode::Vacall {
                            write!(self.out, ", ...")?;
                        }
                        write!(self.out, ")")?;
                    }
                    _ => {
                        if let Some(a1) = inst.args[1] {
                            write!(self.out, ", ")?;
                            self.write_value(Some(f), a1)?;
                        }
                    }
                }
                writeln!(self.out)?;
            }
            match f.blocks[b].term {
                None => {}
                Some(Terminator::Ret(v)) => {
                    write!(self.out, "\tret")?;
                    if let Some(v) = v {
                        write!(self.out, " ")?;
                        self.write_value(Some(f), v)?;
                    }
                    writeln!(self.out)?;
                }
                Some(Terminator::Jmp(to)) => {
                    write!(self.out, "\tjmp ")?;
                    self.write_value(Some(f), Value::Label(to))?;
                    writeln!(self.out)?;
                }
                Some(Terminator::Jnz(v, nonzero, zero)) => {
                    let v = v.ok_or_else(|| {
                        CodegenError::Internal("branch without a condition".to_string())
                    })?;
                    write!(self.out, "\tjnz ")?;
                    self.write_value(Some(f), v)?;
                    write!(self.out, ", ")?;
                    self.write_value(Some(f), Value::Label(nonzero))?;
                    write!(self.out, ", ")?;
                    self.write_value(Some(f), Value::Label(zero))?;
                    writeln!(self.out)?;
                }
            }
        }
        writeln!(self.out, "}}")?;
        Ok(())
    }

    /// Emit a data definition. Initializer expressions must already be
    /// constant-folded. Bit-field runs are packed little-endian into a
    /// 64-bit accumulator and flushed byte by byte.
    pub fn emit_data(&mut self, d: DeclRef, init: &[Init]) -> CodegenResult<()> {
        let ty = self.decls[d].ty;
        let natural = self.types[ty].align;
        let align = match self.decls[d].align {
            0 => {
                self.decls[d].align = natural;
                natural
            }
            a if a < natural => {
                return Err(CodegenError::Diagnostic(format!(
                    "object requires alignment {natural}, which is stricter than {a}"
                )))
            }
            a => a,
        };
        if self.decls[d].linkage == Linkage::Extern {
            write!(self.out, "export ")?;
        }
        write!(self.out, "data ")?;
        let dv = self.decls[d].value.ok_or_else(|| {
            CodegenError::Internal("data definition without a symbol".to_string())
        })?;
        self.write_value(None, dv)?;
        write!(self.out, " = align {align} {{ ")?;

        let size = self.types[ty].size;
        let mut offset = 0u64;
        let mut bits = 0u64;
        let mut i = 0;
        while i < init.len() {
            let cur = &init[i];
            // A later run may override bytes inside a string initializer
            // (a designated element over a string). Patch a copy of the
            // bytes; anything else overlapping is the unresolved
            // multiple-union-member case.
            let mut patched: Option<Vec<u8>> = None;
            i += 1;
            while i < init.len()
                && init[i].start * 8 + u64::from(init[i].bits.before)
                    < cur.end * 8 - u64::from(cur.bits.after)
            {
                if patched.is_none() {
                    let ExprKind::String(data) = &cur.expr.kind else {
                        return Err(CodegenError::Internal(
                            "overlapping initializer for a non-string object".to_string(),
                        ));
                    };
                    patched = Some(data.to_vec());
                }
                let ExprKind::Const(Constant::Int(byte)) = init[i].expr.kind else {
                    return Err(CodegenError::Internal(
                        "overlapping initializer is not a constant byte".to_string(),
                    ));
                };
                let data = patched.as_mut().expect("patched string bytes");
                data[(init[i].start - cur.start) as usize] = byte as u8;
                i += 1;
            }
            let start = cur.start + u64::from(cur.bits.before) / 8;
            let end = cur.end - (u64::from(cur.bits.after) + 7) / 8;
            if offset < start && bits != 0 {
                // Unfinished byte from the previous bit-field.
                write!(self.out, "b {bits}, ")?;
                offset += 1;
                bits = 0;
            }
            if offset < start {
                write!(self.out, "z {}, ", start - offset)?;
            }
            if !cur.bits.is_empty() {
                // Packed little-endian.
                debug_assert!(self.types[cur.expr.ty].props.contains(TypeProps::INT));
                let ExprKind::Const(Constant::Int(c)) = cur.expr.kind else {
                    return Err(CodegenError::Internal(
                        "bit-field initializer is not an integer constant".to_string(),
                    ));
                };
                bits |= c << (cur.bits.before % 8);
                for _ in start..end {
                    write!(self.out, "b {}, ", bits & 0xff)?;
                    bits >>= 8;
                }
                // Clear the upper `after` bits in the last byte, or all
                // bits when the field ended on a byte boundary.
                bits &= 0x7f >> ((u64::from(cur.bits.after) + 7) % 8);
            } else {
                let t = match self.types[cur.expr.ty].kind {
                    TypeKind::Array { elem, .. } => elem,
                    _ => cur.expr.ty,
                };
                let data = self.types.repr(t)?.map(|r| r.data);
                self.write_class(data, None)?;
                write!(self.out, " ")?;
                if let Some(p) = &patched {
                    self.data_string(p, cur.end - cur.start)?;
                } else {
                    self.data_item(&cur.expr, cur.end - cur.start)?;
                }
                write!(self.out, ", ")?;
            }
            offset = end;
        }
        if bits != 0 {
            write!(self.out, "b {bits}, ")?;
            offset += 1;
        }
        debug_assert!(offset <= size);
        if offset < size {
            write!(self.out, "z {} ", size - offset)?;
        }
        writeln!(self.out, "}}")?;
        Ok(())
    }

    /// One constant data item: a number, a global's address, an address
    /// plus offset, or a string.
    fn data_item(&mut self, expr: &Expr, size: u64) -> CodegenResult<()> {
        match &expr.kind {
            ExprKind::Unary { op, base } => {
                if *op != UnaryOp::Addr {
                    return Err(CodegenError::Internal(
                        "not an address expression".to_string(),
                    ));
                }
                let ExprKind::Ident(d) = base.kind else {
                    return Err(CodegenError::Diagnostic(
                        "initializer is not a constant expression".to_string(),
                    ));
                };
                match self.decls[d].value {
                    Some(v @ Value::Global(_)) => self.write_value(None, v),
                    _ => Err(CodegenError::Internal(
                        "address of a non-global in a data item".to_string(),
                    )),
                }
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                if !matches!(lhs.kind, ExprKind::Unary { .. })
                    || !matches!(rhs.kind, ExprKind::Const(_))
                {
                    return Err(CodegenError::Diagnostic(
                        "initializer is not a constant expression".to_string(),
                    ));
                }
                self.data_item(lhs, 0)?;
                write!(self.out, " + ")?;
                self.data_item(rhs, 0)
            }
            ExprKind::Const(c) => {
                if self.types[expr.ty].props.contains(TypeProps::FLOAT) {
                    let Constant::Float(x) = c else {
                        return Err(CodegenError::Internal(
                            "constant does not match its type".to_string(),
                        ));
                    };
                    let sigil = if self.types[expr.ty].size == 4 { 's' } else { 'd' };
                    write!(self.out, "{sigil}_{}", fmt_g17(*x))?;
                } else {
                    let Constant::Int(iv) = c else {
                        return Err(CodegenError::Internal(
                            "constant does not match its type".to_string(),
                        ));
                    };
                    write!(self.out, "{iv}")?;
                }
                Ok(())
            }
            ExprKind::String(data) => self.data_string(data, size),
            _ => Err(CodegenError::Diagnostic(
                "initializer is not a constant expression".to_string(),
            )),
        }
    }

    /// A string data item, truncated or zero-padded to `size`.
    fn data_string(&mut self, data: &[u8], size: u64) -> CodegenResult<()> {
        write!(self.out, "\"")?;
        let n = (data.len() as u64).min(size) as usize;
        for &c in &data[..n] {
            if (0x20..=0x7e).contains(&c) && c != b'"' && c != b'\\' {
                write!(self.out, "{}", c as char)?;
            } else {
                write!(self.out, "\\{c:03o}")?;
            }
        }
        write!(self.out, "\"")?;
        if (n as u64) < size {
            write!(self.out, ", z {}", size - n as u64)?;
        }
        Ok(())
    }
}
