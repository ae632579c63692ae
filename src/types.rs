//! The C type model and its mapping onto IR classes.
//!
//! Types are supplied by the front end and stored in an arena owned by the
//! module; expressions and declarations refer to them through [`TypeRef`]
//! handles. The basic types are pre-interned so the back-end can talk about
//! `char`, `unsigned long` or `void` without threading them through every
//! call.

use bitflags::bitflags;
use core::ops::{Index, IndexMut};
use cranelift_entity::{entity_impl, PrimaryMap};

use crate::errors::{CodegenError, CodegenResult};
use crate::ir::{BitField, Class, DataClass, Opcode};

/// An opaque reference to a C type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeRef(u32);
entity_impl!(TypeRef, "type");

bitflags! {
    /// Properties of a C type.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TypeProps: u8 {
        /// Integer types, including `_Bool` and enumerations.
        const INT = 1 << 0;
        /// Floating types.
        const FLOAT = 1 << 1;
        /// Real types (integer or floating).
        const REAL = 1 << 2;
        /// Scalar types (real types and pointers).
        const SCALAR = 1 << 3;
        /// Aggregate types (arrays, structs and unions).
        const AGGR = 1 << 4;
    }

    /// Type qualifiers.
    #[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
    pub struct TypeQual: u8 {
        const CONST = 1 << 0;
        const VOLATILE = 1 << 1;
    }
}

/// A function parameter.
#[derive(Clone)]
pub struct Param {
    pub name: String,
    pub ty: TypeRef,
    pub qual: TypeQual,
}

/// A struct or union member. `offset` is the byte offset of the member's
/// storage unit; bit-field members carry their window in `bits`.
#[derive(Clone)]
pub struct Member {
    pub ty: TypeRef,
    pub offset: u64,
    pub bits: BitField,
}

/// The kind and payload of a C type.
#[derive(Clone)]
pub enum TypeKind {
    Void,
    Bool,
    /// A basic integer or floating type; which one follows from the size
    /// and the `FLOAT` property.
    Basic { signed: bool },
    Pointer { base: TypeRef },
    Array { elem: TypeRef, len: u64 },
    Func {
        ret: TypeRef,
        params: Vec<Param>,
        variadic: bool,
        prototype: bool,
    },
    Struct {
        tag: Option<String>,
        members: Vec<Member>,
    },
    Union {
        tag: Option<String>,
        members: Vec<Member>,
    },
}

/// A C type.
#[derive(Clone)]
pub struct TypeData {
    pub kind: TypeKind,
    pub size: u64,
    pub align: u32,
    pub props: TypeProps,
    pub incomplete: bool,
    /// Numeric suffix of the emitted named aggregate; written by the type
    /// emitter on first emission and checked for idempotence.
    pub(crate) emit_id: Option<u32>,
}

impl TypeData {
    pub fn new(kind: TypeKind, size: u64, align: u32, props: TypeProps) -> Self {
        Self {
            kind,
            size,
            align,
            props,
            incomplete: false,
            emit_id: None,
        }
    }
}

/// The IR representation of a scalar type: its register class, its extended
/// type for memory and data definitions, and the opcodes that move it
/// between a register and memory.
#[derive(Clone, Copy)]
pub struct TypeRepr {
    pub class: Class,
    pub data: DataClass,
    pub load: Opcode,
    pub store: Opcode,
}

/// The type store of a translation unit.
pub struct Types {
    map: PrimaryMap<TypeRef, TypeData>,
    pub void_ty: TypeRef,
    pub bool_ty: TypeRef,
    pub char_ty: TypeRef,
    pub schar_ty: TypeRef,
    pub uchar_ty: TypeRef,
    pub short_ty: TypeRef,
    pub ushort_ty: TypeRef,
    pub int_ty: TypeRef,
    pub uint_ty: TypeRef,
    pub long_ty: TypeRef,
    pub ulong_ty: TypeRef,
    pub float_ty: TypeRef,
    pub double_ty: TypeRef,
}

impl Types {
    /// Create a store with the basic types pre-interned. Sizes follow the
    /// LP64 data model the textual SSA assumes.
    pub fn new() -> Self {
        let mut map = PrimaryMap::new();
        let int_props = TypeProps::INT | TypeProps::REAL | TypeProps::SCALAR;
        let flt_props = TypeProps::FLOAT | TypeProps::REAL | TypeProps::SCALAR;
        let mut basic = |size: u64, signed: bool| {
            map.push(TypeData::new(
                TypeKind::Basic { signed },
                size,
                size as u32,
                int_props,
            ))
        };
        let char_ty = basic(1, true);
        let schar_ty = basic(1, true);
        let uchar_ty = basic(1, false);
        let short_ty = basic(2, true);
        let ushort_ty = basic(2, false);
        let int_ty_ = basic(4, true);
        let uint_ty = basic(4, false);
        let long_ty = basic(8, true);
        let ulong_ty = basic(8, false);
        let void_ty = map.push(TypeData::new(TypeKind::Void, 0, 0, TypeProps::empty()));
        let bool_ty = map.push(TypeData::new(TypeKind::Bool, 1, 1, int_props));
        let float_ty = map.push(TypeData::new(TypeKind::Basic { signed: true }, 4, 4, flt_props));
        let double_ty = map.push(TypeData::new(TypeKind::Basic { signed: true }, 8, 8, flt_props));
        Self {
            map,
            void_ty,
            bool_ty,
            char_ty,
            schar_ty,
            uchar_ty,
            short_ty,
            ushort_ty,
            int_ty: int_ty_,
            uint_ty,
            long_ty,
            ulong_ty,
            float_ty,
            double_ty,
        }
    }

    /// Intern a new type.
    pub fn push(&mut self, data: TypeData) -> TypeRef {
        self.map.push(data)
    }

    /// A pointer to `base`.
    pub fn pointer_to(&mut self, base: TypeRef) -> TypeRef {
        self.map.push(TypeData::new(
            TypeKind::Pointer { base },
            8,
            8,
            TypeProps::SCALAR,
        ))
    }

    /// An array of `len` elements of `elem`.
    pub fn array_of(&mut self, elem: TypeRef, len: u64) -> TypeRef {
        let (size, align) = (self.map[elem].size * len, self.map[elem].align);
        self.map.push(TypeData::new(
            TypeKind::Array { elem, len },
            size,
            align,
            TypeProps::AGGR,
        ))
    }

    /// A function type.
    pub fn func_type(
        &mut self,
        ret: TypeRef,
        params: Vec<Param>,
        variadic: bool,
        prototype: bool,
    ) -> TypeRef {
        self.map.push(TypeData::new(
            TypeKind::Func {
                ret,
                params,
                variadic,
                prototype,
            },
            0,
            0,
            TypeProps::empty(),
        ))
    }

    /// A struct type with the given layout.
    pub fn struct_type(
        &mut self,
        tag: Option<&str>,
        members: Vec<Member>,
        size: u64,
        align: u32,
    ) -> TypeRef {
        self.map.push(TypeData::new(
            TypeKind::Struct {
                tag: tag.map(str::to_string),
                members,
            },
            size,
            align,
            TypeProps::AGGR,
        ))
    }

    /// A union type with the given layout.
    pub fn union_type(
        &mut self,
        tag: Option<&str>,
        members: Vec<Member>,
        size: u64,
        align: u32,
    ) -> TypeRef {
        self.map.push(TypeData::new(
            TypeKind::Union {
                tag: tag.map(str::to_string),
                members,
            },
            size,
            align,
            TypeProps::AGGR,
        ))
    }

    /// Whether a type is a signed basic type.
    pub fn is_signed(&self, ty: TypeRef) -> bool {
        matches!(self.map[ty].kind, TypeKind::Basic { signed: true })
    }

    /// The default argument promotion of `ty`: integers narrower than `int`
    /// promote to `int`, `float` promotes to `double`.
    pub fn promote(&self, ty: TypeRef) -> TypeRef {
        let t = &self.map[ty];
        if t.props.contains(TypeProps::INT) && t.size < 4 {
            self.int_ty
        } else if t.props.contains(TypeProps::FLOAT) && t.size == 4 {
            self.double_ty
        } else {
            ty
        }
    }

    /// Map a C type to its IR representation. `void` has none; aggregates
    /// are handled through their address and map to `l`.
    pub fn repr(&self, ty: TypeRef) -> CodegenResult<Option<TypeRepr>> {
        use {Class as C, DataClass as DC, Opcode as Op};
        const fn r(class: Class, data: DataClass, load: Opcode, store: Opcode) -> TypeRepr {
            TypeRepr {
                class,
                data,
                load,
                store,
            }
        }
        let t = &self.map[ty];
        if matches!(t.kind, TypeKind::Void) {
            return Ok(None);
        }
        if !t.props.contains(TypeProps::SCALAR) {
            return Ok(Some(r(C::L, DC::L, Op::Loadl, Op::Storel)));
        }
        let signed = self.is_signed(ty);
        let float = t.props.contains(TypeProps::FLOAT);
        Ok(Some(match t.size {
            1 if signed => r(C::W, DC::B, Op::Loadsb, Op::Storeb),
            1 => r(C::W, DC::B, Op::Loadub, Op::Storeb),
            2 if signed => r(C::W, DC::H, Op::Loadsh, Op::Storeh),
            2 => r(C::W, DC::H, Op::Loaduh, Op::Storeh),
            4 if float => r(C::S, DC::S, Op::Loads, Op::Stores),
            4 => r(C::W, DC::W, Op::Loadw, Op::Storew),
            8 if float => r(C::D, DC::D, Op::Loadd, Op::Stored),
            8 => r(C::L, DC::L, Op::Loadl, Op::Storel),
            16 => {
                return Err(CodegenError::Unsupported(
                    "long double is not yet supported".to_string(),
                ))
            }
            size => {
                return Err(CodegenError::Internal(format!(
                    "scalar type of size {size} has no representation"
                )))
            }
        }))
    }

    /// The register class of a type, `None` for `void`.
    pub fn class_of(&self, ty: TypeRef) -> CodegenResult<Option<Class>> {
        Ok(self.repr(ty)?.map(|r| r.class))
    }

    /// The named-type value of an emitted aggregate, used where an
    /// instruction's class must print as `:name` instead of a class letter.
    pub(crate) fn type_value(&self, ty: TypeRef) -> Option<crate::ir::Value> {
        self.map[ty].emit_id.map(|_| crate::ir::Value::Type(ty))
    }
}

impl Default for Types {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<TypeRef> for Types {
    type Output = TypeData;

    fn index(&self, ty: TypeRef) -> &TypeData {
        &self.map[ty]
    }
}

impl IndexMut<TypeRef> for Types {
    fn index_mut(&mut self, ty: TypeRef) -> &mut TypeData {
        &mut self.map[ty]
    }
}
