//! Type model for the cartridge language
//!
//! This module defines the static types of the language and the rules that
//! relate them:
//! - Primitive types: `u8`, `u16`
//! - Compound types: fixed-length arrays, references, structs
//! - Nominal custom types
//! - The `None` sentinel for slots not yet inferred
//!
//! # Usage
//!
//! ```ignore
//! let arr = Type::array(Type::UInt8, 4);
//! assert!(arr.can_assign(&Type::array(Type::UInt8, 3)));
//! let ty = Type::None.unify(&Type::UInt16)?;
//! ```

use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

/// Types in the cartridge language.
///
/// `PartialEq`/`Hash` are structural over the whole value and are used to
/// key [`TypeNameCache`]. Language-level equality, which is nominal for
/// structs, is [`Type::equals`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// Not yet inferred. Never reaches codegen.
    None,
    /// Nominal user type, compared by name
    Custom(String),
    /// 8-bit unsigned integer
    UInt8,
    /// 16-bit unsigned integer, little-endian in memory
    UInt16,
    /// Fixed-length array: `elem[len]`
    Array(Box<Type>, usize),
    /// 16-bit pointer to a value of the element type
    Reference(Box<Type>),
    /// Struct with ordered member types, compared by name
    Struct(String, Vec<Type>),
}

/// Whether a cast was written in the source or inserted by analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    Implicit,
    Explicit,
}

/// Type error raised by the type rules themselves.
///
/// Callers attach the source location (see `sema::Diagnostic`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("expected {expected}, found {found}")]
    Mismatch { expected: Type, found: Type },
    #[error("cannot unify {0} with {1}")]
    CannotUnify(Type, Type),
    #[error("cannot cast {from} to {to}{}", implicit_suffix(.implicit))]
    IllegalCast { from: Type, to: Type, implicit: bool },
    #[error("type {0} has no storage size")]
    Unsized(Type),
    #[error("{0}")]
    Other(String),
}

fn implicit_suffix(implicit: &bool) -> &'static str {
    if *implicit { " implicitly" } else { "" }
}

impl TypeError {
    pub fn other(msg: impl Into<String>) -> Self {
        TypeError::Other(msg.into())
    }
}

impl Type {
    /// Convenience constructor for array types
    pub fn array(elem: Type, len: usize) -> Type {
        Type::Array(Box::new(elem), len)
    }

    /// Convenience constructor for reference types
    pub fn reference(elem: Type) -> Type {
        Type::Reference(Box::new(elem))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Type::None)
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self, Type::UInt8 | Type::UInt16)
    }

    /// True if no `None` occurs anywhere inside this type
    pub fn is_resolved(&self) -> bool {
        match self {
            Type::None => false,
            Type::Custom(_) | Type::UInt8 | Type::UInt16 => true,
            Type::Array(elem, _) | Type::Reference(elem) => elem.is_resolved(),
            Type::Struct(_, members) => members.iter().all(Type::is_resolved),
        }
    }

    /// Structural equality: same tag, same length, same element types,
    /// same name for custom and struct types.
    pub fn equals(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::None, Type::None) => true,
            (Type::UInt8, Type::UInt8) => true,
            (Type::UInt16, Type::UInt16) => true,
            (Type::Custom(a), Type::Custom(b)) => a == b,
            (Type::Struct(a, _), Type::Struct(b, _)) => a == b,
            (Type::Array(a, n), Type::Array(b, m)) => n == m && a.equals(b),
            (Type::Reference(a), Type::Reference(b)) => a.equals(b),
            _ => false,
        }
    }

    /// Can a value of type `value` be stored in a location of type `self`?
    ///
    /// Arrays fit if the element types match and the value is no longer
    /// than the target. A `None` anywhere on either side never assigns.
    pub fn can_assign(&self, value: &Type) -> bool {
        if !self.is_resolved() || !value.is_resolved() {
            return false;
        }
        match (self, value) {
            (Type::Array(target_elem, target_len), Type::Array(value_elem, value_len)) => {
                value_len <= target_len && target_elem.equals(value_elem)
            }
            (Type::Reference(a), Type::Reference(b)) => a.equals(b),
            _ => self.equals(value),
        }
    }

    /// Can a value of type `source` be cast to `self`?
    ///
    /// Widening `u8 -> u16` is always allowed, narrowing `u16 -> u8` only
    /// when written explicitly, same-type casts are no-ops.
    pub fn can_cast(&self, source: &Type, kind: CastKind) -> bool {
        if !self.is_resolved() || !source.is_resolved() {
            return false;
        }
        if self.equals(source) {
            return true;
        }
        match (source, self) {
            (Type::UInt8, Type::UInt16) => true,
            (Type::UInt16, Type::UInt8) => kind == CastKind::Explicit,
            _ => false,
        }
    }

    /// Check a cast, returning the error a caller would report
    pub fn check_cast(&self, source: &Type, kind: CastKind) -> Result<(), TypeError> {
        if self.can_cast(source, kind) {
            Ok(())
        } else {
            Err(TypeError::IllegalCast {
                from: source.clone(),
                to: self.clone(),
                implicit: kind == CastKind::Implicit,
            })
        }
    }

    /// Find the common type of `self` and `other`.
    ///
    /// `None` adopts the other side. Otherwise the types must already be
    /// equal; no winner is picked between differing types.
    pub fn unify(&self, other: &Type) -> Result<Type, TypeError> {
        match (self, other) {
            (Type::None, t) | (t, Type::None) => Ok(t.clone()),
            (a, b) if a.equals(b) => Ok(a.clone()),
            (a, b) => Err(TypeError::CannotUnify(a.clone(), b.clone())),
        }
    }

    /// Storage size in bytes
    pub fn size(&self) -> Result<u16, TypeError> {
        match self {
            Type::UInt8 => Ok(1),
            Type::UInt16 | Type::Reference(_) => Ok(2),
            Type::Array(elem, len) => {
                let elem_size = elem.size()? as usize;
                u16::try_from(elem_size * len).map_err(|_| TypeError::Unsized(self.clone()))
            }
            Type::Struct(_, members) => {
                let mut total: u16 = 0;
                for member in members {
                    total = total
                        .checked_add(member.size()?)
                        .ok_or_else(|| TypeError::Unsized(self.clone()))?;
                }
                Ok(total)
            }
            Type::None | Type::Custom(_) => Err(TypeError::Unsized(self.clone())),
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::None => write!(f, "<none>"),
            Type::Custom(name) => write!(f, "{}", name),
            Type::UInt8 => write!(f, "u8"),
            Type::UInt16 => write!(f, "u16"),
            Type::Array(elem, len) => write!(f, "{}[{}]", elem, len),
            Type::Reference(elem) => write!(f, "&{}", elem),
            Type::Struct(name, members) => {
                write!(f, "struct {} {{", name)?;
                for (i, member) in members.iter().enumerate() {
                    if i > 0 { write!(f, ",")?; }
                    write!(f, " {}", member)?;
                }
                write!(f, " }}")
            }
        }
    }
}

/// Memoized canonical type names.
///
/// Owned by one compilation session. Equal type values share one rendered
/// string; the cache only grows and is dropped with the session.
#[derive(Debug, Default)]
pub struct TypeNameCache {
    names: HashMap<Type, Rc<str>>,
}

impl TypeNameCache {
    pub fn new() -> Self {
        TypeNameCache { names: HashMap::new() }
    }

    /// Render `ty`, reusing the cached string for an equal value
    pub fn name(&mut self, ty: &Type) -> Rc<str> {
        if let Some(name) = self.names.get(ty) {
            return Rc::clone(name);
        }
        let name: Rc<str> = Rc::from(ty.to_string());
        self.names.insert(ty.clone(), Rc::clone(&name));
        name
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
