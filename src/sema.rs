//! Semantic analysis
//!
//! Resolves every type slot in the AST before lowering:
//! - literals take the smallest fitting width, or the declared one
//! - identifiers take the type of their declaration
//! - array literals unify their element types
//! - declarations check assignability and insert implicit casts
//!
//! Type errors are collected per declaration and reported together.
//! Symbol errors (duplicate or undefined names) stop analysis at once.
//!
//! # Usage
//!
//! ```ignore
//! let mut names = TypeNameCache::new();
//! let env = Analyzer::new(&mut names).check_program(&mut program)?;
//! ```

use std::collections::HashMap;

use log::debug;
use thiserror::Error;

use crate::ast::{Location, Node, NodeKind, Program, VarDecl};
use crate::types::{CastKind, Type, TypeError, TypeNameCache};

/// A type error at a source location.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{location}: {error}")]
pub struct Diagnostic {
    pub location: Location,
    pub error: TypeError,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SemaError {
    /// All type errors found in the unit, in source order
    #[error("{}", render_diagnostics(.0))]
    Types(Vec<Diagnostic>),
    #[error("{location}: duplicate declaration of '{name}'")]
    Duplicate { name: String, location: Location },
    #[error("{location}: undefined symbol '{name}'")]
    Undefined { name: String, location: Location },
}

fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics.iter().map(Diagnostic::to_string).collect::<Vec<_>>().join("\n")
}

fn type_error(location: Location, error: TypeError) -> SemaError {
    SemaError::Types(vec![Diagnostic { location, error }])
}

/// Names bound so far and their resolved types.
#[derive(Debug, Clone, Default)]
pub struct TypeEnv {
    bindings: HashMap<String, Type>,
}

impl TypeEnv {
    pub fn new() -> Self {
        TypeEnv { bindings: HashMap::new() }
    }

    pub fn insert(&mut self, name: String, ty: Type) {
        self.bindings.insert(name, ty);
    }

    pub fn get(&self, name: &str) -> Option<&Type> {
        self.bindings.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }
}

/// Type checker for one compilation unit.
pub struct Analyzer<'a> {
    env: TypeEnv,
    diagnostics: Vec<Diagnostic>,
    names: &'a mut TypeNameCache,
}

impl<'a> Analyzer<'a> {
    pub fn new(names: &'a mut TypeNameCache) -> Self {
        Analyzer { env: TypeEnv::new(), diagnostics: Vec::new(), names }
    }

    /// Check every declaration, rewriting type slots in place
    pub fn check_program(mut self, program: &mut Program) -> Result<TypeEnv, SemaError> {
        for node in &mut program.decls {
            match self.check_decl(node) {
                Ok(()) => {}
                Err(SemaError::Types(mut found)) => self.diagnostics.append(&mut found),
                Err(fatal) => return Err(fatal),
            }
        }
        if self.diagnostics.is_empty() {
            Ok(self.env)
        } else {
            Err(SemaError::Types(self.diagnostics))
        }
    }

    fn check_decl(&mut self, node: &mut Node) -> Result<(), SemaError> {
        let location = node.location;
        let NodeKind::VarDecl(decl) = &mut node.kind else {
            return Err(type_error(location, TypeError::other("expected a declaration")));
        };
        if self.env.contains(&decl.name) {
            return Err(SemaError::Duplicate { name: decl.name.clone(), location });
        }

        let result = check_attributes(decl).and_then(|()| self.resolve_decl(decl, location));
        let ty = match result {
            Ok(ty) => ty,
            Err(e) => {
                // Bind the declared type so later uses don't cascade
                self.env.insert(decl.name.clone(), decl.declared.clone());
                return Err(e);
            }
        };
        debug!("{}: {}", decl.name, self.names.name(&ty));
        self.env.insert(decl.name.clone(), ty.clone());
        node.ty = ty;
        Ok(())
    }

    fn resolve_decl(&mut self, decl: &mut VarDecl, location: Location) -> Result<Type, SemaError> {
        let declared = decl.declared.clone();
        let Some(init) = decl.init.as_mut() else {
            if !declared.is_resolved() {
                let msg = format!("'{}' needs a type or an initializer", decl.name);
                return Err(type_error(location, TypeError::other(msg)));
            }
            return Ok(declared);
        };

        let found = self.infer(init, &declared)?;
        if declared.is_none() {
            return Ok(found);
        }
        if !declared.is_resolved() {
            return Err(type_error(location, TypeError::Unsized(declared)));
        }
        if declared.can_assign(&found) {
            return Ok(declared);
        }
        if declared.can_cast(&found, CastKind::Implicit) {
            let operand = std::mem::replace(init.as_mut(), Node::literal(0));
            **init = Node::implicit_cast(operand, declared.clone());
            return Ok(declared);
        }
        Err(type_error(init.location, TypeError::Mismatch { expected: declared, found }))
    }

    /// Infer the type of an expression and store it in the node.
    /// `expected` is a hint from the declaration, `Type::None` if absent.
    fn infer(&mut self, node: &mut Node, expected: &Type) -> Result<Type, SemaError> {
        let location = node.location;
        let ty = match &mut node.kind {
            NodeKind::Literal(value) => literal_type(*value, expected),

            NodeKind::Identifier(name) => match self.env.get(name) {
                None => return Err(SemaError::Undefined { name: name.clone(), location }),
                Some(Type::None) => {
                    let msg = format!("type of '{}' is unknown", name);
                    return Err(type_error(location, TypeError::other(msg)));
                }
                Some(ty) => ty.clone(),
            },

            NodeKind::ArrayLiteral(elems) => {
                let elem_hint = match expected {
                    Type::Array(elem, _) => elem.as_ref().clone(),
                    _ => Type::None,
                };
                if elems.is_empty() && elem_hint.is_none() {
                    let msg = "cannot infer the element type of an empty array";
                    return Err(type_error(location, TypeError::other(msg)));
                }
                let mut elem_ty = if elems.is_empty() { elem_hint.clone() } else { Type::None };
                for elem in elems.iter_mut() {
                    let found = self.infer(elem, &elem_hint)?;
                    elem_ty = elem_ty.unify(&found).map_err(|e| type_error(elem.location, e))?;
                }
                Type::array(elem_ty, elems.len())
            }

            NodeKind::AddressOf(operand) => {
                if !matches!(operand.kind, NodeKind::Identifier(_)) {
                    let msg = "can only take the address of a variable";
                    return Err(type_error(location, TypeError::other(msg)));
                }
                Type::reference(self.infer(operand, &Type::None)?)
            }

            NodeKind::ExplicitCast(operand) => {
                self.check_cast(operand, &node.ty, CastKind::Explicit, location)?
            }
            NodeKind::ImplicitCast(operand) => {
                self.check_cast(operand, &node.ty, CastKind::Implicit, location)?
            }

            NodeKind::VarDecl(_) | NodeKind::Attribute { .. } | NodeKind::AttributeProperty { .. } => {
                let msg = "expected an expression";
                return Err(type_error(location, TypeError::other(msg)));
            }
        };
        node.ty = ty.clone();
        Ok(ty)
    }

    fn check_cast(
        &mut self,
        operand: &mut Node,
        target: &Type,
        kind: CastKind,
        location: Location,
    ) -> Result<Type, SemaError> {
        if !target.is_resolved() {
            return Err(type_error(location, TypeError::Unsized(target.clone())));
        }
        let source = self.infer(operand, &Type::None)?;
        target.check_cast(&source, kind).map_err(|e| type_error(location, e))?;
        Ok(target.clone())
    }
}

/// Smallest primitive holding `value`, or `expected` if it is a
/// primitive the value fits in
fn literal_type(value: u16, expected: &Type) -> Type {
    match expected {
        Type::UInt16 => Type::UInt16,
        Type::UInt8 if value <= 0xFF => Type::UInt8,
        _ if value <= 0xFF => Type::UInt8,
        _ => Type::UInt16,
    }
}

/// Validate the attribute list of a declaration
fn check_attributes(decl: &mut VarDecl) -> Result<(), SemaError> {
    let mut seen: Vec<String> = Vec::new();
    for attr in &mut decl.attributes {
        let location = attr.location;
        let NodeKind::Attribute { name, properties } = &mut attr.kind else {
            return Err(type_error(location, TypeError::other("expected an attribute")));
        };
        if seen.contains(name) {
            let msg = format!("duplicate attribute '{}'", name);
            return Err(type_error(location, TypeError::other(msg)));
        }
        match name.as_str() {
            "zeropage" | "startup" => {
                if !properties.is_empty() {
                    let msg = format!("attribute '{}' takes no properties", name);
                    return Err(type_error(location, TypeError::other(msg)));
                }
            }
            "address" => check_address(properties, location)?,
            other => {
                let msg = format!("unknown attribute '{}'", other);
                return Err(type_error(location, TypeError::other(msg)));
            }
        }
        seen.push(name.clone());
    }
    if seen.iter().any(|n| n == "zeropage") && seen.iter().any(|n| n == "address") {
        let location = decl.attributes.first().map(|a| a.location).unwrap_or_default();
        let msg = "'zeropage' and 'address' cannot be combined";
        return Err(type_error(location, TypeError::other(msg)));
    }
    Ok(())
}

fn check_address(properties: &mut [Node], location: Location) -> Result<(), SemaError> {
    let mut found_at = false;
    for prop in properties.iter_mut() {
        let NodeKind::AttributeProperty { key, value } = &mut prop.kind else {
            return Err(type_error(prop.location, TypeError::other("expected a property")));
        };
        if key != "at" {
            let msg = format!("unknown property '{}' on 'address'", key);
            return Err(type_error(prop.location, TypeError::other(msg)));
        }
        if !matches!(value.kind, NodeKind::Literal(_)) {
            let msg = "'address(at)' must be a literal";
            return Err(type_error(value.location, TypeError::other(msg)));
        }
        value.ty = Type::UInt16;
        found_at = true;
    }
    if !found_at {
        return Err(type_error(location, TypeError::other("'address' needs an 'at' property")));
    }
    Ok(())
}
