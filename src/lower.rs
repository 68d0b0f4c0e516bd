//! AST to IR lowering
//!
//! Runs after semantic analysis. Each declaration becomes a symbol in the
//! global block and its initializer becomes `Copy`/`Widen` instructions.
//! Initializers marked `@startup` go into a startup block instead, so the
//! backend emits them into the startup routine.

use log::debug;
use thiserror::Error;

use crate::ast::{self, attribute_property, Location, Node, NodeKind, VarDecl};
use crate::ir::{self, BlockKind, Instruction, IrError, Place, Placement, Value, Width};
use crate::types::{Type, TypeError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LowerError {
    #[error("{location}: '{name}' reached lowering with unresolved type {ty}")]
    Unresolved { name: String, ty: Type, location: Location },
    #[error("{location}: cannot lower {what}")]
    Unsupported { what: String, location: Location },
    #[error("{location}: {error}")]
    Type { error: TypeError, location: Location },
    #[error(transparent)]
    Symbol(#[from] IrError),
}

/// Lower a checked AST into an IR program
pub fn lower(program: &ast::Program) -> Result<ir::Program, LowerError> {
    let mut lowerer = Lowerer::new();
    for decl in &program.decls {
        lowerer.lower_decl(decl)?;
    }
    Ok(lowerer.program)
}

/// Storage placement requested by a declaration's attributes
pub fn placement(decl: &VarDecl) -> Result<Placement, LowerError> {
    if decl.attribute("zeropage").is_some() {
        return Ok(Placement::ZeroPage);
    }
    let Some(attr) = decl.attribute("address") else {
        return Ok(Placement::Auto);
    };
    match attribute_property(attr, "at") {
        Some(Node { kind: NodeKind::Literal(at), .. }) => Ok(Placement::Fixed(*at)),
        _ => Err(LowerError::Unsupported {
            what: format!("address attribute on '{}'", decl.name),
            location: attr.location,
        }),
    }
}

struct Lowerer {
    program: ir::Program,
}

impl Lowerer {
    fn new() -> Self {
        Lowerer { program: ir::Program::new() }
    }

    fn lower_decl(&mut self, node: &Node) -> Result<(), LowerError> {
        let Some(decl) = node.as_var_decl() else {
            return Err(unsupported("a non-declaration at top level", node.location));
        };
        let ty = node.ty.clone();
        if !ty.is_resolved() {
            return Err(LowerError::Unresolved { name: decl.name.clone(), ty, location: node.location });
        }

        let placement = placement(decl)?;
        self.program.declare_symbol_at(&decl.name, ty.clone(), placement)?;
        debug!("lowered symbol {}: {} ({:?})", decl.name, ty, placement);

        let Some(init) = decl.init.as_deref() else {
            return Ok(());
        };
        let startup = decl.attribute("startup").is_some();
        if startup {
            self.program.open_block(&decl.name, BlockKind::Startup);
        }
        self.lower_init(Place::new(&decl.name), &ty, init)?;
        if startup {
            debug!("{}: {} startup instructions", decl.name, self.program.current_block().instructions.len());
            self.program.close_block()?;
        }
        Ok(())
    }

    /// Store the value of `init` into `dest`, which has type `target`
    fn lower_init(&mut self, dest: Place, target: &Type, init: &Node) -> Result<(), LowerError> {
        match &init.kind {
            NodeKind::Literal(value) => {
                let width = scalar_width(target).ok_or_else(|| {
                    unsupported(&format!("a literal stored as {}", target), init.location)
                })?;
                let value = if width == Width::Byte { value & 0xFF } else { *value };
                self.program.emit(Instruction::Copy { dest, src: Value::Immediate(value), width });
            }

            NodeKind::Identifier(name) => self.copy_place(dest, Place::new(name), &init.ty, init.location)?,

            NodeKind::ArrayLiteral(elems) => {
                let Type::Array(elem_ty, _) = target else {
                    return Err(unsupported(&format!("an array stored as {}", target), init.location));
                };
                let type_error = |error| LowerError::Type { error, location: init.location };
                // The whole array must fit the 16-bit address space
                target.size().map_err(type_error)?;
                let elem_size = elem_ty.size().map_err(type_error)?;
                for (i, elem) in elems.iter().enumerate() {
                    let offset = u16::try_from(i)
                        .ok()
                        .and_then(|i| i.checked_mul(elem_size))
                        .ok_or_else(|| type_error(TypeError::Unsized(target.clone())))?;
                    self.lower_init(dest.offset_by(offset), elem_ty, elem)?;
                }
            }

            NodeKind::AddressOf(operand) => {
                let NodeKind::Identifier(name) = &operand.kind else {
                    return Err(unsupported("the address of an expression", init.location));
                };
                self.program.emit(Instruction::Copy {
                    dest,
                    src: Value::AddressOf(name.clone()),
                    width: Width::Word,
                });
            }

            NodeKind::ExplicitCast(operand) | NodeKind::ImplicitCast(operand) => {
                if init.ty.is_primitive() {
                    let value = fold_scalar(init)?;
                    self.store_scalar(dest, &init.ty, value, init.location)?;
                } else if operand.ty.equals(&init.ty) {
                    self.lower_init(dest, &init.ty, operand)?;
                } else {
                    let what = format!("a cast from {} to {}", operand.ty, init.ty);
                    return Err(unsupported(&what, init.location));
                }
            }

            NodeKind::VarDecl(_) | NodeKind::Attribute { .. } | NodeKind::AttributeProperty { .. } => {
                return Err(unsupported("a declaration used as a value", init.location));
            }
        }
        Ok(())
    }

    fn store_scalar(
        &mut self,
        dest: Place,
        target: &Type,
        value: Scalar,
        location: Location,
    ) -> Result<(), LowerError> {
        let instruction = match (target, value) {
            (Type::UInt8, Scalar::Const(v)) => {
                Instruction::Copy { dest, src: Value::Immediate(v & 0xFF), width: Width::Byte }
            }
            (Type::UInt8, Scalar::Byte(src) | Scalar::Word(src) | Scalar::Widened(src)) => {
                Instruction::Copy { dest, src: Value::Place(src), width: Width::Byte }
            }
            (Type::UInt16, Scalar::Const(v)) => {
                Instruction::Copy { dest, src: Value::Immediate(v), width: Width::Word }
            }
            (Type::UInt16, Scalar::Word(src)) => {
                Instruction::Copy { dest, src: Value::Place(src), width: Width::Word }
            }
            (Type::UInt16, Scalar::Byte(src) | Scalar::Widened(src)) => Instruction::Widen { dest, src },
            (target, _) => return Err(unsupported(&format!("a number stored as {}", target), location)),
        };
        self.program.emit(instruction);
        Ok(())
    }

    fn copy_place(&mut self, dest: Place, src: Place, ty: &Type, location: Location) -> Result<(), LowerError> {
        if let Some(width) = scalar_width(ty) {
            self.program.emit(Instruction::Copy { dest, src: Value::Place(src), width });
            return Ok(());
        }
        let size = ty.size().map_err(|error| LowerError::Type { error, location })?;
        for offset in 0..size {
            self.program.emit(Instruction::Copy {
                dest: dest.offset_by(offset),
                src: Value::Place(src.offset_by(offset)),
                width: Width::Byte,
            });
        }
        Ok(())
    }
}

/// A primitive value with its casts folded away
#[derive(Debug, Clone, PartialEq)]
enum Scalar {
    Const(u16),
    /// One byte of storage
    Byte(Place),
    /// Two bytes of storage
    Word(Place),
    /// One byte of storage zero-extended to a word
    Widened(Place),
}

/// Fold a chain of casts over a literal or a variable
fn fold_scalar(node: &Node) -> Result<Scalar, LowerError> {
    match &node.kind {
        NodeKind::Literal(value) => Ok(Scalar::Const(*value)),
        NodeKind::Identifier(name) => match &node.ty {
            Type::UInt8 => Ok(Scalar::Byte(Place::new(name))),
            Type::UInt16 => Ok(Scalar::Word(Place::new(name))),
            ty => Err(unsupported(&format!("'{}' of type {} as a number", name, ty), node.location)),
        },
        NodeKind::ExplicitCast(operand) | NodeKind::ImplicitCast(operand) => {
            match (&node.ty, fold_scalar(operand)?) {
                (Type::UInt8, Scalar::Const(v)) => Ok(Scalar::Const(v & 0xFF)),
                // Little-endian: the low byte is at offset 0
                (Type::UInt8, Scalar::Byte(p) | Scalar::Word(p) | Scalar::Widened(p)) => Ok(Scalar::Byte(p)),
                (Type::UInt16, Scalar::Byte(p)) => Ok(Scalar::Widened(p)),
                (Type::UInt16, value) => Ok(value),
                (to, _) => Err(unsupported(&format!("a cast to {}", to), node.location)),
            }
        }
        _ => Err(unsupported("this expression as a number", node.location)),
    }
}

fn scalar_width(ty: &Type) -> Option<Width> {
    match ty {
        Type::UInt8 => Some(Width::Byte),
        Type::UInt16 | Type::Reference(_) => Some(Width::Word),
        _ => None,
    }
}

fn unsupported(what: &str, location: Location) -> LowerError {
    LowerError::Unsupported { what: what.to_string(), location }
}
