//! Abstract Syntax Tree for the cartridge language
//!
//! The AST is produced by a front end (or built directly by tests) and
//! consumed by semantic analysis and lowering. Every node owns its
//! children exclusively, so dropping the root frees the whole tree once.
//!
//! # Structure
//!
//! - [`Program`] - A compilation unit (sequence of declarations)
//! - [`Node`] - Expression or declaration with location and type slot
//! - [`NodeKind`] - The closed set of node variants
//! - [`VarDecl`] - Variable declaration with attributes

use crate::types::Type;

/// Source position of a node (1-indexed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl Location {
    pub fn new(line: usize, column: usize) -> Self {
        Location { line, column }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A compilation unit: top-level declarations in source order.
///
/// # Example
///
/// ```text
/// var lives: u8 = 3
/// var score: u16 = lives
/// var map: u8[4] @zeropage = [1, 2, 3]
/// ```
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub decls: Vec<Node>,
}

/// A node in the tree.
///
/// `ty` starts as [`Type::None`] for inferred positions and is overwritten
/// in place by semantic analysis.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub location: Location,
    pub ty: Type,
}

/// Node variants.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Integer literal; its width is inferred
    Literal(u16),
    /// Reference to a declared variable
    Identifier(String),
    /// `var name: ty = init`
    VarDecl(VarDecl),
    /// `[a, b, c]`
    ArrayLiteral(Vec<Node>),
    /// `&name`
    AddressOf(Box<Node>),
    /// `@name(key = value, ...)`
    Attribute {
        name: String,
        properties: Vec<Node>,
    },
    /// `key = value` inside an attribute
    AttributeProperty {
        key: String,
        value: Box<Node>,
    },
    /// Cast written in source: `expr as ty`
    ExplicitCast(Box<Node>),
    /// Cast inserted by semantic analysis
    ImplicitCast(Box<Node>),
}

/// Variable declaration payload.
#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: String,
    /// Declared type, `Type::None` when it is to be inferred
    pub declared: Type,
    pub init: Option<Box<Node>>,
    /// `Attribute` nodes in source order
    pub attributes: Vec<Node>,
}

impl Node {
    pub fn new(kind: NodeKind, location: Location) -> Self {
        Node { kind, location, ty: Type::None }
    }

    pub fn literal(value: u16) -> Self {
        Node::new(NodeKind::Literal(value), Location::default())
    }

    pub fn ident(name: &str) -> Self {
        Node::new(NodeKind::Identifier(name.to_string()), Location::default())
    }

    pub fn array(elems: Vec<Node>) -> Self {
        Node::new(NodeKind::ArrayLiteral(elems), Location::default())
    }

    pub fn address_of(name: &str) -> Self {
        Node::new(NodeKind::AddressOf(Box::new(Node::ident(name))), Location::default())
    }

    /// Explicit cast; the target type is stored in the node's type slot
    pub fn cast(operand: Node, target: Type) -> Self {
        let mut node = Node::new(NodeKind::ExplicitCast(Box::new(operand)), Location::default());
        node.ty = target;
        node
    }

    /// Cast inserted by analysis; keeps the operand's location
    pub fn implicit_cast(operand: Node, target: Type) -> Self {
        let location = operand.location;
        let mut node = Node::new(NodeKind::ImplicitCast(Box::new(operand)), location);
        node.ty = target;
        node
    }

    pub fn var(name: &str, declared: Type, init: Option<Node>) -> Self {
        Node::new(
            NodeKind::VarDecl(VarDecl {
                name: name.to_string(),
                declared,
                init: init.map(Box::new),
                attributes: Vec::new(),
            }),
            Location::default(),
        )
    }

    pub fn attribute(name: &str, properties: Vec<(&str, Node)>) -> Self {
        let properties = properties
            .into_iter()
            .map(|(key, value)| {
                Node::new(
                    NodeKind::AttributeProperty { key: key.to_string(), value: Box::new(value) },
                    Location::default(),
                )
            })
            .collect();
        Node::new(NodeKind::Attribute { name: name.to_string(), properties }, Location::default())
    }

    /// Attach an attribute to a declaration node (builder style)
    pub fn with_attribute(mut self, attribute: Node) -> Self {
        if let NodeKind::VarDecl(decl) = &mut self.kind {
            decl.attributes.push(attribute);
        }
        self
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.location = Location::new(line, column);
        self
    }

    pub fn as_var_decl(&self) -> Option<&VarDecl> {
        match &self.kind {
            NodeKind::VarDecl(decl) => Some(decl),
            _ => None,
        }
    }
}

impl VarDecl {
    /// Find an attribute by name
    pub fn attribute(&self, name: &str) -> Option<&Node> {
        self.attributes.iter().find(|attr| {
            matches!(&attr.kind, NodeKind::Attribute { name: n, .. } if n == name)
        })
    }
}

/// Look up a property value inside an `Attribute` node
pub fn attribute_property<'a>(attribute: &'a Node, key: &str) -> Option<&'a Node> {
    let NodeKind::Attribute { properties, .. } = &attribute.kind else {
        return None;
    };
    properties.iter().find_map(|prop| match &prop.kind {
        NodeKind::AttributeProperty { key: k, value } if k == key => Some(value.as_ref()),
        _ => None,
    })
}
