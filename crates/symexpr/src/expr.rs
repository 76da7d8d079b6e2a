use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Identifier of a symbolic variable. Two variables with the same identifier
/// are equivalent. Identifiers are unique across the process so values may
/// flow between forked states without renaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VarId(usize);

static NEXT_VARIABLE_ID: AtomicUsize = AtomicUsize::new(0);

fn fresh_variable_id() -> VarId {
    VarId(NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed))
}

/// A symbolic word of up to 64 bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymValue {
    /// A concrete constant of the given width.
    Concrete { value: u64, bits: u16 },

    /// A fresh variable. The name is a human-readable tag for diagnostics
    /// and need not be unique; the identifier is.
    Variable { id: VarId, name: Rc<str>, bits: u16 },

    /// The byte at little-endian index `byte` of `source`.
    Extract { source: Rc<SymValue>, byte: usize },

    /// Little-endian concatenation, least significant part first. Each part
    /// must have a byte-aligned width.
    Concat { parts: Vec<SymValue> },

    /// `if condition { on_true } else { on_false }`. Both arms have the same
    /// width.
    Select {
        condition: Rc<BoolExpr>,
        on_true: Rc<SymValue>,
        on_false: Rc<SymValue>,
    },
}

impl SymValue {
    /// Create a concrete constant. Bits beyond the stated width are masked
    /// off.
    pub fn concrete(value: u64, bits: u16) -> Self {
        assert!(bits > 0 && bits <= u64::BITS as u16, "invalid width {bits}");
        let mask = if bits == u64::BITS as u16 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        };
        SymValue::Concrete {
            value: value & mask,
            bits,
        }
    }

    /// Create a fresh variable with a new process-unique identifier.
    pub fn variable(name: impl Into<Rc<str>>, bits: u16) -> Self {
        assert!(bits > 0 && bits <= u64::BITS as u16, "invalid width {bits}");
        SymValue::Variable {
            id: fresh_variable_id(),
            name: name.into(),
            bits,
        }
    }

    /// Width of this value in bits.
    pub fn bits(&self) -> u16 {
        match self {
            SymValue::Concrete { bits, .. } => *bits,
            SymValue::Variable { bits, .. } => *bits,
            SymValue::Extract { .. } => 8,
            SymValue::Concat { parts } => parts.iter().map(SymValue::bits).sum(),
            SymValue::Select { on_true, .. } => on_true.bits(),
        }
    }

    /// Width of this value in whole bytes. Widths are byte-aligned for every
    /// value that travels through guest memory.
    pub fn size(&self) -> usize {
        usize::from(self.bits().div_ceil(8))
    }

    /// The byte at little-endian index `index`. Concrete values extract
    /// directly, everything else becomes an [SymValue::Extract] node.
    pub fn byte(&self, index: usize) -> SymValue {
        assert!(index < self.size(), "byte index {index} out of range");
        match self {
            SymValue::Concrete { value, .. } => {
                SymValue::concrete((value >> (8 * index)) & 0xFF, 8)
            }
            SymValue::Extract { .. } if index == 0 => self.clone(),
            _ => SymValue::Extract {
                source: Rc::new(self.clone()),
                byte: index,
            },
        }
    }

    /// Reassemble a value from its little-endian bytes. Concrete bytes fold
    /// back into a constant, and a full run of extracts from one source folds
    /// back into that source. Anything else becomes a concatenation.
    pub fn from_le_bytes(bytes: Vec<SymValue>) -> SymValue {
        assert!(!bytes.is_empty(), "cannot assemble an empty value");
        assert!(bytes.len() <= 8, "value exceeds 64 bits");

        if bytes.iter().all(|b| matches!(b, SymValue::Concrete { .. })) {
            let mut value = 0u64;
            for (i, byte) in bytes.iter().enumerate() {
                if let SymValue::Concrete { value: v, .. } = byte {
                    value |= v << (8 * i);
                }
            }
            return SymValue::concrete(value, (bytes.len() * 8) as u16);
        }

        if let Some(source) = Self::common_extract_source(&bytes) {
            return source;
        }

        if bytes.len() == 1 {
            return bytes.into_iter().next().unwrap();
        }

        SymValue::Concat { parts: bytes }
    }

    /// If `bytes` is exactly `source.byte(0), source.byte(1), ...` covering
    /// all of one source value, return that source.
    fn common_extract_source(bytes: &[SymValue]) -> Option<SymValue> {
        let source = match &bytes[0] {
            SymValue::Extract { source, byte: 0 } => Rc::clone(source),
            _ => return None,
        };

        if source.size() != bytes.len() {
            return None;
        }

        for (i, byte) in bytes.iter().enumerate() {
            match byte {
                SymValue::Extract { source: s, byte } if *byte == i && *s == source => (),
                _ => return None,
            }
        }

        Some((*source).clone())
    }

    /// Conditional value. A literal condition selects an arm immediately.
    pub fn select(condition: BoolExpr, on_true: SymValue, on_false: SymValue) -> SymValue {
        assert_eq!(
            on_true.bits(),
            on_false.bits(),
            "select arms must have equal widths"
        );
        match condition {
            BoolExpr::Literal(true) => on_true,
            BoolExpr::Literal(false) => on_false,
            _ => SymValue::Select {
                condition: Rc::new(condition),
                on_true: Rc::new(on_true),
                on_false: Rc::new(on_false),
            },
        }
    }

    /// Equality predicate over two values of equal width.
    pub fn equals(self, rhs: SymValue) -> BoolExpr {
        assert_eq!(self.bits(), rhs.bits(), "cannot compare unequal widths");
        if let (SymValue::Concrete { value: x, .. }, SymValue::Concrete { value: y, .. }) =
            (&self, &rhs)
        {
            return BoolExpr::Literal(x == y);
        }
        BoolExpr::Equal(Rc::new(self), Rc::new(rhs))
    }

    /// Predicate that this value is nonzero.
    pub fn non_zero(self) -> BoolExpr {
        if let SymValue::Concrete { value, .. } = &self {
            return BoolExpr::Literal(*value != 0);
        }
        BoolExpr::NonZero(Rc::new(self))
    }

    /// Structurally concrete value, if this is a constant. This does not
    /// consult any constraint bindings; see [crate::ConstraintSet::evaluate].
    pub fn as_concrete(&self) -> Option<u64> {
        match self {
            SymValue::Concrete { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Variable identifier, if this is a bare variable.
    pub fn as_variable(&self) -> Option<VarId> {
        match self {
            SymValue::Variable { id, .. } => Some(*id),
            _ => None,
        }
    }
}

impl std::fmt::Display for SymValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SymValue::Concrete { value, bits } => write!(f, "{value:#x}:{bits}"),
            SymValue::Variable { name, id, .. } => write!(f, "{name}#{id}", id = id.0),
            SymValue::Extract { source, byte } => write!(f, "{source}[{byte}]"),
            SymValue::Concat { parts } => {
                write!(f, "concat(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{part}")?;
                }
                write!(f, ")")
            }
            SymValue::Select {
                condition,
                on_true,
                on_false,
            } => write!(f, "select({condition}, {on_true}, {on_false})"),
        }
    }
}

/// A boolean expression over symbolic values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoolExpr {
    Literal(bool),
    Equal(Rc<SymValue>, Rc<SymValue>),
    NonZero(Rc<SymValue>),
    Not(Rc<BoolExpr>),
    And(Rc<BoolExpr>, Rc<BoolExpr>),
    Or(Rc<BoolExpr>, Rc<BoolExpr>),
}

pub const TRUE: BoolExpr = BoolExpr::Literal(true);
pub const FALSE: BoolExpr = BoolExpr::Literal(false);

impl std::ops::Not for BoolExpr {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            BoolExpr::Literal(value) => BoolExpr::Literal(!value),
            BoolExpr::Not(inner) => (*inner).clone(),
            _ => BoolExpr::Not(Rc::new(self)),
        }
    }
}

impl std::ops::BitAnd for BoolExpr {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (BoolExpr::Literal(false), _) | (_, BoolExpr::Literal(false)) => {
                BoolExpr::Literal(false)
            }
            (BoolExpr::Literal(true), rhs) => rhs,
            (lhs, BoolExpr::Literal(true)) => lhs,
            (lhs, rhs) => BoolExpr::And(Rc::new(lhs), Rc::new(rhs)),
        }
    }
}

impl std::ops::BitOr for BoolExpr {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (BoolExpr::Literal(true), _) | (_, BoolExpr::Literal(true)) => BoolExpr::Literal(true),
            (BoolExpr::Literal(false), rhs) => rhs,
            (lhs, BoolExpr::Literal(false)) => lhs,
            (lhs, rhs) => BoolExpr::Or(Rc::new(lhs), Rc::new(rhs)),
        }
    }
}

impl std::fmt::Display for BoolExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoolExpr::Literal(value) => write!(f, "{value}"),
            BoolExpr::Equal(lhs, rhs) => write!(f, "{lhs} == {rhs}"),
            BoolExpr::NonZero(value) => write!(f, "{value} != 0"),
            BoolExpr::Not(inner) => write!(f, "!({inner})"),
            BoolExpr::And(lhs, rhs) => write!(f, "({lhs} && {rhs})"),
            BoolExpr::Or(lhs, rhs) => write!(f, "({lhs} || {rhs})"),
        }
    }
}
