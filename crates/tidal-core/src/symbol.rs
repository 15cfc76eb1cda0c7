//! Resolved variable references, as produced by a front end's scope resolver.

use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

bitflags! {
    /// Declaration attributes of a local (`<const>`, `<close>`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SymbolAttributes: u8 {
        const CONST = 0b01;
        const TO_BE_CLOSED = 0b10;
    }
}

/// Kind of a [`SymbolRef`], used for display and serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SymbolRefType {
    Local = 0,
    Upvalue = 1,
    Global = 2,
    DefaultEnv = 3,
}

/// A variable reference.
///
/// Local indices are relative to the declaring frame; upvalue indices to the
/// owning closure's captures. A global never names a variable directly: it
/// is a lookup by name through its environment symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymbolRef {
    Local {
        name: Arc<str>,
        index: usize,
        attributes: SymbolAttributes,
    },
    Upvalue {
        name: Arc<str>,
        index: usize,
    },
    Global {
        name: Arc<str>,
        env: Box<SymbolRef>,
    },
    /// The script's globals table, when no `_ENV` is in scope.
    DefaultEnv,
}

impl SymbolRef {
    pub fn local(name: &str, index: usize) -> Self {
        SymbolRef::Local {
            name: name.into(),
            index,
            attributes: SymbolAttributes::empty(),
        }
    }

    pub fn local_with(name: &str, index: usize, attributes: SymbolAttributes) -> Self {
        SymbolRef::Local {
            name: name.into(),
            index,
            attributes,
        }
    }

    pub fn upvalue(name: &str, index: usize) -> Self {
        SymbolRef::Upvalue {
            name: name.into(),
            index,
        }
    }

    pub fn global(name: &str, env: SymbolRef) -> Self {
        SymbolRef::Global {
            name: name.into(),
            env: Box::new(env),
        }
    }

    pub fn kind(&self) -> SymbolRefType {
        match self {
            SymbolRef::Local { .. } => SymbolRefType::Local,
            SymbolRef::Upvalue { .. } => SymbolRefType::Upvalue,
            SymbolRef::Global { .. } => SymbolRefType::Global,
            SymbolRef::DefaultEnv => SymbolRefType::DefaultEnv,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SymbolRef::Local { name, .. }
            | SymbolRef::Upvalue { name, .. }
            | SymbolRef::Global { name, .. } => name,
            SymbolRef::DefaultEnv => crate::ENV_SYMBOL,
        }
    }

    /// Slot index for locals and upvalues; `0` otherwise.
    pub fn index(&self) -> usize {
        match self {
            SymbolRef::Local { index, .. } | SymbolRef::Upvalue { index, .. } => *index,
            SymbolRef::Global { .. } | SymbolRef::DefaultEnv => 0,
        }
    }

    pub fn attributes(&self) -> SymbolAttributes {
        match self {
            SymbolRef::Local { attributes, .. } => *attributes,
            _ => SymbolAttributes::empty(),
        }
    }

    pub fn is_to_be_closed(&self) -> bool {
        self.attributes().contains(SymbolAttributes::TO_BE_CLOSED)
    }

    pub fn env(&self) -> Option<&SymbolRef> {
        match self {
            SymbolRef::Global { env, .. } => Some(env),
            _ => None,
        }
    }
}

impl fmt::Display for SymbolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolRef::Local { name, index, .. } => write!(f, "{name} : local / {index}"),
            SymbolRef::Upvalue { name, index } => write!(f, "{name} : upvalue / {index}"),
            SymbolRef::Global { name, env } => write!(f, "{name} : global / {}", env.name()),
            SymbolRef::DefaultEnv => write!(f, "_ENV : default env"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_points_through_its_environment() {
        let env = SymbolRef::upvalue("_ENV", 0);
        let g = SymbolRef::global("print", env.clone());
        assert_eq!(g.kind(), SymbolRefType::Global);
        assert_eq!(g.env(), Some(&env));
        assert_eq!(g.to_string(), "print : global / _ENV");
    }

    #[test]
    fn to_be_closed_flag() {
        let s = SymbolRef::local_with("f", 2, SymbolAttributes::TO_BE_CLOSED);
        assert!(s.is_to_be_closed());
        assert!(!SymbolRef::local("g", 3).is_to_be_closed());
        assert_eq!(SymbolRef::DefaultEnv.name(), "_ENV");
    }
}
