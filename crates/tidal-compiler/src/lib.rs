//! `tidal-compiler`: the emitter side of the engine.
//!
//! A front end resolves scopes into [`SymbolRef`](tidal_core::SymbolRef)s and
//! drives [`ByteCode`]; the processor executes the resulting flat instruction
//! list. Functions can be dumped to, and reloaded from, binary chunks.

pub mod bytecode;
pub mod decode;
pub mod disasm;
pub mod encode;
pub mod scope;

pub use bytecode::{ByteCode, MetaKind, SourceScope};
pub use decode::{decode_function, DecodedFunction};
pub use disasm::{disassemble, disassemble_range};
pub use encode::{encode_function, find_meta, MAGIC, VERSION};
pub use scope::{RuntimeScopeBlock, RuntimeScopeFrame};
