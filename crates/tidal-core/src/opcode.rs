use bitflags::bitflags;
use strum::{Display, EnumCount, EnumIter, FromRepr, IntoStaticStr};

/// Instruction set of the tidal stack machine.
///
/// Operands travel in the [`Instruction`](crate::Instruction) record; the
/// discriminant is the byte written to binary chunks, so variants must only
/// ever be appended.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumCount, EnumIter, FromRepr, IntoStaticStr,
)]
#[repr(u8)]
#[strum(serialize_all = "UPPERCASE")]
pub enum OpCode {
    // Meta / debug
    Nop,
    Debug,

    // Stack juggling
    Pop,
    Copy,
    Swap,
    Literal,

    // Values
    Closure,
    NewTable,
    TblInitN,
    TblInitI,

    // Variables
    StoreLcl,
    Local,
    StoreUpv,
    Upvalue,
    IndexSet,
    Index,
    IndexSetN,
    IndexN,
    IndexSetL,
    IndexL,

    // Stack frames
    Clean,
    Meta,
    BeginFn,
    Args,
    Call,
    ThisCall,
    Ret,

    // Jumps
    Jump,
    Jf,
    JNil,
    JFor,
    JtOrPop,
    JfOrPop,

    // Operators
    Concat,
    LessEq,
    Less,
    Eq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Not,
    Len,
    Neg,
    Power,
    CNot,

    // Type conversions and manipulations
    MkTuple,
    Scalar,
    Incr,
    ToNum,
    ToBool,
    ExpTuple,

    // Scopes
    Enter,
    Leave,
    Exit,

    // Iterators
    IterPrep,
    IterUpd,

    Invalid,

    // Integer operators
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    ShiftLeft,
    ShiftRight,
    FloorDiv,
}

bitflags! {
    /// Which [`Instruction`](crate::Instruction) fields an opcode reads.
    ///
    /// Governs the disassembly listing and the binary chunk layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FieldUsage: u8 {
        const NUM_VAL = 0x01;
        const NUM_VAL2 = 0x02;
        const VALUE = 0x04;
        const SYMBOL = 0x08;
        const SYMBOL_LIST = 0x10;
        const NAME = 0x20;
        /// `num_val` holds a code address (relocated by dump/undump).
        const NUM_VAL_AS_CODE_ADDRESS = 0x40 | Self::NUM_VAL.bits();
    }
}

impl OpCode {
    pub fn field_usage(self) -> FieldUsage {
        use OpCode::*;
        match self {
            Nop | Debug | Invalid => FieldUsage::NAME,
            Pop | Copy | NewTable | TblInitI | Ret | ToNum | Incr | MkTuple | ExpTuple => {
                FieldUsage::NUM_VAL
            }
            Swap => FieldUsage::NUM_VAL | FieldUsage::NUM_VAL2,
            Literal => FieldUsage::VALUE,
            Closure => FieldUsage::SYMBOL_LIST | FieldUsage::NUM_VAL_AS_CODE_ADDRESS,
            StoreLcl | StoreUpv => FieldUsage::SYMBOL | FieldUsage::NUM_VAL | FieldUsage::NUM_VAL2,
            Local | Upvalue => FieldUsage::SYMBOL,
            IndexSet | IndexSetN | IndexSetL => {
                FieldUsage::SYMBOL | FieldUsage::NUM_VAL | FieldUsage::NUM_VAL2 | FieldUsage::VALUE
            }
            Index | IndexN | IndexL => FieldUsage::VALUE,
            Clean | Enter | Leave | Exit | BeginFn => {
                FieldUsage::NUM_VAL | FieldUsage::NUM_VAL2 | FieldUsage::SYMBOL_LIST
            }
            Meta => FieldUsage::NUM_VAL | FieldUsage::NUM_VAL2 | FieldUsage::NAME | FieldUsage::VALUE,
            Args => FieldUsage::SYMBOL_LIST,
            Call | ThisCall => FieldUsage::NUM_VAL | FieldUsage::NAME,
            Jump | Jf | JNil | JFor | JtOrPop | JfOrPop => FieldUsage::NUM_VAL_AS_CODE_ADDRESS,
            TblInitN | Concat | LessEq | Less | Eq | Add | Sub | Mul | Div | Mod | Not | Len
            | Neg | Power | CNot | Scalar | ToBool | IterPrep | IterUpd | BitAnd | BitOr
            | BitXor | BitNot | ShiftLeft | ShiftRight | FloorDiv => FieldUsage::empty(),
        }
    }

    /// Opcodes whose `num_val` is a jump target.
    pub fn is_jump(self) -> bool {
        self.field_usage().contains(FieldUsage::NUM_VAL_AS_CODE_ADDRESS) && self != OpCode::Closure
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
