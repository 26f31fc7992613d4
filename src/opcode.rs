//! Opcode encoding, per spec §4.4.
//!
//! One byte per opcode; the numeric assignment below is this crate's own
//! (spec §4.4 gives the authoritative mnemonic groups and semantics but not
//! a wire encoding) — an external compiler targeting this VM must agree
//! with this table, same as spec §6 requires.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    // Constants and literals
    PushConst = 0,
    PushTrue = 1,
    PushFalse = 2,
    PushNil = 3,

    // Variables
    SetGlobal = 4,
    PushGlobal = 5,
    SetLocal = 6,
    PushLocal = 7,

    // Type conversions
    Int = 8,
    Bool = 9,
    Num = 10,
    Str = 11,

    // Environment
    Clock = 12,
    Print = 13,

    // Stack discipline
    Pop = 14,
    Squash = 15,

    // Arithmetic and string
    IntNeg = 16,
    NumNeg = 17,
    IntAdd = 18,
    IntSub = 19,
    IntMul = 20,
    IntDiv = 21,
    NumAdd = 22,
    NumSub = 23,
    NumMul = 24,
    NumDiv = 25,
    StrCat = 26,
    Not = 27,

    // Comparison
    IntLess = 28,
    IntGreater = 29,
    NumLess = 30,
    NumGreater = 31,
    Equal = 32,

    // Control flow
    Jump = 33,
    JumpIfFalse = 34,
    Loop = 35,

    // Functions
    Function = 36,
    Call = 37,
    LoadIp = 38,
    LoadFp = 39,
    SetReturn = 40,
    PushReturn = 41,

    // Structs
    Struct = 42,
    Destruct = 43,
    GetField = 44,
    ExtractField = 45,
    SetField = 46,
    InsertField = 47,

    // Upvalues and references
    RefLocal = 48,
    Deref = 49,
    SetRef = 50,

    // Type tests
    IsValType = 51,
    IsObjType = 52,
}

impl Opcode {
    pub fn from_u8(b: u8) -> Option<Self> {
        use Opcode::*;
        Some(match b {
            0 => PushConst,
            1 => PushTrue,
            2 => PushFalse,
            3 => PushNil,
            4 => SetGlobal,
            5 => PushGlobal,
            6 => SetLocal,
            7 => PushLocal,
            8 => Int,
            9 => Bool,
            10 => Num,
            11 => Str,
            12 => Clock,
            13 => Print,
            14 => Pop,
            15 => Squash,
            16 => IntNeg,
            17 => NumNeg,
            18 => IntAdd,
            19 => IntSub,
            20 => IntMul,
            21 => IntDiv,
            22 => NumAdd,
            23 => NumSub,
            24 => NumMul,
            25 => NumDiv,
            26 => StrCat,
            27 => Not,
            28 => IntLess,
            29 => IntGreater,
            30 => NumLess,
            31 => NumGreater,
            32 => Equal,
            33 => Jump,
            34 => JumpIfFalse,
            35 => Loop,
            36 => Function,
            37 => Call,
            38 => LoadIp,
            39 => LoadFp,
            40 => SetReturn,
            41 => PushReturn,
            42 => Struct,
            43 => Destruct,
            44 => GetField,
            45 => ExtractField,
            46 => SetField,
            47 => InsertField,
            48 => RefLocal,
            49 => Deref,
            50 => SetRef,
            51 => IsValType,
            52 => IsObjType,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_opcode() {
        for b in 0..=52u8 {
            assert!(Opcode::from_u8(b).is_some(), "opcode {} should decode", b);
        }
        assert!(Opcode::from_u8(53).is_none());
        assert!(Opcode::from_u8(255).is_none());
    }
}
