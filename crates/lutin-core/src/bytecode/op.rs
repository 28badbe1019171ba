//! op.rs — Jeu d'instructions de la VM.
//!
//! Encodage dense sur un octet, opérandes en ligne dans le flux de code :
//! indices u8, indices longs u24 little-endian, sauts u16 big-endian.
//! Notation d'effet de pile : "(a b — c)" dépile a puis b (b au sommet) et
//! empile c.

/// Un opcode. L'ordre des variantes fixe l'encodage : ajouter en bas.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// u8 idx — empile pool[idx]
    Constant,
    /// u24 idx (LE) — empile pool[idx]
    ConstantLong,
    Nil,
    True,
    False,
    /// ( v — )
    Pop,
    /// u8 slot — empile frame.slots[slot]
    GetLocal,
    /// u8 slot — copie le sommet dans frame.slots[slot], le laisse en pile
    SetLocal,
    /// u8 nom — lit une globale, erreur si absente
    GetGlobal,
    /// u8 nom — définit la globale depuis le sommet, dépile
    DefineGlobal,
    /// u8 nom — affecte si définie, erreur sinon
    SetGlobal,
    /// u8 slot — lit à travers l'upvalue de la fermeture courante
    GetUpvalue,
    /// u8 slot — écrit à travers l'upvalue, laisse la valeur en pile
    SetUpvalue,
    /// u8 nom — ( inst — v ) champ, sinon méthode liée
    GetProperty,
    /// u8 nom — ( inst v — v ) écrit le champ
    SetProperty,
    /// ( a b — bool )
    Equal,
    Greater,
    Less,
    /// ( a b — a+b ) nombres, ou concaténation de deux chaînes
    Add,
    Subtract,
    Multiply,
    Divide,
    /// ( v — !v )
    Not,
    /// ( n — -n )
    Negate,
    /// ( v — ) écrit la valeur formatée + saut de ligne
    Print,
    /// u16 — saut avant inconditionnel
    Jump,
    /// u16 — saut avant si le sommet est falsy (valeur laissée en pile)
    JumpIfFalse,
    /// u16 — saut arrière
    Loop,
    /// u8 argc — appelle la valeur sous les argc arguments
    Call,
    /// u8 nom, u8 argc — accès propriété fusionné avec l'appel
    Invoke,
    /// u8 fn-const, puis 2 octets (is_local, index) par upvalue capturée
    Closure,
    /// ferme l'upvalue du slot sommet, dépile
    CloseUpvalue,
    Return,
    /// u8 nom — empile une classe neuve
    Class,
    /// u8 nom — dépile une fermeture, l'installe comme méthode de la
    /// classe restée en pile
    Method,
}

impl Op {
    /// Décodage d'un octet du flux de code.
    pub fn from_byte(byte: u8) -> Option<Op> {
        use Op::*;
        Some(match byte {
            0 => Constant,
            1 => ConstantLong,
            2 => Nil,
            3 => True,
            4 => False,
            5 => Pop,
            6 => GetLocal,
            7 => SetLocal,
            8 => GetGlobal,
            9 => DefineGlobal,
            10 => SetGlobal,
            11 => GetUpvalue,
            12 => SetUpvalue,
            13 => GetProperty,
            14 => SetProperty,
            15 => Equal,
            16 => Greater,
            17 => Less,
            18 => Add,
            19 => Subtract,
            20 => Multiply,
            21 => Divide,
            22 => Not,
            23 => Negate,
            24 => Print,
            25 => Jump,
            26 => JumpIfFalse,
            27 => Loop,
            28 => Call,
            29 => Invoke,
            30 => Closure,
            31 => CloseUpvalue,
            32 => Return,
            33 => Class,
            34 => Method,
            _ => return None,
        })
    }

    /// Mnémonique court (désassembleur, traces, messages).
    pub fn mnemonic(self) -> &'static str {
        use Op::*;
        match self {
            Constant => "CONSTANT",
            ConstantLong => "CONSTANT_LONG",
            Nil => "NIL",
            True => "TRUE",
            False => "FALSE",
            Pop => "POP",
            GetLocal => "GET_LOCAL",
            SetLocal => "SET_LOCAL",
            GetGlobal => "GET_GLOBAL",
            DefineGlobal => "DEFINE_GLOBAL",
            SetGlobal => "SET_GLOBAL",
            GetUpvalue => "GET_UPVALUE",
            SetUpvalue => "SET_UPVALUE",
            GetProperty => "GET_PROPERTY",
            SetProperty => "SET_PROPERTY",
            Equal => "EQUAL",
            Greater => "GREATER",
            Less => "LESS",
            Add => "ADD",
            Subtract => "SUBTRACT",
            Multiply => "MULTIPLY",
            Divide => "DIVIDE",
            Not => "NOT",
            Negate => "NEGATE",
            Print => "PRINT",
            Jump => "JUMP",
            JumpIfFalse => "JUMP_IF_FALSE",
            Loop => "LOOP",
            Call => "CALL",
            Invoke => "INVOKE",
            Closure => "CLOSURE",
            CloseUpvalue => "CLOSE_UPVALUE",
            Return => "RETURN",
            Class => "CLASS",
            Method => "METHOD",
        }
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Op::from_byte(byte).ok_or(byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Op::from_byte(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Op::from_byte(Op::Method as u8), Some(Op::Method));
        assert_eq!(Op::from_byte(Op::Method as u8 + 1), None);
    }
}
