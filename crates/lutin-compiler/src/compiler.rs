//! compiler.rs — Parseur de Pratt mono-passe.
//!
//! Le bytecode est émis pendant la descente, sans AST. Une pile de
//! compilateurs de fonction (chaînés par `enclosing`) suit les fonctions
//! imbriquées ; la résolution d'une variable remonte cette chaîne et
//! convertit les locales capturées en upvalues, à raison de deux octets
//! `(is_local, index)` émis après `CLOSURE` pour câbler la fermeture à
//! l'exécution.
//!
//! Les erreurs ne jettent jamais : `had_error` + mode panique, puis
//! resynchronisation à la frontière d'instruction suivante, pour rapporter
//! plusieurs erreurs en une passe.

use std::fmt;

use ahash::AHashMap;

use lutin_core::bytecode::chunk::MAX_CONSTANTS;
use lutin_core::bytecode::disasm::disassemble_chunk;
use lutin_core::heap::{FunctionObj, Obj, ObjRef, StrId};
use lutin_core::{Chunk, Heap, Op, Value};

use crate::scanner::{Scanner, Token, TokenKind};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

// ---------- Erreurs ----------

/// Une erreur de compilation localisée.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    /// `" at 'lexème'"`, `" at end"`, ou vide pour un jeton d'erreur lexicale.
    pub location: String,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error{}: {}", self.line, self.location, self.message)
    }
}

/// Toutes les erreurs accumulées par une passe de compilation.
#[derive(Debug, Clone)]
pub struct CompileErrors(pub Vec<CompileError>);

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

// ---------- Précédences & règles ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

type ParseFn<'s, 'h> = fn(&mut Parser<'s, 'h>, bool);

struct ParseRule<'s, 'h> {
    prefix: Option<ParseFn<'s, 'h>>,
    infix: Option<ParseFn<'s, 'h>>,
    precedence: Precedence,
}

fn rule<'s, 'h>(
    prefix: Option<ParseFn<'s, 'h>>,
    infix: Option<ParseFn<'s, 'h>>,
    precedence: Precedence,
) -> ParseRule<'s, 'h> {
    ParseRule { prefix, infix, precedence }
}

/// La table de Pratt : pour chaque sorte de jeton, sa fonction préfixe, sa
/// fonction infixe et sa précédence infixe.
fn get_rule<'s, 'h>(kind: TokenKind) -> ParseRule<'s, 'h> {
    use Precedence as P;
    use TokenKind as T;
    match kind {
        T::LeftParen => rule(Some(Parser::grouping), Some(Parser::call), P::Call),
        T::Dot => rule(None, Some(Parser::dot), P::Call),
        T::Minus => rule(Some(Parser::unary), Some(Parser::binary), P::Term),
        T::Plus => rule(None, Some(Parser::binary), P::Term),
        T::Slash | T::Star => rule(None, Some(Parser::binary), P::Factor),
        T::Bang => rule(Some(Parser::unary), None, P::None),
        T::BangEqual | T::EqualEqual => rule(None, Some(Parser::binary), P::Equality),
        T::Greater | T::GreaterEqual | T::Less | T::LessEqual => {
            rule(None, Some(Parser::binary), P::Comparison)
        }
        T::Identifier => rule(Some(Parser::variable), None, P::None),
        T::String => rule(Some(Parser::string), None, P::None),
        T::Number => rule(Some(Parser::number), None, P::None),
        T::And => rule(None, Some(Parser::and_), P::And),
        T::Or => rule(None, Some(Parser::or_), P::Or),
        T::False | T::Nil | T::True => rule(Some(Parser::literal), None, P::None),
        T::This => rule(Some(Parser::this_), None, P::None),
        _ => rule(None, None, P::None),
    }
}

// ---------- Compilateur de fonction ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'s> {
    name: &'s str,
    /// -1 tant que l'initialiseur n'est pas terminé.
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy)]
struct UpvalueRef {
    is_local: bool,
    index: u8,
}

/// Un étage de la pile de compilation : une fonction en cours.
struct FnCompiler<'s> {
    enclosing: Option<Box<FnCompiler<'s>>>,
    function: FunctionObj,
    ftype: FunctionType,
    locals: Vec<Local<'s>>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: i32,
    /// Dé-dupe des constantes chaîne : interné → indice du pool.
    const_cache: AHashMap<ObjRef, usize>,
}

impl<'s> FnCompiler<'s> {
    fn new(ftype: FunctionType, name: Option<StrId>) -> Self {
        // Le slot 0 est réservé : il reçoit le receveur (`this`) pour les
        // méthodes, la fonction elle-même sinon.
        let slot_zero = match ftype {
            FunctionType::Method | FunctionType::Initializer => "this",
            _ => "",
        };
        Self {
            enclosing: None,
            function: FunctionObj::new(name),
            ftype,
            locals: vec![Local { name: slot_zero, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
            const_cache: AHashMap::new(),
        }
    }

    fn resolve_local(&self, name: &str) -> Result<Option<u8>, &'static str> {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err("Can't read local variable in its own initializer.");
                }
                return Ok(Some(i as u8));
            }
        }
        Ok(None)
    }

    /// Résolution d'upvalue : locale du parent (qu'on marque capturée) ou,
    /// récursivement, upvalue du parent.
    fn resolve_upvalue(&mut self, name: &str) -> Result<Option<u8>, &'static str> {
        let Some(enclosing) = self.enclosing.as_deref_mut() else {
            return Ok(None);
        };
        if let Some(local) = enclosing.resolve_local(name)? {
            enclosing.locals[usize::from(local)].is_captured = true;
            return self.add_upvalue(true, local).map(Some);
        }
        if let Some(upvalue) = enclosing.resolve_upvalue(name)? {
            return self.add_upvalue(false, upvalue).map(Some);
        }
        Ok(None)
    }

    /// Dé-duplique sur `(is_local, index)` et renvoie le slot stable.
    fn add_upvalue(&mut self, is_local: bool, index: u8) -> Result<u8, &'static str> {
        for (i, uv) in self.upvalues.iter().enumerate() {
            if uv.is_local == is_local && uv.index == index {
                return Ok(i as u8);
            }
        }
        if self.upvalues.len() == MAX_UPVALUES {
            return Err("Too many closure variables in function.");
        }
        self.upvalues.push(UpvalueRef { is_local, index });
        self.function.upvalue_count = self.upvalues.len();
        Ok((self.upvalues.len() - 1) as u8)
    }
}

// ---------- Parseur ----------

struct Parser<'s, 'h> {
    heap: &'h mut Heap,
    scanner: Scanner<'s>,
    current: Token<'s>,
    previous: Token<'s>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    compiler: Box<FnCompiler<'s>>,
    /// Profondeur d'imbrication des déclarations `class` ; `this` n'est
    /// légal que si elle est non nulle.
    class_depth: usize,
}

/// Compile `source` et renvoie la fonction `<script>`, ou les erreurs.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, CompileErrors> {
    let mut parser = Parser {
        heap,
        scanner: Scanner::new(source),
        current: Token::synthetic(),
        previous: Token::synthetic(),
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        compiler: Box::new(FnCompiler::new(FunctionType::Script, None)),
        class_depth: 0,
    };

    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }
    let (function, _) = parser.end_compiler();

    if parser.had_error {
        Err(CompileErrors(parser.errors))
    } else {
        Ok(parser.alloc_function(function))
    }
}

impl<'s, 'h> Parser<'s, 'h> {
    // ----- Flux de jetons -----

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ----- Rapport d'erreurs -----

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'s>, message: &str) {
        // En mode panique, les rapports en cascade sont muselés jusqu'à la
        // resynchronisation.
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.errors.push(CompileError { line: token.line, location, message: message.to_string() });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ----- Émission -----

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.compiler.function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: Op) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, op: Op, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        // Un initialiseur renvoie toujours son instance (slot 0).
        if self.compiler.ftype == FunctionType::Initializer {
            self.emit_ops(Op::GetLocal, 0);
        } else {
            self.emit_op(Op::Nil);
        }
        self.emit_op(Op::Return);
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.previous.line;
        let index = self.current_chunk().write_constant(value, line);
        if index >= MAX_CONSTANTS {
            self.error("Too many constants in one chunk.");
        }
    }

    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 : les deux octets de l'opérande sont déjà dans le flux.
        let jump = self.current_chunk().code.len() - offset - 2;
        if jump > usize::from(u16::MAX) {
            self.error("Too much code to jump over.");
        }
        self.current_chunk().code[offset] = ((jump >> 8) & 0xff) as u8;
        self.current_chunk().code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Op::Loop);
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > usize::from(u16::MAX) {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    // ----- Constantes & tas -----

    /// Racines GC du compilateur : chaque étage de la chaîne protège le nom
    /// et les constantes de sa fonction en construction.
    fn gc_roots(&self) -> Vec<Value> {
        let mut roots = Vec::new();
        let mut frame: Option<&FnCompiler<'s>> = Some(&self.compiler);
        while let Some(c) = frame {
            if let Some(name) = c.function.name {
                roots.push(Value::Obj(name.obj));
            }
            roots.extend_from_slice(&c.function.chunk.constants);
            frame = c.enclosing.as_deref();
        }
        roots
    }

    fn intern(&mut self, chars: &str) -> StrId {
        if self.heap.should_collect() {
            let roots = self.gc_roots();
            self.heap.collect(&roots);
        }
        self.heap.copy_string(chars)
    }

    fn alloc_function(&mut self, function: FunctionObj) -> ObjRef {
        if self.heap.should_collect() {
            // La fonction finie n'est plus dans la chaîne : on la racine à
            // la main le temps de la collecte.
            let mut roots = self.gc_roots();
            if let Some(name) = function.name {
                roots.push(Value::Obj(name.obj));
            }
            roots.extend_from_slice(&function.chunk.constants);
            self.heap.collect(&roots);
        }
        self.heap.alloc(Obj::Function(function))
    }

    /// Indice de pool pour une chaîne internée, dé-dupliqué par fonction.
    fn string_constant(&mut self, id: StrId) -> usize {
        if let Some(&index) = self.compiler.const_cache.get(&id.obj) {
            return index;
        }
        let index = self.compiler.function.chunk.add_constant(Value::Obj(id.obj));
        self.compiler.const_cache.insert(id.obj, index);
        index
    }

    /// Constante d'identifiant : l'opérande des opcodes nommés tient sur un
    /// octet.
    fn identifier_constant(&mut self, name: &str) -> u8 {
        let id = self.intern(name);
        let index = self.string_constant(id);
        if index > usize::from(u8::MAX) {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    // ----- Pile de compilateurs -----

    fn push_compiler(&mut self, ftype: FunctionType, name: StrId) {
        let fresh = Box::new(FnCompiler::new(ftype, Some(name)));
        let enclosing = std::mem::replace(&mut self.compiler, fresh);
        self.compiler.enclosing = Some(enclosing);
    }

    fn end_compiler(&mut self) -> (FunctionObj, Vec<UpvalueRef>) {
        self.emit_return();
        let enclosing = self.compiler.enclosing.take();
        let frame = std::mem::replace(
            &mut self.compiler,
            enclosing.unwrap_or_else(|| Box::new(FnCompiler::new(FunctionType::Script, None))),
        );
        let FnCompiler { function, upvalues, .. } = *frame;
        if !self.had_error && log::log_enabled!(log::Level::Trace) {
            let name = match function.name {
                Some(n) => self.heap.str_chars(n.obj).to_string(),
                None => "<script>".to_string(),
            };
            log::trace!("\n{}", disassemble_chunk(self.heap, &function.chunk, &name));
        }
        (function, upvalues)
    }

    // ----- Portées & variables -----

    fn begin_scope(&mut self) {
        self.compiler.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.compiler.scope_depth -= 1;
        loop {
            let captured = match self.compiler.locals.last() {
                Some(local) if local.depth > self.compiler.scope_depth => local.is_captured,
                _ => break,
            };
            // Une locale capturée part vivre sur le tas, les autres sont
            // simplement dépilées.
            if captured {
                self.emit_op(Op::CloseUpvalue);
            } else {
                self.emit_op(Op::Pop);
            }
            self.compiler.locals.pop();
        }
    }

    fn add_local(&mut self, name: &'s str) {
        if self.compiler.locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.compiler.locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.compiler.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let mut duplicate = false;
        for local in self.compiler.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.compiler.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.compiler.scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn mark_initialized(&mut self) {
        if self.compiler.scope_depth == 0 {
            return;
        }
        let depth = self.compiler.scope_depth;
        if let Some(local) = self.compiler.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.compiler.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_ops(Op::DefineGlobal, global);
    }

    fn named_variable(&mut self, name: Token<'s>, can_assign: bool) {
        let (get_op, set_op, arg) = match self.compiler.resolve_local(name.lexeme) {
            Err(message) => {
                self.error(message);
                (Op::GetLocal, Op::SetLocal, 0)
            }
            Ok(Some(slot)) => (Op::GetLocal, Op::SetLocal, slot),
            Ok(None) => match self.compiler.resolve_upvalue(name.lexeme) {
                Err(message) => {
                    self.error(message);
                    (Op::GetLocal, Op::SetLocal, 0)
                }
                Ok(Some(slot)) => (Op::GetUpvalue, Op::SetUpvalue, slot),
                Ok(None) => {
                    let index = self.identifier_constant(name.lexeme);
                    (Op::GetGlobal, Op::SetGlobal, index)
                }
            },
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_ops(set_op, arg);
        } else {
            self.emit_ops(get_op, arg);
        }
    }

    // ----- Expressions -----

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = get_rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = get_rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1]; // sans les guillemets
        let id = self.intern(content);
        let index = self.string_constant(id);
        let line = self.previous.line;
        if index < 256 {
            self.current_chunk().write_op(Op::Constant, line);
            self.emit_byte(index as u8);
        } else if index < MAX_CONSTANTS {
            self.current_chunk().write_op(Op::ConstantLong, line);
            self.emit_byte((index & 0xff) as u8);
            self.emit_byte(((index >> 8) & 0xff) as u8);
            self.emit_byte(((index >> 16) & 0xff) as u8);
        } else {
            self.error("Too many constants in one chunk.");
        }
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(Op::False),
            TokenKind::Nil => self.emit_op(Op::Nil),
            TokenKind::True => self.emit_op(Op::True),
            _ => unreachable!("jeton littéral"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match kind {
            TokenKind::Minus => self.emit_op(Op::Negate),
            TokenKind::Bang => self.emit_op(Op::Not),
            _ => unreachable!("opérateur unaire"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let kind = self.previous.kind;
        let precedence = get_rule(kind).precedence;
        self.parse_precedence(precedence.next());
        match kind {
            TokenKind::BangEqual => {
                self.emit_op(Op::Equal);
                self.emit_op(Op::Not);
            }
            TokenKind::EqualEqual => self.emit_op(Op::Equal),
            TokenKind::Greater => self.emit_op(Op::Greater),
            // a >= b ≡ !(a < b), a <= b ≡ !(a > b) — NaN suit IEEE.
            TokenKind::GreaterEqual => {
                self.emit_op(Op::Less);
                self.emit_op(Op::Not);
            }
            TokenKind::Less => self.emit_op(Op::Less),
            TokenKind::LessEqual => {
                self.emit_op(Op::Greater);
                self.emit_op(Op::Not);
            }
            TokenKind::Plus => self.emit_op(Op::Add),
            TokenKind::Minus => self.emit_op(Op::Subtract),
            TokenKind::Star => self.emit_op(Op::Multiply),
            TokenKind::Slash => self.emit_op(Op::Divide),
            _ => unreachable!("opérateur binaire"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous;
        self.named_variable(name, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.class_depth == 0 {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        let token = self.previous;
        self.named_variable(token, false);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_ops(Op::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let lexeme = self.previous.lexeme;
        let name = self.identifier_constant(lexeme);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_ops(Op::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            // `expr.nom(args)` fusionne l'accès et l'appel.
            let arg_count = self.argument_list();
            self.emit_ops(Op::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_ops(Op::GetProperty, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arg_count == u8::MAX {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    arg_count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        arg_count
    }

    // ----- Déclarations -----

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Op::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Une fonction peut se référencer elle-même dans son corps.
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, ftype: FunctionType) {
        let lexeme = self.previous.lexeme;
        let name = self.intern(lexeme);
        self.push_compiler(ftype, name);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.compiler.function.arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.compiler.function.arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_compiler();
        let fn_ref = self.alloc_function(function);
        let index = self.current_chunk().add_constant(Value::Obj(fn_ref));
        if index > usize::from(u8::MAX) {
            self.error("Too many constants in one chunk.");
            return;
        }
        self.emit_ops(Op::Closure, index as u8);
        // Deux octets par capture : la VM s'en sert pour câbler la fermeture.
        for uv in upvalues {
            self.emit_byte(u8::from(uv.is_local));
            self.emit_byte(uv.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        self.emit_ops(Op::Class, name_constant);
        self.define_variable(name_constant);

        self.class_depth += 1;
        // Recharge la classe au sommet pour y attacher les méthodes.
        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(Op::Pop);
        self.class_depth -= 1;
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let lexeme = self.previous.lexeme;
        let constant = self.identifier_constant(lexeme);
        let ftype = if lexeme == "init" { FunctionType::Initializer } else { FunctionType::Method };
        self.function(ftype);
        self.emit_ops(Op::Method, constant);
    }

    // ----- Instructions -----

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(Op::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(Op::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        // JUMP_IF_FALSE laisse la condition en pile : POP explicite des
        // deux côtés.
        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        let else_jump = self.emit_jump(Op::Jump);
        self.patch_jump(then_jump);
        self.emit_op(Op::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(Op::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // pas d'initialiseur
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit_op(Op::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            // L'incrément s'exécute après le corps : on saute par-dessus,
            // le corps boucle vers lui, lui vers la condition.
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_op(Op::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(Op::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.compiler.ftype == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.compiler.ftype == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(Op::Return);
        }
    }
}
