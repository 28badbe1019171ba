//! vm.rs — La machine virtuelle.
//!
//! Une pile de valeurs, une pile de frames (64 max), la liste des upvalues
//! ouvertes triée par slot décroissant, et le tas partagé avec le
//! compilateur. La boucle `run` lit un opcode à la fois à travers la frame
//! du sommet ; les appels/retours se contentent d'empiler/dépiler des
//! frames, la frame courante étant relue à chaque accès.
//!
//! Toute erreur d'exécution imprime le message puis la remontée de pile
//! (`[line N] in f()` frame par frame), remet la pile à zéro et fait
//! remonter `VmError::Runtime`.

use lutin_core::bytecode::disasm::{disassemble_chunk, disassemble_instruction};
use lutin_core::heap::{
    BoundMethodObj, ClassObj, ClosureObj, InstanceObj, NativeFn, NativeObj, Obj, ObjRef, StrId,
    UpvalueState,
};
use lutin_core::value::format_value;
use lutin_core::{Heap, Op, Table, Value};

use lutin_compiler::compile;

use crate::natives;
use crate::{DefaultHost, Host, InterpretError, VmError, VmOptions};

/// Profondeur d'appels maximale.
pub const FRAMES_MAX: usize = 64;
/// Capacité de la pile de valeurs (chaque frame adresse au plus 256 slots).
pub const STACK_MAX: usize = FRAMES_MAX * 256;

struct CallFrame {
    closure: ObjRef,
    /// Indice du prochain octet à lire dans le chunk de la fonction.
    ip: usize,
    /// Base de la fenêtre de pile : slot 0 de l'appelé.
    slots: usize,
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Upvalues ouvertes, slot de pile décroissant, au plus une par slot.
    open_upvalues: Vec<ObjRef>,
    options: VmOptions,
    host: Box<dyn Host>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        let mut heap = Heap::new();
        heap.set_stress(options.stress_gc);
        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: Vec::new(),
            options,
            host: Box::new(DefaultHost),
        };
        natives::install(&mut vm);
        vm
    }

    /// Installe un hôte personnalisé (capture de sortie dans les tests).
    pub fn with_host(mut self, host: Box<dyn Host>) -> Self {
        self.host = host;
        self
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Compile puis exécute `source`. La VM survit à l'appel : les globales
    /// définies restent visibles au suivant (REPL).
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = match compile(source, &mut self.heap) {
            Ok(function) => function,
            Err(errors) => {
                for e in &errors.0 {
                    self.host.error(&e.to_string());
                }
                return Err(InterpretError::Compile(errors));
            }
        };

        if self.options.disasm {
            let chunk = &self.heap.function(function).chunk;
            let text = disassemble_chunk(&self.heap, chunk, "<script>");
            self.host.print(text.trim_end());
        }

        // La fonction passe par la pile le temps d'allouer sa fermeture.
        self.push(Value::Obj(function));
        let closure = self.alloc(Obj::Closure(ClosureObj { function, upvalues: Vec::new() }));
        self.pop().map_err(InterpretError::from)?;
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0)?;
        match self.run() {
            Ok(()) => Ok(()),
            Err(e) => {
                // `runtime_error` a déjà remis la pile à zéro ; les erreurs
                // internes (bytecode invalide) passent aussi par ici pour
                // que la VM reste utilisable au prochain `interpret`.
                self.reset_stack();
                Err(InterpretError::from(e))
            }
        }
    }

    // ---------- Pile ----------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn peek(&self, distance: usize) -> Result<Value, VmError> {
        let len = self.stack.len();
        if distance >= len {
            return Err(VmError::StackUnderflow);
        }
        Ok(self.stack[len - 1 - distance])
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // ---------- Erreurs ----------

    /// Rapporte le message et la remontée de pile, remet la pile à zéro.
    fn runtime_error(&mut self, message: String) -> VmError {
        self.host.error(&message);
        for frame in self.frames.iter().rev() {
            let closure = self.heap.closure(frame.closure);
            let function = self.heap.function(closure.function);
            let line = function.chunk.get_line(frame.ip.saturating_sub(1));
            match function.name {
                Some(name) => {
                    let text = format!("[line {line}] in {}()", self.heap.str_chars(name.obj));
                    self.host.error(&text);
                }
                None => self.host.error(&format!("[line {line}] in script")),
            }
        }
        self.reset_stack();
        VmError::Runtime(message)
    }

    // ---------- GC ----------

    /// Racines de la VM : pile, fermetures des frames, upvalues ouvertes.
    /// Les globales et `"init"` vivent sur le tas et sont racinées là-bas.
    fn collect_if_needed(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let mut roots: Vec<Value> =
            Vec::with_capacity(self.stack.len() + self.frames.len() + self.open_upvalues.len());
        roots.extend_from_slice(&self.stack);
        roots.extend(self.frames.iter().map(|f| Value::Obj(f.closure)));
        roots.extend(self.open_upvalues.iter().map(|&u| Value::Obj(u)));
        self.heap.collect(&roots);
    }

    fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.collect_if_needed();
        self.heap.alloc(obj)
    }

    /// Slots de la liste ouverte, pour vérifier l'invariant de tri (tests).
    pub fn open_upvalue_slots(&self) -> Vec<usize> {
        self.open_upvalues
            .iter()
            .filter_map(|&u| match *self.heap.upvalue(u) {
                UpvalueState::Open(slot) => Some(slot),
                UpvalueState::Closed(_) => None,
            })
            .collect()
    }

    // ---------- Lecture du flux de code ----------

    fn read_byte(&mut self) -> Result<u8, VmError> {
        let frame = self.frames.last_mut().ok_or(VmError::NoCallFrame)?;
        let function = self.heap.closure(frame.closure).function;
        let chunk = &self.heap.function(function).chunk;
        let byte = *chunk
            .code
            .get(frame.ip)
            .ok_or_else(|| VmError::InvalidBytecode("lecture au-delà du flux de code".to_string()))?;
        frame.ip += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, VmError> {
        let hi = self.read_byte()?;
        let lo = self.read_byte()?;
        Ok(u16::from(hi) << 8 | u16::from(lo))
    }

    fn read_u24(&mut self) -> Result<usize, VmError> {
        let lo = self.read_byte()?;
        let mid = self.read_byte()?;
        let hi = self.read_byte()?;
        Ok(usize::from(lo) | usize::from(mid) << 8 | usize::from(hi) << 16)
    }

    fn constant(&self, index: usize) -> Result<Value, VmError> {
        let frame = self.frames.last().ok_or(VmError::NoCallFrame)?;
        let function = self.heap.closure(frame.closure).function;
        self.heap
            .function(function)
            .chunk
            .constants
            .get(index)
            .copied()
            .ok_or_else(|| VmError::InvalidBytecode(format!("constante {index} absente du pool")))
    }

    fn constant_string(&self, index: usize) -> Result<StrId, VmError> {
        let value = self.constant(index)?;
        self.heap
            .value_as_str(value)
            .map(|r| self.heap.str_id(r))
            .ok_or_else(|| VmError::InvalidBytecode(format!("la constante {index} n'est pas un nom")))
    }

    fn frame_slots(&self) -> Result<usize, VmError> {
        Ok(self.frames.last().ok_or(VmError::NoCallFrame)?.slots)
    }

    fn offset_ip(&mut self, forward: bool, offset: u16) -> Result<(), VmError> {
        let frame = self.frames.last_mut().ok_or(VmError::NoCallFrame)?;
        if forward {
            frame.ip += usize::from(offset);
        } else {
            frame.ip -= usize::from(offset);
        }
        Ok(())
    }

    // ---------- Appels ----------

    fn call_closure(&mut self, closure: ObjRef, arg_count: u8) -> Result<(), VmError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {arg_count}.")));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }
        let slots = self.stack.len() - usize::from(arg_count) - 1;
        self.frames.push(CallFrame { closure, ip: 0, slots });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), VmError> {
        // Instantané de la variante pour relâcher l'emprunt du tas avant
        // de manipuler la pile.
        enum Kind {
            Closure,
            Native(NativeFn, u8),
            Class,
            Bound(Value, ObjRef),
            Other,
        }

        let Value::Obj(r) = callee else {
            return Err(self.runtime_error("Can only call functions and classes.".to_string()));
        };
        let kind = match self.heap.obj(r) {
            Obj::Closure(_) => Kind::Closure,
            Obj::Native(n) => Kind::Native(n.function, n.arity),
            Obj::Class(_) => Kind::Class,
            Obj::Bound(b) => Kind::Bound(b.receiver, b.method),
            _ => Kind::Other,
        };

        match kind {
            Kind::Closure => self.call_closure(r, arg_count),
            Kind::Native(function, arity) => {
                if arg_count != arity {
                    return Err(
                        self.runtime_error(format!("Expected {arity} arguments but got {arg_count}."))
                    );
                }
                let base = self.stack.len() - usize::from(arg_count);
                match function(&mut self.heap, &self.stack[base..]) {
                    Ok(result) => {
                        // Le résultat remplace l'appelé sous les arguments.
                        self.stack.truncate(base - 1);
                        self.push(result);
                        Ok(())
                    }
                    Err(message) => Err(self.runtime_error(message)),
                }
            }
            Kind::Class => {
                let instance = self.alloc(Obj::Instance(InstanceObj { class: r, fields: Table::new() }));
                let receiver_index = self.stack.len() - usize::from(arg_count) - 1;
                self.stack[receiver_index] = Value::Obj(instance);
                let init = self.heap.class(r).methods.get(self.heap.init_string);
                if let Some(Value::Obj(init_closure)) = init {
                    self.call_closure(init_closure, arg_count)
                } else if arg_count != 0 {
                    Err(self.runtime_error(format!("Expected 0 arguments but got {arg_count}.")))
                } else {
                    Ok(())
                }
            }
            Kind::Bound(receiver, method) => {
                let receiver_index = self.stack.len() - usize::from(arg_count) - 1;
                self.stack[receiver_index] = receiver;
                self.call_closure(method, arg_count)
            }
            Kind::Other => Err(self.runtime_error("Can only call functions and classes.".to_string())),
        }
    }

    /// `expr.nom(args)` fusionné : champ appelable d'abord, méthode sinon.
    fn invoke(&mut self, name: StrId, arg_count: u8) -> Result<(), VmError> {
        let receiver = self.peek(usize::from(arg_count))?;
        let Some(instance) = self.heap.value_as_instance(receiver) else {
            return Err(self.runtime_error("Only instances have methods.".to_string()));
        };

        if let Some(field) = self.heap.instance(instance).fields.get(name) {
            let receiver_index = self.stack.len() - usize::from(arg_count) - 1;
            self.stack[receiver_index] = field;
            return self.call_value(field, arg_count);
        }

        let class = self.heap.instance(instance).class;
        match self.heap.class(class).methods.get(name) {
            Some(Value::Obj(method)) => self.call_closure(method, arg_count),
            _ => {
                let message = format!("Undefined property '{}'.", self.heap.str_chars(name.obj));
                Err(self.runtime_error(message))
            }
        }
    }

    /// Résout `instance.nom` en méthode : empile une méthode liée au
    /// receveur (créée paresseusement ici).
    fn bind_method(&mut self, class: ObjRef, name: StrId) -> Result<(), VmError> {
        let Some(Value::Obj(method)) = self.heap.class(class).methods.get(name) else {
            let message = format!("Undefined property '{}'.", self.heap.str_chars(name.obj));
            return Err(self.runtime_error(message));
        };
        let receiver = self.peek(0)?;
        let bound = self.alloc(Obj::Bound(BoundMethodObj { receiver, method }));
        self.pop()?;
        self.push(Value::Obj(bound));
        Ok(())
    }

    // ---------- Upvalues ----------

    /// Partage ou crée l'upvalue ouverte du slot : deux fermetures capturant
    /// la même locale voient les écritures l'une de l'autre.
    fn capture_upvalue(&mut self, slot: usize) -> Result<ObjRef, VmError> {
        let mut index = 0;
        while index < self.open_upvalues.len() {
            let upvalue = self.open_upvalues[index];
            match *self.heap.upvalue(upvalue) {
                UpvalueState::Open(s) if s > slot => index += 1,
                UpvalueState::Open(s) if s == slot => return Ok(upvalue),
                _ => break,
            }
        }
        let created = self.alloc(Obj::Upvalue(UpvalueState::Open(slot)));
        self.open_upvalues.insert(index, created);
        Ok(created)
    }

    /// Ferme toutes les upvalues ouvertes de slot ≥ `last` : la valeur est
    /// copiée dans la cellule de l'upvalue, qui devient son propre support.
    fn close_upvalues(&mut self, last: usize) -> Result<(), VmError> {
        while let Some(&head) = self.open_upvalues.first() {
            let UpvalueState::Open(slot) = *self.heap.upvalue(head) else {
                return Err(VmError::InvalidBytecode("upvalue fermée dans la liste ouverte".to_string()));
            };
            if slot < last {
                break;
            }
            let value = *self.stack.get(slot).ok_or(VmError::StackUnderflow)?;
            *self.heap.upvalue_mut(head) = UpvalueState::Closed(value);
            self.open_upvalues.remove(0);
        }
        Ok(())
    }

    // ---------- Opérations binaires ----------

    fn binary_number_op(&mut self, op: fn(f64, f64) -> Value) -> Result<(), VmError> {
        let b = self.peek(0)?;
        let a = self.peek(1)?;
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop()?;
                self.pop()?;
                self.push(op(a, b));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.".to_string())),
        }
    }

    fn concatenate(&mut self, a: ObjRef, b: ObjRef) -> Result<(), VmError> {
        let mut chars =
            String::with_capacity(self.heap.str_chars(a).len() + self.heap.str_chars(b).len());
        chars.push_str(self.heap.str_chars(a));
        chars.push_str(self.heap.str_chars(b));
        // Les opérandes restent en pile pendant l'internement : ils sont
        // encore des racines si la collecte se déclenche.
        self.collect_if_needed();
        let id = self.heap.take_string(chars);
        self.pop()?;
        self.pop()?;
        self.push(Value::Obj(id.obj));
        Ok(())
    }

    // ---------- Dispatch ----------

    fn run(&mut self) -> Result<(), VmError> {
        loop {
            if self.options.trace {
                self.trace_instruction();
            }
            debug_assert!(self.frames.len() <= FRAMES_MAX);

            let byte = self.read_byte()?;
            let op = Op::from_byte(byte)
                .ok_or_else(|| VmError::InvalidBytecode(format!("opcode {byte}")))?;

            match op {
                Op::Constant => {
                    let index = usize::from(self.read_byte()?);
                    let value = self.constant(index)?;
                    self.push(value);
                }
                Op::ConstantLong => {
                    let index = self.read_u24()?;
                    let value = self.constant(index)?;
                    self.push(value);
                }
                Op::Nil => self.push(Value::Nil),
                Op::True => self.push(Value::Bool(true)),
                Op::False => self.push(Value::Bool(false)),
                Op::Pop => {
                    self.pop()?;
                }
                Op::GetLocal => {
                    let slot = usize::from(self.read_byte()?);
                    let base = self.frame_slots()?;
                    let value = *self.stack.get(base + slot).ok_or(VmError::StackUnderflow)?;
                    self.push(value);
                }
                Op::SetLocal => {
                    let slot = usize::from(self.read_byte()?);
                    let base = self.frame_slots()?;
                    let value = self.peek(0)?;
                    *self.stack.get_mut(base + slot).ok_or(VmError::StackUnderflow)? = value;
                }
                Op::GetGlobal => {
                    let index = usize::from(self.read_byte()?);
                    let name = self.constant_string(index)?;
                    match self.heap.globals.get(name) {
                        Some(value) => self.push(value),
                        None => {
                            let message =
                                format!("Undefined variable '{}'.", self.heap.str_chars(name.obj));
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                Op::DefineGlobal => {
                    let index = usize::from(self.read_byte()?);
                    let name = self.constant_string(index)?;
                    let value = self.peek(0)?;
                    self.heap.globals.set(name, value);
                    self.pop()?;
                }
                Op::SetGlobal => {
                    let index = usize::from(self.read_byte()?);
                    let name = self.constant_string(index)?;
                    let value = self.peek(0)?;
                    if self.heap.globals.set(name, value) {
                        // La clé n'existait pas : on annule et on signale.
                        self.heap.globals.delete(name);
                        let message =
                            format!("Undefined variable '{}'.", self.heap.str_chars(name.obj));
                        return Err(self.runtime_error(message));
                    }
                }
                Op::GetUpvalue => {
                    let slot = usize::from(self.read_byte()?);
                    let closure = self.frames.last().ok_or(VmError::NoCallFrame)?.closure;
                    let upvalue = *self
                        .heap
                        .closure(closure)
                        .upvalues
                        .get(slot)
                        .ok_or_else(|| VmError::InvalidBytecode(format!("upvalue {slot}")))?;
                    let value = match *self.heap.upvalue(upvalue) {
                        UpvalueState::Open(s) => {
                            *self.stack.get(s).ok_or(VmError::StackUnderflow)?
                        }
                        UpvalueState::Closed(v) => v,
                    };
                    self.push(value);
                }
                Op::SetUpvalue => {
                    let slot = usize::from(self.read_byte()?);
                    let value = self.peek(0)?;
                    let closure = self.frames.last().ok_or(VmError::NoCallFrame)?.closure;
                    let upvalue = *self
                        .heap
                        .closure(closure)
                        .upvalues
                        .get(slot)
                        .ok_or_else(|| VmError::InvalidBytecode(format!("upvalue {slot}")))?;
                    match *self.heap.upvalue(upvalue) {
                        UpvalueState::Open(s) => {
                            *self.stack.get_mut(s).ok_or(VmError::StackUnderflow)? = value;
                        }
                        UpvalueState::Closed(_) => {
                            *self.heap.upvalue_mut(upvalue) = UpvalueState::Closed(value);
                        }
                    }
                }
                Op::GetProperty => {
                    let index = usize::from(self.read_byte()?);
                    let name = self.constant_string(index)?;
                    let receiver = self.peek(0)?;
                    let Some(instance) = self.heap.value_as_instance(receiver) else {
                        return Err(self.runtime_error("Only instances have properties.".to_string()));
                    };
                    // Un champ masque une méthode du même nom.
                    if let Some(value) = self.heap.instance(instance).fields.get(name) {
                        self.pop()?;
                        self.push(value);
                    } else {
                        let class = self.heap.instance(instance).class;
                        self.bind_method(class, name)?;
                    }
                }
                Op::SetProperty => {
                    let index = usize::from(self.read_byte()?);
                    let name = self.constant_string(index)?;
                    let receiver = self.peek(1)?;
                    let Some(instance) = self.heap.value_as_instance(receiver) else {
                        return Err(self.runtime_error("Only instances have fields.".to_string()));
                    };
                    let value = self.peek(0)?;
                    self.heap.instance_mut(instance).fields.set(name, value);
                    let value = self.pop()?;
                    self.pop()?; // le receveur
                    self.push(value);
                }
                Op::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(a == b));
                }
                Op::Greater => self.binary_number_op(|a, b| Value::Bool(a > b))?,
                Op::Less => self.binary_number_op(|a, b| Value::Bool(a < b))?,
                Op::Add => {
                    let b = self.peek(0)?;
                    let a = self.peek(1)?;
                    let strings = (self.heap.value_as_str(a), self.heap.value_as_str(b));
                    if let (Some(a), Some(b)) = strings {
                        self.concatenate(a, b)?;
                    } else if let (Value::Number(a), Value::Number(b)) = (a, b) {
                        self.pop()?;
                        self.pop()?;
                        self.push(Value::Number(a + b));
                    } else {
                        return Err(self
                            .runtime_error("Operands must be two numbers or two strings.".to_string()));
                    }
                }
                Op::Subtract => self.binary_number_op(|a, b| Value::Number(a - b))?,
                Op::Multiply => self.binary_number_op(|a, b| Value::Number(a * b))?,
                Op::Divide => self.binary_number_op(|a, b| Value::Number(a / b))?,
                Op::Not => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_falsey()));
                }
                Op::Negate => match self.peek(0)? {
                    Value::Number(n) => {
                        self.pop()?;
                        self.push(Value::Number(-n));
                    }
                    _ => return Err(self.runtime_error("Operand must be a number.".to_string())),
                },
                Op::Print => {
                    let value = self.pop()?;
                    let text = format_value(&self.heap, value);
                    self.host.print(&text);
                }
                Op::Jump => {
                    let offset = self.read_u16()?;
                    self.offset_ip(true, offset)?;
                }
                Op::JumpIfFalse => {
                    let offset = self.read_u16()?;
                    // La condition reste en pile : le compilateur émet les
                    // POP explicites des deux côtés.
                    if self.peek(0)?.is_falsey() {
                        self.offset_ip(true, offset)?;
                    }
                }
                Op::Loop => {
                    let offset = self.read_u16()?;
                    self.offset_ip(false, offset)?;
                }
                Op::Call => {
                    let arg_count = self.read_byte()?;
                    let callee = self.peek(usize::from(arg_count))?;
                    self.call_value(callee, arg_count)?;
                }
                Op::Invoke => {
                    let index = usize::from(self.read_byte()?);
                    let name = self.constant_string(index)?;
                    let arg_count = self.read_byte()?;
                    self.invoke(name, arg_count)?;
                }
                Op::Closure => {
                    let index = usize::from(self.read_byte()?);
                    let value = self.constant(index)?;
                    let Value::Obj(function) = value else {
                        return Err(VmError::InvalidBytecode("constante de fermeture".to_string()));
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let closure = self.alloc(Obj::Closure(ClosureObj {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // La fermeture est empilée avant le câblage : elle
                    // racine ses upvalues déjà capturées.
                    self.push(Value::Obj(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte()? == 1;
                        let index = usize::from(self.read_byte()?);
                        let upvalue = if is_local {
                            let base = self.frame_slots()?;
                            self.capture_upvalue(base + index)?
                        } else {
                            let enclosing = self.frames.last().ok_or(VmError::NoCallFrame)?.closure;
                            *self.heap.closure(enclosing).upvalues.get(index).ok_or_else(
                                || VmError::InvalidBytecode(format!("upvalue héritée {index}")),
                            )?
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                Op::CloseUpvalue => {
                    let top = self.stack.len().checked_sub(1).ok_or(VmError::StackUnderflow)?;
                    self.close_upvalues(top)?;
                    self.pop()?;
                }
                Op::Return => {
                    let result = self.pop()?;
                    let frame = self.frames.pop().ok_or(VmError::NoCallFrame)?;
                    self.close_upvalues(frame.slots)?;
                    if self.frames.is_empty() {
                        // Dépile la fermeture <script> et termine.
                        self.pop()?;
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result);
                }
                Op::Class => {
                    let index = usize::from(self.read_byte()?);
                    let name = self.constant_string(index)?;
                    let class = self.alloc(Obj::Class(ClassObj { name, methods: Table::new() }));
                    self.push(Value::Obj(class));
                }
                Op::Method => {
                    let index = usize::from(self.read_byte()?);
                    let name = self.constant_string(index)?;
                    let method = self.peek(0)?;
                    let class_value = self.peek(1)?;
                    let Value::Obj(class) = class_value else {
                        return Err(VmError::InvalidBytecode("classe attendue sous la méthode".to_string()));
                    };
                    self.heap.class_mut(class).methods.set(name, method);
                    self.pop()?;
                }
            }
        }
    }

    // ---------- Trace ----------

    fn trace_instruction(&mut self) {
        let Some(frame) = self.frames.last() else {
            return;
        };
        let mut dump = String::from("          ");
        for &value in &self.stack {
            dump.push_str("[ ");
            dump.push_str(&format_value(&self.heap, value));
            dump.push_str(" ]");
        }
        let function = self.heap.closure(frame.closure).function;
        let chunk = &self.heap.function(function).chunk;
        let mut text = String::new();
        disassemble_instruction(&self.heap, chunk, frame.ip, &mut text);
        log::trace!("{dump}\n{text}");
    }

    // ---------- Natives ----------

    /// Déclare une native globale. Le nom puis l'objet natif passent par la
    /// pile pendant l'installation : la table des globales peut croître et
    /// déclencher une collecte.
    pub(crate) fn define_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        self.collect_if_needed();
        let name_id = self.heap.copy_string(name);
        self.push(Value::Obj(name_id.obj));
        let native = self.alloc(Obj::Native(NativeObj { arity, function }));
        self.push(Value::Obj(native));
        self.heap.globals.set(name_id, Value::Obj(native));
        let _ = self.stack.pop();
        let _ = self.stack.pop();
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_keeps_the_open_list_sorted_and_shared() {
        let mut vm = Vm::new();
        vm.stack.push(Value::Nil);
        vm.stack.push(Value::Nil);
        vm.stack.push(Value::Nil);

        vm.capture_upvalue(1).unwrap();
        let two = vm.capture_upvalue(2).unwrap();
        vm.capture_upvalue(0).unwrap();
        assert_eq!(vm.open_upvalue_slots(), vec![2, 1, 0]);

        // Recapturer un slot déjà ouvert partage l'upvalue existante.
        assert_eq!(vm.capture_upvalue(2).unwrap(), two);
        assert_eq!(vm.open_upvalue_slots(), vec![2, 1, 0]);
    }

    #[test]
    fn closing_migrates_the_stack_value_into_the_cell() {
        let mut vm = Vm::new();
        vm.stack.push(Value::Number(1.0));
        vm.stack.push(Value::Number(2.0));
        let low = vm.capture_upvalue(0).unwrap();
        let high = vm.capture_upvalue(1).unwrap();

        vm.close_upvalues(1).unwrap();
        assert_eq!(vm.open_upvalue_slots(), vec![0]);
        assert!(matches!(*vm.heap.upvalue(high), UpvalueState::Closed(Value::Number(n)) if n == 2.0));
        assert!(matches!(*vm.heap.upvalue(low), UpvalueState::Open(0)));
    }
}
