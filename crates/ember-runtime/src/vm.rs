//! Stack-based virtual machine
//!
//! Executes compiled chunks with a value stack and call frames. The VM owns
//! the heap, the globals table, and the open-upvalue list, and it is the
//! collector's driver: every runtime allocation funnels through [`Vm::alloc`]
//! or [`Vm::intern`], which run a collection first when the heap asks for
//! one, with the stack, frames, globals, and open upvalues as roots.

use std::fmt;
use std::io::{self, Write};

use thiserror::Error;

use crate::bytecode::OpCode;
use crate::compiler::compile;
use crate::diagnostic::Diagnostic;
use crate::memory::Heap;
use crate::object::{
    BoundMethod, Class, Closure, Instance, NativeFn, Obj, ObjRef, Upvalue,
};
use crate::stdlib;
use crate::table::Table;
use crate::value::Value;

/// Maximum call depth
pub const FRAMES_MAX: usize = 64;
/// Value stack capacity: a full window for every possible frame
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Why interpretation stopped
#[derive(Debug, Error)]
pub enum InterpretError {
    /// The source did not compile; one diagnostic per reported error
    #[error("{}", .0.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("\n"))]
    Compile(Vec<Diagnostic>),
    /// Execution failed
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// One frame of a runtime error trace, innermost first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Line of the instruction being executed in this frame
    pub line: u32,
    /// `name()` for functions, `script` for top-level code
    pub function: String,
}

/// A runtime failure: the message plus the call stack at the fault
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for frame in &self.trace {
            writeln!(f, "[line {}] in {}", frame.line, frame.function)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// An activation record: the running closure, its saved instruction
/// pointer, and the base of its stack window.
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: ObjRef,
    /// The closure's function, cached to keep dispatch to one heap hop
    function: ObjRef,
    ip: usize,
    slots: usize,
}

/// Virtual machine state
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Upvalues still pointing into the stack, sorted by strictly
    /// descending slot index
    open_upvalues: Vec<ObjRef>,
    heap: Heap,
    /// Canonical `init`, looked up on every class call
    init_string: ObjRef,
    /// Destination for `print` (defaults to stdout)
    out: Box<dyn Write>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Create a VM printing to stdout
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Create a VM that writes `print` output to `out`
    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Self {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            heap,
            init_string,
            out,
        };
        stdlib::install(&mut vm);
        vm
    }

    /// Compile and run `source`. Globals persist across calls, so a REPL can
    /// feed lines to one VM.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compile(source, &mut self.heap).map_err(InterpretError::Compile)?;
        let result = self.run_function(function);
        if result.is_err() {
            self.reset_stack();
        }
        result.map_err(InterpretError::Runtime)
    }

    /// Register a native function under `name`
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let name_ref = self.intern(name);
        // Both objects stay rooted on the stack until the table owns them
        self.push(Value::Obj(name_ref));
        let native = self.alloc(Obj::Native(crate::object::Native { function }));
        self.push(Value::Obj(native));
        let hash = self.heap.string_hash(name_ref);
        self.globals.set(name_ref, hash, Value::Obj(native));
        self.pop();
        self.pop();
    }

    /// Force a collection before every allocation point (test hook)
    pub fn set_gc_stress(&mut self, stress: bool) {
        self.heap.set_stress(stress);
    }

    /// The VM's heap, for tooling and diagnostics
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    // === Execution ===

    fn run_function(&mut self, function: ObjRef) -> Result<(), RuntimeError> {
        // Root the function while the closure allocates
        self.push(Value::Obj(function));
        let closure = self.alloc(Obj::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0)?;
        self.run()
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.stack.len() >= STACK_MAX {
                return Err(self.error("Stack overflow."));
            }

            #[cfg(feature = "trace-execution")]
            {
                let mut line = String::from("          ");
                for &value in &self.stack {
                    line.push_str(&format!("[ {} ]", value.display(&self.heap)));
                }
                eprintln!("{}", line);
                let frame = self.frame();
                eprintln!(
                    "{}",
                    crate::bytecode::disassemble_instruction(
                        &self.heap.function(frame.function).chunk,
                        frame.ip,
                        &self.heap,
                    )
                );
            }

            let op = self.read_op()?;
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().slots + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    // Assignment is an expression; the value stays put
                    let value = self.peek(0);
                    self.stack[base + slot] = value;
                }

                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let message =
                                format!("Undefined variable '{}'.", self.heap.string(name));
                            return Err(self.error(message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        // Assignment must not create globals; undo and fail
                        self.globals.delete(name, hash);
                        let message = format!("Undefined variable '{}'.", self.heap.string(name));
                        return Err(self.error(message));
                    }
                }

                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                    let value = match *self.heap.upvalue(upvalue) {
                        Upvalue::Open(slot) => self.stack[slot],
                        Upvalue::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                    let value = self.peek(0);
                    let current = *self.heap.upvalue(upvalue);
                    match current {
                        Upvalue::Open(slot) => self.stack[slot] = value,
                        Upvalue::Closed(_) => {
                            *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value)
                        }
                    }
                }

                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(0);
                    let instance = match receiver.as_obj().filter(|&r| self.heap.is_instance(r)) {
                        Some(r) => r,
                        None => return Err(self.error("Only instances have properties.")),
                    };
                    let hash = self.heap.string_hash(name);
                    if let Some(value) = self.heap.instance(instance).fields.get(name, hash) {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = self.heap.instance(instance).class;
                        match self.heap.class(class).methods.get(name, hash) {
                            Some(Value::Obj(method)) => {
                                let bound =
                                    self.alloc(Obj::BoundMethod(BoundMethod { receiver, method }));
                                self.pop();
                                self.push(Value::Obj(bound));
                            }
                            _ => {
                                let message = format!(
                                    "Undefined property '{}'.",
                                    self.heap.string(name)
                                );
                                return Err(self.error(message));
                            }
                        }
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let target = self.peek(1);
                    let instance = match target.as_obj().filter(|&r| self.heap.is_instance(r)) {
                        Some(r) => r,
                        None => return Err(self.error("Only instances have fields.")),
                    };
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0);
                    self.heap.instance_mut(instance).fields.set(name, hash, value);
                    // Leave the assigned value as the expression result
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_number_op(op)?,
                OpCode::Less => self.binary_number_op(op)?,
                OpCode::Add => match (self.peek(1), self.peek(0)) {
                    (Value::Number(a), Value::Number(b)) => {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b));
                    }
                    (Value::Obj(a), Value::Obj(b))
                        if matches!(self.heap.get(a), Obj::String(_))
                            && matches!(self.heap.get(b), Obj::String(_)) =>
                    {
                        let mut joined =
                            String::with_capacity(self.heap.string(a).len() + self.heap.string(b).len());
                        joined.push_str(self.heap.string(a));
                        joined.push_str(self.heap.string(b));
                        // Operands stay rooted on the stack across the intern
                        let result = self.intern(&joined);
                        self.pop();
                        self.pop();
                        self.push(Value::Obj(result));
                    }
                    _ => return Err(self.error("Operands must be two numbers or two strings.")),
                },
                OpCode::Subtract => self.binary_number_op(op)?,
                OpCode::Multiply => self.binary_number_op(op)?,
                OpCode::Divide => self.binary_number_op(op)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => return Err(self.error("Operand must be a number.")),
                },

                OpCode::Print => {
                    let value = self.pop();
                    let text = value.display(&self.heap);
                    if writeln!(self.out, "{}", text).is_err() {
                        return Err(self.error("Could not write output."));
                    }
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }

                OpCode::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(r) => r,
                        _ => unreachable!("closure constant is not a function"),
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let closure = self.alloc(Obj::Closure(Closure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // On the stack before capture so a mid-capture collection
                    // sees the partially built closure
                    self.push(Value::Obj(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame().slots + index;
                            self.capture_upvalue(slot)
                        } else {
                            self.heap.closure(self.frame().closure).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("frame underflow");
                    self.close_upvalues(frame.slots);
                    if self.frames.is_empty() {
                        // Unwind the script closure itself
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result);
                }

                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.alloc(Obj::Class(Class {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let class = match self.peek(1) {
                        Value::Obj(r) => r,
                        _ => unreachable!("method binding without a class on the stack"),
                    };
                    let hash = self.heap.string_hash(name);
                    self.heap.class_mut(class).methods.set(name, hash, method);
                    self.pop();
                }
            }
        }
    }

    // === Calls ===

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        enum Target {
            Closure,
            Native(NativeFn),
            Class,
            Bound(Value, ObjRef),
            NotCallable,
        }

        let target = match callee.as_obj() {
            Some(r) => match self.heap.get(r) {
                Obj::Closure(_) => Target::Closure,
                Obj::Native(native) => Target::Native(native.function),
                Obj::Class(_) => Target::Class,
                Obj::BoundMethod(bound) => Target::Bound(bound.receiver, bound.method),
                _ => Target::NotCallable,
            },
            None => Target::NotCallable,
        };

        match target {
            Target::Closure => {
                let closure = callee.as_obj().expect("closure handle");
                self.call_closure(closure, arg_count)
            }
            Target::Native(function) => {
                let top = self.stack.len();
                let result = function(&self.stack[top - arg_count..top]);
                self.stack.truncate(top - arg_count - 1);
                self.push(result);
                Ok(())
            }
            Target::Class => {
                let class = callee.as_obj().expect("class handle");
                self.call_class(class, arg_count)
            }
            Target::Bound(receiver, method) => {
                // The receiver takes the callee slot, so the method's `this`
                // (slot 0) resolves to it
                let top = self.stack.len();
                self.stack[top - arg_count - 1] = receiver;
                self.call_closure(method, arg_count)
            }
            Target::NotCallable => Err(self.error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            let message = format!("Expected {} arguments but got {}.", arity, arg_count);
            return Err(self.error(message));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn call_class(&mut self, class: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let instance = self.alloc(Obj::Instance(Instance {
            class,
            fields: Table::new(),
        }));
        let top = self.stack.len();
        self.stack[top - arg_count - 1] = Value::Obj(instance);

        let hash = self.heap.string_hash(self.init_string);
        match self.heap.class(class).methods.get(self.init_string, hash) {
            Some(Value::Obj(init)) => self.call_closure(init, arg_count),
            _ if arg_count != 0 => {
                let message = format!("Expected 0 arguments but got {}.", arg_count);
                Err(self.error(message))
            }
            _ => Ok(()),
        }
    }

    /// Fused property call: fields shadow methods, methods dispatch straight
    /// through the class table without a bound-method allocation.
    fn invoke(&mut self, name: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count);
        let instance = match receiver.as_obj().filter(|&r| self.heap.is_instance(r)) {
            Some(r) => r,
            None => return Err(self.error("Only instances have methods.")),
        };

        let hash = self.heap.string_hash(name);
        if let Some(field) = self.heap.instance(instance).fields.get(name, hash) {
            let top = self.stack.len();
            self.stack[top - arg_count - 1] = field;
            return self.call_value(field, arg_count);
        }

        let class = self.heap.instance(instance).class;
        match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => self.call_closure(method, arg_count),
            _ => {
                let message = format!("Undefined property '{}'.", self.heap.string(name));
                Err(self.error(message))
            }
        }
    }

    // === Upvalues ===

    /// Reuse the open upvalue for `slot` or insert a new one, keeping the
    /// list sorted by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = 0;
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            match *self.heap.upvalue(upvalue) {
                Upvalue::Open(existing) if existing > slot => insert_at = i + 1,
                Upvalue::Open(existing) if existing == slot => return upvalue,
                _ => break,
            }
        }
        let created = self.alloc(Obj::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Close every open upvalue at or above `from`: copy the stack value
    /// into the cell and unlink it.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = match *self.heap.upvalue(upvalue) {
                Upvalue::Open(slot) => slot,
                Upvalue::Closed(_) => break,
            };
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // === Allocation ===

    /// Allocate through the collector: collect first when the heap is due
    fn alloc(&mut self, obj: Obj) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.allocate(obj)
    }

    /// Intern through the collector
    fn intern(&mut self, chars: &str) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(chars)
    }

    fn collect_garbage(&mut self) {
        let Vm {
            heap,
            stack,
            frames,
            open_upvalues,
            globals,
            init_string,
            ..
        } = self;

        heap.begin_collection();
        for &value in stack.iter() {
            heap.mark_value(value);
        }
        for frame in frames.iter() {
            heap.mark_object(frame.closure);
        }
        for &upvalue in open_upvalues.iter() {
            heap.mark_object(upvalue);
        }
        for (key, value) in globals.entries() {
            heap.mark_object(key);
            heap.mark_value(value);
        }
        heap.mark_object(*init_string);
        heap.finish_collection();
    }

    // === Stack and decoding ===

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let (function, ip) = (frame.function, frame.ip);
        frame.ip += 1;
        self.heap.function(function).chunk.code[ip]
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        ((high as u16) << 8) | low as u16
    }

    fn read_op(&mut self) -> Result<OpCode, RuntimeError> {
        let byte = self.read_byte();
        OpCode::try_from(byte).map_err(|bad| self.error(format!("Unknown opcode {}.", bad)))
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let function = self.frame().function;
        self.heap.function(function).chunk.constants[index]
    }

    fn read_string(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(r) => r,
            _ => unreachable!("name constant is not a string"),
        }
    }

    fn binary_number_op(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let (a, b) = match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => (a, b),
            _ => return Err(self.error("Operands must be numbers.")),
        };
        self.pop();
        self.pop();
        let result = match op {
            OpCode::Greater => Value::Bool(a > b),
            OpCode::Less => Value::Bool(a < b),
            OpCode::Subtract => Value::Number(a - b),
            OpCode::Multiply => Value::Number(a * b),
            OpCode::Divide => Value::Number(a / b),
            _ => unreachable!("not a numeric binary opcode"),
        };
        self.push(result);
        Ok(())
    }

    /// Build a runtime error with the current call-stack trace
    fn error(&self, message: impl Into<String>) -> RuntimeError {
        let trace = self
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let function = self.heap.function(frame.function);
                let line = function.chunk.line_for(frame.ip.saturating_sub(1));
                let name = match function.name {
                    Some(name) => format!("{}()", self.heap.string(name)),
                    None => "script".to_string(),
                };
                TraceFrame {
                    line,
                    function: name,
                }
            })
            .collect();
        RuntimeError {
            message: message.into(),
            trace,
        }
    }
}
