//! Stack-based virtual machine.
//!
//! One flat dispatch loop over [`Opcode`] bytes, a value stack, and a stack of
//! call frames. Frames never recurse into Rust's own call stack for an Eva
//! `CALL`/`NEW`/constructor invocation — pushing a `Frame` and letting the
//! loop pick its code back up drives execution for both ordinary calls and
//! constructor invocations.

use crate::bytecode::{CompareOp, Opcode};
use crate::code::CodeObject;
use crate::error::EvaError;
use crate::global::Global;
use crate::value::{ClassObject, EvaValue, FunctionObject, InstanceObject};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Fixed capacity of the value stack.
pub const STACK_LIMIT: usize = 512;

/// Bounds recursive Eva calls; without *some* cap a runaway recursive
/// program would grow `frames` without bound.
pub const CALL_STACK_LIMIT: usize = 256;

/// What a frame does with its return value: an ordinary call pushes it, a
/// constructor invocation discards it and pushes the instance being built
/// instead — `new`'s result is the constructed instance, not the
/// constructor's own return value.
#[derive(Debug)]
enum FrameKind {
    Plain,
    Constructor(EvaValue),
}

struct Frame {
    code: Rc<CodeObject>,
    ip: usize,
    /// Stack index where this frame's arguments/locals begin.
    bp: usize,
    /// This frame's cell slots: the leading `code.free_var_count` are
    /// inherited from the enclosing function at `MAKE_FUNCTION` time; any
    /// further entries are this frame's own promoted params/locals.
    cells: Vec<Rc<RefCell<EvaValue>>>,
    kind: FrameKind,
}

/// The Eva virtual machine: a value stack, a call-frame stack, and a
/// reference to the [`Global`] table it shares with whatever [`crate::compiler::Compiler`]
/// produced the code it's running.
pub struct Vm {
    global: Rc<RefCell<Global>>,
    stack: Vec<EvaValue>,
    frames: Vec<Frame>,
}

impl Vm {
    pub fn new(global: Rc<RefCell<Global>>) -> Self {
        Vm {
            global,
            stack: Vec::new(),
            frames: Vec::new(),
        }
    }

    /// Run `code` to completion (through its own `HALT`) and return its
    /// result. The value stack is **not** reset between calls, so a REPL can
    /// call `exec` repeatedly against freshly compiled top-level code while
    /// reusing one `Vm`/`Global` pair — each top-level program leaves the
    /// stack exactly as it found it (single result popped by `HALT`).
    pub fn exec(&mut self, code: Rc<CodeObject>) -> Result<EvaValue, EvaError> {
        let bp = self.stack.len();
        let cells = own_cell_placeholders(&code, Vec::new());
        self.frames.push(Frame {
            code,
            ip: 0,
            bp,
            cells,
            kind: FrameKind::Plain,
        });
        let base_frame_depth = self.frames.len() - 1;
        let result = self.run();
        // On error, unwind any frames this exec() pushed so the Vm stays
        // reusable for the next REPL line.
        if result.is_err() {
            self.frames.truncate(base_frame_depth);
            self.stack.truncate(bp);
        }
        result
    }

    fn push(&mut self, value: EvaValue) -> Result<(), EvaError> {
        if self.stack.len() >= STACK_LIMIT {
            return Err(EvaError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<EvaValue, EvaError> {
        self.stack.pop().ok_or(EvaError::StackUnderflow)
    }

    fn peek(&self) -> Result<&EvaValue, EvaError> {
        self.stack.last().ok_or(EvaError::StackUnderflow)
    }

    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("non-empty frame stack");
        let byte = frame.code.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_u8();
        let lo = self.read_u8();
        ((hi as u16) << 8) | (lo as u16)
    }

    fn const_at(&self, idx: u8) -> Result<EvaValue, EvaError> {
        let frame = self.frames.last().expect("non-empty frame stack");
        frame
            .code
            .constants
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| EvaError::InvalidIndex(format!("constant #{idx}")))
    }

    fn run(&mut self) -> Result<EvaValue, EvaError> {
        loop {
            let byte = self.read_u8();
            let opcode = Opcode::try_from(byte).map_err(EvaError::UnknownOpcode)?;
            match opcode {
                Opcode::Halt => return self.pop(),
                Opcode::Const => {
                    let idx = self.read_u8();
                    let v = self.const_at(idx)?;
                    self.push(v)?;
                }
                Opcode::Pop => {
                    self.pop()?;
                }
                Opcode::Add => self.binary_add()?,
                Opcode::Sub => self.binary_arith(|a, b| a - b)?,
                Opcode::Mul => self.binary_arith(|a, b| a * b)?,
                Opcode::Div => self.binary_arith(|a, b| a / b)?,
                Opcode::Compare => {
                    let op_byte = self.read_u8();
                    let op = CompareOp::try_from(op_byte).map_err(EvaError::UnknownOpcode)?;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = compare_values(&a, &b, op)?;
                    self.push(EvaValue::Boolean(result))?;
                }
                Opcode::Jmp => {
                    let addr = self.read_u16();
                    self.frames.last_mut().expect("non-empty frame stack").ip = addr as usize;
                }
                Opcode::JmpIfFalse => {
                    let addr = self.read_u16();
                    let cond = self.pop()?.as_boolean()?;
                    if !cond {
                        self.frames.last_mut().expect("non-empty frame stack").ip = addr as usize;
                    }
                }
                Opcode::GetGlobal => {
                    let idx = self.read_u8();
                    let v = self
                        .global
                        .borrow()
                        .get(idx as usize)
                        .ok_or_else(|| EvaError::InvalidIndex(format!("global #{idx}")))?;
                    self.push(v)?;
                }
                Opcode::SetGlobal => {
                    let idx = self.read_u8();
                    let v = self.peek()?.clone();
                    if !self.global.borrow_mut().set(idx as usize, v) {
                        return Err(EvaError::InvalidIndex(format!("global #{idx}")));
                    }
                }
                Opcode::GetLocal => {
                    let idx = self.read_u8();
                    let bp = self.frames.last().expect("non-empty frame stack").bp;
                    let v = self
                        .stack
                        .get(bp + idx as usize)
                        .cloned()
                        .ok_or_else(|| EvaError::InvalidIndex(format!("local #{idx}")))?;
                    self.push(v)?;
                }
                Opcode::SetLocal => {
                    let idx = self.read_u8();
                    let bp = self.frames.last().expect("non-empty frame stack").bp;
                    let v = self.peek()?.clone();
                    let slot = self
                        .stack
                        .get_mut(bp + idx as usize)
                        .ok_or_else(|| EvaError::InvalidIndex(format!("local #{idx}")))?;
                    *slot = v;
                }
                Opcode::GetCell => {
                    let idx = self.read_u8();
                    let cell = self.cell_at(idx)?;
                    let v = cell.borrow().clone();
                    self.push(v)?;
                }
                Opcode::SetCell => {
                    let idx = self.read_u8();
                    let v = self.peek()?.clone();
                    let cell = self.cell_at(idx)?;
                    *cell.borrow_mut() = v;
                }
                Opcode::MakeCell => {
                    let idx = self.read_u8();
                    let v = self.peek()?.clone();
                    let cell = self.cell_at(idx)?;
                    // Write *through* the existing handle rather than
                    // replacing it: a self-recursive function already
                    // captured this cell via GET_FREE before this name's
                    // value existed (`compiler::Compiler::compile_closure_value`
                    // emits GET_FREE before the enclosing MAKE_CELL runs), so
                    // the handle must stay the same object for that capture
                    // to observe the update.
                    *cell.borrow_mut() = v;
                }
                Opcode::GetFree => {
                    let idx = self.read_u8();
                    let cell = self.cell_at(idx)?;
                    self.push(EvaValue::Cell(cell))?;
                }
                Opcode::ScopeExit => {
                    let n = self.read_u8();
                    let result = self.pop()?;
                    for _ in 0..n {
                        self.pop()?;
                    }
                    self.push(result)?;
                }
                Opcode::MakeFunction => self.make_function()?,
                Opcode::Call => {
                    let argc = self.read_u8();
                    self.call(argc as usize)?;
                }
                Opcode::Return => self.do_return()?,
                Opcode::New => {
                    let argc = self.read_u8();
                    self.construct(argc as usize)?;
                }
                Opcode::GetProp => {
                    let idx = self.read_u8();
                    let name = self.const_at(idx)?.as_string()?;
                    let obj = self.pop()?;
                    let v = self.get_prop(&obj, &name)?;
                    self.push(v)?;
                }
                Opcode::SetProp => {
                    let idx = self.read_u8();
                    let name = self.const_at(idx)?.as_string()?;
                    let value = self.pop()?;
                    let obj = self.pop()?;
                    self.set_prop(&obj, &name, value.clone())?;
                    self.push(value)?;
                }
                Opcode::MakeClass => {
                    let count = self.read_u8();
                    self.make_class(count as usize)?;
                }
            }
        }
    }

    /// `frame.cells` holds the unit's inherited + own-promoted cells, shared
    /// with `code.cell_names` by position. `GET_CELL`/`SET_CELL`/`MAKE_CELL`
    /// (read/write/box from *within* the owning unit) and `GET_FREE` (hand a
    /// cell handle out to a nested closure being constructed) all index into
    /// the same array; only their read/write shape differs.
    fn cell_at(&self, idx: u8) -> Result<Rc<RefCell<EvaValue>>, EvaError> {
        let frame = self.frames.last().expect("non-empty frame stack");
        frame
            .cells
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| EvaError::InvalidIndex(format!("cell #{idx}")))
    }

    fn binary_add(&mut self) -> Result<(), EvaError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match (&a, &b) {
            (EvaValue::Number(x), EvaValue::Number(y)) => EvaValue::Number(x + y),
            (EvaValue::String(x), EvaValue::String(y)) => EvaValue::string(format!("{x}{y}")),
            _ => {
                return Err(EvaError::Type(format!(
                    "cannot add {} and {}",
                    a.type_name(),
                    b.type_name()
                )))
            }
        };
        self.push(result)
    }

    fn binary_arith(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), EvaError> {
        let b = self.pop()?.as_number()?;
        let a = self.pop()?.as_number()?;
        self.push(EvaValue::Number(op(a, b)))
    }

    fn make_function(&mut self) -> Result<(), EvaError> {
        let code = self.pop()?.as_code()?;
        let n = code.free_var_count;
        let mut cells = Vec::with_capacity(n);
        for _ in 0..n {
            cells.push(self.pop()?.as_cell()?);
        }
        cells.reverse();
        self.push(EvaValue::Function(Rc::new(FunctionObject { code, cells })))
    }

    fn call(&mut self, argc: usize) -> Result<(), EvaError> {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        let callee = self.pop()?;
        match callee {
            EvaValue::Native(native) => {
                if args.len() != native.arity {
                    return Err(EvaError::Arity {
                        name: native.name.clone(),
                        expected: native.arity,
                        got: args.len(),
                    });
                }
                let result = (native.func)(&args)?;
                self.push(result)
            }
            EvaValue::Function(func) => {
                if args.len() != func.code.arity {
                    return Err(EvaError::Arity {
                        name: func.code.name.clone(),
                        expected: func.code.arity,
                        got: args.len(),
                    });
                }
                self.push_call_frame(func.code.clone(), func.cells.clone(), args, FrameKind::Plain)
            }
            other => Err(EvaError::NotCallable(other.type_name().to_string())),
        }
    }

    fn push_call_frame(
        &mut self,
        code: Rc<CodeObject>,
        inherited_cells: Vec<Rc<RefCell<EvaValue>>>,
        args: Vec<EvaValue>,
        kind: FrameKind,
    ) -> Result<(), EvaError> {
        if self.frames.len() >= CALL_STACK_LIMIT {
            return Err(EvaError::CallStackOverflow);
        }
        let bp = self.stack.len();
        for a in args {
            self.push(a)?;
        }
        let cells = own_cell_placeholders(&code, inherited_cells);
        self.frames.push(Frame { code, ip: 0, bp, cells, kind });
        Ok(())
    }

    fn do_return(&mut self) -> Result<(), EvaError> {
        let result = self.pop()?;
        let frame = self.frames.pop().expect("RETURN only executes inside a called frame");
        self.stack.truncate(frame.bp);
        match frame.kind {
            FrameKind::Plain => self.push(result),
            FrameKind::Constructor(instance) => self.push(instance),
        }
    }

    fn construct(&mut self, argc: usize) -> Result<(), EvaError> {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        let class = self.pop()?.as_class()?;

        let instance = Rc::new(RefCell::new(InstanceObject {
            class: class.clone(),
            properties: class.default_properties.clone(),
        }));
        let instance_value = EvaValue::Instance(instance);

        match class.find_method("constructor") {
            Some(ctor) => {
                if ctor.code.arity != args.len() + 1 {
                    return Err(EvaError::Arity {
                        name: "constructor".to_string(),
                        expected: ctor.code.arity,
                        got: args.len() + 1,
                    });
                }
                let mut call_args = Vec::with_capacity(args.len() + 1);
                call_args.push(instance_value.clone());
                call_args.extend(args);
                self.push_call_frame(
                    ctor.code.clone(),
                    ctor.cells.clone(),
                    call_args,
                    FrameKind::Constructor(instance_value),
                )
            }
            None => {
                if !args.is_empty() {
                    return Err(EvaError::Arity {
                        name: class.name.clone(),
                        expected: 0,
                        got: args.len(),
                    });
                }
                self.push(instance_value)
            }
        }
    }

    /// `obj` is either an `Instance` (own properties first, then its class's
    /// method table) or a `Class` reached via `(prop (super ClassName) name)`
    /// (looked up starting at `ClassName`'s *superclass*, since that's the
    /// only legitimate use of a bare class operand here).
    fn get_prop(&self, obj: &EvaValue, name: &str) -> Result<EvaValue, EvaError> {
        match obj {
            EvaValue::Instance(inst) => {
                let inst = inst.borrow();
                if let Some(v) = inst.properties.get(name) {
                    return Ok(v.clone());
                }
                inst.class
                    .find_method(name)
                    .map(EvaValue::Function)
                    .ok_or_else(|| EvaError::Resolve(format!("{name} on instance of {}", inst.class.name)))
            }
            EvaValue::Class(class) => class
                .superclass
                .as_ref()
                .and_then(|s| s.find_method(name))
                .map(EvaValue::Function)
                .ok_or_else(|| EvaError::Resolve(format!("{name} on superclass of {}", class.name))),
            other => Err(EvaError::Type(format!("cannot read property on {}", other.type_name()))),
        }
    }

    fn set_prop(&self, obj: &EvaValue, name: &str, value: EvaValue) -> Result<(), EvaError> {
        match obj {
            EvaValue::Instance(inst) => {
                inst.borrow_mut().properties.insert(name.to_string(), value);
                Ok(())
            }
            other => Err(EvaError::Type(format!("cannot set property on {}", other.type_name()))),
        }
    }

    fn make_class(&mut self, count: usize) -> Result<(), EvaError> {
        let mut methods = HashMap::with_capacity(count);
        for _ in 0..count {
            let func = match self.pop()? {
                EvaValue::Function(f) => f,
                other => return Err(EvaError::Type(format!("expected function for method, got {}", other.type_name()))),
            };
            let name = self.pop()?.as_string()?;
            methods.insert(name.to_string(), func);
        }
        let superclass = match self.pop()? {
            EvaValue::Boolean(false) => None,
            EvaValue::Class(c) => Some(c),
            other => return Err(EvaError::Type(format!("expected class or false for superclass, got {}", other.type_name()))),
        };
        let name = self.pop()?.as_string()?.to_string();
        let default_properties = superclass.as_ref().map(|s| s.default_properties.clone()).unwrap_or_default();
        let class = ClassObject {
            name,
            superclass,
            methods,
            default_properties,
        };
        self.push(EvaValue::Class(Rc::new(class)))
    }
}

/// Every frame's `cells` must be fully sized to `code.cell_names.len()`
/// *before* a single instruction runs: the leading `free_var_count` slots
/// are the real handles a closure captured at `MAKE_FUNCTION` time; the rest
/// are this frame's own params/locals a nested closure captures, which need
/// a real `Rc` to exist (and potentially be read via `GET_FREE`, for
/// self-recursive `def`s) before `MAKE_CELL` ever runs for them.
fn own_cell_placeholders(code: &CodeObject, mut cells: Vec<Rc<RefCell<EvaValue>>>) -> Vec<Rc<RefCell<EvaValue>>> {
    while cells.len() < code.cell_names.len() {
        cells.push(Rc::new(RefCell::new(EvaValue::Boolean(false))));
    }
    cells
}

fn compare_values(a: &EvaValue, b: &EvaValue, op: CompareOp) -> Result<bool, EvaError> {
    use std::cmp::Ordering;
    let ordering: Ordering = match (a, b) {
        (EvaValue::Number(x), EvaValue::Number(y)) => {
            x.partial_cmp(y).ok_or_else(|| EvaError::Type("cannot compare NaN".into()))?
        }
        (EvaValue::String(x), EvaValue::String(y)) => x.cmp(y),
        _ => {
            return Err(EvaError::Type(format!(
                "cannot compare {} and {}",
                a.type_name(),
                b.type_name()
            )))
        }
    };
    Ok(match op {
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Eq => ordering.is_eq(),
        CompareOp::Ge => ordering.is_ge(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Ne => ordering.is_ne(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::reader::read_program;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn run(src: &str) -> EvaValue {
        let global = Rc::new(RefCell::new(Global::new()));
        let program = read_program(src).unwrap();
        let code = Compiler::compile(&program, global.clone()).unwrap();
        Vm::new(global).exec(Rc::new(code)).unwrap()
    }

    #[rstest]
    #[case("42", 42.0)]
    #[case("(+ 2 3)", 5.0)]
    #[case("(* (+ 1 2) 3)", 9.0)]
    #[case("(/ 10 4)", 2.5)]
    #[case("(begin (var x 5) (var y 10) (+ x y))", 15.0)]
    #[case("(if (> 3 2) 1 0)", 1.0)]
    #[case("(if (< 3 2) 1 0)", 0.0)]
    fn evaluates_arithmetic_and_control_flow(#[case] src: &str, #[case] expected: f64) {
        assert_eq!(run(src).as_number().unwrap(), expected);
    }

    #[test]
    fn if_without_else_yields_false() {
        assert_eq!(run("(if (< 1 0) 99)").as_boolean().unwrap(), false);
    }

    #[test]
    fn while_loop_accumulates() {
        let v = run("(begin (var x 0) (var i 0) (while (< i 5) (begin (set x (+ x i)) (set i (+ i 1)))) x)");
        assert_eq!(v.as_number().unwrap(), 10.0);
    }

    #[test]
    fn for_loop_counts_down() {
        let v = run("(begin (var acc 0) (for (var i 0) (< i 4) (set i (+ i 1)) (set acc (+ acc 1))) acc)");
        assert_eq!(v.as_number().unwrap(), 4.0);
    }

    #[test]
    fn lambda_applies_to_arguments() {
        assert_eq!(run("((lambda (x y) (+ x y)) 3 4)").as_number().unwrap(), 7.0);
    }

    #[test]
    fn closure_captures_outer_variable() {
        let v = run("(begin (def make (n) (lambda () (set n (+ n 1)) n)) (var inc (make 10)) (inc) (inc))");
        assert_eq!(v.as_number().unwrap(), 12.0);
    }

    #[test]
    fn recursive_function_computes_factorial() {
        let src = "(begin (def fact (n) (if (== n 0) 1 (* n (fact (- n 1))))) (fact 5))";
        assert_eq!(run(src).as_number().unwrap(), 120.0);
    }

    #[test]
    fn class_instance_stores_and_reads_properties() {
        let src = "(begin \
                     (class Point null \
                       (def constructor (self x y) \
                         (begin (set (prop self x) x) (set (prop self y) y))) \
                       (def getX (self) (prop self x))) \
                     (var p (new Point 1 2)) \
                     ((prop p getX) p))";
        assert_eq!(run(src).as_number().unwrap(), 1.0);
    }

    #[test]
    fn subclass_method_calls_super_implementation() {
        let src = "(begin \
                     (class Point null \
                       (def constructor (self x y) \
                         (begin (set (prop self x) x) (set (prop self y) y))) \
                       (def calc (self) (+ (prop self x) (prop self y)))) \
                     (class Point3D Point \
                       (def constructor (self x y z) \
                         (begin ((prop (super Point3D) constructor) self x y) \
                                (set (prop self z) z))) \
                       (def calc (self) (+ ((prop (super Point3D) calc) self) (prop self z)))) \
                     (var p (new Point3D 1 2 3)) \
                     ((prop p calc) p))";
        assert_eq!(run(src).as_number().unwrap(), 6.0);
    }

    #[test]
    fn string_concatenation_via_add() {
        assert_eq!(run(r#"(+ "a" "b")"#).as_string().unwrap().as_str(), "ab");
    }

    #[test]
    fn mixed_string_and_number_add_is_a_type_error() {
        let global = Rc::new(RefCell::new(Global::new()));
        let program = read_program(r#"(+ "a" 1)"#).unwrap();
        let code = Compiler::compile(&program, global.clone()).unwrap();
        let err = Vm::new(global).exec(Rc::new(code)).unwrap_err();
        assert!(matches!(err, EvaError::Type(_)));
    }

    #[test]
    fn division_by_zero_yields_infinity() {
        assert!(run("(/ 1 0)").as_number().unwrap().is_infinite());
    }

    #[test]
    fn undefined_global_read_is_a_resolve_error() {
        let global = Rc::new(RefCell::new(Global::new()));
        let program = read_program("missing").unwrap();
        let code = Compiler::compile(&program, global.clone()).unwrap();
        let err = Vm::new(global).exec(Rc::new(code));
        assert!(err.is_err());
    }

    #[test]
    fn unknown_opcode_byte_is_a_runtime_error() {
        let global = Rc::new(RefCell::new(Global::new()));
        let mut code = CodeObject::new("main", 0);
        code.emit_u8(0xfe);
        let err = Vm::new(global).exec(Rc::new(code)).unwrap_err();
        assert!(matches!(err, EvaError::UnknownOpcode(0xfe)));
    }
}
