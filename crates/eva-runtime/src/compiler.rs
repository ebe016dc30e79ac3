//! Single-pass compiler: `Expr` tree → `CodeObject`.
//!
//! One instance compiles one program. Nested functions/methods push a fresh
//! `CodeObject` onto `code_stack` and pop it back off once their body is
//! compiled, so "the current unit" is always `code_stack.last_mut()`.

use crate::analysis::{free_variables, locally_captured_names, param_names};
use crate::bytecode::{CompareOp, Opcode};
use crate::code::CodeObject;
use crate::error::EvaError;
use crate::expr::Expr;
use crate::global::Global;
use crate::value::EvaValue;
use std::cell::RefCell;
use std::rc::Rc;

fn to_u8(n: usize) -> Result<u8, EvaError> {
    u8::try_from(n).map_err(|_| EvaError::InvalidIndex(format!("{n} exceeds the 1-byte operand limit of 255")))
}

fn expect_symbol<'a>(expr: &'a Expr, what: &str) -> Result<&'a str, EvaError> {
    expr.as_symbol().ok_or_else(|| EvaError::Parse(format!("expected a symbol for {what}")))
}

fn is_declaration(expr: &Expr) -> bool {
    matches!(expr.head_symbol(), Some("var") | Some("def") | Some("class"))
}

/// Compiles an `Expr` tree into a `CodeObject`, resolving globals against a
/// shared [`Global`] table as it goes.
pub struct Compiler {
    code_stack: Vec<CodeObject>,
    global: Rc<RefCell<Global>>,
}

impl Compiler {
    /// Compile `expr` (the whole program, already wrapped in an implicit
    /// `begin` by [`crate::reader::read_program`]) into the top-level `"main"`
    /// code object.
    pub fn compile(expr: &Expr, global: Rc<RefCell<Global>>) -> Result<CodeObject, EvaError> {
        let mut compiler = Compiler {
            code_stack: vec![CodeObject::new("main", 0)],
            global,
        };
        // `expr` is already the whole program wrapped in one `begin` by
        // `reader::read_program`; running it through the same
        // captures-then-body prepass as every other unit means a top-level
        // self-recursive `(def f (..) (... (f ..) ...))` gets `f` promoted
        // to a cell exactly like a nested one would.
        compiler.compile_captures_and_body(&[], std::slice::from_ref(expr))?;
        compiler.emit(Opcode::Halt);
        Ok(compiler.code_stack.pop().expect("main code object"))
    }

    fn current(&mut self) -> &mut CodeObject {
        self.code_stack.last_mut().expect("non-empty code stack")
    }

    fn emit(&mut self, op: Opcode) {
        self.current().emit_u8(op as u8);
    }

    fn emit_byte(&mut self, byte: u8) {
        self.current().emit_u8(byte);
    }

    /// A code object is the program's top-level unit iff it is named `"main"`
    /// and sits at the outermost `scope_level`. `var` binds a global there;
    /// everywhere else it binds a local.
    fn is_global_scope(&self) -> bool {
        let top = self.code_stack.last().expect("non-empty code stack");
        self.code_stack.len() == 1 && top.name == "main" && top.scope_level == 1
    }

    fn enter_scope(&mut self) {
        self.current().scope_level += 1;
    }

    fn exit_scope(&mut self) {
        let dropped = self.current().pop_scope_locals();
        self.current().scope_level -= 1;
        if dropped > 0 {
            self.emit(Opcode::ScopeExit);
            self.emit_byte(dropped as u8);
        }
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), EvaError> {
        match expr {
            Expr::Number(n) => {
                let idx = self.current().add_number_const(*n);
                self.emit(Opcode::Const);
                self.emit_byte(idx);
            }
            Expr::String(s) => {
                let idx = self.current().add_string_const(s);
                self.emit(Opcode::Const);
                self.emit_byte(idx);
            }
            Expr::Symbol(name) => self.compile_read(name)?,
            Expr::List(items) => self.compile_list(items)?,
        }
        Ok(())
    }

    /// A block of expressions, emitting `POP` after every non-last one that
    /// isn't a `var`/`def`/`class` declaration — a declaration's assignment
    /// opcode leaves its value *in place* as the new local's slot, not as a
    /// disposable intermediate, so it must not be popped.
    fn compile_block(&mut self, body: &[Expr]) -> Result<(), EvaError> {
        if body.is_empty() {
            let idx = self.current().add_boolean_const(false);
            self.emit(Opcode::Const);
            self.emit_byte(idx);
            return Ok(());
        }
        let last = body.len() - 1;
        for (i, e) in body.iter().enumerate() {
            self.compile_expr(e)?;
            if i != last && !is_declaration(e) {
                self.emit(Opcode::Pop);
            }
        }
        Ok(())
    }

    fn compile_read(&mut self, name: &str) -> Result<(), EvaError> {
        if name == "true" || name == "false" {
            let idx = self.current().add_boolean_const(name == "true");
            self.emit(Opcode::Const);
            self.emit_byte(idx);
            return Ok(());
        }
        if let Some(idx) = self.current().get_cell_index(name) {
            self.emit(Opcode::GetCell);
            self.emit_byte(idx);
            return Ok(());
        }
        if let Some(idx) = self.current().get_local_index(name) {
            self.emit(Opcode::GetLocal);
            self.emit_byte(idx);
            return Ok(());
        }
        if let Some(idx) = self.global.borrow().get_index(name) {
            self.emit(Opcode::GetGlobal);
            self.emit_byte(to_u8(idx)?);
            return Ok(());
        }
        Err(EvaError::Resolve(name.to_string()))
    }

    fn compile_write(&mut self, name: &str) -> Result<(), EvaError> {
        if let Some(idx) = self.current().get_cell_index(name) {
            self.emit(Opcode::SetCell);
            self.emit_byte(idx);
            return Ok(());
        }
        if let Some(idx) = self.current().get_local_index(name) {
            self.emit(Opcode::SetLocal);
            self.emit_byte(idx);
            return Ok(());
        }
        if let Some(idx) = self.global.borrow().get_index(name) {
            self.emit(Opcode::SetGlobal);
            self.emit_byte(to_u8(idx)?);
            return Ok(());
        }
        Err(EvaError::Resolve(name.to_string()))
    }

    /// Bind `name` to the value already on top of the stack: a fresh cell if
    /// some nested closure captures it, otherwise a global (at the program's
    /// top level) or a new local.
    fn bind_new_name(&mut self, name: &str) -> Result<(), EvaError> {
        if let Some(idx) = self.current().get_cell_index(name) {
            // MAKE_CELL only peeks the stack, so this declaration still needs
            // its own permanent stack slot for `SCOPE_EXIT` bookkeeping, same
            // as a plain local — it's just never read back through it, since
            // cell lookup always wins over `get_local_index`.
            self.current().add_local(name);
            self.emit(Opcode::MakeCell);
            self.emit_byte(idx);
            return Ok(());
        }
        if self.is_global_scope() {
            let idx = self.global.borrow_mut().define(name);
            self.emit(Opcode::SetGlobal);
            self.emit_byte(to_u8(idx)?);
        } else {
            let idx = self.current().add_local(name);
            self.emit(Opcode::SetLocal);
            self.emit_byte(idx);
        }
        Ok(())
    }

    fn compile_list(&mut self, items: &[Expr]) -> Result<(), EvaError> {
        let Some(head) = items.first().and_then(Expr::as_symbol) else {
            return Err(EvaError::Parse("cannot call a non-symbol in operator position".into()));
        };
        match head {
            "begin" => self.compile_begin(items),
            "var" => self.compile_var(items),
            "set" => self.compile_set(items),
            "if" => self.compile_if(items),
            "while" => self.compile_while(&items[1], &items[2]),
            "for" => self.compile_for(items),
            "def" => {
                let name = expect_symbol(&items[1], "a function name")?;
                self.compile_lambda_or_def(Some(name.to_string()).as_deref(), &items[2], &items[3..])
            }
            "lambda" => self.compile_lambda_or_def(None, &items[1], &items[2..]),
            "class" => self.compile_class(items),
            "new" => self.compile_new(items),
            "prop" => self.compile_prop(items),
            "+" | "-" | "*" | "/" => self.compile_arith(head, &items[1], &items[2]),
            "<" | ">" | "==" | ">=" | "<=" | "!=" => self.compile_compare(head, &items[1], &items[2]),
            _ => self.compile_call(items),
        }
    }

    fn compile_begin(&mut self, items: &[Expr]) -> Result<(), EvaError> {
        self.enter_scope();
        let result = self.compile_block(&items[1..]);
        self.exit_scope();
        result
    }

    fn compile_var(&mut self, items: &[Expr]) -> Result<(), EvaError> {
        let name = expect_symbol(&items[1], "a var name")?.to_string();
        self.compile_expr(&items[2])?;
        self.bind_new_name(&name)
    }

    fn compile_set(&mut self, items: &[Expr]) -> Result<(), EvaError> {
        match items[1].as_symbol() {
            Some(name) => {
                let name = name.to_string();
                self.compile_expr(&items[2])?;
                self.compile_write(&name)
            }
            None => {
                let target = items[1]
                    .as_list()
                    .filter(|t| t.first().and_then(Expr::as_symbol) == Some("prop"))
                    .ok_or_else(|| EvaError::Parse("set target must be a symbol or (prop obj name)".into()))?;
                self.compile_expr(&target[1])?;
                self.compile_expr(&items[2])?;
                let key = expect_symbol(&target[2], "a property name")?;
                let idx = self.current().add_string_const(key);
                self.emit(Opcode::SetProp);
                self.emit_byte(idx);
                Ok(())
            }
        }
    }

    fn compile_if(&mut self, items: &[Expr]) -> Result<(), EvaError> {
        self.compile_expr(&items[1])?;
        self.emit(Opcode::JmpIfFalse);
        let else_jump = self.current().emit_placeholder();

        self.compile_expr(&items[2])?;
        self.emit(Opcode::Jmp);
        let end_jump = self.current().emit_placeholder();

        let else_target = self.current().offset();
        self.current().patch_jump(else_jump, else_target);
        match items.get(3) {
            Some(else_branch) => self.compile_expr(else_branch)?,
            None => {
                let idx = self.current().add_boolean_const(false);
                self.emit(Opcode::Const);
                self.emit_byte(idx);
            }
        }

        let end_target = self.current().offset();
        self.current().patch_jump(end_jump, end_target);
        Ok(())
    }

    fn compile_while(&mut self, test: &Expr, body: &Expr) -> Result<(), EvaError> {
        let loop_start = self.current().offset();
        self.compile_expr(test)?;
        self.emit(Opcode::JmpIfFalse);
        let exit_jump = self.current().emit_placeholder();

        self.compile_expr(body)?;
        self.emit(Opcode::Pop);
        self.emit(Opcode::Jmp);
        self.current().emit_u16(loop_start as u16);

        let exit_target = self.current().offset();
        self.current().patch_jump(exit_jump, exit_target);

        let idx = self.current().add_boolean_const(false);
        self.emit(Opcode::Const);
        self.emit_byte(idx);
        Ok(())
    }

    /// `(for init test step body)`. Desugars to `while test (begin body
    /// step)`, but `init` (typically a `var`) must live in a scope that
    /// encloses the *entire* loop, not just one iteration's block, or the
    /// loop variable would vanish before `test` ever re-reads it.
    fn compile_for(&mut self, items: &[Expr]) -> Result<(), EvaError> {
        self.enter_scope();
        let init = &items[1];
        self.compile_expr(init)?;
        if !is_declaration(init) {
            self.emit(Opcode::Pop);
        }

        let test = &items[2];
        let step = &items[3];
        let body = &items[4];

        let loop_start = self.current().offset();
        self.compile_expr(test)?;
        self.emit(Opcode::JmpIfFalse);
        let exit_jump = self.current().emit_placeholder();

        self.compile_expr(body)?;
        self.emit(Opcode::Pop);
        self.compile_expr(step)?;
        self.emit(Opcode::Pop);
        self.emit(Opcode::Jmp);
        self.current().emit_u16(loop_start as u16);

        let exit_target = self.current().offset();
        self.current().patch_jump(exit_jump, exit_target);

        let idx = self.current().add_boolean_const(false);
        self.emit(Opcode::Const);
        self.emit_byte(idx);
        self.exit_scope();
        Ok(())
    }

    fn compile_arith(&mut self, op: &str, a: &Expr, b: &Expr) -> Result<(), EvaError> {
        self.compile_expr(a)?;
        self.compile_expr(b)?;
        let opcode = match op {
            "+" => Opcode::Add,
            "-" => Opcode::Sub,
            "*" => Opcode::Mul,
            "/" => Opcode::Div,
            _ => unreachable!("compile_list only dispatches here for arithmetic operators"),
        };
        self.emit(opcode);
        Ok(())
    }

    fn compile_compare(&mut self, op: &str, a: &Expr, b: &Expr) -> Result<(), EvaError> {
        self.compile_expr(a)?;
        self.compile_expr(b)?;
        let cmp = CompareOp::from_name(op).expect("compile_list only dispatches here for known comparison operators");
        self.emit(Opcode::Compare);
        self.emit_byte(cmp as u8);
        Ok(())
    }

    fn compile_call(&mut self, items: &[Expr]) -> Result<(), EvaError> {
        self.compile_expr(&items[0])?;
        for arg in &items[1..] {
            self.compile_expr(arg)?;
        }
        self.emit(Opcode::Call);
        self.emit_byte(to_u8(items.len() - 1)?);
        Ok(())
    }

    /// Compile a function/method body into its own `CodeObject`: run the
    /// closure-capture prepass first, then compile every instruction knowing
    /// up front which names are cells.
    fn compile_function(&mut self, name: &str, params: &[String], body: &[Expr]) -> Result<Rc<CodeObject>, EvaError> {
        // `free_variables` is a purely syntactic walk: it has no notion of
        // what's actually bound where, so it over-reports every unbound name
        // as needing to be inherited — including ones that resolve to a
        // global (a native function, a top-level `var`/`def`), which isn't a
        // free variable at all; only names resolving to a local in an outer,
        // still-live unit should be inherited. Drop anything already defined
        // as a global here so it falls through to `GET_GLOBAL`/`SET_GLOBAL`
        // in `compile_read`/`compile_write` instead of being registered as
        // an inherited cell no enclosing unit can actually supply.
        let global = self.global.clone();
        let inherited: Vec<String> = free_variables(params, body)
            .into_iter()
            .filter(|n| !global.borrow().exists(n))
            .collect();
        let mut code = CodeObject::new(name, params.len());
        for n in &inherited {
            code.add_inherited_cell(n.clone());
        }
        code.scope_level = 1;
        self.code_stack.push(code);

        for p in params {
            self.current().add_local(p.clone());
        }

        self.compile_captures_and_body(params, body)?;
        self.emit(Opcode::Return);

        Ok(Rc::new(self.code_stack.pop().expect("function code object")))
    }

    /// Promote this unit's own params/vars that a direct nested closure
    /// captures to cells *before* compiling a single instruction of `body`,
    /// then compile `body`. Shared between `compile_function` and the
    /// top-level program, so a
    /// self-recursive top-level `(def f ...)` and a nested one are promoted
    /// identically.
    fn compile_captures_and_body(&mut self, params: &[String], body: &[Expr]) -> Result<(), EvaError> {
        let captured = locally_captured_names(params, body);
        let mut param_cells = Vec::new();
        for n in &captured {
            let cell_idx = self.current().add_own_cell(n.clone());
            if params.contains(n) {
                param_cells.push((n.clone(), cell_idx));
            }
        }
        for (n, cell_idx) in &param_cells {
            let local_idx = self.current().get_local_index(n).expect("param was just declared as a local");
            self.emit(Opcode::GetLocal);
            self.emit_byte(local_idx);
            self.emit(Opcode::MakeCell);
            self.emit_byte(*cell_idx);
            // MAKE_CELL peeks rather than pops (so a `(var ...)` declaration's
            // cell-promotion still leaves its initializer value as the
            // declaration's result) — the GET_LOCAL duplicate above is only
            // scaffolding for this boxing step and must be discarded here.
            self.emit(Opcode::Pop);
        }
        self.compile_block(body)
    }

    /// Compile a closure's code object, then (back in the enclosing unit)
    /// pull its captures onto the stack, wrap them into a `Function` constant
    /// with `MAKE_FUNCTION`, and leave that `Function` value on top.
    fn compile_closure_value(&mut self, name: &str, params: &[String], body: &[Expr]) -> Result<(), EvaError> {
        let inner = self.compile_function(name, params, body)?;
        let free_names: Vec<String> = inner.cell_names[..inner.free_var_count].to_vec();
        for n in &free_names {
            let idx = self
                .current()
                .get_cell_index(n)
                .ok_or_else(|| EvaError::Resolve(format!("{n} is not available to capture here")))?;
            self.emit(Opcode::GetFree);
            self.emit_byte(idx);
        }
        let const_idx = self.current().add_unique_const(EvaValue::Code(inner));
        self.emit(Opcode::Const);
        self.emit_byte(const_idx);
        self.emit(Opcode::MakeFunction);
        Ok(())
    }

    fn compile_lambda_or_def(&mut self, name: Option<&str>, params_expr: &Expr, body: &[Expr]) -> Result<(), EvaError> {
        let params = param_names(params_expr);
        let display_name = name.unwrap_or("lambda");
        self.compile_closure_value(display_name, &params, body)?;
        if let Some(name) = name {
            self.bind_new_name(name)?;
        }
        Ok(())
    }

    /// `(class Name super (def method (params...) body...)...)`. Builds the
    /// class at runtime with `MAKE_CLASS`: push the name, the superclass (or
    /// `false` as the "no superclass" sentinel), then each `(name, Function)`
    /// method pair, in that order.
    fn compile_class(&mut self, items: &[Expr]) -> Result<(), EvaError> {
        let name = expect_symbol(&items[1], "a class name")?.to_string();
        let super_name = items[2].as_symbol().map(str::to_string);
        let body = &items[3..];

        let name_idx = self.current().add_string_const(&name);
        self.emit(Opcode::Const);
        self.emit_byte(name_idx);

        match super_name.as_deref() {
            None | Some("null") => {
                let idx = self.current().add_boolean_const(false);
                self.emit(Opcode::Const);
                self.emit_byte(idx);
            }
            Some(super_name) => self.compile_read(super_name)?,
        }

        let mut method_count: usize = 0;
        for member in body {
            let Some(member_items) = member.as_list() else { continue };
            if member_items.first().and_then(Expr::as_symbol) != Some("def") {
                continue;
            }
            let method_name = expect_symbol(&member_items[1], "a method name")?.to_string();
            let params = param_names(&member_items[2]);
            let method_body = &member_items[3..];

            let name_const = self.current().add_string_const(&method_name);
            self.emit(Opcode::Const);
            self.emit_byte(name_const);

            self.compile_closure_value(&method_name, &params, method_body)?;
            method_count += 1;
        }

        self.emit(Opcode::MakeClass);
        self.emit_byte(to_u8(method_count)?);
        self.bind_new_name(&name)
    }

    fn compile_new(&mut self, items: &[Expr]) -> Result<(), EvaError> {
        self.compile_expr(&items[1])?;
        for arg in &items[2..] {
            self.compile_expr(arg)?;
        }
        self.emit(Opcode::New);
        self.emit_byte(to_u8(items.len() - 2)?);
        Ok(())
    }

    /// `(prop obj name)`. `obj` may be `(super ClassName)`, in which case we
    /// push the *class* value for `ClassName` rather than an instance —
    /// `GET_PROP` resolves a class operand against its superclass's method
    /// table instead of an instance's properties.
    fn compile_prop(&mut self, items: &[Expr]) -> Result<(), EvaError> {
        let obj = &items[1];
        let prop_name = expect_symbol(&items[2], "a property name")?;

        if let Some(super_items) = obj.as_list() {
            if super_items.first().and_then(Expr::as_symbol) == Some("super") {
                let class_name = expect_symbol(&super_items[1], "a class name")?.to_string();
                self.compile_read(&class_name)?;
                let idx = self.current().add_string_const(prop_name);
                self.emit(Opcode::GetProp);
                self.emit_byte(idx);
                return Ok(());
            }
        }

        self.compile_expr(obj)?;
        let idx = self.current().add_string_const(prop_name);
        self.emit(Opcode::GetProp);
        self.emit_byte(idx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;
    use crate::reader::{read_one, read_program};
    use pretty_assertions::assert_eq;

    fn compile_source(src: &str) -> CodeObject {
        let global = Rc::new(RefCell::new(Global::new()));
        let program = read_program(src).unwrap();
        Compiler::compile(&program, global).unwrap()
    }

    #[test]
    fn number_literal_compiles_to_const_and_halt() {
        let code = compile_source("42");
        assert_eq!(code.code, vec![Opcode::Const as u8, 0, Opcode::Halt as u8]);
        assert_eq!(code.constants.len(), 1);
    }

    #[test]
    fn top_level_var_defines_a_global() {
        let global = Rc::new(RefCell::new(Global::new()));
        let program = read_program("(var x 10) x").unwrap();
        Compiler::compile(&program, global.clone()).unwrap();
        assert!(global.borrow().exists("x"));
    }

    #[test]
    fn nested_var_becomes_a_local_not_a_global() {
        let global = Rc::new(RefCell::new(Global::new()));
        let program = read_program("(begin (var x 10) x)").unwrap();
        Compiler::compile(&program, global.clone()).unwrap();
        assert!(!global.borrow().exists("x"));
    }

    #[test]
    fn if_without_else_pushes_false() {
        let code = compile_source("(if (> 1 2) 10)");
        // Const(cond), JmpIfFalse, Const(10), Jmp, Const(false)
        assert!(code.constants.iter().any(|c| matches!(c, EvaValue::Boolean(false))));
    }

    #[test]
    fn undefined_symbol_is_a_resolve_error() {
        let global = Rc::new(RefCell::new(Global::new()));
        let program = read_one("undefined_name").unwrap();
        let err = Compiler::compile(&program, global).unwrap_err();
        assert!(matches!(err, EvaError::Resolve(_)));
    }

    #[test]
    fn lambda_compiles_with_return_opcode() {
        let code = compile_source("(lambda (x) (* x x))");
        let fn_const = code.constants.iter().find_map(|c| match c {
            EvaValue::Code(c) => Some(c.clone()),
            _ => None,
        });
        let fn_code = fn_const.expect("lambda body compiled as a code constant");
        assert_eq!(fn_code.code.last(), Some(&(Opcode::Return as u8)));
        assert_eq!(fn_code.arity, 1);
    }

    #[test]
    fn closure_emits_get_free_for_each_inherited_cell() {
        let code = compile_source("(def make (n) (lambda () (set n (+ n 1)) n))");
        // `make`'s own body should box `n` via MAKE_CELL before returning the lambda.
        let make_code = code.constants.iter().find_map(|c| match c {
            EvaValue::Code(c) if c.name == "make" => Some(c.clone()),
            _ => None,
        });
        let make_code = make_code.expect("make compiled as a code constant");
        assert!(make_code.code.contains(&(Opcode::MakeCell as u8)));
        assert!(make_code.code.contains(&(Opcode::GetFree as u8)));
    }

    #[test]
    fn function_body_reading_a_host_global_does_not_capture_it_as_a_cell() {
        let global = Rc::new(RefCell::new(Global::new()));
        global
            .borrow_mut()
            .add_native_function("print", 1, |args| Ok(args[0].clone()));
        let program = read_program("(def greet (x) (print x))").unwrap();
        let code = Compiler::compile(&program, global).unwrap();
        let greet_code = code
            .constants
            .iter()
            .find_map(|c| match c {
                EvaValue::Code(c) if c.name == "greet" => Some(c.clone()),
                _ => None,
            })
            .expect("greet compiled as a code constant");
        assert_eq!(greet_code.free_var_count, 0);
        assert!(greet_code.code.contains(&(Opcode::GetGlobal as u8)));
    }

    #[test]
    fn class_with_superclass_emits_make_class() {
        let code = compile_source(
            "(begin (class Point null (def constructor (self x) (set (prop self x) x))) (class Point3D Point null))",
        );
        assert!(code.code.contains(&(Opcode::MakeClass as u8)));
    }
}
