//! Compile-time free-variable analysis, feeding the compiler's closure-capture
//! scheme.
//!
//! The compiler is single-pass, but deciding whether `(var name expr)`
//! should emit `SET_LOCAL` or `MAKE_CELL` requires knowing, *before* a
//! single instruction of a function body is emitted, which of its
//! params/vars a nested `lambda`/`def`/method will capture. This module
//! answers that question by walking the parsed [`Expr`] tree — it never
//! touches bytecode.

use crate::expr::Expr;
use std::collections::HashSet;

/// Keywords and operators that are never variable references.
const RESERVED: &[&str] = &[
    "begin", "var", "set", "if", "while", "for", "def", "lambda", "class", "new", "prop", "super",
    "null", "true", "false", "+", "-", "*", "/", "<", ">", "==", ">=", "<=", "!=",
];

fn is_reserved(name: &str) -> bool {
    RESERVED.contains(&name)
}

pub(crate) fn param_names(params_form: &Expr) -> Vec<String> {
    params_form
        .as_list()
        .map(|items| items.iter().filter_map(|e| e.as_symbol().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn is_bound(scopes: &[HashSet<String>], name: &str) -> bool {
    scopes.iter().rev().any(|s| s.contains(name))
}

/// The set of symbol names read or written anywhere within `body` (at any
/// nesting depth, including inside further-nested closures) that are not
/// bound by `params`, by any `(var ...)` declaration within `body`, or by
/// any nested closure's own params — i.e. exactly the names `body`'s
/// function needs to inherit from its enclosing scope.
pub fn free_variables(params: &[String], body: &[Expr]) -> Vec<String> {
    let mut scopes = vec![param_scope(params)];
    let mut free = Vec::new();
    let mut seen = HashSet::new();
    for e in body {
        collect_free(e, &mut scopes, &mut free, &mut seen);
    }
    free
}

fn param_scope(params: &[String]) -> HashSet<String> {
    let mut s: HashSet<String> = params.iter().cloned().collect();
    s.insert("self".to_string());
    s
}

fn record_free(name: &str, scopes: &[HashSet<String>], free: &mut Vec<String>, seen: &mut HashSet<String>) {
    if is_reserved(name) || is_bound(scopes, name) {
        return;
    }
    if seen.insert(name.to_string()) {
        free.push(name.to_string());
    }
}

fn collect_free(expr: &Expr, scopes: &mut Vec<HashSet<String>>, free: &mut Vec<String>, seen: &mut HashSet<String>) {
    match expr {
        Expr::Number(_) | Expr::String(_) => {}
        Expr::Symbol(name) => record_free(name, scopes, free, seen),
        Expr::List(items) => collect_free_list(items, scopes, free, seen),
    }
}

fn collect_free_list(items: &[Expr], scopes: &mut Vec<HashSet<String>>, free: &mut Vec<String>, seen: &mut HashSet<String>) {
    let Some(head) = items.first().and_then(Expr::as_symbol) else {
        for e in items {
            collect_free(e, scopes, free, seen);
        }
        return;
    };

    match head {
        "var" => {
            collect_free(&items[2], scopes, free, seen);
            if let Some(name) = items[1].as_symbol() {
                scopes.last_mut().unwrap().insert(name.to_string());
            }
        }
        "set" => {
            collect_free(&items[2], scopes, free, seen);
            match items[1].as_symbol() {
                Some(name) => record_free(name, scopes, free, seen),
                None => collect_free(&items[1], scopes, free, seen),
            }
        }
        "begin" => {
            scopes.push(HashSet::new());
            for e in &items[1..] {
                collect_free(e, scopes, free, seen);
            }
            scopes.pop();
        }
        "if" | "while" => {
            for e in &items[1..] {
                collect_free(e, scopes, free, seen);
            }
        }
        "for" => {
            scopes.push(HashSet::new());
            for e in &items[1..] {
                collect_free(e, scopes, free, seen);
            }
            scopes.pop();
        }
        "def" => {
            let name = items[1].as_symbol().unwrap_or_default();
            scopes.last_mut().unwrap().insert(name.to_string());
            let params = param_names(&items[2]);
            scopes.push(param_scope(&params));
            for e in &items[3..] {
                collect_free(e, scopes, free, seen);
            }
            scopes.pop();
        }
        "lambda" => {
            let params = param_names(&items[1]);
            scopes.push(param_scope(&params));
            for e in &items[2..] {
                collect_free(e, scopes, free, seen);
            }
            scopes.pop();
        }
        "class" => {
            let name = items[1].as_symbol().unwrap_or_default();
            scopes.last_mut().unwrap().insert(name.to_string());
            if let Some(super_name) = items[2].as_symbol() {
                if super_name != "null" {
                    record_free(super_name, scopes, free, seen);
                }
            }
            for method in &items[3..] {
                collect_free(method, scopes, free, seen);
            }
        }
        "prop" => {
            // (prop obj name): `name` is a property key, never a variable.
            // `obj` is visited normally — including `(super ClassName)`,
            // where `ClassName` is a real symbol reference a method must
            // capture to resolve its superclass at runtime (`super` itself
            // is reserved and never recorded).
            if let Some(obj) = items.get(1) {
                collect_free(obj, scopes, free, seen);
            }
        }
        _ => {
            for e in items {
                collect_free(e, scopes, free, seen);
            }
        }
    }
}

/// Every name bound anywhere within `body` at the top level's own scope —
/// `params`/`self` plus every `(var ...)` declared at any depth, as long as
/// it doesn't cross into a nested closure's own scope. This is the
/// candidate set that a direct nested closure might need promoted to a
/// cell.
fn collect_own_bindings(params: &[String], body: &[Expr]) -> HashSet<String> {
    let mut bindings = param_scope(params);
    for e in body {
        walk_own_bindings(e, &mut bindings);
    }
    bindings
}

fn walk_own_bindings(expr: &Expr, bindings: &mut HashSet<String>) {
    let Some(items) = expr.as_list() else { return };
    let Some(head) = items.first().and_then(Expr::as_symbol) else {
        return;
    };
    match head {
        "var" => {
            if let Some(name) = items[1].as_symbol() {
                bindings.insert(name.to_string());
            }
        }
        "def" => {
            // The function's own body is a fresh scope (don't descend), but
            // its *name* is bound right here — needed so a self-recursive
            // `(def f (..) (... (f ...) ...))` sees `f` as an own binding of
            // the enclosing unit its own closure can capture.
            if let Some(name) = items[1].as_symbol() {
                bindings.insert(name.to_string());
            }
        }
        "class" => {
            // Likewise: a method referencing `(prop (super ClassName) ...)`
            // needs `ClassName` visible as an own binding of the unit the
            // class itself is being defined in.
            if let Some(name) = items[1].as_symbol() {
                bindings.insert(name.to_string());
            }
        }
        "lambda" => {
            // Anonymous: introduces a fresh scope, binds no name here.
        }
        "begin" | "if" | "while" | "for" => {
            for e in &items[1..] {
                walk_own_bindings(e, bindings);
            }
        }
        _ => {}
    }
}

/// Every direct nested `lambda`/`def`/class-method closure appearing
/// anywhere in `body` (transparently through `begin`/`if`/`while`/`for`),
/// as `(params, body)` pairs. Closures nested *inside* those closures are
/// not collected here — each handles its own capture needs when it is
/// itself compiled.
fn collect_direct_closures<'a>(body: &'a [Expr], out: &mut Vec<(Vec<String>, &'a [Expr])>) {
    for e in body {
        walk_direct_closures(e, out);
    }
}

fn walk_direct_closures<'a>(expr: &'a Expr, out: &mut Vec<(Vec<String>, &'a [Expr])>) {
    let Some(items) = expr.as_list() else { return };
    let Some(head) = items.first().and_then(Expr::as_symbol) else {
        return;
    };
    match head {
        "lambda" => out.push((param_names(&items[1]), &items[2..])),
        "def" => out.push((param_names(&items[2]), &items[3..])),
        "class" => {
            for method in &items[3..] {
                if let Some(method_items) = method.as_list() {
                    if method_items.first().and_then(Expr::as_symbol) == Some("def") {
                        out.push((param_names(&method_items[2]), &method_items[3..]));
                    }
                }
            }
        }
        "begin" | "if" | "while" | "for" => {
            for e in &items[1..] {
                walk_direct_closures(e, out);
            }
        }
        _ => {}
    }
}

/// Names among `params`/`self`/this unit's own `var`s that some nested
/// closure captures — these must be promoted to cells *before* a single
/// instruction of `body` is compiled, so `(var name ...)` and param entry
/// can box them.
pub fn locally_captured_names(params: &[String], body: &[Expr]) -> Vec<String> {
    let own_bindings = collect_own_bindings(params, body);
    let mut closures = Vec::new();
    collect_direct_closures(body, &mut closures);

    let mut captured = Vec::new();
    let mut seen = HashSet::new();
    for (closure_params, closure_body) in closures {
        for name in free_variables(&closure_params, closure_body) {
            if own_bindings.contains(&name) && seen.insert(name.clone()) {
                captured.push(name);
            }
        }
    }
    captured
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::read_one;

    fn params(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plain_function_has_no_free_variables() {
        let body = read_one("(* x x)").unwrap();
        let free = free_variables(&params(&["x"]), &[body]);
        assert!(free.is_empty());
    }

    #[test]
    fn lambda_capturing_outer_param_is_free() {
        // (lambda () (set n (+ n 1)) n) — n is free relative to the lambda.
        let forms = vec![
            read_one("(set n (+ n 1))").unwrap(),
            read_one("n").unwrap(),
        ];
        let free = free_variables(&[], &forms);
        assert_eq!(free, vec!["n".to_string()]);
    }

    #[test]
    fn make_promotes_n_for_its_inner_lambda() {
        // (def make (n) (lambda () (set n (+ n 1)) n))
        let body = read_one("(lambda () (set n (+ n 1)) n)").unwrap();
        let captured = locally_captured_names(&params(&["n"]), &[body]);
        assert_eq!(captured, vec!["n".to_string()]);
    }

    #[test]
    fn prop_key_is_never_treated_as_a_free_variable() {
        let body = read_one("(prop self x)").unwrap();
        let free = free_variables(&params(&["self"]), &[body]);
        assert!(free.is_empty());
    }

    #[test]
    fn super_class_name_is_a_free_variable_but_super_keyword_is_not() {
        // A method resolving `(super Point)` must capture `Point` itself
        // (to read its superclass at runtime); `super` is never a variable.
        let body = read_one("(prop (super Point) calc)").unwrap();
        let free = free_variables(&[], &[body]);
        assert_eq!(free, vec!["Point".to_string()]);
    }
}
