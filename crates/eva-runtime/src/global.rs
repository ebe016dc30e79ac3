//! Global table.
//!
//! An ordered list of (name, value) slots plus a name→index lookup. Indices
//! are stable once assigned; `define` is idempotent. Shared by reference
//! between the compiler (which resolves names to indices at compile time)
//! and the VM (which reads/writes by index at run time).

use crate::value::{EvaValue, NativeFunction};
use std::rc::Rc;

struct GlobalVar {
    name: String,
    value: EvaValue,
}

/// Process-wide named storage for variables and native functions.
#[derive(Default)]
pub struct Global {
    vars: Vec<GlobalVar>,
}

impl Global {
    pub fn new() -> Self {
        Global { vars: Vec::new() }
    }

    /// Register a global slot, initialized to `Number(0)` if new. Returns
    /// the slot's index either way — idempotent, per spec.
    pub fn define(&mut self, name: &str) -> usize {
        if let Some(idx) = self.get_index(name) {
            return idx;
        }
        self.vars.push(GlobalVar {
            name: name.to_string(),
            value: EvaValue::Number(0.0),
        });
        self.vars.len() - 1
    }

    /// Define a global pre-initialized to a constant value (a no-op if the
    /// name is already defined).
    pub fn add_const(&mut self, name: &str, value: EvaValue) {
        if self.exists(name) {
            return;
        }
        self.vars.push(GlobalVar {
            name: name.to_string(),
            value,
        });
    }

    /// Install a native (host) function under `name`.
    pub fn add_native_function(
        &mut self,
        name: &str,
        arity: usize,
        func: impl Fn(&[EvaValue]) -> Result<EvaValue, crate::error::EvaError> + 'static,
    ) {
        let native = EvaValue::Native(Rc::new(NativeFunction {
            name: name.to_string(),
            arity,
            func: Box::new(func),
        }));
        self.add_const(name, native);
    }

    pub fn get(&self, index: usize) -> Option<EvaValue> {
        self.vars.get(index).map(|v| v.value.clone())
    }

    pub fn set(&mut self, index: usize, value: EvaValue) -> bool {
        match self.vars.get_mut(index) {
            Some(slot) => {
                slot.value = value;
                true
            }
            None => false,
        }
    }

    /// Most-recently-defined match first — shadowing redefinitions resolve
    /// to the latest.
    pub fn get_index(&self, name: &str) -> Option<usize> {
        self.vars.iter().enumerate().rev().find(|(_, v)| v.name == name).map(|(i, _)| i)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.get_index(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_is_idempotent() {
        let mut g = Global::new();
        let a = g.define("x");
        let b = g.define("x");
        assert_eq!(a, b);
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn get_index_resolves_shadowed_name_to_latest() {
        let mut g = Global::new();
        g.define("x");
        g.add_const("y", EvaValue::Number(1.0));
        assert_eq!(g.get_index("x"), Some(0));
        assert_eq!(g.get_index("y"), Some(1));
        assert_eq!(g.get_index("z"), None);
    }

    #[test]
    fn set_updates_existing_slot() {
        let mut g = Global::new();
        let idx = g.define("x");
        assert!(g.set(idx, EvaValue::Number(5.0)));
        assert_eq!(g.get(idx).unwrap().as_number().unwrap(), 5.0);
    }
}
