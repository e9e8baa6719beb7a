// Lexical scope chain used by the type checker to resolve local variables,
// parameters, and `self` against the enclosing method/class.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub struct Env<T> {
    scope: RefCell<HashMap<String, T>>,
    parent: Option<Rc<Env<T>>>,
}

impl<T> Env<T>
where
    T: Clone,
{
    fn new(parent: Option<Rc<Env<T>>>) -> Env<T> {
        Env {
            scope: RefCell::new(HashMap::new()),
            parent,
        }
    }

    pub fn root() -> Env<T> {
        Self::new(None)
    }

    pub fn chain(parent: &Rc<Env<T>>) -> Env<T> {
        Self::new(Some(parent.clone()))
    }

    // Look up an identifier from anywhere in our scope chain.
    pub fn get(&self, key: &str) -> Option<T> {
        if let Some(value) = self.scope.borrow().get(key) {
            Some(value.clone())
        } else if let Some(env) = &self.parent {
            env.get(key)
        } else {
            None
        }
    }

    // True if `key` is bound in this scope only (not an ancestor's).
    pub fn defined_locally(&self, key: &str) -> bool {
        self.scope.borrow().contains_key(key)
    }

    // Insert a value in the current scope.
    pub fn define(&self, key: &str, value: T) {
        self.scope.borrow_mut().insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_falls_back_to_parent() {
        let root = Rc::new(Env::root());
        root.define("x", 1i64);
        let child = Env::chain(&root);
        child.define("y", 2i64);
        assert_eq!(child.get("x"), Some(1));
        assert_eq!(child.get("y"), Some(2));
        assert_eq!(root.get("y"), None);
    }

    #[test]
    fn shadowing_prefers_innermost() {
        let root = Rc::new(Env::root());
        root.define("x", 1i64);
        let child = Env::chain(&root);
        child.define("x", 2i64);
        assert_eq!(child.get("x"), Some(2));
        assert_eq!(root.get("x"), Some(1));
    }
}
