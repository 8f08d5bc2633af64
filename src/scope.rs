//! Lexical resolution: scopes are signals holding an environment record
//! plus a symbol table.
//!
//! `var` declarations hoist to the nearest function/module frame; `let` and
//! `const` bind in place and conflict on redeclaration from a different
//! declaration site. Every write goes through the signal layer so dependent
//! units reschedule like for any other mutation.

use crate::arena::{ScopeKind, SignalId, SignalKind, UnitId};
use crate::error::{Error, Result};
use crate::value::{Key, Value};

/// Declaration kind of a binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeclKind {
    /// Function-scoped, hoisted.
    Var,
    /// Block-scoped.
    Let,
    /// Block-scoped, write-once.
    Const,
}

/// Symbol-table entry for one declared name.
#[derive(Clone, Debug)]
pub struct Symbol {
    /// How the name was declared.
    pub kind: DeclKind,
    /// Declaration-site identity; a `let` redeclared from a different
    /// serial conflicts.
    pub serial: u64,
    /// Live destructuring reader committing into this binding, if any.
    pub reader: Option<UnitId>,
}

impl SignalId {
    /// The scope kind of this signal, `None` for non-scope signals.
    pub fn scope_kind(self) -> Option<ScopeKind> {
        self.with(|m| match m.kind {
            SignalKind::Scope(kind) => Some(kind),
            _ => None,
        })
        .flatten()
    }

    fn scope_context(self) -> Option<SignalId> {
        self.with(|m| m.context).flatten()
    }

    /// Walk the context chain from this scope to the first frame whose
    /// state already holds `name`.
    pub fn resolve(self, name: &str) -> Result<SignalId> {
        let key = Key::from(name);
        let mut cur = Some(self);
        while let Some(scope) = cur {
            let holds = scope
                .with(|m| m.state.read().get(&key).is_some())
                .unwrap_or(false);
            if holds {
                return Ok(scope);
            }
            cur = scope.scope_context();
        }
        Err(Error::Unresolved { name: name.to_owned() })
    }

    /// Like [`resolve`](Self::resolve), but a failed lookup yields `None`.
    /// Used where a best-effort type-check hint suppresses the error.
    pub fn resolve_lenient(self, name: &str) -> Option<SignalId> {
        self.resolve(name).ok()
    }

    /// Symbol-table entry for `name` on this frame.
    pub fn symbol(self, name: &str) -> Option<Symbol> {
        self.with(|m| m.symbols.read().get(name).cloned()).flatten()
    }

    pub(crate) fn put_symbol(self, name: &str, symbol: Symbol) {
        self.with(|m| m.symbols.write().insert(name.to_owned(), symbol));
    }

    /// Declare `name` on this frame (or, for `var`, on the nearest
    /// function/module ancestor), enforcing the redeclaration rules.
    ///
    /// Returns the frame the binding landed on.
    pub fn declare(self, name: &str, kind: DeclKind, serial: u64, value: Value) -> Result<SignalId> {
        let target = match kind {
            DeclKind::Var => self.hoist_target(name),
            DeclKind::Let | DeclKind::Const => self,
        };

        if let Some(existing) = target.symbol(name) {
            let conflict = existing.kind != kind
                || (matches!(kind, DeclKind::Let | DeclKind::Const) && existing.serial != serial);
            if conflict {
                return Err(Error::DeclarationConflict { name: name.to_owned() });
            }
        }

        target.write_path(&[Key::from(name)], Some(value))?;
        target.put_symbol(name, Symbol { kind, serial, reader: None });
        Ok(target)
    }

    /// Assign `name` in its defining frame; constants reject the write
    /// before any state mutation occurs.
    pub fn update(self, name: &str, value: Value) -> Result<()> {
        let frame = self.resolve(name)?;
        if frame.symbol(name).is_some_and(|s| s.kind == DeclKind::Const) {
            return Err(Error::AssignmentToConstant { name: name.to_owned() });
        }
        frame.write_path(&[Key::from(name)], Some(value))
    }

    /// Nearest function/module ancestor frame, or the first ancestor
    /// already holding `name` (an earlier hoisted declaration wins).
    fn hoist_target(self, name: &str) -> SignalId {
        let key = Key::from(name);
        let mut cur = self;
        loop {
            let holds = cur
                .with(|m| m.state.read().get(&key).is_some())
                .unwrap_or(false);
            let kind = cur.scope_kind();
            if holds || matches!(kind, Some(ScopeKind::Function | ScopeKind::Module)) {
                return cur;
            }
            match cur.scope_context() {
                Some(parent) if parent.scope_kind().is_some() => cur = parent,
                _ => return cur,
            }
        }
    }
}

/// Compute the destructured projection of `source`: the picked sub-paths
/// for one binding, or, for a rest binding, the source minus the excluded
/// keys.
pub fn project(source: &Value, picks: &[Key], rest_excludes: Option<&[String]>) -> Result<Value> {
    if !source.is_container() {
        return Err(Error::NotDestructurable { type_name: source.type_name() });
    }
    if let Some(excludes) = rest_excludes {
        return Ok(match source {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(k, _)| !excludes.iter().any(|e| e == *k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            Value::Array(items) => {
                let skip: usize = excludes.len();
                Value::Array(items.iter().skip(skip).cloned().collect())
            }
            _ => unreachable!(),
        });
    }
    let mut cur = source;
    for key in picks {
        match cur.get(key) {
            Some(next) => cur = next,
            None => return Ok(Value::Undefined),
        }
    }
    Ok(cur.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{SignalMetadata, signal_arena_insert};

    fn frame(kind: ScopeKind, context: Option<SignalId>) -> SignalId {
        signal_arena_insert(SignalMetadata::scope(kind, context))
    }

    #[test]
    fn var_hoists_to_function_frame() {
        let func = frame(ScopeKind::Function, None);
        let block = frame(ScopeKind::Block, Some(func));

        let landed = block.declare("a", DeclKind::Var, 1, Value::Number(1.0)).unwrap();
        assert_eq!(landed, func);
        assert_eq!(func.state().get(&Key::from("a")), Some(&Value::Number(1.0)));

        // A sibling block-scoped `let a` must not conflict.
        let sibling = frame(ScopeKind::Block, Some(func));
        sibling.declare("a", DeclKind::Let, 2, Value::Number(2.0)).unwrap();
    }

    #[test]
    fn let_redeclaration_from_other_site_conflicts() {
        let scope = frame(ScopeKind::Block, None);
        scope.declare("x", DeclKind::Let, 10, Value::Null).unwrap();
        // Same site re-executes cleanly.
        scope.declare("x", DeclKind::Let, 10, Value::Null).unwrap();

        let err = scope.declare("x", DeclKind::Let, 11, Value::Null).unwrap_err();
        assert!(matches!(err, Error::DeclarationConflict { .. }));

        let err = scope.declare("x", DeclKind::Var, 10, Value::Null).unwrap_err();
        assert!(matches!(err, Error::DeclarationConflict { .. }));
    }

    #[test]
    fn const_rejects_assignment_before_mutation() {
        let scope = frame(ScopeKind::Block, None);
        scope.declare("x", DeclKind::Const, 1, Value::Number(1.0)).unwrap();

        let err = scope.update("x", Value::Number(2.0)).unwrap_err();
        assert_eq!(err, Error::AssignmentToConstant { name: "x".into() });
        assert_eq!(scope.state().get(&Key::from("x")), Some(&Value::Number(1.0)));
    }

    #[test]
    fn resolve_walks_the_chain() {
        let module = frame(ScopeKind::Module, None);
        let inner = frame(ScopeKind::Block, Some(module));
        module.declare("top", DeclKind::Let, 1, Value::Bool(true)).unwrap();

        assert_eq!(inner.resolve("top").unwrap(), module);
        assert!(matches!(
            inner.resolve("missing"),
            Err(Error::Unresolved { .. })
        ));
        assert!(inner.resolve_lenient("missing").is_none());
    }

    #[test]
    fn projection_picks_and_rest() {
        let mut source = Value::object();
        source.set(&Key::from("a"), Value::Number(1.0));
        source.set(&Key::from("b"), Value::Number(2.0));
        source.set(&Key::from("c"), Value::Number(3.0));

        assert_eq!(project(&source, &[Key::from("b")], None).unwrap(), Value::Number(2.0));

        let rest = project(&source, &[], Some(&["a".to_owned()])).unwrap();
        assert_eq!(rest.get(&Key::from("a")), None);
        assert_eq!(rest.get(&Key::from("b")), Some(&Value::Number(2.0)));

        assert!(matches!(
            project(&Value::Number(1.0), &[], None),
            Err(Error::NotDestructurable { .. })
        ));
    }
}
