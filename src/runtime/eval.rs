//! # Evaluator
//!
//! Walks [`CompiledForm`]s against a [`Store`]: a chain of local frames rooted
//! at a namespace's value store.
//!
//! ## Tail Calls
//!
//! Every form in tail position is returned to the loop in [`Evaluator::eval`]
//! as a [`Trampoline::Eval`] instead of being evaluated by a nested call.
//! Only non-tail subforms (operands, tests, all but the last body form) grow
//! the native stack, so tail recursion runs in constant stack space.

use std::cell::RefCell;
use std::sync::{Arc, RwLock};

use im::{OrdMap, Vector};

use crate::compiler::CompiledForm;
use crate::runtime::namespace::Namespace;
use crate::runtime::{Closure, DynamicParameter, MacroTransformer, Procedure, Value};
use crate::syntax::Symbol;
use crate::{err_msg, TesseraError};

// ============================================================================
// STORES AND FRAMES
// ============================================================================

/// One activation of a `lambda`, `let` or `letrec`.
pub struct Frame {
    slots: RwLock<Vec<Option<Value>>>,
    parent: Option<Arc<Frame>>,
}

impl Frame {
    fn new(slots: Vec<Option<Value>>, parent: Option<Arc<Frame>>) -> Arc<Frame> {
        Arc::new(Frame {
            slots: RwLock::new(slots),
            parent,
        })
    }

    fn get(&self, slot: usize, name: &Symbol) -> Result<Value, TesseraError> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        match slots.get(slot) {
            Some(Some(value)) => Ok(value.clone()),
            Some(None) => Err(err_msg!(Eval, "`{name}` is used before its initialization")),
            None => Err(err_msg!(Internal, "frame has no slot {slot} for `{name}`")),
        }
    }

    fn set(&self, slot: usize, value: Value) -> Result<(), TesseraError> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        match slots.get_mut(slot) {
            Some(cell) => {
                *cell = Some(value);
                Ok(())
            }
            None => Err(err_msg!(Internal, "frame has no slot {slot}")),
        }
    }
}

/// Where compiled forms find their variables.
#[derive(Clone)]
pub struct Store {
    pub(crate) namespace: Arc<Namespace>,
    pub(crate) frame: Option<Arc<Frame>>,
}

impl Store {
    /// The store of a namespace's top level, with no local frames.
    pub fn top(namespace: Arc<Namespace>) -> Self {
        Store {
            namespace,
            frame: None,
        }
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    fn push(&self, slots: Vec<Option<Value>>) -> Store {
        Store {
            namespace: self.namespace.clone(),
            frame: Some(Frame::new(slots, self.frame.clone())),
        }
    }

    fn frame_at(&self, depth: usize) -> Result<&Arc<Frame>, TesseraError> {
        let mut frame = self.frame.as_ref();
        for _ in 0..depth {
            frame = frame.and_then(|f| f.parent.as_ref());
        }
        frame.ok_or_else(|| err_msg!(Internal, "no local frame at depth {depth}"))
    }
}

// ============================================================================
// EVALUATOR
// ============================================================================

/// What the trampoline does next.
pub enum Trampoline {
    Value(Value),
    Eval(Arc<CompiledForm>, Store),
}

/// Evaluation state for one thread of control: the dynamic parameter bindings.
#[derive(Default)]
pub struct Evaluator {
    dynamic: RefCell<Vec<(Arc<DynamicParameter>, Value)>>,
}

/// Pops parameter bindings on every exit path of a `parameterize` body.
struct ParameterizeGuard<'e> {
    evaluator: &'e Evaluator,
    depth: usize,
}

impl Drop for ParameterizeGuard<'_> {
    fn drop(&mut self) {
        self.evaluator.dynamic.borrow_mut().truncate(self.depth);
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluates `form`, running tail positions through the trampoline.
    pub fn eval(&self, form: &Arc<CompiledForm>, store: &Store) -> Result<Value, TesseraError> {
        let mut form = form.clone();
        let mut store = store.clone();
        loop {
            match self.step(&form, &store)? {
                Trampoline::Value(value) => return Ok(value),
                Trampoline::Eval(next, next_store) => {
                    form = next;
                    store = next_store;
                }
            }
        }
    }

    /// Applies `procedure` to `args` as a non-tail call.
    pub fn apply(&self, procedure: &Value, args: Vec<Value>) -> Result<Value, TesseraError> {
        match self.apply_tail(procedure, args)? {
            Trampoline::Value(value) => Ok(value),
            Trampoline::Eval(body, store) => self.eval(&body, &store),
        }
    }

    /// Current value of a dynamic parameter.
    pub fn parameter_value(&self, parameter: &Arc<DynamicParameter>) -> Value {
        self.dynamic
            .borrow()
            .iter()
            .rev()
            .find(|(p, _)| Arc::ptr_eq(p, parameter))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| parameter.default_value().clone())
    }

    fn apply_tail(&self, procedure: &Value, args: Vec<Value>) -> Result<Trampoline, TesseraError> {
        let Value::Procedure(procedure) = procedure else {
            return Err(err_msg!(
                Eval,
                "cannot apply a {} value: {}",
                procedure.type_name(),
                procedure
            ));
        };
        procedure.arity().check(&procedure.identify(), args.len())?;
        match procedure {
            Procedure::Native(native) => native.call(&args).map(Trampoline::Value),
            Procedure::Parameter(parameter) => Ok(Trampoline::Value(self.parameter_value(parameter))),
            Procedure::Closure(closure) => Ok(Trampoline::Eval(
                closure.template.body.clone(),
                closure_store(closure, args),
            )),
        }
    }

    fn step(&self, form: &CompiledForm, store: &Store) -> Result<Trampoline, TesseraError> {
        let value = match form {
            CompiledForm::Constant(value) => value.clone(),
            CompiledForm::Void => Value::Void,

            CompiledForm::LocalRef { depth, slot, name } => store.frame_at(*depth)?.get(*slot, name)?,
            CompiledForm::TopRef { address, name } => store.namespace.lookup_address(*address, name)?,
            CompiledForm::ImportRef {
                module,
                address,
                name,
            } => store.namespace.lookup_import(*module, *address, name)?,
            CompiledForm::FreeTopRef { name, origin } => store
                .namespace
                .lookup_name(name)
                .map_err(|e| match e {
                    TesseraError::UnboundIdentifier { name, .. } => TesseraError::unbound(
                        name,
                        crate::diagnostics::ErrorContext::for_syntax(origin),
                    ),
                    other => other,
                })?,

            CompiledForm::LocalSet { depth, slot, value } => {
                let value = self.eval(value, store)?;
                store.frame_at(*depth)?.set(*slot, value)?;
                Value::Void
            }
            CompiledForm::TopSet { address, value } => {
                let value = self.eval(value, store)?;
                store.namespace.set(*address, value);
                Value::Void
            }
            CompiledForm::Define {
                name,
                address,
                value,
            } => {
                let value = self.eval(value, store)?;
                value.infer_name(name.as_str());
                store.namespace.set(*address, value);
                Value::Void
            }
            CompiledForm::DefineSyntax {
                name,
                address,
                value,
                origin,
            } => {
                let transformer = match self.eval(value, store)? {
                    Value::Procedure(p) => Value::Macro(Arc::new(MacroTransformer::new(p))),
                    form @ (Value::Macro(_) | Value::Form(_)) => form,
                    other => {
                        return Err(TesseraError::Contract {
                            message: format!(
                                "define_syntax value is not a transformer: {}",
                                other.type_name()
                            ),
                            ctx: crate::diagnostics::ErrorContext::for_syntax(origin),
                            source: None,
                        })
                    }
                };
                transformer.infer_name(name.as_str());
                store.namespace.set(*address, transformer);
                Value::Void
            }

            CompiledForm::If {
                test,
                then,
                otherwise,
            } => {
                let branch = if self.eval(test, store)?.is_truthy() {
                    then
                } else {
                    otherwise
                };
                return Ok(Trampoline::Eval(branch.clone(), store.clone()));
            }
            CompiledForm::Sequence(forms) => {
                let Some((last, init)) = forms.split_last() else {
                    return Ok(Trampoline::Value(Value::Void));
                };
                for form in init {
                    self.eval(form, store)?;
                }
                return Ok(Trampoline::Eval(last.clone(), store.clone()));
            }
            CompiledForm::Lambda(template) => Value::Procedure(Procedure::Closure(Arc::new(
                Closure::new(template.clone(), store.clone()),
            ))),
            CompiledForm::Let { inits, body } => {
                let slots = inits
                    .iter()
                    .map(|init| self.eval(init, store).map(Some))
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(Trampoline::Eval(body.clone(), store.push(slots)));
            }
            CompiledForm::Letrec { inits, body } => {
                let inner = store.push(vec![None; inits.len()]);
                let frame = inner.frame_at(0)?.clone();
                for (slot, init) in inits.iter().enumerate() {
                    let value = self.eval(init, &inner)?;
                    frame.set(slot, value)?;
                }
                return Ok(Trampoline::Eval(body.clone(), inner));
            }
            CompiledForm::Apply {
                procedure,
                args,
                call,
            } => {
                let procedure = self.eval(procedure, store)?;
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg, store))
                    .collect::<Result<Vec<_>, _>>()?;
                return self.apply_tail(&procedure, args).map_err(|mut e| {
                    if e.span().is_none() {
                        e.add_context(call);
                    }
                    e
                });
            }
            CompiledForm::Parameterize { bindings, body } => {
                let mut pushed = Vec::with_capacity(bindings.len());
                for (parameter, value) in bindings {
                    let parameter = match self.eval(parameter, store)? {
                        Value::Procedure(Procedure::Parameter(p)) => p,
                        other => {
                            return Err(err_msg!(
                                Contract,
                                "parameterize expects a parameter, got {}",
                                other.type_name()
                            ))
                        }
                    };
                    pushed.push((parameter, self.eval(value, store)?));
                }
                let guard = ParameterizeGuard {
                    evaluator: self,
                    depth: self.dynamic.borrow().len(),
                };
                self.dynamic.borrow_mut().extend(pushed);
                let result = self.eval(body, store);
                drop(guard);
                result?
            }
            CompiledForm::ListLiteral(elements) => Value::List(
                elements
                    .iter()
                    .map(|e| self.eval(e, store))
                    .collect::<Result<Vector<_>, _>>()?,
            ),
            CompiledForm::StructLiteral(fields) => {
                let mut map = OrdMap::new();
                for (key, value) in fields {
                    map.insert(key.clone(), self.eval(value, store)?);
                }
                Value::Struct(map)
            }
        };
        Ok(Trampoline::Value(value))
    }
}

/// The store a closure's body runs in, with `args` bound to its parameters.
fn closure_store(closure: &Closure, args: Vec<Value>) -> Store {
    let template = &closure.template;
    let mut slots: Vec<Option<Value>> = Vec::with_capacity(template.frame_size());
    if template.rest {
        let mut args = args.into_iter();
        slots.extend(args.by_ref().take(template.required).map(Some));
        slots.push(Some(Value::List(args.collect())));
    } else {
        slots.extend(args.into_iter().map(Some));
    }
    closure.store.push(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::LambdaTemplate;
    use crate::runtime::namespace::NamespaceKind;
    use crate::runtime::registry::ModuleId;

    fn store() -> Store {
        Store::top(Namespace::new(ModuleId::new("/eval-test"), NamespaceKind::TopLevel))
    }

    fn countdown() -> Arc<LambdaTemplate> {
        // (lambda (n) (if n (self (- n 1)) 'done)), with `self` and `-` supplied
        // through an enclosing frame at depth 1.
        let n = || Arc::new(CompiledForm::LocalRef {
            depth: 0,
            slot: 0,
            name: Symbol::new("n"),
        });
        let outer = |slot| Arc::new(CompiledForm::LocalRef {
            depth: 1,
            slot,
            name: Symbol::new("outer"),
        });
        let is_zero = Arc::new(CompiledForm::Apply {
            procedure: outer(2),
            args: vec![n()],
            call: crate::syntax::Syntax::identifier("zero?"),
        });
        let decrement = Arc::new(CompiledForm::Apply {
            procedure: outer(1),
            args: vec![n()],
            call: crate::syntax::Syntax::identifier("dec"),
        });
        let recur = Arc::new(CompiledForm::Apply {
            procedure: outer(0),
            args: vec![decrement],
            call: crate::syntax::Syntax::identifier("loop"),
        });
        Arc::new(LambdaTemplate {
            name: Some(Symbol::new("loop")),
            required: 1,
            rest: false,
            body: Arc::new(CompiledForm::If {
                test: is_zero,
                then: Arc::new(CompiledForm::Constant(Value::symbol("done"))),
                otherwise: recur,
            }),
        })
    }

    #[test]
    fn tail_calls_run_in_constant_stack() {
        let dec = Procedure::native(
            "dec",
            crate::runtime::Arity::exact(1),
            Arc::new(|args| Ok(Value::Int(args[0].as_int().unwrap_or(0) - 1))),
        );
        let is_zero = Procedure::native(
            "is_zero",
            crate::runtime::Arity::exact(1),
            Arc::new(|args| Ok(Value::Bool(args[0].as_int() == Some(0)))),
        );
        let program = Arc::new(CompiledForm::Letrec {
            inits: vec![
                Arc::new(CompiledForm::Lambda(countdown())),
                Arc::new(CompiledForm::Constant(Value::Procedure(dec))),
                Arc::new(CompiledForm::Constant(Value::Procedure(is_zero))),
            ],
            body: Arc::new(CompiledForm::Apply {
                procedure: Arc::new(CompiledForm::LocalRef {
                    depth: 0,
                    slot: 0,
                    name: Symbol::new("loop"),
                }),
                args: vec![Arc::new(CompiledForm::Constant(Value::Int(1_000_000)))],
                call: crate::syntax::Syntax::identifier("loop"),
            }),
        });
        let result = Evaluator::new().eval(&program, &store()).unwrap();
        assert_eq!(result, Value::symbol("done"));
    }

    #[test]
    fn parameter_bindings_are_restored_after_errors() {
        let parameter = Arc::new(DynamicParameter::new(Value::Int(1)));
        let evaluator = Evaluator::new();
        let failing = Arc::new(CompiledForm::Parameterize {
            bindings: vec![(
                Arc::new(CompiledForm::Constant(Value::Procedure(Procedure::Parameter(
                    parameter.clone(),
                )))),
                Arc::new(CompiledForm::Constant(Value::Int(2))),
            )],
            body: Arc::new(CompiledForm::TopRef {
                address: 0,
                name: Symbol::new("missing"),
            }),
        });
        assert!(evaluator.eval(&failing, &store()).is_err());
        assert_eq!(evaluator.parameter_value(&parameter), Value::Int(1));
    }

    #[test]
    fn letrec_slots_read_before_initialization_fail() {
        let program = Arc::new(CompiledForm::Letrec {
            inits: vec![Arc::new(CompiledForm::LocalRef {
                depth: 0,
                slot: 0,
                name: Symbol::new("x"),
            })],
            body: Arc::new(CompiledForm::Void),
        });
        let err = Evaluator::new().eval(&program, &store()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Eval);
    }

    #[test]
    fn applying_a_non_procedure_fails() {
        let err = Evaluator::new()
            .apply(&Value::Int(3), vec![])
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Eval);
    }
}
