//! # Compiler
//!
//! Turns fully expanded syntax into [`CompiledForm`] trees in which every
//! identifier has become an address:
//!
//! | binding | compiled reference |
//! |---|---|
//! | lexical | [`CompiledForm::LocalRef`] `(depth, slot)` |
//! | defined in the compiling namespace | [`CompiledForm::TopRef`] `address` |
//! | defined elsewhere, or imported | [`CompiledForm::ImportRef`] `(module id, address)` |
//! | free, at top level | [`CompiledForm::FreeTopRef`] looked up by name at run time |
//!
//! A free reference inside a module body is an `UnboundIdentifier` failure.
//! Assignments to imported bindings are rejected here, before anything runs.

use std::sync::Arc;

use tracing::trace;

use crate::diagnostics::ErrorContext;
use crate::macros::forms::core_form;
use crate::runtime::binding::{Binding, Denotation, RibId};
use crate::runtime::namespace::Namespace;
use crate::runtime::{Arity, CoreForm, Value};
use crate::syntax::{Symbol, Syntax, SyntaxDatum};
use crate::{err_stx, TesseraError};

/// An executable form.
#[derive(Debug)]
pub enum CompiledForm {
    Constant(Value),
    Void,
    LocalRef {
        depth: usize,
        slot: usize,
        name: Symbol,
    },
    TopRef {
        address: usize,
        name: Symbol,
    },
    ImportRef {
        module: usize,
        address: usize,
        name: Symbol,
    },
    FreeTopRef {
        name: Symbol,
        origin: Syntax,
    },
    LocalSet {
        depth: usize,
        slot: usize,
        value: Arc<CompiledForm>,
    },
    TopSet {
        address: usize,
        value: Arc<CompiledForm>,
    },
    Define {
        name: Symbol,
        address: usize,
        value: Arc<CompiledForm>,
    },
    DefineSyntax {
        name: Symbol,
        address: usize,
        value: Arc<CompiledForm>,
        origin: Syntax,
    },
    If {
        test: Arc<CompiledForm>,
        then: Arc<CompiledForm>,
        otherwise: Arc<CompiledForm>,
    },
    Sequence(Vec<Arc<CompiledForm>>),
    Lambda(Arc<LambdaTemplate>),
    Let {
        inits: Vec<Arc<CompiledForm>>,
        body: Arc<CompiledForm>,
    },
    Letrec {
        inits: Vec<Arc<CompiledForm>>,
        body: Arc<CompiledForm>,
    },
    Apply {
        procedure: Arc<CompiledForm>,
        args: Vec<Arc<CompiledForm>>,
        call: Syntax,
    },
    Parameterize {
        bindings: Vec<(Arc<CompiledForm>, Arc<CompiledForm>)>,
        body: Arc<CompiledForm>,
    },
    ListLiteral(Vec<Arc<CompiledForm>>),
    StructLiteral(Vec<(Arc<str>, Arc<CompiledForm>)>),
}

/// The compiled shape of a `lambda`.
#[derive(Debug)]
pub struct LambdaTemplate {
    pub name: Option<Symbol>,
    /// Number of positional parameters.
    pub required: usize,
    /// Whether extra arguments are collected into a final list parameter.
    pub rest: bool,
    pub body: Arc<CompiledForm>,
}

impl LambdaTemplate {
    pub fn arity(&self) -> Arity {
        if self.rest {
            Arity::at_least(self.required)
        } else {
            Arity::exact(self.required)
        }
    }

    pub fn frame_size(&self) -> usize {
        self.required + usize::from(self.rest)
    }
}

/// Compiles one fully expanded form against `namespace`.
pub fn compile(namespace: &Arc<Namespace>, form: &Syntax) -> Result<Arc<CompiledForm>, TesseraError> {
    let mut compiler = Compiler {
        namespace,
        scopes: Vec::new(),
    };
    compiler.compile(form).map(Arc::new)
}

struct Compiler<'a> {
    namespace: &'a Arc<Namespace>,
    /// Frames from outermost to innermost; `None` for a frame with no binders.
    scopes: Vec<Option<RibId>>,
}

impl Compiler<'_> {
    fn compile(&mut self, form: &Syntax) -> Result<CompiledForm, TesseraError> {
        match form.datum() {
            SyntaxDatum::Symbol(_) => self.compile_reference(form),
            SyntaxDatum::Sexp(_) => self.compile_sexp(form),
            SyntaxDatum::List(_) => {
                let elements = form.list_elements().unwrap_or_default();
                Ok(CompiledForm::ListLiteral(self.compile_all(&elements)?))
            }
            SyntaxDatum::Struct(_) => {
                let mut fields = Vec::new();
                for (key, value) in form.struct_fields().unwrap_or_default() {
                    fields.push((key, self.compile_arc(&value)?));
                }
                Ok(CompiledForm::StructLiteral(fields))
            }
            _ => Ok(CompiledForm::Constant(form.to_datum())),
        }
    }

    fn compile_arc(&mut self, form: &Syntax) -> Result<Arc<CompiledForm>, TesseraError> {
        self.compile(form).map(Arc::new)
    }

    fn compile_all(&mut self, forms: &[Syntax]) -> Result<Vec<Arc<CompiledForm>>, TesseraError> {
        forms.iter().map(|f| self.compile_arc(f)).collect()
    }

    /// A body: every form but the last for effect, the last in tail position.
    fn compile_sequence(&mut self, forms: &[Syntax]) -> Result<CompiledForm, TesseraError> {
        match forms {
            [] => Ok(CompiledForm::Void),
            [single] => self.compile(single),
            _ => Ok(CompiledForm::Sequence(self.compile_all(forms)?)),
        }
    }

    fn compile_body(&mut self, forms: &[Syntax]) -> Result<Arc<CompiledForm>, TesseraError> {
        self.compile_sequence(forms).map(Arc::new)
    }

    fn compile_sexp(&mut self, form: &Syntax) -> Result<CompiledForm, TesseraError> {
        let parts = form.subforms().unwrap_or_default();
        let Some(head) = parts.first() else {
            return Err(err_stx!(Syntax, form, "empty form is not an expression"));
        };
        let Some(core) = core_form(self.namespace, head) else {
            let procedure = self.compile_arc(head)?;
            let args = self.compile_all(&parts[1..])?;
            return Ok(CompiledForm::Apply {
                procedure,
                args,
                call: form.clone(),
            });
        };

        match core {
            CoreForm::Quote => Ok(CompiledForm::Constant(operand(form, &parts, 1)?.to_datum())),
            CoreForm::QuoteSyntax => Ok(CompiledForm::Constant(Value::Syntax(
                operand(form, &parts, 1)?.clone(),
            ))),
            CoreForm::If => Ok(CompiledForm::If {
                test: self.compile_arc(operand(form, &parts, 1)?)?,
                then: self.compile_arc(operand(form, &parts, 2)?)?,
                otherwise: self.compile_arc(operand(form, &parts, 3)?)?,
            }),
            CoreForm::Begin => self.compile_sequence(&parts[1..]),
            CoreForm::Lambda => self
                .compile_lambda(form, &parts, None)
                .map(|t| CompiledForm::Lambda(Arc::new(t))),
            CoreForm::Let => self.compile_let(form, &parts, false),
            CoreForm::Letrec => self.compile_let(form, &parts, true),
            CoreForm::Set => self.compile_set(form, &parts),
            CoreForm::Define => self.compile_define(form, &parts),
            CoreForm::DefineSyntax => {
                let (name, address) = self.defined_address(operand(form, &parts, 1)?)?;
                Ok(CompiledForm::DefineSyntax {
                    name,
                    address,
                    value: self.compile_arc(operand(form, &parts, 2)?)?,
                    origin: form.clone(),
                })
            }
            CoreForm::Parameterize => self.compile_parameterize(form, &parts),
            // Fully handled during expansion.
            CoreForm::Module | CoreForm::Require | CoreForm::Provide => Ok(CompiledForm::Void),
        }
    }

    // ------------------------------------------------------------------------
    // References and assignment
    // ------------------------------------------------------------------------

    fn compile_reference(&mut self, id: &Syntax) -> Result<CompiledForm, TesseraError> {
        let name = id.as_symbol().cloned().unwrap_or_else(|| Symbol::new("?"));
        let denotation = id
            .resolve()
            .unwrap_or_else(|| Binding::Free(name.clone()))
            .denotation();
        match denotation {
            Denotation::Free(name) => {
                if self.namespace.allows_free_references() {
                    trace!(%name, "free top-level reference");
                    Ok(CompiledForm::FreeTopRef {
                        name,
                        origin: id.clone(),
                    })
                } else {
                    Err(TesseraError::unbound(name.as_str(), ErrorContext::for_syntax(id)))
                }
            }
            Denotation::Local(local) => {
                let depth = self.depth_of(local.rib, id)?;
                Ok(CompiledForm::LocalRef {
                    depth,
                    slot: local.slot,
                    name,
                })
            }
            Denotation::Defined(target) if target.namespace_id() == self.namespace.id() => {
                Ok(CompiledForm::TopRef {
                    address: target.address(),
                    name,
                })
            }
            Denotation::Defined(target) => Ok(CompiledForm::ImportRef {
                module: self.namespace.required_module_address(&target)?,
                address: target.address(),
                name,
            }),
            Denotation::Required(required) => {
                let target = required.target();
                if target.namespace_id() == self.namespace.id() {
                    return Ok(CompiledForm::TopRef {
                        address: target.address(),
                        name,
                    });
                }
                Ok(CompiledForm::ImportRef {
                    module: self.namespace.required_module_address(target)?,
                    address: target.address(),
                    name,
                })
            }
        }
    }

    fn depth_of(&self, rib: RibId, id: &Syntax) -> Result<usize, TesseraError> {
        self.scopes
            .iter()
            .rev()
            .position(|scope| *scope == Some(rib))
            .ok_or_else(|| err_stx!(Syntax, id, "identifier used outside the scope that binds it"))
    }

    fn compile_set(&mut self, form: &Syntax, parts: &[Syntax]) -> Result<CompiledForm, TesseraError> {
        let target = operand(form, parts, 1)?;
        let value = self.compile_arc(operand(form, parts, 2)?)?;
        let Some(name) = target.as_symbol().cloned() else {
            return Err(err_stx!(Syntax, target, "set! expects an identifier"));
        };
        match target.resolve().map(|b| b.denotation()) {
            Some(Denotation::Local(local)) => Ok(CompiledForm::LocalSet {
                depth: self.depth_of(local.rib, target)?,
                slot: local.slot,
                value,
            }),
            Some(Denotation::Defined(d)) if d.namespace_id() == self.namespace.id() => {
                Ok(CompiledForm::TopSet {
                    address: d.address(),
                    value,
                })
            }
            Some(Denotation::Defined(_)) | Some(Denotation::Required(_)) => Err(TesseraError::Contract {
                message: format!("Mutation of imported binding is not allowed: `{name}`"),
                ctx: ErrorContext::for_syntax(form),
                source: None,
            }),
            Some(Denotation::Free(_)) | None => Err(TesseraError::unbound(
                name.as_str(),
                ErrorContext::for_syntax(target),
            )),
        }
    }

    // ------------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------------

    /// The address reserved for a predefined identifier.
    fn defined_address(&self, id: &Syntax) -> Result<(Symbol, usize), TesseraError> {
        match id.resolve().map(|b| b.denotation()) {
            Some(Denotation::Defined(d)) if d.namespace_id() == self.namespace.id() => {
                Ok((d.name().clone(), d.address()))
            }
            _ => Err(err_stx!(
                Syntax,
                id,
                "definition target is not a definition of this namespace"
            )),
        }
    }

    fn compile_define(&mut self, form: &Syntax, parts: &[Syntax]) -> Result<CompiledForm, TesseraError> {
        let (name, address) = self.defined_address(operand(form, parts, 1)?)?;
        let value_form = operand(form, parts, 2)?;
        let value = match self.lambda_parts(value_form) {
            Some(lambda_parts) => Arc::new(CompiledForm::Lambda(Arc::new(self.compile_lambda(
                value_form,
                &lambda_parts,
                Some(name.clone()),
            )?))),
            None => self.compile_arc(value_form)?,
        };
        Ok(CompiledForm::Define {
            name,
            address,
            value,
        })
    }

    fn lambda_parts(&self, form: &Syntax) -> Option<Vec<Syntax>> {
        let parts = form.subforms()?;
        match core_form(self.namespace, parts.first()?) {
            Some(CoreForm::Lambda) => Some(parts),
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Binding forms
    // ------------------------------------------------------------------------

    fn with_scope<T>(
        &mut self,
        binders: &[Syntax],
        body: impl FnOnce(&mut Self) -> Result<T, TesseraError>,
    ) -> Result<T, TesseraError> {
        let rib = match binders.first() {
            Some(first) => match first.resolve() {
                Some(Binding::Local(local)) => Some(local.rib),
                _ => return Err(err_stx!(Syntax, first, "binder was not renamed by expansion")),
            },
            None => None,
        };
        self.scopes.push(rib);
        let result = body(self);
        self.scopes.pop();
        result
    }

    fn compile_lambda(
        &mut self,
        form: &Syntax,
        parts: &[Syntax],
        name: Option<Symbol>,
    ) -> Result<LambdaTemplate, TesseraError> {
        let formals = operand(form, parts, 1)?;
        let (binders, rest) = if formals.is_identifier() {
            (vec![formals.clone()], true)
        } else {
            (formals.subforms().unwrap_or_default(), false)
        };
        let required = if rest { 0 } else { binders.len() };
        let body = self.with_scope(&binders, |c| c.compile_body(&parts[2..]))?;
        Ok(LambdaTemplate {
            name,
            required,
            rest,
            body,
        })
    }

    fn compile_let(
        &mut self,
        form: &Syntax,
        parts: &[Syntax],
        recursive: bool,
    ) -> Result<CompiledForm, TesseraError> {
        let clauses = operand(form, parts, 1)?.subforms().unwrap_or_default();
        let mut binders = Vec::with_capacity(clauses.len());
        let mut init_forms = Vec::with_capacity(clauses.len());
        for clause in &clauses {
            let pair = clause.subforms().unwrap_or_default();
            let [binder, init] = pair.as_slice() else {
                return Err(err_stx!(Syntax, clause, "expected a (name value) binding clause"));
            };
            binders.push(binder.clone());
            init_forms.push(init.clone());
        }

        if recursive {
            let (inits, body) = self.with_scope(&binders, |c| {
                Ok((c.compile_all(&init_forms)?, c.compile_body(&parts[2..])?))
            })?;
            Ok(CompiledForm::Letrec { inits, body })
        } else {
            let inits = self.compile_all(&init_forms)?;
            let body = self.with_scope(&binders, |c| c.compile_body(&parts[2..]))?;
            Ok(CompiledForm::Let { inits, body })
        }
    }

    fn compile_parameterize(
        &mut self,
        form: &Syntax,
        parts: &[Syntax],
    ) -> Result<CompiledForm, TesseraError> {
        let clauses = operand(form, parts, 1)?.subforms().unwrap_or_default();
        let mut bindings = Vec::with_capacity(clauses.len());
        for clause in &clauses {
            let pair = clause.subforms().unwrap_or_default();
            let [parameter, value] = pair.as_slice() else {
                return Err(err_stx!(Syntax, clause, "expected a (parameter value) clause"));
            };
            bindings.push((self.compile_arc(parameter)?, self.compile_arc(value)?));
        }
        let body = self.compile_body(&parts[2..])?;
        Ok(CompiledForm::Parameterize { bindings, body })
    }
}

fn operand<'s>(form: &Syntax, parts: &'s [Syntax], index: usize) -> Result<&'s Syntax, TesseraError> {
    parts
        .get(index)
        .ok_or_else(|| err_stx!(Syntax, form, "malformed core form"))
}
