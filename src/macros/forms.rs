//! Expansion rules of the kernel's core forms.
//!
//! | form | shape |
//! |---|---|
//! | `quote`, `quote_syntax` | `(quote DATUM)` |
//! | `if` | `(if TEST THEN ELSE)` |
//! | `begin` | `(begin FORM...)` |
//! | `lambda` | `(lambda (ID...) BODY...+)` or `(lambda ID BODY...+)` |
//! | `let` | `(let ((ID EXPR)...) BODY...+)` or `(let NAME ((ID EXPR)...) BODY...+)` |
//! | `letrec` | `(letrec ((ID EXPR)...) BODY...+)` |
//! | `set!` | `(set! ID EXPR)` |
//! | `define` | `(define ID EXPR)`, `(define ID "doc" EXPR)`, `(define (ID ARG...) BODY...+)` |
//! | `define_syntax` | `(define_syntax ID EXPR)` |
//! | `parameterize` | `(parameterize ((PARAM EXPR)...) BODY...+)` |
//! | `module` | `(module NAME FORM...)`, top level only |
//! | `require` | `(require SPEC...)`; SPEC is a path, `(only_in PATH ID...)` or `(rename_in PATH (EXPORTED LOCAL)...)` |
//! | `provide` | `(provide SPEC...)` in a module; SPEC is an identifier or `(all_defined_out)` |

use std::sync::Arc;

use tracing::debug;

use crate::diagnostics::ErrorContext;
use crate::macros::{ExpandContext, Expander};
use crate::runtime::binding::{Binding, ProvidedBinding, Rib};
use crate::runtime::namespace::Namespace;
use crate::runtime::registry::{LoadingGuard, ModuleInstance};
use crate::runtime::{CoreForm, Value};
use crate::syntax::{Syntax, SyntaxDatum, Wrap};
use crate::{err_stx, TesseraError};

// ============================================================================
// HEAD DISPATCH
// ============================================================================

/// Expansion-time value of the identifier `head`, if it denotes a
/// namespace-level binding whose value is already known.
pub(crate) fn head_value(namespace: &Namespace, head: &Syntax) -> Option<Value> {
    if !head.is_identifier() {
        return None;
    }
    match head.resolve()? {
        Binding::Local(_) | Binding::Free(_) => None,
        binding => namespace.lookup(&binding),
    }
}

/// The core form `head` denotes, if any.
pub(crate) fn core_form(namespace: &Namespace, head: &Syntax) -> Option<CoreForm> {
    match head_value(namespace, head)? {
        Value::Form(form) => Some(form),
        _ => None,
    }
}

pub(crate) fn expand_core(
    ex: &Expander,
    core: CoreForm,
    form: &Syntax,
    parts: &[Syntax],
    ctx: ExpandContext,
) -> Result<Syntax, TesseraError> {
    match core {
        CoreForm::Quote | CoreForm::QuoteSyntax => {
            expect_count(form, parts, 2, "expects exactly one datum")?;
            Ok(form.clone())
        }
        CoreForm::If => {
            expect_count(form, parts, 4, "expects a test, a then branch and an else branch")?;
            let mut expanded = vec![parts[0].clone()];
            expanded.extend(ex.expand_all(&parts[1..])?);
            Ok(form.rebuild_sexp(expanded))
        }
        CoreForm::Begin => {
            let mut expanded = vec![parts[0].clone()];
            for part in &parts[1..] {
                expanded.push(ex.expand(part, ctx)?);
            }
            Ok(form.rebuild_sexp(expanded))
        }
        CoreForm::Lambda => expand_lambda(ex, form, parts),
        CoreForm::Let => expand_let(ex, form, parts),
        CoreForm::Letrec => expand_letrec(ex, form, parts),
        CoreForm::Set => {
            expect_count(form, parts, 3, "expects an identifier and a value")?;
            if !parts[1].is_identifier() {
                return Err(err_stx!(Syntax, &parts[1], "set! expects an identifier"));
            }
            let value = ex.expand(&parts[2], ExpandContext::Expression)?;
            Ok(form.rebuild_sexp(vec![parts[0].clone(), parts[1].clone(), value]))
        }
        CoreForm::Define => {
            require_definition_context(form, ctx, "define")?;
            // Module bodies reserve their definitions during the first pass.
            let normalized = if ctx == ExpandContext::ModuleBody {
                form.clone()
            } else {
                predefine_definition(ex, form)?
            };
            match normalized.subforms().as_deref() {
                Some([head, id, value]) => {
                    let value = ex.expand(value, ExpandContext::Expression)?;
                    Ok(normalized.rebuild_sexp(vec![head.clone(), id.clone(), value]))
                }
                _ => Err(err_stx!(Syntax, form, "define expects an identifier and a value")),
            }
        }
        CoreForm::DefineSyntax => {
            require_definition_context(form, ctx, "define_syntax")?;
            expect_count(form, parts, 3, "expects an identifier and a transformer")?;
            let id = ex.namespace().predefine(&parts[1])?;
            let value = ex.expand(&parts[2], ExpandContext::Expression)?;
            Ok(form.rebuild_sexp(vec![parts[0].clone(), id, value]))
        }
        CoreForm::Parameterize => expand_parameterize(ex, form, parts),
        CoreForm::Module => {
            if ctx != ExpandContext::TopLevel {
                return Err(err_stx!(
                    Syntax,
                    form,
                    "module declarations are only allowed at top level"
                ));
            }
            expand_module(ex, form, parts)
        }
        CoreForm::Require => {
            require_definition_context(form, ctx, "require")?;
            for spec in &parts[1..] {
                expand_require_spec(ex, spec)?;
            }
            Ok(form.clone())
        }
        CoreForm::Provide => {
            if ctx != ExpandContext::ModuleBody {
                return Err(err_stx!(Syntax, form, "provide is only allowed in a module body"));
            }
            for spec in &parts[1..] {
                expand_provide_spec(ex, spec)?;
            }
            Ok(form.clone())
        }
    }
}

fn expect_count(form: &Syntax, parts: &[Syntax], count: usize, what: &str) -> Result<(), TesseraError> {
    if parts.len() == count {
        return Ok(());
    }
    Err(err_stx!(Syntax, form, "{} {what}", form_name(parts)))
}

fn expect_body(form: &Syntax, parts: &[Syntax], first_body: usize) -> Result<(), TesseraError> {
    if parts.len() > first_body {
        return Ok(());
    }
    Err(err_stx!(Syntax, form, "{} requires a body", form_name(parts)))
}

fn form_name(parts: &[Syntax]) -> String {
    parts
        .first()
        .and_then(Syntax::as_symbol)
        .map_or_else(|| "form".to_string(), |s| s.to_string())
}

fn require_definition_context(form: &Syntax, ctx: ExpandContext, what: &str) -> Result<(), TesseraError> {
    if ctx.allows_definitions() {
        return Ok(());
    }
    Err(err_stx!(
        Syntax,
        form,
        "{what} is only allowed at top level or in a module body"
    ))
}

// ============================================================================
// BINDING FORMS
// ============================================================================

/// Parses `(ID EXPR)` clauses.
fn binding_clauses(clauses: &Syntax) -> Result<Vec<(Syntax, Syntax)>, TesseraError> {
    let Some(items) = clauses.subforms() else {
        return Err(err_stx!(Syntax, clauses, "expected a sequence of binding clauses"));
    };
    items
        .iter()
        .map(|clause| match clause.subforms().as_deref() {
            Some([id, init]) if id.is_identifier() => Ok((id.clone(), init.clone())),
            _ => Err(err_stx!(Syntax, clause, "expected a (name value) binding clause")),
        })
        .collect()
}

fn renamed(forms: &[Syntax], rib: &Arc<Rib>) -> Vec<Syntax> {
    forms
        .iter()
        .map(|f| f.add_wrap(Wrap::Rename(rib.clone())))
        .collect()
}

fn rebuild_clauses(site: &Syntax, ids: Vec<Syntax>, inits: Vec<Syntax>) -> Syntax {
    site.rebuild_sexp(
        ids.into_iter()
            .zip(inits)
            .map(|(id, init)| Syntax::sexp(vec![id, init], site.span()))
            .collect(),
    )
}

fn expand_lambda(ex: &Expander, form: &Syntax, parts: &[Syntax]) -> Result<Syntax, TesseraError> {
    if parts.len() < 2 {
        return Err(err_stx!(Syntax, form, "lambda expects formals and a body"));
    }
    expect_body(form, parts, 2)?;
    let formals = &parts[1];
    let binders = if formals.is_identifier() {
        vec![formals.clone()]
    } else if let Some(items) = formals.subforms() {
        items
    } else {
        return Err(err_stx!(Syntax, formals, "lambda formals must be identifiers"));
    };
    let (rib, _) = Rib::new(&binders)?;
    let binders = renamed(&binders, &rib);
    let formals = if formals.is_identifier() {
        binders[0].clone()
    } else {
        formals.rebuild_sexp(binders)
    };
    let body = ex.expand_all(&renamed(&parts[2..], &rib))?;

    let mut expanded = vec![parts[0].clone(), formals];
    expanded.extend(body);
    Ok(form.rebuild_sexp(expanded))
}

fn expand_let(ex: &Expander, form: &Syntax, parts: &[Syntax]) -> Result<Syntax, TesseraError> {
    if parts.len() > 1 && parts[1].is_identifier() {
        return expand_named_let(ex, form, parts);
    }
    if parts.len() < 2 {
        return Err(err_stx!(Syntax, form, "let expects binding clauses and a body"));
    }
    expect_body(form, parts, 2)?;
    let (ids, inits): (Vec<_>, Vec<_>) = binding_clauses(&parts[1])?.into_iter().unzip();
    let inits = ex.expand_all(&inits)?;
    let (rib, _) = Rib::new(&ids)?;
    let body = ex.expand_all(&renamed(&parts[2..], &rib))?;

    let mut expanded = vec![
        parts[0].clone(),
        rebuild_clauses(&parts[1], renamed(&ids, &rib), inits),
    ];
    expanded.extend(body);
    Ok(form.rebuild_sexp(expanded))
}

/// `(let NAME ((ID INIT)...) BODY...)` becomes
/// `((letrec ((NAME (lambda (ID...) BODY...))) NAME) INIT...)`.
fn expand_named_let(ex: &Expander, form: &Syntax, parts: &[Syntax]) -> Result<Syntax, TesseraError> {
    if parts.len() < 3 {
        return Err(err_stx!(Syntax, form, "named let expects a name, clauses and a body"));
    }
    expect_body(form, parts, 3)?;
    let name = &parts[1];
    let (ids, inits): (Vec<_>, Vec<_>) = binding_clauses(&parts[2])?.into_iter().unzip();

    let mut lambda = vec![ex.kernel_identifier("lambda", form), parts[2].rebuild_sexp(ids)];
    lambda.extend(parts[3..].iter().cloned());
    let lambda = form.rebuild_sexp(lambda);
    let clause = form.rebuild_sexp(vec![name.clone(), lambda]);
    let letrec = form.rebuild_sexp(vec![
        ex.kernel_identifier("letrec", form),
        form.rebuild_sexp(vec![clause]),
        name.clone(),
    ]);
    let mut call = vec![letrec];
    call.extend(inits);
    ex.expand(&form.rebuild_sexp(call), ExpandContext::Expression)
}

fn expand_letrec(ex: &Expander, form: &Syntax, parts: &[Syntax]) -> Result<Syntax, TesseraError> {
    if parts.len() < 2 {
        return Err(err_stx!(Syntax, form, "letrec expects binding clauses and a body"));
    }
    expect_body(form, parts, 2)?;
    let (ids, inits): (Vec<_>, Vec<_>) = binding_clauses(&parts[1])?.into_iter().unzip();
    let (rib, _) = Rib::new(&ids)?;
    let inits = ex.expand_all(&renamed(&inits, &rib))?;
    let body = ex.expand_all(&renamed(&parts[2..], &rib))?;

    let mut expanded = vec![
        parts[0].clone(),
        rebuild_clauses(&parts[1], renamed(&ids, &rib), inits),
    ];
    expanded.extend(body);
    Ok(form.rebuild_sexp(expanded))
}

fn expand_parameterize(ex: &Expander, form: &Syntax, parts: &[Syntax]) -> Result<Syntax, TesseraError> {
    if parts.len() < 2 {
        return Err(err_stx!(Syntax, form, "parameterize expects clauses and a body"));
    }
    expect_body(form, parts, 2)?;
    let Some(clauses) = parts[1].subforms() else {
        return Err(err_stx!(Syntax, &parts[1], "expected parameterize clauses"));
    };
    let mut expanded_clauses = Vec::with_capacity(clauses.len());
    for clause in &clauses {
        let Some([parameter, value]) = clause.subforms().as_deref().and_then(two) else {
            return Err(err_stx!(Syntax, clause, "expected a (parameter value) clause"));
        };
        expanded_clauses.push(clause.rebuild_sexp(vec![
            ex.expand(&parameter, ExpandContext::Expression)?,
            ex.expand(&value, ExpandContext::Expression)?,
        ]));
    }
    let mut expanded = vec![parts[0].clone(), parts[1].rebuild_sexp(expanded_clauses)];
    expanded.extend(ex.expand_all(&parts[2..])?);
    Ok(form.rebuild_sexp(expanded))
}

// ============================================================================
// DEFINITIONS
// ============================================================================

/// Normalizes a `define` to `(define ID EXPR)` and reserves the address of ID.
/// The value expression is left unexpanded.
pub(crate) fn predefine_definition(ex: &Expander, form: &Syntax) -> Result<Syntax, TesseraError> {
    let parts = form.subforms().unwrap_or_default();
    let (target, value) = match parts.as_slice() {
        [_, id, value] if id.is_identifier() => (id.clone(), value.clone()),
        [_, id, doc, value] if id.is_identifier() && matches!(doc.datum(), SyntaxDatum::String(_)) => {
            (id.clone(), value.clone())
        }
        [_, signature, body @ ..] if signature.is_sexp() => {
            let Some(signature_parts) = signature.subforms() else {
                return Err(err_stx!(Syntax, signature, "malformed procedure signature"));
            };
            let Some((name, formals)) = signature_parts.split_first() else {
                return Err(err_stx!(Syntax, signature, "procedure signature needs a name"));
            };
            if body.is_empty() {
                return Err(err_stx!(Syntax, form, "define requires a body"));
            }
            let mut lambda = vec![
                ex.kernel_identifier("lambda", form),
                signature.rebuild_sexp(formals.to_vec()),
            ];
            lambda.extend(body.iter().cloned());
            (name.clone(), form.rebuild_sexp(lambda))
        }
        _ => {
            return Err(err_stx!(
                Syntax,
                form,
                "define expects an identifier and a value"
            ))
        }
    };
    if !target.is_identifier() {
        return Err(err_stx!(Syntax, &target, "define expects an identifier"));
    }
    let target = ex.namespace().predefine(&target)?;
    Ok(form.rebuild_sexp(vec![parts[0].clone(), target, value]))
}

// ============================================================================
// MODULES
// ============================================================================

fn expand_module(ex: &Expander, form: &Syntax, parts: &[Syntax]) -> Result<Syntax, TesseraError> {
    let Some(name) = parts.get(1).and_then(Syntax::as_symbol) else {
        return Err(err_stx!(Syntax, form, "module expects a name"));
    };
    let runtime = ex.runtime();
    let id = runtime.resolve_module(name.as_str(), None)?;
    // The body gets a namespace of its own, not the declaring one.
    let body: Vec<Syntax> = parts[2..].iter().map(Syntax::strip_context).collect();
    let _loading = LoadingGuard::enter(&id)?;
    let declaration = crate::macros::declare_module(runtime, id, body)?;
    runtime.registry().declare(declaration)?;
    Ok(form.clone())
}

fn module_path(spec: &Syntax) -> Result<String, TesseraError> {
    match spec.datum() {
        SyntaxDatum::String(path) => Ok(path.to_string()),
        SyntaxDatum::Symbol(path) => Ok(path.to_string()),
        _ => Err(err_stx!(Syntax, spec, "expected a module path")),
    }
}

fn required_instance(ex: &Expander, path_stx: &Syntax) -> Result<Arc<ModuleInstance>, TesseraError> {
    let path = module_path(path_stx)?;
    let runtime = ex.runtime();
    let id = runtime
        .resolve_module(&path, Some(ex.namespace().module_id()))
        .map_err(|e| e.with_context(path_stx))?;
    runtime.instantiate(&id).map_err(|e| e.with_context(path_stx))
}

fn exported<'i>(instance: &'i ModuleInstance, id: &Syntax) -> Result<&'i Arc<ProvidedBinding>, TesseraError> {
    let name = id.as_symbol().map(|s| s.as_str()).unwrap_or_default();
    instance.provided(name).ok_or_else(|| {
        TesseraError::unbound(name, ErrorContext::for_syntax(id))
            .with_help(format!("module {} does not provide `{name}`", instance.id()))
    })
}

fn expand_require_spec(ex: &Expander, spec: &Syntax) -> Result<(), TesseraError> {
    let namespace = ex.namespace();
    let Some(parts) = spec.subforms() else {
        let instance = required_instance(ex, spec)?;
        debug!(module = %instance.id(), into = %namespace.module_id(), "requiring module");
        for provided in instance.provided_bindings() {
            let local = Syntax::from_datum_in_context(&Value::Symbol(provided.name().clone()), Some(spec))?;
            namespace.require(&local, provided, false)?;
        }
        return Ok(());
    };

    let keyword = parts.first().and_then(Syntax::as_symbol).map(|s| s.as_str());
    match (keyword, parts.get(1)) {
        (Some("only_in"), Some(path)) => {
            let instance = required_instance(ex, path)?;
            for id in &parts[2..] {
                if !id.is_identifier() {
                    return Err(err_stx!(Syntax, id, "only_in expects identifiers"));
                }
                namespace.require(id, exported(&instance, id)?, false)?;
            }
            Ok(())
        }
        (Some("rename_in"), Some(path)) => {
            let instance = required_instance(ex, path)?;
            for pair in &parts[2..] {
                let Some([exported_id, local]) = pair.subforms().as_deref().and_then(two) else {
                    return Err(err_stx!(Syntax, pair, "rename_in expects (exported local) pairs"));
                };
                if !local.is_identifier() {
                    return Err(err_stx!(Syntax, &local, "rename_in expects a local identifier"));
                }
                namespace.require(&local, exported(&instance, &exported_id)?, false)?;
            }
            Ok(())
        }
        _ => Err(err_stx!(Syntax, spec, "unknown require spec")),
    }
}

fn two(items: &[Syntax]) -> Option<[Syntax; 2]> {
    match items {
        [a, b] => Some([a.clone(), b.clone()]),
        _ => None,
    }
}

fn expand_provide_spec(ex: &Expander, spec: &Syntax) -> Result<(), TesseraError> {
    let namespace = ex.namespace();
    if spec.is_identifier() {
        let name = spec.as_symbol().cloned().unwrap_or_else(|| "?".into());
        let target = spec
            .resolve()
            .and_then(|b| b.denotation().defined_target().cloned())
            .ok_or_else(|| TesseraError::unbound(name.as_str(), ErrorContext::for_syntax(spec)))?;
        ex.record_provide(Arc::new(ProvidedBinding { name, target }));
        return Ok(());
    }
    match spec.subforms().as_deref() {
        Some([keyword]) if keyword.as_symbol().map(|s| s.as_str()) == Some("all_defined_out") => {
            for target in namespace.unmarked_definitions() {
                ex.record_provide(Arc::new(ProvidedBinding {
                    name: target.name().clone(),
                    target,
                }));
            }
            Ok(())
        }
        _ => Err(err_stx!(Syntax, spec, "unknown provide spec")),
    }
}
