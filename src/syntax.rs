//! # Syntax Objects and Lexical Wraps
//!
//! Source forms are represented as immutable [`Syntax`] trees. Each node carries
//! a chain of [`Wrap`]s recording the lexical transformations applied to it:
//! namespace renames, hygiene marks, lexical ribs introduced by binding forms,
//! and module renames. Adding a wrap produces a new node that shares every
//! unchanged subtree with the original.
//!
//! ## Wrap Order
//!
//! The wrap chain is stored newest first. Wraps placed on a container apply to
//! all of its children; they are pushed down lazily when children are
//! extracted, landing in front of (newer than) the child's own wraps.
//!
//! ## Resolution
//!
//! An identifier is resolved by replaying its wraps from the oldest to the
//! newest. Mark wraps toggle membership in the accumulated mark set, so two
//! applications of the same mark cancel. A rename wrap substitutes a binding
//! when its key (origin binding, marks accumulated so far) matches. A
//! namespace wrap first tries the identifier's complete mark set, which is how
//! macro-introduced top-level definitions stay distinct from user definitions,
//! and falls back to the marks accumulated at its position.

pub mod parser;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use im::{OrdMap, OrdSet, Vector};
use serde::{Deserialize, Serialize};

use crate::runtime::binding::{Binding, Rib};
use crate::runtime::namespace::{Namespace, NamespaceId};
use crate::runtime::Value;
use crate::{err_msg, TesseraError};

// ============================================================================
// CORE DATA STRUCTURES
// ============================================================================

/// Byte range of a form within its source text.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// An interned-by-content identifier name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(name: &str) -> Self {
        Symbol(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Symbol {
    fn from(name: &str) -> Self {
        Symbol::new(name)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}", self.0)
    }
}

static NEXT_MARK: AtomicU64 = AtomicU64::new(1);

/// An opaque hygiene tag. Every macro invocation draws a fresh one.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Mark(u64);

impl Mark {
    pub fn fresh() -> Self {
        Mark(NEXT_MARK.fetch_add(1, Ordering::Relaxed))
    }
}

pub type MarkSet = OrdSet<Mark>;

fn toggle(marks: &mut MarkSet, mark: Mark) {
    if marks.remove(&mark).is_none() {
        marks.insert(mark);
    }
}

/// One lexical-context transformation layered onto a syntax object.
#[derive(Clone)]
pub enum Wrap {
    Mark(Mark),
    /// Lexical bindings introduced by `lambda`, `let`, or `letrec`.
    Rename(Arc<Rib>),
    /// A namespace's bindings, current and future.
    Namespace { id: NamespaceId, ns: Weak<Namespace> },
    /// Renames free identifiers into a module's own binding space.
    ModuleRename { id: NamespaceId, ns: Weak<Namespace> },
}

impl fmt::Debug for Wrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wrap::Mark(mark) => write!(f, "Mark({})", mark.0),
            Wrap::Rename(rib) => write!(f, "Rename({:?})", rib.id()),
            Wrap::Namespace { id, .. } => write!(f, "Namespace({id:?})"),
            Wrap::ModuleRename { id, .. } => write!(f, "ModuleRename({id:?})"),
        }
    }
}

/// The payload of a syntax node.
#[derive(Clone)]
pub enum SyntaxDatum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Arc<str>),
    Symbol(Symbol),
    Sexp(Vector<Syntax>),
    List(Vector<Syntax>),
    Struct(OrdMap<Arc<str>, Syntax>),
}

struct SyntaxNode {
    datum: SyntaxDatum,
    wraps: Vector<Wrap>,
    span: Option<Span>,
    annotations: Vector<Symbol>,
    /// Binding recorded by `predefine` or a binding form; cleared by new wraps.
    binding: Option<Binding>,
}

/// A source form paired with its lexical context.
#[derive(Clone)]
pub struct Syntax(Arc<SyntaxNode>);

// ============================================================================
// CONSTRUCTION AND ACCESS
// ============================================================================

impl Syntax {
    pub fn new(datum: SyntaxDatum, span: Option<Span>) -> Self {
        Syntax(Arc::new(SyntaxNode {
            datum,
            wraps: Vector::new(),
            span,
            annotations: Vector::new(),
            binding: None,
        }))
    }

    /// A bare identifier with no lexical context.
    pub fn identifier(name: &str) -> Self {
        Syntax::new(SyntaxDatum::Symbol(Symbol::new(name)), None)
    }

    pub fn sexp(items: Vec<Syntax>, span: Option<Span>) -> Self {
        Syntax::new(SyntaxDatum::Sexp(items.into_iter().collect()), span)
    }

    fn rebuild(&self, wraps: Vector<Wrap>, binding: Option<Binding>) -> Self {
        Syntax(Arc::new(SyntaxNode {
            datum: self.0.datum.clone(),
            wraps,
            span: self.0.span,
            annotations: self.0.annotations.clone(),
            binding,
        }))
    }

    /// The raw payload. Children reached through it do not carry this node's wraps;
    /// use [`subforms`](Self::subforms) and friends for lexically correct children.
    pub fn datum(&self) -> &SyntaxDatum {
        &self.0.datum
    }

    pub fn span(&self) -> Option<Span> {
        self.0.span
    }

    pub fn wraps(&self) -> &Vector<Wrap> {
        &self.0.wraps
    }

    pub fn annotations(&self) -> &Vector<Symbol> {
        &self.0.annotations
    }

    pub fn with_annotations(&self, annotations: Vector<Symbol>) -> Self {
        Syntax(Arc::new(SyntaxNode {
            datum: self.0.datum.clone(),
            wraps: self.0.wraps.clone(),
            span: self.0.span,
            annotations,
            binding: self.0.binding.clone(),
        }))
    }

    /// Adds `wrap` as the newest wrap. Adjacent applications of one mark cancel.
    pub fn add_wrap(&self, wrap: Wrap) -> Self {
        let mut wraps = self.0.wraps.clone();
        let cancels = matches!(
            (&wrap, wraps.front()),
            (Wrap::Mark(new), Some(Wrap::Mark(top))) if new == top
        );
        if cancels {
            wraps.pop_front();
        } else {
            wraps.push_front(wrap);
        }
        self.rebuild(wraps, None)
    }

    /// Places `newer` in front of this node's wraps.
    pub fn add_wraps(&self, newer: &Vector<Wrap>) -> Self {
        if newer.is_empty() {
            return self.clone();
        }
        let mut result = self.clone();
        for wrap in newer.iter().rev() {
            result = result.add_wrap(wrap.clone());
        }
        result
    }

    pub fn as_symbol(&self) -> Option<&Symbol> {
        match &self.0.datum {
            SyntaxDatum::Symbol(sym) => Some(sym),
            _ => None,
        }
    }

    pub fn is_identifier(&self) -> bool {
        self.as_symbol().is_some()
    }

    pub fn is_sexp(&self) -> bool {
        matches!(self.0.datum, SyntaxDatum::Sexp(_))
    }

    /// Children of a sexp, with this node's wraps pushed down.
    pub fn subforms(&self) -> Option<Vec<Syntax>> {
        match &self.0.datum {
            SyntaxDatum::Sexp(items) => Some(self.push_down(items)),
            _ => None,
        }
    }

    /// Elements of a list literal, with this node's wraps pushed down.
    pub fn list_elements(&self) -> Option<Vec<Syntax>> {
        match &self.0.datum {
            SyntaxDatum::List(items) => Some(self.push_down(items)),
            _ => None,
        }
    }

    /// Fields of a struct literal, with this node's wraps pushed down.
    pub fn struct_fields(&self) -> Option<Vec<(Arc<str>, Syntax)>> {
        match &self.0.datum {
            SyntaxDatum::Struct(fields) => Some(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.add_wraps(&self.0.wraps)))
                    .collect(),
            ),
            _ => None,
        }
    }

    fn push_down(&self, items: &Vector<Syntax>) -> Vec<Syntax> {
        items.iter().map(|c| c.add_wraps(&self.0.wraps)).collect()
    }

    /// A sexp with the same location as `self` holding `items`.
    pub fn rebuild_sexp(&self, items: Vec<Syntax>) -> Self {
        Syntax::sexp(items, self.0.span)
    }

    pub fn rebuild_list(&self, items: Vec<Syntax>) -> Self {
        Syntax::new(SyntaxDatum::List(items.into_iter().collect()), self.0.span)
    }

    pub fn rebuild_struct(&self, fields: Vec<(Arc<str>, Syntax)>) -> Self {
        Syntax::new(SyntaxDatum::Struct(fields.into_iter().collect()), self.0.span)
    }

    pub fn ptr_eq(&self, other: &Syntax) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// A copy of this identifier carrying a resolved binding.
    pub fn with_binding(&self, binding: Binding) -> Self {
        self.rebuild(self.0.wraps.clone(), Some(binding))
    }

    /// The same tree with every wrap removed; spans and annotations are kept.
    pub fn strip_context(&self) -> Self {
        let datum = match &self.0.datum {
            SyntaxDatum::Sexp(items) => {
                SyntaxDatum::Sexp(items.iter().map(Syntax::strip_context).collect())
            }
            SyntaxDatum::List(items) => {
                SyntaxDatum::List(items.iter().map(Syntax::strip_context).collect())
            }
            SyntaxDatum::Struct(fields) => SyntaxDatum::Struct(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.strip_context()))
                    .collect(),
            ),
            atom => atom.clone(),
        };
        Syntax::new(datum, self.0.span).with_annotations(self.0.annotations.clone())
    }
}

// ============================================================================
// IDENTIFIER RESOLUTION
// ============================================================================

impl Syntax {
    /// The identifier's binding, or `None` when it is free.
    pub fn resolve(&self) -> Option<Binding> {
        if let Some(binding) = &self.0.binding {
            return Some(binding.clone());
        }
        self.resolve_with_marks().0
    }

    /// The identifier's binding together with its complete mark set.
    pub fn resolve_with_marks(&self) -> (Option<Binding>, MarkSet) {
        match self.as_symbol() {
            Some(name) => resolve_identifier(name, &self.0.wraps, None),
            None => (None, MarkSet::new()),
        }
    }

    /// Resolves while ignoring the substitutions of namespace `ns`, yielding the
    /// origin binding that keys the namespace's own table.
    pub(crate) fn resolve_outside(&self, ns: NamespaceId) -> (Binding, MarkSet) {
        let name = self
            .as_symbol()
            .cloned()
            .unwrap_or_else(|| Symbol::new("?"));
        let (binding, marks) = resolve_identifier(&name, &self.0.wraps, Some(ns));
        (binding.unwrap_or(Binding::Free(name)), marks)
    }

    /// The accumulated mark set of this node's wraps.
    pub fn marks(&self) -> MarkSet {
        let mut marks = MarkSet::new();
        for wrap in self.0.wraps.iter() {
            if let Wrap::Mark(mark) = wrap {
                toggle(&mut marks, *mark);
            }
        }
        marks
    }

    /// Whether a binding of one identifier would capture the other.
    pub fn bound_identifier_eq(&self, other: &Syntax) -> bool {
        let (Some(a), Some(b)) = (self.as_symbol(), other.as_symbol()) else {
            return false;
        };
        if a != b {
            return false;
        }
        let (binding_a, marks_a) = self.resolve_with_marks();
        let (binding_b, marks_b) = other.resolve_with_marks();
        let origin_a = binding_a.unwrap_or_else(|| Binding::Free(a.clone()));
        let origin_b = binding_b.unwrap_or_else(|| Binding::Free(b.clone()));
        marks_a == marks_b && origin_a.same_origin(&origin_b)
    }

    /// Whether both identifiers currently denote the same binding.
    pub fn free_identifier_eq(&self, other: &Syntax) -> bool {
        let (Some(a), Some(b)) = (self.as_symbol(), other.as_symbol()) else {
            return false;
        };
        let denote_a = self
            .resolve()
            .unwrap_or_else(|| Binding::Free(a.clone()))
            .denotation();
        let denote_b = other
            .resolve()
            .unwrap_or_else(|| Binding::Free(b.clone()))
            .denotation();
        denote_a.same_target(&denote_b)
    }
}

fn resolve_identifier(
    name: &Symbol,
    wraps: &Vector<Wrap>,
    skip: Option<NamespaceId>,
) -> (Option<Binding>, MarkSet) {
    let mut total = MarkSet::new();
    for wrap in wraps.iter() {
        if let Wrap::Mark(mark) = wrap {
            toggle(&mut total, *mark);
        }
    }

    let mut binding: Option<Binding> = None;
    let mut marks = MarkSet::new();
    for wrap in wraps.iter().rev() {
        match wrap {
            Wrap::Mark(mark) => toggle(&mut marks, *mark),
            Wrap::Rename(rib) => {
                if let Some(local) = rib.substitute(name, binding.as_ref(), &marks) {
                    binding = Some(local);
                }
            }
            Wrap::Namespace { id, ns } => {
                if skip == Some(*id) {
                    continue;
                }
                if let Some(ns) = ns.upgrade() {
                    if let Some(found) = ns.substitute(name, binding.as_ref(), &total, &marks) {
                        binding = Some(found);
                    }
                }
            }
            Wrap::ModuleRename { ns, .. } => {
                if binding.is_none() {
                    if let Some(ns) = ns.upgrade() {
                        binding = ns.substitute(name, None, &MarkSet::new(), &MarkSet::new());
                    }
                }
            }
        }
    }
    (binding, marks)
}

// ============================================================================
// DATUM CONVERSION
// ============================================================================

impl Syntax {
    /// Converts a plain data value to syntax with no lexical context.
    pub fn from_datum(value: &Value, span: Option<Span>) -> Result<Syntax, TesseraError> {
        datum_to_syntax(value, &Vector::new(), span)
    }

    /// Converts a plain data value to syntax, giving new identifiers the lexical
    /// context of `context`. Syntax objects embedded in `value` are kept as is.
    pub fn from_datum_in_context(
        value: &Value,
        context: Option<&Syntax>,
    ) -> Result<Syntax, TesseraError> {
        match context {
            Some(ctx) => datum_to_syntax(value, ctx.wraps(), ctx.span()),
            None => datum_to_syntax(value, &Vector::new(), None),
        }
    }

    /// Strips all lexical context, yielding a plain data value.
    pub fn to_datum(&self) -> Value {
        match &self.0.datum {
            SyntaxDatum::Null => Value::Null,
            SyntaxDatum::Bool(b) => Value::Bool(*b),
            SyntaxDatum::Int(i) => Value::Int(*i),
            SyntaxDatum::Float(x) => Value::Float(*x),
            SyntaxDatum::String(s) => Value::String(s.clone()),
            SyntaxDatum::Symbol(sym) => Value::Symbol(sym.clone()),
            SyntaxDatum::Sexp(items) => Value::Sexp(items.iter().map(Syntax::to_datum).collect()),
            SyntaxDatum::List(items) => Value::List(items.iter().map(Syntax::to_datum).collect()),
            SyntaxDatum::Struct(fields) => Value::Struct(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_datum()))
                    .collect(),
            ),
        }
    }
}

fn datum_to_syntax(
    value: &Value,
    wraps: &Vector<Wrap>,
    span: Option<Span>,
) -> Result<Syntax, TesseraError> {
    let datum = match value {
        Value::Syntax(stx) => return Ok(stx.clone()),
        Value::Null => SyntaxDatum::Null,
        Value::Bool(b) => SyntaxDatum::Bool(*b),
        Value::Int(i) => SyntaxDatum::Int(*i),
        Value::Float(x) => SyntaxDatum::Float(*x),
        Value::String(s) => SyntaxDatum::String(s.clone()),
        Value::Symbol(sym) => SyntaxDatum::Symbol(sym.clone()),
        Value::Sexp(items) => SyntaxDatum::Sexp(
            items
                .iter()
                .map(|v| datum_to_syntax(v, wraps, span))
                .collect::<Result<_, _>>()?,
        ),
        Value::List(items) => SyntaxDatum::List(
            items
                .iter()
                .map(|v| datum_to_syntax(v, wraps, span))
                .collect::<Result<_, _>>()?,
        ),
        Value::Struct(fields) => SyntaxDatum::Struct(
            fields
                .iter()
                .map(|(k, v)| Ok((k.clone(), datum_to_syntax(v, wraps, span)?)))
                .collect::<Result<_, TesseraError>>()?,
        ),
        other => {
            return Err(err_msg!(
                Contract,
                "cannot convert {} to syntax",
                other.type_name()
            ))
        }
    };
    let is_container = matches!(
        datum,
        SyntaxDatum::Sexp(_) | SyntaxDatum::List(_) | SyntaxDatum::Struct(_)
    );
    let stx = Syntax::new(datum, span);
    // Containers stay unwrapped so embedded syntax keeps its own context.
    Ok(if is_container {
        stx
    } else {
        stx.add_wraps(wraps)
    })
}

// ============================================================================
// DISPLAY
// ============================================================================

pub(crate) fn write_string_literal(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            c => write!(f, "{c}")?,
        }
    }
    f.write_str("\"")
}

pub(crate) fn write_float(f: &mut fmt::Formatter<'_>, x: f64) -> fmt::Result {
    if x.is_finite() && x.fract() == 0.0 {
        write!(f, "{x:.1}")
    } else {
        write!(f, "{x}")
    }
}

fn write_separated<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    items: impl Iterator<Item = T>,
    separator: &str,
) -> fmt::Result {
    for (i, item) in items.enumerate() {
        if i > 0 {
            f.write_str(separator)?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Syntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for annotation in self.0.annotations.iter() {
            write!(f, "{annotation}::")?;
        }
        match &self.0.datum {
            SyntaxDatum::Null => f.write_str("null"),
            SyntaxDatum::Bool(b) => write!(f, "{b}"),
            SyntaxDatum::Int(i) => write!(f, "{i}"),
            SyntaxDatum::Float(x) => write_float(f, *x),
            SyntaxDatum::String(s) => write_string_literal(f, s),
            SyntaxDatum::Symbol(sym) => write!(f, "{sym}"),
            SyntaxDatum::Sexp(items) => {
                f.write_str("(")?;
                write_separated(f, items.iter(), " ")?;
                f.write_str(")")
            }
            SyntaxDatum::List(items) => {
                f.write_str("[")?;
                write_separated(f, items.iter(), ", ")?;
                f.write_str("]")
            }
            SyntaxDatum::Struct(fields) => {
                f.write_str("{")?;
                write_separated(f, fields.iter().map(|(k, v)| format!("{k}: {v}")), ", ")?;
                f.write_str("}")
            }
        }
    }
}

impl fmt::Debug for Syntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<syntax {self}")?;
        if let Some(span) = self.0.span {
            write!(f, " @{}..{}", span.start, span.end)?;
        }
        if !self.0.wraps.is_empty() {
            write!(f, " {:?}", self.0.wraps)?;
        }
        f.write_str(">")
    }
}

#[cfg(test)]
mod tests {
    use im::vector;

    use super::*;

    fn sample_record() -> Value {
        let mut fields = OrdMap::new();
        fields.insert(Arc::from("name"), Value::String(Arc::from("tile")));
        fields.insert(
            Arc::from("sides"),
            Value::List(vector![Value::Int(4), Value::Float(2.5), Value::Null]),
        );
        Value::Sexp(vector![
            Value::Symbol(Symbol::new("shape")),
            Value::Struct(fields),
            Value::Bool(false)
        ])
    }

    #[test]
    fn datum_round_trip_preserves_nested_data() {
        let original = sample_record();
        let stx = Syntax::from_datum(&original, None).unwrap();
        assert_eq!(stx.to_datum(), original);
    }

    #[test]
    fn non_data_values_cannot_become_syntax() {
        let err = Syntax::from_datum(&Value::Void, None).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Contract);
    }

    #[test]
    fn adjacent_marks_cancel() {
        let m = Mark::fresh();
        let id = Syntax::identifier("t").add_wrap(Wrap::Mark(m));
        assert_eq!(id.marks().len(), 1);
        let twice = id.add_wrap(Wrap::Mark(m));
        assert!(twice.wraps().is_empty());
        assert!(twice.marks().is_empty());
    }

    #[test]
    fn container_wraps_push_down_in_front_of_child_wraps() {
        let inner = Mark::fresh();
        let outer = Mark::fresh();
        let child = Syntax::identifier("x").add_wrap(Wrap::Mark(inner));
        let parent = Syntax::sexp(vec![child], None).add_wrap(Wrap::Mark(outer));
        let pushed = &parent.subforms().unwrap()[0];
        let order: Vec<_> = pushed
            .wraps()
            .iter()
            .map(|w| match w {
                Wrap::Mark(m) => *m,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![outer, inner]);
    }

    #[test]
    fn bound_identifier_equality_depends_on_marks() {
        let m = Mark::fresh();
        let plain = Syntax::identifier("t");
        let marked = plain.add_wrap(Wrap::Mark(m));
        assert!(plain.bound_identifier_eq(&Syntax::identifier("t")));
        assert!(!plain.bound_identifier_eq(&marked));
        assert!(!plain.bound_identifier_eq(&Syntax::identifier("u")));
    }

    #[test]
    fn context_wraps_reach_new_atoms_only() {
        let m = Mark::fresh();
        let ctx = Syntax::identifier("here").add_wrap(Wrap::Mark(m));
        let kept = Syntax::identifier("kept");
        let value = Value::Sexp(vector![
            Value::Symbol(Symbol::new("fresh")),
            Value::Syntax(kept)
        ]);
        let stx = Syntax::from_datum_in_context(&value, Some(&ctx)).unwrap();
        let parts = stx.subforms().unwrap();
        assert_eq!(parts[0].marks().len(), 1);
        assert!(parts[1].marks().is_empty());
    }

    #[test]
    fn display_writes_source_notation() {
        let stx = Syntax::from_datum(&sample_record(), None).unwrap();
        assert_eq!(
            stx.to_string(),
            "(shape {name: \"tile\", sides: [4, 2.5, null]} false)"
        );
    }
}
