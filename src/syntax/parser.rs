//! Tessera Reader
//!
//! Converts source text into [`Syntax`] objects with source locations and no
//! lexical context. Reading is purely syntactic; namespaces introduce their
//! wraps later.

use std::sync::Arc;

use im::{OrdMap, Vector};
use pest::{error::InputLocation, iterators::Pair, Parser};
use pest_derive::Parser;

use crate::diagnostics::{to_error_source, SourceArc};
use crate::runtime::Value;
use crate::syntax::{Span, Symbol, Syntax, SyntaxDatum};
use crate::{err_src, TesseraError};

#[derive(Parser)]
#[grammar = "syntax/grammar.pest"]
struct TesseraParser;

// ============================================================================
// PUBLIC API
// ============================================================================

/// Reads every form in `source_text`. `name` labels the source in diagnostics.
pub fn read(source_text: &str, name: &str) -> Result<Vec<Syntax>, TesseraError> {
    let source = to_error_source(name, source_text);
    let mut pairs = TesseraParser::parse(Rule::program, source_text)
        .map_err(|e| convert_parse_error(e, &source))?;

    let Some(program) = pairs.next() else {
        return Ok(vec![]);
    };

    program
        .into_inner()
        .filter(|p| p.as_rule() != Rule::EOI)
        .map(|p| build_syntax(p, &source))
        .collect()
}

/// Reads a single form, failing if the text holds zero or several.
pub fn read_one(source_text: &str) -> Result<Syntax, TesseraError> {
    let mut forms = read(source_text, "input")?;
    if forms.len() != 1 {
        let source = to_error_source("input", source_text);
        return Err(err_src!(
            Parse,
            format!("expected exactly one form, found {}", forms.len()),
            &source,
            Span {
                start: 0,
                end: source_text.len()
            }
        ));
    }
    Ok(forms.remove(0))
}

/// Reads `source_text` as plain data, stripping syntax.
pub fn read_data(source_text: &str) -> Result<Vec<Value>, TesseraError> {
    Ok(read(source_text, "data")?
        .iter()
        .map(Syntax::to_datum)
        .collect())
}

// ============================================================================
// SYNTAX BUILDERS
// ============================================================================

fn get_span(pair: &Pair<Rule>) -> Span {
    let s = pair.as_span();
    Span {
        start: s.start(),
        end: s.end(),
    }
}

fn build_syntax(pair: Pair<Rule>, source: &SourceArc) -> Result<Syntax, TesseraError> {
    let span = get_span(&pair);
    match pair.as_rule() {
        Rule::datum => {
            let mut annotations = Vector::new();
            let mut value = None;
            for inner in pair.into_inner() {
                if inner.as_rule() == Rule::annotation {
                    annotations.push_back(Symbol::new(inner.as_str().trim_end_matches("::")));
                } else {
                    value = Some(build_syntax(inner, source)?);
                }
            }
            let Some(value) = value else {
                return Err(err_src!(Parse, "annotation without a value", source, span));
            };
            Ok(if annotations.is_empty() {
                value
            } else {
                value.with_annotations(annotations)
            })
        }

        Rule::quoted => {
            let mut items = vec![Syntax::new(
                SyntaxDatum::Symbol(Symbol::new("quote")),
                Some(Span {
                    start: span.start,
                    end: span.start + 1,
                }),
            )];
            for inner in pair.into_inner() {
                items.push(build_syntax(inner, source)?);
            }
            Ok(Syntax::sexp(items, Some(span)))
        }

        Rule::sexp | Rule::list => {
            let is_sexp = pair.as_rule() == Rule::sexp;
            let items = pair
                .into_inner()
                .map(|p| build_syntax(p, source))
                .collect::<Result<Vector<_>, _>>()?;
            let datum = if is_sexp {
                SyntaxDatum::Sexp(items)
            } else {
                SyntaxDatum::List(items)
            };
            Ok(Syntax::new(datum, Some(span)))
        }

        Rule::structure => {
            let mut fields = OrdMap::new();
            for field in pair.into_inner() {
                let field_span = get_span(&field);
                let mut parts = field.into_inner();
                let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                    return Err(err_src!(Parse, "malformed struct field", source, field_span));
                };
                let key: Arc<str> = match key.as_rule() {
                    Rule::string => Arc::from(unescape_string(key.as_str(), source, field_span)?),
                    _ => Arc::from(key.as_str()),
                };
                let value = build_syntax(value, source)?;
                if fields.insert(key.clone(), value).is_some() {
                    return Err(err_src!(
                        Parse,
                        format!("duplicate struct field `{key}`"),
                        source,
                        field_span
                    ));
                }
            }
            Ok(Syntax::new(SyntaxDatum::Struct(fields), Some(span)))
        }

        Rule::null => Ok(Syntax::new(SyntaxDatum::Null, Some(span))),

        Rule::boolean => Ok(Syntax::new(
            SyntaxDatum::Bool(pair.as_str() == "true"),
            Some(span),
        )),

        Rule::int => {
            let text = pair.as_str();
            let value = text.parse::<i64>().map_err(|_| {
                err_src!(Parse, format!("integer literal out of range: {text}"), source, span)
            })?;
            Ok(Syntax::new(SyntaxDatum::Int(value), Some(span)))
        }

        Rule::float => {
            let text = pair.as_str();
            let value = text.parse::<f64>().map_err(|_| {
                err_src!(Parse, format!("invalid float literal: {text}"), source, span)
            })?;
            Ok(Syntax::new(SyntaxDatum::Float(value), Some(span)))
        }

        Rule::string => {
            let content = unescape_string(pair.as_str(), source, span)?;
            Ok(Syntax::new(SyntaxDatum::String(Arc::from(content)), Some(span)))
        }

        Rule::symbol => Ok(Syntax::new(
            SyntaxDatum::Symbol(Symbol::new(pair.as_str())),
            Some(span),
        )),

        other => Err(err_src!(
            Parse,
            format!("unexpected grammar rule {other:?}"),
            source,
            span
        )),
    }
}

fn unescape_string(raw: &str, source: &SourceArc, span: Span) -> Result<String, TesseraError> {
    let body = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                return Err(err_src!(
                    Parse,
                    format!("unknown escape sequence \\{other}"),
                    source,
                    span
                ))
            }
            None => return Err(err_src!(Parse, "dangling escape", source, span)),
        }
    }
    Ok(out)
}

fn convert_parse_error(error: pest::error::Error<Rule>, source: &SourceArc) -> TesseraError {
    let span = match error.location {
        InputLocation::Pos(pos) => Span {
            start: pos,
            end: pos,
        },
        InputLocation::Span((start, end)) => Span { start, end },
    };
    let message = error.variant.message().to_string();
    err_src!(Parse, message, source, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_scalars_and_containers() {
        let forms = read("42 -7 1.5 \"hi\\n\" true null sym [1, 2] {a: 1, \"b c\": 2}", "t").unwrap();
        let rendered: Vec<String> = forms.iter().map(|f| f.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "42",
                "-7",
                "1.5",
                "\"hi\\n\"",
                "true",
                "null",
                "sym",
                "[1, 2]",
                "{a: 1, b c: 2}"
            ]
        );
    }

    #[test]
    fn quote_shorthand_becomes_quote_form() {
        let form = read_one("'(a b)").unwrap();
        assert_eq!(form.to_string(), "(quote (a b))");
    }

    #[test]
    fn operators_read_as_symbols() {
        let form = read_one("(- n 1)").unwrap();
        let parts = form.subforms().unwrap();
        assert_eq!(parts[0].as_symbol().unwrap().as_str(), "-");
        assert!(matches!(parts[2].datum(), SyntaxDatum::Int(1)));
    }

    #[test]
    fn spans_cover_source_text() {
        let form = read_one("  (f x)").unwrap();
        assert_eq!(form.span(), Some(Span { start: 2, end: 7 }));
    }

    #[test]
    fn annotations_are_kept() {
        let form = read_one("note::\"text\"").unwrap();
        assert_eq!(form.annotations().len(), 1);
        assert_eq!(form.to_string(), "note::\"text\"");
    }

    #[test]
    fn comments_are_skipped() {
        let forms = read("; heading\n(a) ; trailing\n(b)", "t").unwrap();
        assert_eq!(forms.len(), 2);
    }

    #[test]
    fn unbalanced_input_is_a_parse_error() {
        let err = read("(a b", "t").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Parse);
    }
}
