//! Code fingerprinting.
//!
//! A stage is skipped only when, among other things, the *code* it would
//! run is unchanged. The fingerprint is a byte string that is a stable
//! function of a callable's compiled representation: it changes whenever
//! behaviour changes and stays put under cosmetic edits (whitespace,
//! comments, docstrings).
//!
//! Callables are explicit data here: a [`CodeObject`] carries the compiled
//! parts of one callable, produced by [`compile`] from a source text of
//! the form `fn name(params) { body }`. The parts mirror what the
//! fingerprint consumes:
//!
//! - the constant pool with the leading docstring removed
//! - the externally referenced symbols the body invokes
//! - the instruction bytes (the literal-blinded token stream)
//! - nested function definitions, compiled alongside
//!
//! Referenced symbols resolve through a [`CallableRegistry`]. A symbol
//! registered with the opt-in hashable marker is pulled into the caller's
//! fingerprint recursively; everything else (including unregistered
//! built-ins) contributes only its fully-qualified name. The recursion is
//! opt-in because automatic whole-program closure is neither decidable
//! nor desirable.

pub mod lexer;
pub mod registry;

use serde_json::Value;

use crate::errors::{MemoError, MemoResult};
use lexer::Token;
pub use registry::{CallableRegistry, PropertyObject, RegisteredCallable, TypeObject};

const KEYWORDS: &[&str] = &[
    "fn", "let", "return", "if", "else", "while", "for", "in", "match",
];

/// The compiled representation of one callable.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeObject {
    /// Fully-qualified symbolic name; also the default stage name.
    pub name: String,
    /// Declared parameter names, in order.
    pub params: Vec<String>,
    /// Leading docstring. Not part of the fingerprint.
    pub doc: Option<String>,
    /// Constant pool, docstring removed.
    pub consts: Vec<Value>,
    /// Externally referenced symbols in first-occurrence order.
    pub symbols: Vec<String>,
    /// Instruction bytes: the token stream with literals blinded.
    pub code: Vec<u8>,
    /// Inline function definitions.
    pub nested: Vec<CodeObject>,
}

impl CodeObject {
    /// Start building a code object by hand. `compile` is the usual entry
    /// point; the builder exists for synthesized callables and tests.
    pub fn builder(name: impl Into<String>) -> CodeObjectBuilder {
        CodeObjectBuilder {
            code: CodeObject {
                name: name.into(),
                params: Vec::new(),
                doc: None,
                consts: Vec::new(),
                symbols: Vec::new(),
                code: Vec::new(),
                nested: Vec::new(),
            },
        }
    }
}

/// Builder for hand-assembled [`CodeObject`]s.
pub struct CodeObjectBuilder {
    code: CodeObject,
}

impl CodeObjectBuilder {
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.code.params.push(name.into());
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.code.doc = Some(doc.into());
        self
    }

    pub fn constant(mut self, value: Value) -> Self {
        self.code.consts.push(value);
        self
    }

    pub fn symbol(mut self, name: impl Into<String>) -> Self {
        self.code.symbols.push(name.into());
        self
    }

    pub fn code_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.code.code = bytes.into();
        self
    }

    pub fn nested(mut self, nested: CodeObject) -> Self {
        self.code.nested.push(nested);
        self
    }

    pub fn build(self) -> CodeObject {
        self.code
    }
}

/// Compile a source text of the form `fn name(params) { body }`.
pub fn compile(source: &str) -> MemoResult<CodeObject> {
    let tokens = lexer::tokenize(source)?;
    let mut idx = 0usize;

    expect_ident(&tokens, &mut idx, "fn")?;
    let name = take_ident(&tokens, &mut idx)?;
    let params = parse_params(&tokens, &mut idx)?;
    let body = parse_braced(&tokens, &mut idx)?;

    if idx != tokens.len() {
        return Err(MemoError::validation(format!(
            "unexpected tokens after function body of `{name}`"
        )));
    }

    compile_body(name, params, body)
}

fn expect_ident(tokens: &[Token], idx: &mut usize, want: &str) -> MemoResult<()> {
    match tokens.get(*idx) {
        Some(Token::Ident(s)) if s == want => {
            *idx += 1;
            Ok(())
        }
        other => Err(MemoError::validation(format!(
            "expected `{want}`, found {other:?}"
        ))),
    }
}

fn take_ident(tokens: &[Token], idx: &mut usize) -> MemoResult<String> {
    match tokens.get(*idx) {
        Some(Token::Ident(s)) => {
            *idx += 1;
            Ok(s.clone())
        }
        other => Err(MemoError::validation(format!(
            "expected identifier, found {other:?}"
        ))),
    }
}

fn expect_punct(tokens: &[Token], idx: &mut usize, want: char) -> MemoResult<()> {
    match tokens.get(*idx) {
        Some(t) if t.is_punct(want) => {
            *idx += 1;
            Ok(())
        }
        other => Err(MemoError::validation(format!(
            "expected `{want}`, found {other:?}"
        ))),
    }
}

fn parse_params(tokens: &[Token], idx: &mut usize) -> MemoResult<Vec<String>> {
    expect_punct(tokens, idx, '(')?;
    let mut params = Vec::new();
    loop {
        match tokens.get(*idx) {
            Some(t) if t.is_punct(')') => {
                *idx += 1;
                return Ok(params);
            }
            Some(Token::Ident(p)) => {
                params.push(p.clone());
                *idx += 1;
                if tokens.get(*idx).map(|t| t.is_punct(',')).unwrap_or(false) {
                    *idx += 1;
                }
            }
            other => {
                return Err(MemoError::validation(format!(
                    "expected parameter name, found {other:?}"
                )))
            }
        }
    }
}

/// Consume a `{ … }` block, returning the tokens between the braces.
fn parse_braced(tokens: &[Token], idx: &mut usize) -> MemoResult<Vec<Token>> {
    expect_punct(tokens, idx, '{')?;
    let mut depth = 1usize;
    let mut body = Vec::new();
    while let Some(tok) = tokens.get(*idx) {
        *idx += 1;
        if tok.is_punct('{') {
            depth += 1;
        } else if tok.is_punct('}') {
            depth -= 1;
            if depth == 0 {
                return Ok(body);
            }
        }
        body.push(tok.clone());
    }
    Err(MemoError::validation("unbalanced braces in function body"))
}

fn compile_body(name: String, params: Vec<String>, body: Vec<Token>) -> MemoResult<CodeObject> {
    // split out nested `fn` definitions first
    let mut nested = Vec::new();
    let mut flat = Vec::new();
    let mut idx = 0usize;
    while idx < body.len() {
        let starts_fn = body[idx].ident() == Some("fn")
            && matches!(body.get(idx + 1), Some(Token::Ident(_)))
            && body.get(idx + 2).map(|t| t.is_punct('(')).unwrap_or(false);
        if starts_fn {
            idx += 1;
            let sub_name = take_ident(&body, &mut idx)?;
            let sub_params = parse_params(&body, &mut idx)?;
            let sub_body = parse_braced(&body, &mut idx)?;
            nested.push(compile_body(sub_name, sub_params, sub_body)?);
        } else {
            flat.push(body[idx].clone());
            idx += 1;
        }
    }

    // a leading string statement is the docstring
    let mut doc = None;
    if let Some(Token::Str(s)) = flat.first() {
        let alone = flat.len() == 1 || flat.get(1).map(|t| t.is_punct(';')).unwrap_or(false);
        if alone {
            doc = Some(s.clone());
            flat.remove(0);
            if flat.first().map(|t| t.is_punct(';')).unwrap_or(false) {
                flat.remove(0);
            }
        }
    }

    // locals: parameters plus `let` bindings
    let mut locals: Vec<String> = params.clone();
    for pair in flat.windows(2) {
        if pair[0].ident() == Some("let") {
            if let Some(Token::Ident(n)) = pair.get(1) {
                if !locals.contains(n) {
                    locals.push(n.clone());
                }
            }
        }
    }

    let mut consts = Vec::new();
    let mut symbols: Vec<String> = Vec::new();
    let mut code = Vec::new();

    for (i, tok) in flat.iter().enumerate() {
        match tok {
            Token::Str(s) => {
                consts.push(Value::String(s.clone()));
                code.extend_from_slice(b"k");
            }
            Token::Number(n) => {
                let value = serde_json::from_str::<Value>(n)
                    .unwrap_or_else(|_| Value::String(n.clone()));
                consts.push(value);
                code.extend_from_slice(b"k");
            }
            Token::Ident(n) if n == "true" => {
                consts.push(Value::Bool(true));
                code.extend_from_slice(b"k");
            }
            Token::Ident(n) if n == "false" => {
                consts.push(Value::Bool(false));
                code.extend_from_slice(b"k");
            }
            Token::Ident(n) if n == "null" => {
                consts.push(Value::Null);
                code.extend_from_slice(b"k");
            }
            Token::Ident(n) => {
                let called = flat.get(i + 1).map(|t| t.is_punct('(')).unwrap_or(false);
                if called
                    && !KEYWORDS.contains(&n.as_str())
                    && !locals.contains(n)
                    && !symbols.contains(n)
                {
                    symbols.push(n.clone());
                }
                code.extend_from_slice(b"i:");
                code.extend_from_slice(n.as_bytes());
            }
            Token::Punct(c) => {
                code.extend_from_slice(b"p:");
                let mut buf = [0u8; 4];
                code.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
        code.push(0);
    }

    Ok(CodeObject {
        name,
        params,
        doc,
        consts,
        symbols,
        code,
        nested,
    })
}

/// Compute the fingerprint of a callable.
///
/// Wrapper registrations are peeled to the primitive first. The output is
/// the concatenation, in order, of: the serialized constant pool, the
/// names of non-opted-in referenced symbols, the instruction bytes, and
/// each recursively computed sub-fingerprint (nested definitions first,
/// then opted-in referenced symbols in occurrence order).
pub fn fingerprint(code: &CodeObject, registry: &CallableRegistry) -> MemoResult<Vec<u8>> {
    let primitive = registry.primitive_code(&code.name).unwrap_or(code);
    let mut visiting = Vec::new();
    fingerprint_inner(primitive, registry, &mut visiting)
}

fn fingerprint_inner(
    code: &CodeObject,
    registry: &CallableRegistry,
    visiting: &mut Vec<String>,
) -> MemoResult<Vec<u8>> {
    if visiting.iter().any(|n| n == &code.name) {
        return Err(MemoError::validation(format!(
            "fingerprint recursion cycle through `{}`",
            code.name
        )));
    }
    visiting.push(code.name.clone());

    let mut subs: Vec<Vec<u8>> = Vec::new();
    for nested in &code.nested {
        subs.push(fingerprint_inner(nested, registry, visiting)?);
    }

    let mut opaque: Vec<&str> = Vec::new();
    for symbol in &code.symbols {
        match registry.resolve(symbol) {
            Some(entry) if entry.hashable => {
                subs.push(fingerprint_inner(&entry.code, registry, visiting)?);
            }
            _ => opaque.push(symbol),
        }
    }

    let mut out = serde_json::to_vec(&code.consts)
        .map_err(|e| MemoError::serialization(format!("const pool encoding failed: {e}")))?;
    out.push(0);
    out.extend(
        serde_json::to_vec(&opaque)
            .map_err(|e| MemoError::serialization(format!("symbol list encoding failed: {e}")))?,
    );
    out.push(0);
    out.extend_from_slice(&code.code);
    for sub in subs {
        out.extend(sub);
    }

    visiting.pop();
    Ok(out)
}
