//! Condition expression engine.
//!
//! A small arithmetic/boolean language evaluated per point: `+ - * / %`,
//! comparisons, `&& || !`, parentheses, identifiers over point fields and
//! tags, and a function library (`abs`, `min`, `max`, `regex`,
//! `avg(last_values, n)`, ...). Scripts are parsed once by recursive descent
//! and the AST is cached in an LRU keyed by expression text, so steady-state
//! evaluation never re-parses.

mod eval;
mod functions;
mod lexer;
mod parser;

pub use eval::{evaluate, EvalContext, ExprValue};
pub use parser::{parse, Expr};

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use thiserror::Error;

/// Default AST cache capacity.
pub const DEFAULT_CACHE_SIZE: usize = 10_000;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("Lex error at byte {pos}: {message}")]
    Lex { pos: usize, message: String },

    #[error("Parse error at token {pos}: {message}")]
    Parse { pos: usize, message: String },

    #[error("Evaluation error: {0}")]
    Eval(String),

    #[error("Unknown identifier '{0}'")]
    UnknownIdent(String),

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{name}: expected {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("Type mismatch: expected {expected}, got {got}")]
    Type {
        expected: &'static str,
        got: &'static str,
    },

    #[error("Series '{0}' has no samples yet")]
    EmptySeries(String),
}

/// Parsed-AST cache. Identical expression text parses at most once per LRU
/// lifetime; hit/miss counters make that property assertable.
pub struct ExprCache {
    inner: Mutex<LruCache<String, Arc<Expr>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ExprCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fetch the AST for `script`, parsing on first sight.
    pub fn get_or_parse(&self, script: &str) -> Result<Arc<Expr>, ExprError> {
        if let Ok(mut cache) = self.inner.lock() {
            if let Some(ast) = cache.get(script) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(ast));
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let ast = Arc::new(parse(script)?);
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(script.to_string(), Arc::clone(&ast));
        }
        Ok(ast)
    }

    /// Parse-and-evaluate convenience used by the condition evaluator.
    pub fn eval(&self, script: &str, ctx: &EvalContext<'_>) -> Result<ExprValue, ExprError> {
        let ast = self.get_or_parse(script)?;
        evaluate(&ast, ctx)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ExprCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}
