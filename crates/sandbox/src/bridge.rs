//! Running caller-supplied functions inside the page

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::error::{SandboxError, SandboxResult};
use crate::page::PageDriver;

static FUNCTION_EXPR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:async\s+)?(?:function\b|\((?s:.*)\)\s*=>|[A-Za-z_$][A-Za-z0-9_$]*\s*=>)",
    )
    .expect("function pattern is valid")
});

/// JavaScript source known to be a function expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFunction(String);

impl PageFunction {
    /// Accepts `function ...`, `async function ...` and arrow functions.
    pub fn parse(source: impl Into<String>) -> SandboxResult<Self> {
        let source = source.into();
        if FUNCTION_EXPR.is_match(&source) {
            Ok(Self(source))
        } else {
            Err(SandboxError::InvalidArgument(format!(
                "evaluate expects a function, got `{}`",
                preview(&source)
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn preview(source: &str) -> &str {
    let trimmed = source.trim();
    match trimmed.char_indices().nth(40) {
        Some((end, _)) => &trimmed[..end],
        None => trimmed,
    }
}

/// Function-in, value-out access to the page.
#[derive(Clone)]
pub struct EvaluationBridge {
    page: Arc<dyn PageDriver>,
}

impl EvaluationBridge {
    pub fn new(page: Arc<dyn PageDriver>) -> Self {
        Self { page }
    }

    /// Run `function` in the page with `args` spread as its parameters.
    ///
    /// A non-function fails with [`SandboxError::InvalidArgument`] before the
    /// page is contacted. Errors thrown in the page come back unchanged.
    pub async fn evaluate(&self, function: &str, args: &[Value]) -> SandboxResult<Value> {
        let function = PageFunction::parse(function)?;
        debug!(args = args.len(), "Evaluating in page");
        self.page.evaluate(function.as_str(), args.to_vec()).await
    }

    /// [`evaluate`](Self::evaluate), deserializing the result.
    pub async fn evaluate_as<T: DeserializeOwned>(&self, function: &str, args: &[Value]) -> SandboxResult<T> {
        let value = self.evaluate(function, args).await?;
        Ok(serde_json::from_value(value)?)
    }
}
