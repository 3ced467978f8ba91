//! Evaluation of CEL expressions embedded in arbitrary data trees.
//!
//! Expressions are delimited by `${ ... }` and may appear as whole strings
//! (the native result type is preserved), as substrings (the result is
//! stringified and spliced), as map keys (the result must be a string) and
//! anywhere inside nested maps and lists.
//!
//! The engine keeps two process-wide caches, both safe for concurrent use:
//! environments keyed by the set of declared top-level variable names, and
//! compiled programs keyed by (environment, expression source). Both are
//! bounded LRU caches; [`TemplateEngineOptions::disable_caching`] turns them
//! off, which must not change any rendered output.

use cel_interpreter::{Context, ExecutionError, Program, Value as CelValue};
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};

mod cache;
mod functions;
mod value;

use cache::LruCache;
pub(crate) use functions::OMIT_MARKER;
use value::{cel_to_json, cel_type_name, json_to_cel};

use crate::snapshot::Document;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("unbalanced expression delimiters in {input:?}"))]
    UnbalancedDelimiters { input: String },

    #[snafu(display("failed to parse expression {expression:?}: {message}"))]
    Parse { expression: String, message: String },

    #[snafu(display("failed to evaluate expression {expression:?}"))]
    Eval {
        source: ExecutionError,
        expression: String,
    },

    #[snafu(display("map key expression {expression:?} evaluated to {actual} instead of a string"))]
    DynamicKeyNotString {
        expression: String,
        actual: &'static str,
    },

    #[snafu(display("expression produced a value not representable in the output: {kind}"))]
    UnrepresentableValue { kind: &'static str },
}

impl Error {
    /// True for the two evaluation errors classified as *missing data*:
    /// referencing an undeclared variable and accessing an absent map key.
    /// `includeWhen` and patch `where` contexts tolerate these; everywhere
    /// else they abort the render.
    pub fn is_missing_data(&self) -> bool {
        matches!(
            self,
            Self::Eval {
                source: ExecutionError::NoSuchKey(_) | ExecutionError::UndeclaredReference(_),
                ..
            }
        )
    }
}

#[derive(Clone, Debug)]
pub struct TemplateEngineOptions {
    pub environment_cache_size: usize,
    pub program_cache_size: usize,

    /// Bypass both caches. Output must be identical either way; tests use
    /// this to prove cache transparency.
    pub disable_caching: bool,
}

impl Default for TemplateEngineOptions {
    fn default() -> Self {
        Self {
            environment_cache_size: 64,
            program_cache_size: 1024,
            disable_caching: false,
        }
    }
}

/// The set of top-level variable names an expression is evaluated against.
/// Contexts with the same variable names share an environment, and compiled
/// programs are reused per environment.
pub(crate) struct Environment {
    variables: Vec<String>,
}

impl Environment {
    fn cache_key(context: &Document) -> String {
        // Document keys are already sorted (BTreeMap backing)
        context.keys().cloned().collect::<Vec<_>>().join("\0")
    }
}

pub struct TemplateEngine {
    environments: LruCache<String, Environment>,
    programs: LruCache<(String, String), Program>,
}

impl TemplateEngine {
    pub fn new(options: &TemplateEngineOptions) -> Self {
        let (environment_capacity, program_capacity) = if options.disable_caching {
            (0, 0)
        } else {
            (options.environment_cache_size, options.program_cache_size)
        };
        Self {
            environments: LruCache::new(environment_capacity),
            programs: LruCache::new(program_capacity),
        }
    }

    /// Renders a data tree: walks `template`, evaluates every embedded
    /// expression against `context` and prunes omit sentinels from the
    /// result.
    pub fn render(&self, template: &Value, context: &Document) -> Result<Value> {
        let mut rendered = self.render_value(template, context)?;
        prune_omitted(&mut rendered);
        Ok(rendered)
    }

    /// Evaluates a standalone expression string as used by `includeWhen`,
    /// `forEach` and patch `where` fields. Accepts both the `${...}`-wrapped
    /// form and a bare expression.
    pub fn eval_expr(&self, expression: &str, context: &Document) -> Result<Value> {
        let tokens = tokenize(expression)?;
        let source = match tokens.as_slice() {
            [Token::Expression(source)] => *source,
            _ => expression,
        };
        let result = self.eval(source, context)?;
        cel_to_json(&result)
    }

    /// Renders a string with splice semantics only: every token is
    /// stringified, whole-string expressions included. Used for templated
    /// patch paths.
    pub fn render_to_string(&self, input: &str, context: &Document) -> Result<String> {
        let mut output = String::new();
        for token in tokenize(input)? {
            match token {
                Token::Literal(literal) => output.push_str(literal),
                Token::Expression(source) => {
                    let result = self.eval(source, context)?;
                    output.push_str(&stringify(&result)?);
                }
            }
        }
        Ok(output)
    }

    fn render_value(&self, template: &Value, context: &Document) -> Result<Value> {
        match template {
            Value::String(input) => self.render_string(input, context),
            Value::Array(items) => {
                let mut rendered = Vec::with_capacity(items.len());
                for item in items {
                    let item = self.render_value(item, context)?;
                    if !is_omit_marker(&item) {
                        rendered.push(item);
                    }
                }
                Ok(Value::Array(rendered))
            }
            Value::Object(map) => {
                let mut rendered = Map::new();
                for (key, template_value) in map {
                    let key = match self.render_string(key, context)? {
                        Value::String(key) => key,
                        other => {
                            return DynamicKeyNotStringSnafu {
                                expression: key.clone(),
                                actual: crate::schema::json_type_name(&other),
                            }
                            .fail();
                        }
                    };
                    if key == OMIT_MARKER {
                        continue;
                    }
                    let rendered_value = self.render_value(template_value, context)?;
                    if !is_omit_marker(&rendered_value) {
                        rendered.insert(key, rendered_value);
                    }
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    fn render_string(&self, input: &str, context: &Document) -> Result<Value> {
        let tokens = tokenize(input)?;

        // A whole-string expression preserves the native result type
        if let [Token::Expression(source)] = tokens.as_slice() {
            let result = self.eval(source, context)?;
            return cel_to_json(&result);
        }

        let mut output = String::new();
        for token in &tokens {
            match token {
                Token::Literal(literal) => output.push_str(literal),
                Token::Expression(source) => {
                    let result = self.eval(source, context)?;
                    let spliced = stringify(&result)?;
                    // An omitted token omits the whole leaf
                    if spliced == OMIT_MARKER {
                        return Ok(Value::String(OMIT_MARKER.to_owned()));
                    }
                    output.push_str(&spliced);
                }
            }
        }
        Ok(Value::String(output))
    }

    fn eval(&self, source: &str, context: &Document) -> Result<CelValue> {
        let environment_key = Environment::cache_key(context);
        let environment = self
            .environments
            .get_or_try_insert_with(&environment_key, || {
                Ok::<_, Error>(Environment {
                    variables: context.keys().cloned().collect(),
                })
            })?;

        let program_key = (environment_key, source.to_owned());
        let program = self.programs.get_or_try_insert_with(&program_key, || {
            Program::compile(source).map_err(|err| {
                ParseSnafu {
                    expression: source,
                    message: err.to_string(),
                }
                .build()
            })
        })?;

        let mut cel_context = Context::default();
        functions::register(&mut cel_context);
        for name in &environment.variables {
            let variable = context.get(name).cloned().unwrap_or(Value::Null);
            cel_context.add_variable_from_value(name.clone(), json_to_cel(&variable));
        }

        program
            .execute(&cel_context)
            .context(EvalSnafu { expression: source })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Token<'a> {
    Literal(&'a str),
    Expression(&'a str),
}

/// Splits `input` into literal and `${...}` expression tokens. Braces inside
/// an expression are balance-counted, so expressions may contain `{` / `}`
/// (CEL map and message literals).
fn tokenize(input: &str) -> Result<Vec<Token<'_>>> {
    let mut tokens = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        if start > 0 {
            tokens.push(Token::Literal(&rest[..start]));
        }

        let body = &rest[start + 2..];
        let mut depth = 1_usize;
        let mut end = None;
        for (offset, ch) in body.char_indices() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(offset);
                        break;
                    }
                }
                _ => {}
            }
        }

        let Some(end) = end else {
            return UnbalancedDelimitersSnafu { input }.fail();
        };
        tokens.push(Token::Expression(&body[..end]));
        rest = &body[end + 1..];
    }

    if !rest.is_empty() {
        tokens.push(Token::Literal(rest));
    }
    Ok(tokens)
}

fn stringify(value: &CelValue) -> Result<String> {
    if let CelValue::String(string) = value {
        return Ok(string.as_ref().clone());
    }
    let json = cel_to_json(value)?;
    serde_json::to_string(&json).map_err(|_| {
        UnrepresentableValueSnafu {
            kind: cel_type_name(value),
        }
        .build()
    })
}

fn is_omit_marker(value: &Value) -> bool {
    matches!(value, Value::String(string) if string == OMIT_MARKER)
}

/// Removes omit sentinels that surfaced through nested evaluation, e.g. a
/// whole-string expression returning a map that contains omitted values.
fn prune_omitted(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, entry| !is_omit_marker(entry));
            for entry in map.values_mut() {
                prune_omitted(entry);
            }
        }
        Value::Array(items) => {
            items.retain(|item| !is_omit_marker(item));
            for item in items {
                prune_omitted(item);
            }
        }
        _ => {}
    }
}
