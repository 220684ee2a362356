//! Template engine for rule and message bodies.
//!
//! Bodies embed actions between `[[` and `]]`, which leaves Go / Prometheus
//! `{{ }}` markers of alerting rules untouched. The action language is a
//! restricted pipeline language: field access (`.for`), literals, function
//! calls with the fixed set of `funcs`, `if` / `range` blocks, and
//! `[[-` / `-]]` whitespace trimming.
//!
//! Rendering is all-or-nothing: output is buffered and returned only when
//! every action evaluated successfully.

use std::collections::BTreeMap;

mod definition;
mod exec;
mod funcs;
mod lex;
mod parse;

pub use definition::{
    decode_rule_nodes, message_content, messages, parse_definition, rule_nodes, Definition,
};
pub use lex::{LEFT_DELIM, RIGHT_DELIM};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to parse template definition")]
    Definition(#[source] serde_yaml::Error),
    #[error("template definition is missing a {0:?}")]
    MissingField(&'static str),
    #[error("failed to decode template body")]
    Body(#[source] serde_yaml::Error),
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("line {line}: executing: {message}")]
    Exec { line: usize, message: String },
    #[error("no message content for receiver type {0:?}")]
    NoMessage(String),
    #[error("failed to serialize render data")]
    Data(#[source] serde_json::Error),
}

impl From<Error> for models::Error {
    fn from(err: Error) -> Self {
        // Every template failure is an authoring problem.
        models::Error::new(models::ErrorKind::Invalid, err)
    }
}

/// Text is a parsed template body, which may be executed many times.
#[derive(Debug, Clone)]
pub struct Text {
    nodes: Vec<parse::Node>,
}

impl Text {
    pub fn parse(source: &str) -> Result<Self, Error> {
        let items = lex::scan(source)?;
        let nodes = parse::parse(items)?;
        Ok(Self { nodes })
    }

    /// Execute against `data`, which is the initial `.` of actions.
    pub fn execute(&self, data: &serde_json::Value) -> Result<String, Error> {
        let mut out = String::new();
        exec::execute(&self.nodes, data, &mut out)?;
        Ok(out)
    }

    /// Execute against the JSON form of a serializable `data`.
    pub fn render<T: serde::Serialize>(&self, data: &T) -> Result<String, Error> {
        let data = serde_json::to_value(data).map_err(Error::Data)?;
        self.execute(&data)
    }
}

/// Extend `variables` with the default of each declared variable which
/// `variables` doesn't already supply.
pub fn enrich_with_defaults(
    declared: &[models::Variable],
    variables: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut enriched = variables.clone();

    for variable in declared {
        enriched
            .entry(variable.name.clone())
            .or_insert_with(|| variable.default.clone());
    }
    enriched
}

/// Render the body of `template` with `variables` enriched by the template's defaults.
pub fn render(
    template: &models::Template,
    variables: &BTreeMap<String, String>,
) -> Result<String, Error> {
    let enriched = enrich_with_defaults(&template.variables, variables);
    Text::parse(&template.body)?.render(&enriched)
}
