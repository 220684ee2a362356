use super::Error;
use models::{Message, RuleNode, Template, Variable};

/// Definition is the YAML document in which templates are authored.
#[derive(Debug, serde::Deserialize)]
pub struct Definition {
    pub name: String,
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(rename = "type", default)]
    pub type_: String,
    pub body: serde_yaml::Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

/// Parse a template definition. Its structured `body` is re-serialized to
/// YAML text, which becomes the Template body.
pub fn parse_definition(raw: &str) -> Result<Template, Error> {
    let Definition {
        name,
        api_version: _,
        type_: _,
        body,
        tags,
        variables,
    } = serde_yaml::from_str(raw).map_err(Error::Definition)?;

    if name.is_empty() {
        return Err(Error::MissingField("name"));
    }
    if body.is_null() {
        return Err(Error::MissingField("body"));
    }

    Ok(Template {
        name,
        body: to_yaml_text(&body)?,
        tags,
        variables,
        ..Default::default()
    })
}

/// Decode the un-rendered body of `template` as a sequence of rule nodes.
pub fn rule_nodes(template: &Template) -> Result<Vec<RuleNode>, Error> {
    decode_rule_nodes(&template.body)
}

/// Decode YAML text holding a sequence of rule nodes.
/// Empty text decodes to no nodes.
pub fn decode_rule_nodes(text: &str) -> Result<Vec<RuleNode>, Error> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(text).map_err(Error::Body)
}

/// Decode the body of `template` as a sequence of receiver-type messages.
pub fn messages(template: &Template) -> Result<Vec<Message>, Error> {
    if template.body.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(&template.body).map_err(Error::Body)
}

/// Content of the message of `template` for `receiver_type`.
pub fn message_content(template: &Template, receiver_type: &str) -> Result<String, Error> {
    messages(template)?
        .into_iter()
        .find(|message| message.receiver_type == receiver_type)
        .map(|message| message.content)
        .filter(|content| !content.is_empty())
        .ok_or_else(|| Error::NoMessage(receiver_type.to_string()))
}

// Scalars holding actions are emitted plain or single-quoted, never with
// escapes, so action text reaches the template parser as it was authored.
fn to_yaml_text(value: &serde_yaml::Value) -> Result<String, Error> {
    let text = serde_yaml::to_string(value).map_err(Error::Body)?;

    // Rendered bodies are concatenated into a single sequence.
    if text.ends_with('\n') {
        Ok(text)
    } else {
        Ok(text + "\n")
    }
}
