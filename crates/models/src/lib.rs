//! Entities shared by the template engine, the rule reconciliation service,
//! and the provider uploaders. Nothing here performs I/O.

mod alerts;
mod error;
mod namespaces;
mod plugins;
mod rules;
mod templates;

pub use alerts::Alert;
pub use error::{Error, ErrorExt, ErrorKind, Result};
pub use namespaces::{Namespace, Provider};
pub use plugins::{Handshake, PluginConfig, PluginsConfig};
pub use rules::{Rule, RuleFilter, RuleGroup, RuleNode, RuleVariable};
pub use templates::{is_reserved_name, Message, Template, Variable, RESERVED_SYSTEM_DEFAULT};
