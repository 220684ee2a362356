//! Rule reconciliation: persist a Rule, and push the consistent state of its
//! whole Rule Group to the provider's alerting backend.
//!
//! The remote push happens inside the database transaction which upserted
//! the Rule. A Rule is committed only if its group was pushed, and a failed
//! database write never reaches the backend.

use models::{Namespace, Provider, Rule, RuleFilter, RuleVariable, Template};
use providers::{Registry, UpsertRule};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub mod postgres;

#[async_trait::async_trait]
pub trait TemplateService: Send + Sync {
    async fn get_by_name(&self, name: &str) -> models::Result<Template>;
}

#[async_trait::async_trait]
pub trait NamespaceService: Send + Sync {
    async fn get(&self, id: u64) -> models::Result<Namespace>;
}

#[async_trait::async_trait]
pub trait ProviderService: Send + Sync {
    async fn get(&self, id: u64) -> models::Result<Provider>;
}

/// Repository is the persistent store of Rules.
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    type Txn: Txn;

    /// Begin a transaction. A transaction which is dropped without being
    /// committed is rolled back.
    async fn begin(&self) -> models::Result<Self::Txn>;

    async fn list(&self, filter: &RuleFilter) -> models::Result<Vec<Rule>>;
}

/// Txn is an open transaction of a Repository.
#[async_trait::async_trait]
pub trait Txn: Send + Sized {
    /// Insert `rule`, or update the Rule having its name, returning the Rule
    /// as stored. The upserted row stays locked until the transaction ends.
    async fn upsert(&mut self, rule: &Rule) -> models::Result<Rule>;

    async fn list(&mut self, filter: &RuleFilter) -> models::Result<Vec<Rule>>;

    async fn commit(self) -> models::Result<()>;

    async fn rollback(self) -> models::Result<()>;
}

/// Service reconciles Rules against the alerting backends of their providers.
pub struct Service<R> {
    repository: R,
    templates: Arc<dyn TemplateService>,
    namespaces: Arc<dyn NamespaceService>,
    providers: Arc<dyn ProviderService>,
    uploaders: Registry,
    remote_timeout: Duration,
}

impl<R: Repository> Service<R> {
    pub fn new(
        repository: R,
        templates: Arc<dyn TemplateService>,
        namespaces: Arc<dyn NamespaceService>,
        providers: Arc<dyn ProviderService>,
        uploaders: Registry,
    ) -> Self {
        Self {
            repository,
            templates,
            namespaces,
            providers,
            uploaders,
            remote_timeout: Duration::from_secs(30),
        }
    }

    /// Bound each call to a rule uploader by `timeout`. The call is made
    /// with a database transaction open, so it must not hang.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub async fn list(&self, filter: &RuleFilter) -> models::Result<Vec<Rule>> {
        self.repository.list(filter).await
    }

    /// Upsert `rule` and reconcile its Rule Group, returning the Rule as stored.
    #[tracing::instrument(
        skip_all,
        fields(
            namespace = %rule.namespace,
            group_name = %rule.group_name,
            template = %rule.template,
        ),
        err(Display),
    )]
    pub async fn upsert(&self, mut rule: Rule) -> models::Result<Rule> {
        let template = self.templates.get_by_name(&rule.template).await?;
        rule.variables = merge_variables(&template, &rule.variables);

        let namespace = self.namespaces.get(rule.provider_namespace).await?;
        let provider = self.providers.get(namespace.provider).await?;

        rule.name = Rule::derive_name(
            &provider.urn,
            &namespace.urn,
            &rule.namespace,
            &rule.group_name,
            &rule.template,
        );

        let mut txn = self.repository.begin().await?;

        let rule = match txn.upsert(&rule).await {
            Ok(stored) => stored,
            Err(err) => return Err(rollback(txn, err).await),
        };

        match self
            .reconcile_group(&mut txn, &rule, &template, &namespace, &provider)
            .await
        {
            Ok(()) => {
                txn.commit().await?;
                tracing::info!(
                    name = %rule.name,
                    id = rule.id,
                    enabled = rule.enabled,
                    "upserted rule"
                );
                Ok(rule)
            }
            Err(err) => Err(rollback(txn, err).await),
        }
    }

    async fn reconcile_group(
        &self,
        txn: &mut R::Txn,
        rule: &Rule,
        template: &Template,
        namespace: &Namespace,
        provider: &Provider,
    ) -> models::Result<()> {
        let Some(uploader) = self.uploaders.get(&provider.type_) else {
            tracing::debug!(
                provider_type = %provider.type_,
                "provider has no rule uploader; rule is stored locally only"
            );
            return Ok(());
        };

        let group = txn
            .list(&RuleFilter {
                namespace: Some(rule.namespace.clone()),
                group_name: Some(rule.group_name.clone()),
                provider_namespace: Some(rule.provider_namespace),
                ..Default::default()
            })
            .await?;

        let rendered_group = self.render_group(&group, template).await?;
        tracing::debug!(
            members = group.len(),
            enabled = group.iter().filter(|r| r.enabled).count(),
            "rendered rule group"
        );

        let request = UpsertRule {
            namespace_urn: namespace.urn.clone(),
            provider: provider.clone(),
            rule: rule.clone(),
            template: template.clone(),
            rendered_group,
        };

        match tokio::time::timeout(self.remote_timeout, uploader.upsert_rule(request)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(models::Error::unavailable(format!(
                "rule uploader of provider type {:?} didn't respond within {:?}",
                provider.type_, self.remote_timeout
            ))),
        }
    }

    /// Render every enabled member of a Rule Group, concatenated so that
    /// each rendering begins on a new line.
    async fn render_group(&self, group: &[Rule], upserted: &Template) -> models::Result<String> {
        let mut by_name = BTreeMap::new();
        by_name.insert(upserted.name.clone(), upserted.clone());

        let mut rendered = String::new();

        for member in group.iter().filter(|r| r.enabled) {
            if !by_name.contains_key(&member.template) {
                let template = self.templates.get_by_name(&member.template).await?;
                by_name.insert(member.template.clone(), template);
            }
            let template = &by_name[&member.template];

            let fragment = templates::render(template, &member.variable_values()).map_err(|err| {
                models::Error::from(err).context(format!("rendering rule {:?}", member.name))
            })?;

            if !rendered.is_empty() && !rendered.ends_with('\n') {
                rendered.push('\n');
            }
            rendered.push_str(&fragment);
        }
        Ok(rendered)
    }
}

/// Merge the variables supplied by a rule with the variables declared by its
/// Template. The result holds one variable per declared variable, in
/// declaration order, taking the rule's value where it has one and the
/// declared default otherwise. Undeclared variables of the rule are dropped.
pub fn merge_variables(template: &Template, supplied: &[RuleVariable]) -> Vec<RuleVariable> {
    template
        .variables
        .iter()
        .map(|declared| {
            let value = supplied
                .iter()
                .find(|v| v.name == declared.name)
                .map(|v| v.value.clone())
                .unwrap_or_else(|| declared.default.clone());

            RuleVariable {
                name: declared.name.clone(),
                type_: declared.type_.clone(),
                value,
                description: declared.description.clone(),
            }
        })
        .collect()
}

/// Roll back `txn` after `err`. A failed rollback is reported together with
/// the error which caused it, as the committed state is then unknown.
async fn rollback<T: Txn>(txn: T, err: models::Error) -> models::Error {
    match txn.rollback().await {
        Ok(()) => err,
        Err(rollback_err) => models::Error::new(
            err.kind,
            anyhow::anyhow!(
                "rollback error: {:#} with error: {:#}",
                rollback_err.error,
                err.error
            ),
        ),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::Variable;

    #[test]
    fn test_merge_variables() {
        let template = Template {
            name: "cpu-usage".to_string(),
            variables: ["for", "warning", "critical"]
                .into_iter()
                .map(|name| Variable {
                    name: name.to_string(),
                    type_: "string".to_string(),
                    default: format!("default-{name}"),
                    description: format!("the {name}"),
                })
                .collect(),
            ..Default::default()
        };
        let supplied = vec![
            RuleVariable {
                name: "critical".to_string(),
                type_: "int".to_string(),
                value: "90".to_string(),
                description: "ignored".to_string(),
            },
            RuleVariable {
                name: "undeclared".to_string(),
                value: "dropped".to_string(),
                ..Default::default()
            },
        ];

        insta::assert_json_snapshot!(merge_variables(&template, &supplied), @r###"
        [
          {
            "name": "for",
            "type": "string",
            "value": "default-for",
            "description": "the for"
          },
          {
            "name": "warning",
            "type": "string",
            "value": "default-warning",
            "description": "the warning"
          },
          {
            "name": "critical",
            "type": "string",
            "value": "90",
            "description": "the critical"
          }
        ]
        "###);
    }
}
