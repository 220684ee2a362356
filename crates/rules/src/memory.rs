//! In-memory implementations of the Rule Repository and of the Template,
//! Namespace and Provider lookups, for tests and local rendering.

use super::{NamespaceService, ProviderService, Repository, TemplateService, Txn};
use models::{Namespace, Provider, Rule, RuleFilter, Template};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default, Clone)]
struct State {
    // Rules keyed on their derived name.
    rules: BTreeMap<String, Rule>,
    next_id: u64,
}

/// MemoryStore is a Repository of Rules held in memory. Transactions are
/// serialized: a transaction holds the store's lock from `begin()` until
/// it's committed, rolled back, or dropped.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

pub struct MemoryTxn {
    guard: OwnedMutexGuard<State>,
    // Working copy, which replaces the guarded state on commit.
    staged: State,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All committed rules, ordered on name.
    pub async fn rules(&self) -> Vec<Rule> {
        self.state.lock().await.rules.values().cloned().collect()
    }
}

fn list(state: &State, filter: &RuleFilter) -> Vec<Rule> {
    let mut rules: Vec<Rule> = state
        .rules
        .values()
        .filter(|rule| filter.matches(rule))
        .cloned()
        .collect();
    rules.sort_by_key(|rule| rule.id);
    rules
}

#[async_trait::async_trait]
impl Repository for MemoryStore {
    type Txn = MemoryTxn;

    async fn begin(&self) -> models::Result<MemoryTxn> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(MemoryTxn { guard, staged })
    }

    async fn list(&self, filter: &RuleFilter) -> models::Result<Vec<Rule>> {
        Ok(list(&*self.state.lock().await, filter))
    }
}

#[async_trait::async_trait]
impl Txn for MemoryTxn {
    async fn upsert(&mut self, rule: &Rule) -> models::Result<Rule> {
        let now = chrono::Utc::now();
        let staged = &mut self.staged;

        let rule = match staged.rules.get(&rule.name) {
            Some(existing) => Rule {
                id: existing.id,
                created_at: existing.created_at,
                updated_at: Some(now),
                ..rule.clone()
            },
            None => {
                staged.next_id += 1;
                Rule {
                    id: staged.next_id,
                    created_at: Some(now),
                    updated_at: Some(now),
                    ..rule.clone()
                }
            }
        };
        staged.rules.insert(rule.name.clone(), rule.clone());
        Ok(rule)
    }

    async fn list(&mut self, filter: &RuleFilter) -> models::Result<Vec<Rule>> {
        Ok(list(&self.staged, filter))
    }

    async fn commit(mut self) -> models::Result<()> {
        *self.guard = self.staged;
        Ok(())
    }

    async fn rollback(self) -> models::Result<()> {
        Ok(())
    }
}

/// Catalog holds the Templates, Namespaces and Providers which rules refer to.
#[derive(Debug, Default)]
pub struct Catalog {
    pub templates: BTreeMap<String, Template>,
    pub namespaces: BTreeMap<u64, Namespace>,
    pub providers: BTreeMap<u64, Provider>,
}

#[async_trait::async_trait]
impl TemplateService for Catalog {
    async fn get_by_name(&self, name: &str) -> models::Result<Template> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| models::Error::not_found(format!("template {name:?} not found")))
    }
}

#[async_trait::async_trait]
impl NamespaceService for Catalog {
    async fn get(&self, id: u64) -> models::Result<Namespace> {
        self.namespaces
            .get(&id)
            .cloned()
            .ok_or_else(|| models::Error::not_found(format!("namespace {id} not found")))
    }
}

#[async_trait::async_trait]
impl ProviderService for Catalog {
    async fn get(&self, id: u64) -> models::Result<Provider> {
        self.providers
            .get(&id)
            .cloned()
            .ok_or_else(|| models::Error::not_found(format!("provider {id} not found")))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rule(name: &str, group_name: &str) -> Rule {
        Rule {
            name: name.to_string(),
            enabled: true,
            namespace: "billing".to_string(),
            group_name: group_name.to_string(),
            template: "cpu-usage".to_string(),
            provider_namespace: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_transactions_commit_or_discard() {
        let store = MemoryStore::new();

        let mut txn = store.begin().await.unwrap();
        assert_eq!(txn.upsert(&rule("a", "g1")).await.unwrap().id, 1);
        assert_eq!(txn.upsert(&rule("b", "g2")).await.unwrap().id, 2);
        // Upsert of an existing name keeps its id.
        assert_eq!(txn.upsert(&rule("a", "g1")).await.unwrap().id, 1);

        let g1 = RuleFilter {
            group_name: Some("g1".to_string()),
            ..Default::default()
        };
        assert_eq!(txn.list(&g1).await.unwrap().len(), 1);
        txn.commit().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        txn.upsert(&rule("c", "g1")).await.unwrap();
        assert_eq!(txn.list(&g1).await.unwrap().len(), 2);
        txn.rollback().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        txn.upsert(&rule("d", "g1")).await.unwrap();
        std::mem::drop(txn); // Dropped, as if cancelled.

        let names: Vec<_> = store.rules().await.into_iter().map(|r| r.name).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(store.list(&g1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transactions_are_serialized() {
        let store = MemoryStore::new();
        let txn = store.begin().await.unwrap();

        let other = store.clone();
        let mut waiting = tokio::spawn(async move {
            let mut txn = other.begin().await.unwrap();
            txn.upsert(&rule("b", "g1")).await.unwrap();
            txn.commit().await.unwrap();
        });

        // The second transaction can't begin while the first is open.
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), &mut waiting)
                .await
                .is_err()
        );
        txn.commit().await.unwrap();
        waiting.await.unwrap();

        assert_eq!(store.rules().await.len(), 1);
    }
}
