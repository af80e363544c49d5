//! Entity enumeration: list, keep running entities, apply the entity filter.

use crate::backend::Session;
use crate::error::{CollectError, Result};
use crate::filter::{select, FilterSpec};
use crate::metrics::Entity;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// List the running entities that survive `filter`, in listing order.
///
/// Any listing failure or an overrun of `deadline` is a
/// [`CollectError::Connection`]; there is no partial result.
pub async fn list_active_entities(
    session: &dyn Session,
    filter: &FilterSpec,
    deadline: Duration,
) -> Result<Vec<Entity>> {
    let listed = match timeout(deadline, session.list_entities()).await {
        Ok(Ok(listed)) => listed,
        Ok(Err(e @ CollectError::Connection(_))) => return Err(e),
        Ok(Err(e)) => return Err(CollectError::Connection(e.to_string())),
        Err(_) => {
            return Err(CollectError::Connection(format!(
                "entity listing timed out after {:?}",
                deadline
            )))
        }
    };

    let total = listed.len();
    let running: Vec<Entity> = listed.into_iter().filter(Entity::is_running).collect();
    let ids: HashSet<String> = running.iter().map(|e| e.id.clone()).collect();
    let selected = select(ids, filter)?;

    let entities: Vec<Entity> = running
        .into_iter()
        .filter(|e| selected.contains(&e.id))
        .collect();
    debug!(listed = total, selected = entities.len(), "Enumerated entities");
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{EntityState, StatReader};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Listing {
        entities: Vec<Entity>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Session for Listing {
        async fn list_entities(&self) -> Result<Vec<Entity>> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(CollectError::Read("lxc exited with 1".into()));
            }
            Ok(self.entities.clone())
        }
        fn readers(&self) -> &[Arc<dyn StatReader>] {
            &[]
        }
        async fn close(&self) {}
    }

    const SECOND: Duration = Duration::from_secs(1);

    fn listing(entities: Vec<Entity>) -> Listing {
        Listing {
            entities,
            delay: Duration::ZERO,
            fail: false,
        }
    }

    fn ids(entities: &[Entity]) -> Vec<&str> {
        entities.iter().map(|e| e.id.as_str()).collect()
    }

    #[tokio::test]
    async fn only_running_entities_survive() {
        let session = listing(vec![
            Entity::new("vm-a", "vm-a", EntityState::Running),
            Entity::new("vm-b", "vm-b", EntityState::NotRunning),
        ]);
        let out = list_active_entities(&session, &FilterSpec::default(), SECOND)
            .await
            .unwrap();
        assert_eq!(ids(&out), vec!["vm-a"]);
    }

    #[tokio::test]
    async fn entity_filter_keeps_listing_order() {
        let session = listing(
            ["c", "a", "b"]
                .iter()
                .map(|n| Entity::new(*n, *n, EntityState::Running))
                .collect(),
        );
        let out = list_active_entities(&session, &FilterSpec::exclude(["a"]), SECOND)
            .await
            .unwrap();
        assert_eq!(ids(&out), vec!["c", "b"]);

        let out = list_active_entities(&session, &FilterSpec::include(["b", "zzz"]), SECOND)
            .await
            .unwrap();
        assert_eq!(ids(&out), vec!["b"]);
    }

    #[tokio::test]
    async fn listing_failure_is_connection_error() {
        let session = Listing {
            fail: true,
            ..listing(Vec::new())
        };
        let err = list_active_entities(&session, &FilterSpec::default(), SECOND)
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::Connection(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_listing_times_out() {
        let session = Listing {
            delay: Duration::from_secs(30),
            ..listing(Vec::new())
        };
        let err = list_active_entities(&session, &FilterSpec::default(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::Connection(msg) if msg.contains("timed out")));
    }
}
