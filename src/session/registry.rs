use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use axum::http::StatusCode;
use tracing::{debug, info};

use super::SessionContext;
use crate::errors::{AppError, SERVER_ERROR};

/// Live sessions keyed by transport-assigned id. Locks are never held
/// across an await.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<SessionContext>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, context: Arc<SessionContext>) -> Result<(), AppError> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if sessions.contains_key(context.id()) {
            return Err(AppError::protocol(
                StatusCode::CONFLICT,
                SERVER_ERROR,
                format!("Session already exists: {}", context.id()),
            ));
        }
        sessions.insert(context.id().to_string(), context);
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionContext>> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
            .cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.get(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Tears a session down and forgets it. Safe to call from several paths:
    /// only the first caller drains, the rest return `false`.
    pub async fn close(&self, session_id: &str) -> bool {
        let Some(context) = self.get(session_id) else {
            debug!(session_id = %session_id, "close requested for unknown session");
            return false;
        };
        if !context.begin_closing() {
            return false;
        }

        context.drain().await;

        // Re-check after the await: only remove the entry we drained.
        {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if sessions
                .get(session_id)
                .is_some_and(|stored| Arc::ptr_eq(stored, &context))
            {
                sessions.remove(session_id);
            }
        }
        context.mark_closed();

        info!(
            session_id = %session_id,
            transport = %context.transport().kind(),
            "session closed"
        );
        true
    }

    pub async fn close_all(&self) {
        for session_id in self.ids() {
            self.close(&session_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        bus::InMemoryBus,
        session::{SessionState, TransportHandle},
        testing::MockBackend,
        toolset::ToolsetService,
    };

    fn context(id: &str) -> Arc<SessionContext> {
        SessionContext::new(id.to_string(), TransportHandle::streamable())
    }

    #[test]
    fn one_context_per_id() {
        let registry = SessionRegistry::new();
        registry.insert(context("a")).expect("insert");

        let err = registry.insert(context("a")).expect_err("duplicate");
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn double_close_matches_single_close() {
        let registry = SessionRegistry::new();
        let session = context("a");
        registry.insert(Arc::clone(&session)).expect("insert");
        registry.insert(context("b")).expect("insert");

        assert!(registry.close("a").await);
        assert!(!registry.close("a").await);
        assert_eq!(registry.ids(), vec!["b".to_string()]);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.transport().is_closed());
    }

    #[tokio::test]
    async fn completion_is_visible_through_earlier_references() {
        let registry = SessionRegistry::new();
        let bus = Arc::new(InMemoryBus::new());
        let session = context("a");
        registry.insert(Arc::clone(&session)).expect("insert");

        let held = registry.get("a").expect("partial context");
        assert_eq!(held.state(), SessionState::Initialized);
        assert!(held.toolset().is_none());

        let toolset = Arc::new(ToolsetService::new(
            bus.clone(),
            MockBackend::identity(),
            Duration::from_millis(50),
            Duration::from_millis(50),
        ));
        toolset.start().await.expect("started");
        session
            .complete(Arc::clone(&toolset), tokio::spawn(async {}))
            .expect("completed");

        assert_eq!(held.state(), SessionState::Active);
        assert!(held.toolset().is_some());

        assert!(registry.close("a").await);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn completing_a_closed_session_fails() {
        let registry = SessionRegistry::new();
        let session = context("a");
        registry.insert(Arc::clone(&session)).expect("insert");
        assert!(registry.close("a").await);

        let bus = Arc::new(InMemoryBus::new());
        let toolset = Arc::new(ToolsetService::new(
            bus,
            MockBackend::identity(),
            Duration::from_millis(50),
            Duration::from_millis(50),
        ));
        assert!(session.complete(toolset, tokio::spawn(async {})).is_err());
        assert!(registry.is_empty());
    }
}
