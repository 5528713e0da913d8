//! Liveness reporting for the long-running loops of the indexer.
//!
//! Every topic subscription and the batch timer hold a [`HealthHandle`] and
//! report on a schedule. The process is live only while every registered loop
//! has reported within its deadline:
//!   - no component registered yet: not live
//!   - any component reported unhealthy, or missed its deadline: not live
//!   - otherwise: live
use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, but has not reported yet.
    Starting,
    /// Reported healthy; must report again before this instant.
    HealthyUntil(OffsetDateTime),
    /// The component reported itself unhealthy.
    Unhealthy,
    /// The component missed its `HealthyUntil` deadline.
    Stalled,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl HealthStatus {
    fn evaluate(components: &HashMap<String, ComponentStatus>, now: OffsetDateTime) -> Self {
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, reported) in components {
            let effective = match reported {
                ComponentStatus::HealthyUntil(until) if *until > now => reported.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(effective, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), effective);
        }

        status
    }
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, format!("{:?}", self)).into_response()
    }
}

struct StatusUpdate {
    component: String,
    status: ComponentStatus,
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<StatusUpdate>,
}

impl HealthHandle {
    /// Report healthy until `now + deadline`. Call more often than the deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let update = StatusUpdate {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(update).await {
            warn!(component = %self.component, "failed to report health status: {}", err)
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<StatusUpdate>,
}

impl HealthRegistry {
    /// Create a registry and spawn the task applying status updates. Must be
    /// called from within a tokio runtime.
    pub fn new(name: &str) -> Self {
        let (sender, mut receiver) = mpsc::channel::<StatusUpdate>(16);
        let components: Arc<RwLock<HashMap<String, ComponentStatus>>> = Default::default();

        let shared = components.clone();
        tokio::spawn(async move {
            while let Some(update) = receiver.recv().await {
                match shared.write() {
                    Ok(mut map) => {
                        map.insert(update.component, update.status);
                    }
                    Err(_) => warn!("poisoned health registry lock"),
                }
            }
        });

        Self {
            name: name.to_owned(),
            components,
            sender,
        }
    }

    /// Register a component; the returned handle goes to the loop being watched.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Current process status. Usable directly as an axum handler result.
    pub fn get_status(&self) -> HealthStatus {
        let status = match self.components.read() {
            Ok(components) => HealthStatus::evaluate(&components, OffsetDateTime::now_utc()),
            Err(_) => {
                warn!("poisoned health registry lock");
                HealthStatus::default()
            }
        };

        if status.healthy {
            debug!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Sub;

    async fn assert_or_retry<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = OffsetDateTime::now_utc().add(Duration::seconds(5));
        while !check() && OffsetDateTime::now_utc() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn empty_registry_is_not_live() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn topic_loops_must_all_report() {
        let registry = HealthRegistry::new("liveness");
        let sell = registry
            .register("subscription_sell".to_string(), Duration::seconds(30))
            .await;
        let timer = registry
            .register("batch_timer".to_string(), Duration::seconds(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 2).await;
        assert!(!registry.get_status().healthy);

        sell.report_healthy().await;
        assert_or_retry(|| {
            registry.get_status().components.get("subscription_sell")
                != Some(&ComponentStatus::Starting)
        })
        .await;
        assert!(!registry.get_status().healthy);

        timer.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        sell.report_status(ComponentStatus::Unhealthy).await;
        assert_or_retry(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("subscription_sell"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[tokio::test]
    async fn missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("batch_timer".to_string(), Duration::seconds(30))
            .await;

        handle
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc().sub(Duration::seconds(1)),
            ))
            .await;
        assert_or_retry(|| {
            registry.get_status().components.get("batch_timer") == Some(&ComponentStatus::Stalled)
        })
        .await;
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn status_maps_to_http_code() {
        let down = HealthStatus::default().into_response();
        assert_eq!(down.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let up = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(up.status(), StatusCode::OK);
    }
}
