//! Idempotent topic provisioning
//!
//! [`TopicProvisioner::ensure_topic`] opens an admin session, creates the topic
//! only if the broker does not already list it, and always closes the session.

use crate::error::{BrokerError, ProvisionError};
use crate::lifecycle::retry::{retry_async, RetryPolicy};
use crate::lifecycle::Role;
use crate::observability::metrics::metrics;
use crate::transport::{AdminSession, AdminTransport};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Longest topic name the broker accepts
pub const MAX_TOPIC_NAME_LEN: usize = 249;

static TOPIC_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._-]+$").unwrap());

/// Validate a topic name against broker naming rules
pub fn validate_topic_name(name: &str) -> Result<(), ProvisionError> {
    if name.is_empty() {
        return Err(ProvisionError::InvalidSpec(
            "topic name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_TOPIC_NAME_LEN {
        return Err(ProvisionError::InvalidSpec(format!(
            "topic name exceeds {MAX_TOPIC_NAME_LEN} characters"
        )));
    }
    if name == "." || name == ".." {
        return Err(ProvisionError::InvalidSpec(format!(
            "topic name '{name}' is reserved"
        )));
    }
    if !TOPIC_NAME.is_match(name) {
        return Err(ProvisionError::InvalidSpec(format!(
            "topic name '{name}' may only contain [a-zA-Z0-9._-]"
        )));
    }
    Ok(())
}

/// Desired topic layout. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TopicSpec {
    name: String,
    partitions: u32,
    replication_factor: u32,
}

impl TopicSpec {
    pub fn new(
        name: impl Into<String>,
        partitions: u32,
        replication_factor: u32,
    ) -> Result<Self, ProvisionError> {
        let name = name.into();
        validate_topic_name(&name)?;

        if partitions == 0 {
            return Err(ProvisionError::InvalidSpec(
                "partition count must be at least 1".to_string(),
            ));
        }
        if replication_factor == 0 {
            return Err(ProvisionError::InvalidSpec(
                "replication factor must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            name,
            partitions,
            replication_factor,
        })
    }

    /// Single-replica topic with the given partition count
    pub fn with_partitions(name: impl Into<String>, partitions: u32) -> Result<Self, ProvisionError> {
        Self::new(name, partitions, 1)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn replication_factor(&self) -> u32 {
        self.replication_factor
    }
}

/// What `ensure_topic` had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Created,
    AlreadyExisted,
}

/// Anything that can guarantee a topic exists
#[async_trait]
pub trait EnsureTopic: Send + Sync {
    async fn ensure_topic(&self, spec: &TopicSpec) -> Result<ProvisionOutcome, ProvisionError>;
}

/// Topic provisioner backed by an admin transport
pub struct TopicProvisioner<A: AdminTransport> {
    admin: A,
    retry: RetryPolicy,
}

impl<A: AdminTransport> TopicProvisioner<A> {
    pub fn new(admin: A, retry: RetryPolicy) -> Self {
        Self { admin, retry }
    }

    pub fn admin(&self) -> &A {
        &self.admin
    }

    async fn open_session(&self) -> Result<A::Session, ProvisionError> {
        retry_async(&self.retry, "admin_open", || async {
            metrics().connection_attempt(Role::Admin);
            let opened = self.admin.open().await;
            match &opened {
                Ok(_) => metrics().connection_established(Role::Admin),
                Err(_) => metrics().connection_failed(Role::Admin),
            }
            opened
        })
        .await
        .map_err(ProvisionError::SessionUnavailable)
    }

    async fn ensure_with_session(
        &self,
        session: &A::Session,
        spec: &TopicSpec,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let topics = retry_async(&self.retry, "list_topics", || session.list_topics())
            .await
            .map_err(ProvisionError::ListFailed)?;

        if topics.iter().any(|t| t == spec.name()) {
            debug!(topic = spec.name(), "Topic already exists");
            return Ok(ProvisionOutcome::AlreadyExisted);
        }

        match session.create_topics(std::slice::from_ref(spec)).await {
            Ok(()) => Ok(ProvisionOutcome::Created),
            // Lost a creation race with another client
            Err(BrokerError::TopicAlreadyExists(_)) => Ok(ProvisionOutcome::AlreadyExisted),
            Err(source) => Err(ProvisionError::CreateRejected {
                topic: spec.name().to_string(),
                source,
            }),
        }
    }
}

#[async_trait]
impl<A: AdminTransport> EnsureTopic for TopicProvisioner<A> {
    async fn ensure_topic(&self, spec: &TopicSpec) -> Result<ProvisionOutcome, ProvisionError> {
        let session = self.open_session().await?;

        let outcome = self.ensure_with_session(&session, spec).await;

        if let Err(e) = session.close().await {
            warn!(topic = spec.name(), error = %e, "Failed to close admin session");
        }
        metrics().connection_closed(Role::Admin);

        match &outcome {
            Ok(ProvisionOutcome::Created) => {
                metrics().record_topic_created();
                info!(
                    topic = spec.name(),
                    partitions = spec.partitions(),
                    replication_factor = spec.replication_factor(),
                    "Topic created"
                );
            }
            Ok(ProvisionOutcome::AlreadyExisted) => {
                info!(topic = spec.name(), "Topic already present");
            }
            Err(e) => {
                warn!(topic = spec.name(), error = %e, "Topic provisioning failed");
            }
        }

        outcome
    }
}
