//! Command handlers for the `Policy` aggregate.

use uuid::Uuid;

use crate::{
    aggregate::AggregateRoot,
    domain::Policy,
    error::{CoreError, DomainError, DomainResult},
};

use super::{CommandExecutor, CommandMetadata, CommandOutcome};

impl CommandExecutor {
    pub(crate) async fn create_policy(
        &self,
        name: String,
        rules: serde_json::Value,
        metadata: &CommandMetadata,
    ) -> DomainResult<CommandOutcome> {
        let now = self.now();
        let (policy, transition) = Policy::create(name, rules, now)?;

        let mut tx = self.begin().await?;
        self.storage().policies.insert_in_tx(&mut tx, &policy).await?;
        let event_ids = self
            .persist_transition(
                &mut tx,
                Policy::AGGREGATE_TYPE,
                &policy.aggregate_id(),
                &transition,
                metadata,
                now,
            )
            .await?;
        tx.commit().await.map_err(CoreError::from)?;

        Ok(CommandOutcome { aggregate_id: policy.id, version: transition.new_version, event_ids })
    }

    pub(crate) async fn update_policy_rules(
        &self,
        policy_id: Uuid,
        expected_version: i32,
        rules: serde_json::Value,
        metadata: &CommandMetadata,
    ) -> DomainResult<CommandOutcome> {
        self.transition_policy(policy_id, expected_version, metadata, |policy, now| {
            policy.update_rules(expected_version, rules, now)
        })
        .await
    }

    pub(crate) async fn activate_policy(
        &self,
        policy_id: Uuid,
        expected_version: i32,
        metadata: &CommandMetadata,
    ) -> DomainResult<CommandOutcome> {
        self.transition_policy(policy_id, expected_version, metadata, |policy, now| {
            policy.activate(expected_version, now)
        })
        .await
    }

    pub(crate) async fn suspend_policy(
        &self,
        policy_id: Uuid,
        expected_version: i32,
        reason: String,
        metadata: &CommandMetadata,
    ) -> DomainResult<CommandOutcome> {
        self.transition_policy(policy_id, expected_version, metadata, |policy, now| {
            policy.suspend(expected_version, reason, now)
        })
        .await
    }

    pub(crate) async fn resume_policy(
        &self,
        policy_id: Uuid,
        expected_version: i32,
        metadata: &CommandMetadata,
    ) -> DomainResult<CommandOutcome> {
        self.transition_policy(policy_id, expected_version, metadata, |policy, now| {
            policy.resume(expected_version, now)
        })
        .await
    }

    pub(crate) async fn revoke_policy(
        &self,
        policy_id: Uuid,
        expected_version: i32,
        reason: String,
        metadata: &CommandMetadata,
    ) -> DomainResult<CommandOutcome> {
        let revoked_by = metadata.actor.id.clone();
        self.transition_policy(policy_id, expected_version, metadata, |policy, now| {
            policy.revoke(expected_version, reason, revoked_by, now)
        })
        .await
    }

    /// Shared load -> mutate -> guarded write -> publish path.
    async fn transition_policy<F>(
        &self,
        policy_id: Uuid,
        expected_version: i32,
        metadata: &CommandMetadata,
        op: F,
    ) -> DomainResult<CommandOutcome>
    where
        F: FnOnce(
            &mut Policy,
            chrono::DateTime<chrono::Utc>,
        ) -> DomainResult<crate::aggregate::Transition>,
    {
        let now = self.now();
        let mut tx = self.begin().await?;

        let mut policy = self
            .storage()
            .policies
            .find_by_id_in_tx(&mut tx, policy_id)
            .await?
            .ok_or_else(|| DomainError::not_found("policy", policy_id))?;

        let transition = op(&mut policy, now)?;

        if transition.is_noop() {
            return Ok(CommandOutcome {
                aggregate_id: policy_id,
                version: transition.new_version,
                event_ids: Vec::new(),
            });
        }

        let applied =
            self.storage().policies.update_in_tx(&mut tx, &policy, expected_version).await?;
        if !applied {
            return Err(Self::write_conflict("policy.version.mismatch", expected_version));
        }

        let event_ids = self
            .persist_transition(
                &mut tx,
                Policy::AGGREGATE_TYPE,
                &policy.aggregate_id(),
                &transition,
                metadata,
                now,
            )
            .await?;
        tx.commit().await.map_err(CoreError::from)?;

        Ok(CommandOutcome { aggregate_id: policy_id, version: transition.new_version, event_ids })
    }
}
