//! Command handlers for the `Action` aggregate.

use uuid::Uuid;

use crate::{
    aggregate::AggregateRoot,
    domain::Action,
    error::{CoreError, DomainError, DomainResult},
};

use super::{CommandExecutor, CommandMetadata, CommandOutcome};

impl CommandExecutor {
    pub(crate) async fn create_action(
        &self,
        name: String,
        description: Option<String>,
        metadata: &CommandMetadata,
    ) -> DomainResult<CommandOutcome> {
        let now = self.now();
        let (action, transition) = Action::create(name, description, now)?;

        let mut tx = self.begin().await?;
        self.storage().actions.insert_in_tx(&mut tx, &action).await?;
        let event_ids = self
            .persist_transition(
                &mut tx,
                Action::AGGREGATE_TYPE,
                &action.aggregate_id(),
                &transition,
                metadata,
                now,
            )
            .await?;
        tx.commit().await.map_err(CoreError::from)?;

        Ok(CommandOutcome { aggregate_id: action.id, version: transition.new_version, event_ids })
    }

    pub(crate) async fn update_action(
        &self,
        action_id: Uuid,
        expected_version: i32,
        name: Option<String>,
        description: Option<String>,
        metadata: &CommandMetadata,
    ) -> DomainResult<CommandOutcome> {
        self.transition_action(action_id, expected_version, metadata, |action, now| {
            action.update(expected_version, name, description, now)
        })
        .await
    }

    pub(crate) async fn complete_action(
        &self,
        action_id: Uuid,
        expected_version: i32,
        metadata: &CommandMetadata,
    ) -> DomainResult<CommandOutcome> {
        self.transition_action(action_id, expected_version, metadata, |action, now| {
            action.complete(expected_version, now)
        })
        .await
    }

    pub(crate) async fn cancel_action(
        &self,
        action_id: Uuid,
        expected_version: i32,
        reason: String,
        metadata: &CommandMetadata,
    ) -> DomainResult<CommandOutcome> {
        self.transition_action(action_id, expected_version, metadata, |action, now| {
            action.cancel(expected_version, reason, now)
        })
        .await
    }

    /// Shared load -> mutate -> guarded write -> publish path.
    async fn transition_action<F>(
        &self,
        action_id: Uuid,
        expected_version: i32,
        metadata: &CommandMetadata,
        op: F,
    ) -> DomainResult<CommandOutcome>
    where
        F: FnOnce(
            &mut Action,
            chrono::DateTime<chrono::Utc>,
        ) -> DomainResult<crate::aggregate::Transition>,
    {
        let now = self.now();
        let mut tx = self.begin().await?;

        let mut action = self
            .storage()
            .actions
            .find_by_id_in_tx(&mut tx, action_id)
            .await?
            .ok_or_else(|| DomainError::not_found("action", action_id))?;

        let transition = op(&mut action, now)?;

        if transition.is_noop() {
            return Ok(CommandOutcome {
                aggregate_id: action_id,
                version: transition.new_version,
                event_ids: Vec::new(),
            });
        }

        let applied =
            self.storage().actions.update_in_tx(&mut tx, &action, expected_version).await?;
        if !applied {
            return Err(Self::write_conflict("action.version.mismatch", expected_version));
        }

        let event_ids = self
            .persist_transition(
                &mut tx,
                Action::AGGREGATE_TYPE,
                &action.aggregate_id(),
                &transition,
                metadata,
                now,
            )
            .await?;
        tx.commit().await.map_err(CoreError::from)?;

        Ok(CommandOutcome { aggregate_id: action_id, version: transition.new_version, event_ids })
    }
}
