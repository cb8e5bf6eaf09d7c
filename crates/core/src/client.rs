use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    error::{DecisionServiceError, Result},
    events::{Event, EventSink, InteractionEvent, ObservationEvent},
    explore::explore,
    mapper::{collapse_to_top, ActionProbability, ContextMapper},
    metadata::ApplicationClientMetadata,
};

/// Outcome of one decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub event_id: String,
    pub application_id: String,
    pub timestamp: DateTime<Utc>,
    /// Chosen action first, with the probability it was chosen with.
    pub ranking: Vec<ActionProbability>,
    pub explored: bool,
}

impl Decision {
    pub fn chosen_action(&self) -> Option<u32> {
        self.ranking.first().map(|a| a.action)
    }
}

/// Reward side of a client. Needs metadata and an event sink, but no model.
#[derive(Clone)]
pub struct RewardReporter {
    metadata: ApplicationClientMetadata,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for RewardReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewardReporter")
            .field("application_id", &self.metadata.application_id)
            .finish_non_exhaustive()
    }
}

impl RewardReporter {
    pub fn new(metadata: ApplicationClientMetadata, events: Arc<dyn EventSink>) -> Self {
        Self { metadata, events }
    }

    pub fn metadata(&self) -> &ApplicationClientMetadata {
        &self.metadata
    }

    /// Reports `reward` for the decision identified by `event_id`.
    pub fn report_reward(&self, event_id: &str, reward: f32) -> Result<()> {
        let event = Event::Observation(ObservationEvent {
            event_id: event_id.to_string(),
            application_id: self.metadata.application_id.clone(),
            timestamp: Utc::now(),
            reward,
        });
        self.events
            .emit(&self.metadata.event_hub_observation_connection_string, &event)
    }
}

/// Decision façade bound to one metadata snapshot and one mapper.
///
/// Nothing is mutated after construction, so a client can be shared across
/// threads and called concurrently. To pick up new metadata build a new client.
pub struct DecisionServiceClient<C> {
    reporter: RewardReporter,
    mapper: Box<dyn ContextMapper<C>>,
}

impl<C> std::fmt::Debug for DecisionServiceClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionServiceClient")
            .field("application_id", &self.metadata().application_id)
            .field("exploration", &self.metadata().is_exploration_enabled)
            .finish_non_exhaustive()
    }
}

impl<C> DecisionServiceClient<C> {
    pub(crate) fn new(
        metadata: ApplicationClientMetadata,
        mapper: Box<dyn ContextMapper<C>>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        if let (Some(expected), Some(actual)) =
            (metadata.training_number_of_actions(), mapper.num_actions())
        {
            if expected != actual {
                return Err(DecisionServiceError::mapper(format!(
                    "model has {actual} actions but application '{}' is configured for {expected}",
                    metadata.application_id
                )));
            }
        }
        Ok(Self {
            reporter: RewardReporter::new(metadata, events),
            mapper,
        })
    }

    pub fn metadata(&self) -> &ApplicationClientMetadata {
        self.reporter.metadata()
    }

    /// Reports `reward` for the decision identified by `event_id`.
    pub fn report_reward(&self, event_id: &str, reward: f32) -> Result<()> {
        self.reporter.report_reward(event_id, reward)
    }

    pub fn reporter(&self) -> &RewardReporter {
        &self.reporter
    }
}

impl<C: Serialize> DecisionServiceClient<C> {
    /// Ranks the actions for `context`, chooses one and records the
    /// interaction under `event_id`.
    ///
    /// With exploration enabled the chosen action is drawn from the mapper's
    /// distribution mixed with `initial_exploration_epsilon`, seeded by the
    /// event id. With exploration disabled the ranking collapses to the top
    /// action at probability 1, whatever the mapper returned.
    pub fn decide(&self, event_id: &str, context: &C) -> Result<Decision> {
        let ranking = self.mapper.map_context(context)?;
        if ranking.is_empty() {
            return Err(DecisionServiceError::Decision(
                "mapper returned no actions".into(),
            ));
        }
        let metadata = self.metadata();
        let explored = metadata.is_exploration_enabled;
        let ranking = if explored {
            explore(event_id, &ranking, metadata.initial_exploration_epsilon)
        } else {
            collapse_to_top(&ranking)
        };

        let context = serde_json::to_value(context)
            .map_err(|err| DecisionServiceError::Decision(format!("context not serializable: {err}")))?;
        let decision = Decision {
            event_id: event_id.to_string(),
            application_id: metadata.application_id.clone(),
            timestamp: Utc::now(),
            ranking,
            explored,
        };
        let event = Event::Interaction(InteractionEvent {
            event_id: decision.event_id.clone(),
            application_id: decision.application_id.clone(),
            timestamp: decision.timestamp,
            context,
            ranking: decision.ranking.clone(),
            explored,
        });
        self.reporter
            .events
            .emit(&metadata.event_hub_interaction_connection_string, &event)?;
        tracing::trace!(event_id, action = ?decision.chosen_action(), "decision served");
        Ok(decision)
    }

    /// Action chosen for `context`.
    pub fn choose_action(&self, event_id: &str, context: &C) -> Result<u32> {
        let decision = self.decide(event_id, context)?;
        decision
            .chosen_action()
            .ok_or_else(|| DecisionServiceError::Decision("mapper returned no actions".into()))
    }
}
