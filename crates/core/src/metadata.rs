//! Application metadata records shared between clients and the control plane.

use serde::{Deserialize, Serialize};

use crate::train_args;

/// Key of the client record inside the settings container.
pub const LATEST_CLIENT_SETTINGS_KEY: &str = "mwt-settings/client";
/// Key of the administrative record inside the settings container.
pub const EXTRA_SETTINGS_KEY: &str = "mwt-settings/extra";

const fn default_experimental_unit_duration() -> u32 {
    3600
}

/// Per-application configuration read by every client.
///
/// Missing fields deserialize to their defaults so that partially written
/// records (e.g. a fresh record created by a settings update) remain readable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApplicationClientMetadata {
    #[serde(alias = "ApplicationID")]
    pub application_id: String,
    #[serde(alias = "TrainArguments")]
    pub train_arguments: String,
    #[serde(alias = "BYOMTrainArguments")]
    pub byom_train_arguments: Option<String>,
    #[serde(alias = "EventHubInteractionConnectionString")]
    pub event_hub_interaction_connection_string: String,
    #[serde(alias = "EventHubObservationConnectionString")]
    pub event_hub_observation_connection_string: String,
    #[serde(alias = "IsExplorationEnabled")]
    pub is_exploration_enabled: bool,
    #[serde(alias = "InitialExplorationEpsilon")]
    pub initial_exploration_epsilon: f32,
    #[serde(alias = "ModelBlobUri")]
    pub model_blob_uri: String,
    #[serde(alias = "AppInsightsKey")]
    pub app_insights_key: String,
}

impl ApplicationClientMetadata {
    /// Fixed number of actions configured for training, `None` when variable.
    pub fn training_number_of_actions(&self) -> Option<u32> {
        train_args::training_number_of_actions(
            &self.train_arguments,
            self.byom_train_arguments.as_deref(),
        )
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionType {
    /// One action out of a fixed action set.
    #[default]
    SingleAction,
    /// Several actions out of a variable action set.
    MultiActions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainFrequency {
    #[default]
    Low,
    High,
}

/// Administrative fields. Clients never read this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApplicationExtraMetadata {
    pub subscription_id: String,
    pub azure_resource_group_name: String,
    pub decision_type: DecisionType,
    pub train_frequency: TrainFrequency,
    pub model_id: String,
    /// Seconds within which a reward is joined to its decision.
    pub experimental_unit_duration: u32,
    pub settings_token_uri1: String,
    pub settings_token_uri2: String,
}

impl Default for ApplicationExtraMetadata {
    fn default() -> Self {
        Self {
            subscription_id: String::new(),
            azure_resource_group_name: String::new(),
            decision_type: DecisionType::default(),
            train_frequency: TrainFrequency::default(),
            model_id: String::new(),
            experimental_unit_duration: default_experimental_unit_duration(),
            settings_token_uri1: String::new(),
            settings_token_uri2: String::new(),
        }
    }
}

/// Partial update of [`ApplicationClientMetadata`]. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub train_arguments: Option<String>,
    #[serde(alias = "byomtrainArguments")]
    pub byom_train_arguments: Option<String>,
    pub initial_exploration_epsilon: Option<f32>,
    pub is_exploration_enabled: Option<bool>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.train_arguments.is_none()
            && self.byom_train_arguments.is_none()
            && self.initial_exploration_epsilon.is_none()
            && self.is_exploration_enabled.is_none()
    }

    /// Overwrites the supplied fields of `meta`.
    pub fn apply_to(&self, meta: &mut ApplicationClientMetadata) {
        if let Some(args) = &self.train_arguments {
            meta.train_arguments = args.clone();
        }
        if let Some(args) = &self.byom_train_arguments {
            meta.byom_train_arguments = Some(args.clone());
        }
        if let Some(epsilon) = self.initial_exploration_epsilon {
            meta.initial_exploration_epsilon = epsilon;
        }
        if let Some(enabled) = self.is_exploration_enabled {
            meta.is_exploration_enabled = enabled;
        }
    }
}
