mod types;

pub use types::{ControllerConfig, FleetConfig, GithubConfig, WebhookConfig};
