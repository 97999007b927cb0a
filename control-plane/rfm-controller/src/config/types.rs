use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct ControllerConfig {
    #[envconfig(from = "HTTP_PORT", default = "8000")]
    pub http_port: u16,

    /// Namespace to watch; empty watches all namespaces.
    /// Env: RFM_K8S_NAMESPACE
    #[envconfig(from = "RFM_K8S_NAMESPACE", default = "")]
    pub k8s_namespace: String,

    /// Polling reconcile interval for autoscaler targets, in seconds.
    /// Env: RFM_SYNC_INTERVAL_SECS
    #[envconfig(from = "RFM_SYNC_INTERVAL_SECS", default = "60")]
    pub sync_interval_secs: u64,

    #[envconfig(nested)]
    pub github: GithubConfig,

    #[envconfig(nested)]
    pub webhook: WebhookConfig,

    #[envconfig(nested)]
    pub fleet: FleetConfig,
}

#[derive(Envconfig, Clone, Debug, Default)]
pub struct GithubConfig {
    /// Personal access token or app installation token used for telemetry
    /// and runner unregistration. Metric-driven autoscalers fail their
    /// reconcile when unset.
    /// Env: RFM_GITHUB_TOKEN
    #[envconfig(from = "RFM_GITHUB_TOKEN")]
    pub token: Option<String>,

    /// Env: RFM_GITHUB_BASE_URL
    #[envconfig(from = "RFM_GITHUB_BASE_URL", default = "https://api.github.com")]
    pub base_url: String,
}

#[derive(Envconfig, Clone, Debug, Default)]
pub struct WebhookConfig {
    /// Shared secret for X-Hub-Signature-256 validation; unset accepts
    /// deliveries unauthenticated.
    /// Env: RFM_WEBHOOK_SECRET
    #[envconfig(from = "RFM_WEBHOOK_SECRET")]
    pub secret: Option<String>,

    /// Batch window of the capacity-reservation pipeline, in seconds.
    /// Env: RFM_BATCH_INTERVAL_SECS
    #[envconfig(from = "RFM_BATCH_INTERVAL_SECS", default = "3")]
    pub batch_interval_secs: u64,

    /// Capacity of the bounded hand-off queue feeding the batch consumer.
    /// Producers await when it is full.
    /// Env: RFM_BATCH_QUEUE_CAPACITY
    #[envconfig(from = "RFM_BATCH_QUEUE_CAPACITY", default = "1024")]
    pub batch_queue_capacity: usize,

    /// Capacity of the non-blocking queue in front of the HTTP handler.
    /// Overflow is signaled to the sender as a retryable failure.
    /// Env: RFM_WEBHOOK_QUEUE_CAPACITY
    #[envconfig(from = "RFM_WEBHOOK_QUEUE_CAPACITY", default = "1024")]
    pub webhook_queue_capacity: usize,
}

#[derive(Envconfig, Clone, Debug)]
pub struct FleetConfig {
    /// Scale-down grace period after a scale-out, unless the autoscaler
    /// overrides it.
    /// Env: RFM_SCALE_DOWN_DELAY_SECS
    #[envconfig(from = "RFM_SCALE_DOWN_DELAY_SECS", default = "600")]
    pub scale_down_delay_secs: u64,

    /// A Running pod with no recorded registration id counts as stuck once
    /// its Ready condition has been true for longer than this.
    /// Env: RFM_REGISTRATION_TIMEOUT_SECS
    #[envconfig(from = "RFM_REGISTRATION_TIMEOUT_SECS", default = "600")]
    pub registration_timeout_secs: u64,

    /// Hard ceiling on the graceful-termination protocol. Must exceed the
    /// ~60s staleness window of GitHub's runner listing cache.
    /// Env: RFM_UNREGISTRATION_TIMEOUT_SECS
    #[envconfig(from = "RFM_UNREGISTRATION_TIMEOUT_SECS", default = "600")]
    pub unregistration_timeout_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            scale_down_delay_secs: 600,
            registration_timeout_secs: 600,
            unregistration_timeout_secs: 600,
        }
    }
}
