// AWS SDK client construction.

use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use grader_common::GraderConfig;

/// Attempts per AWS request, including the first.
const MAX_ATTEMPTS: u32 = 3;

/// Clients for every AWS service the host talks to, sharing one config.
#[derive(Clone)]
pub struct AwsClients {
    pub s3: aws_sdk_s3::Client,
    pub sqs: aws_sdk_sqs::Client,
    pub autoscaling: aws_sdk_autoscaling::Client,
}

impl AwsClients {
    /// Load credentials and region from the environment, then apply the
    /// configured region and endpoint overrides.
    pub async fn load(config: &GraderConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .retry_config(RetryConfig::standard().with_max_attempts(MAX_ATTEMPTS));
        if let Some(region) = config.aws_region.clone().filter(|r| !r.is_empty()) {
            loader = loader.region(Region::new(region));
        }
        if let Some(endpoint) = config.aws_endpoint_url.as_deref().filter(|u| !u.is_empty()) {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        Self::from_sdk_config(&sdk_config, config.aws_endpoint_url.is_some())
    }

    fn from_sdk_config(sdk_config: &SdkConfig, custom_endpoint: bool) -> Self {
        // Emulators serve buckets by path, not by virtual host.
        let s3_config = aws_sdk_s3::config::Builder::from(sdk_config)
            .force_path_style(custom_endpoint)
            .build();
        Self {
            s3: aws_sdk_s3::Client::from_conf(s3_config),
            sqs: aws_sdk_sqs::Client::new(sdk_config),
            autoscaling: aws_sdk_autoscaling::Client::new(sdk_config),
        }
    }
}
