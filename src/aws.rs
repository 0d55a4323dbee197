//! Shared AWS SDK configuration

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_types::SdkConfig;

/// Static access key pair taken from the settings
#[derive(Clone)]
pub struct StaticKeys {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Loads SDK configuration for `region`. Without explicit keys the default
/// provider chain (environment, profile, instance role) is used.
pub async fn load_sdk_config(region: &str, keys: Option<StaticKeys>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));

    if let Some(keys) = keys {
        loader = loader.credentials_provider(Credentials::new(
            keys.access_key_id,
            keys.secret_access_key,
            None,
            None,
            "rdsdump-settings",
        ));
    }

    loader.load().await
}
