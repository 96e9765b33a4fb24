use aws_config::{AppName, BehaviorVersion, ConfigLoader, SdkConfig};

/// Get AWS config from the environment, or credentials files, or ambient, etc.
pub async fn init() -> SdkConfig {
	ConfigLoader::default()
		.behavior_version(BehaviorVersion::v2023_11_09())
		.app_name(AppName::new(crate::APP_NAME).unwrap())
		.load()
		.await
}
