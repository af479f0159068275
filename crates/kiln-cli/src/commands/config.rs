//! `kiln config`: print the configuration after file and flag merging

use crate::config::CliConfig;

pub fn execute(config: &CliConfig) -> anyhow::Result<String> {
    config.to_toml()
}
