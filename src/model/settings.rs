//! 运行时配置
//!
//! 持有当前配置，保留策略可在运行时修改并写回配置文件。

use parking_lot::RwLock;

use crate::token_stats::{RetentionConfig, RetentionConfigProvider};

use super::config::Config;

pub struct SettingsStore {
    config: RwLock<Config>,
}

impl SettingsStore {
    pub fn new(config: Config) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }
}

impl RetentionConfigProvider for SettingsStore {
    fn retention_config(&self) -> RetentionConfig {
        self.config.read().retention.clone()
    }

    /// 写回失败时恢复旧值
    fn update_retention_config(&self, retention: RetentionConfig) -> anyhow::Result<()> {
        let mut config = self.config.write();
        let previous = std::mem::replace(&mut config.retention, retention);
        if config.config_path().is_some() {
            if let Err(e) = config.save() {
                config.retention = previous;
                return Err(e);
            }
        }
        Ok(())
    }
}
