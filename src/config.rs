//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONVOY__*` 覆盖（双下划线表示嵌套，如 `CONVOY__GATEWAY__BIND_ADDR=0.0.0.0:8002`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub persistence: PersistenceSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// [gateway] 段：监听地址、数据库、连接上限
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// SQLite 文件路径；未设置时使用内存存储（进程退出即丢失）
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_path: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8002".to_string()
}

fn default_max_connections() -> usize {
    1000
}

/// [persistence] 段：checkpoint 写入的重试策略
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

/// [session] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionSection {
    /// 等待人工输入的上限（秒）；不设置则无限等待
    pub input_timeout_secs: Option<u64>,
}

/// 从 config 目录加载配置，环境变量 CONVOY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CONVOY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONVOY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.gateway.bind_addr, "127.0.0.1:8002");
        assert!(config.gateway.database_path.is_none());
        assert_eq!(config.persistence.max_attempts, 3);
        assert_eq!(config.persistence.initial_backoff_ms, 100);
        assert_eq!(config.persistence.max_backoff_ms, 2000);
        assert!(config.session.input_timeout_secs.is_none());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[gateway]\nbind_addr = \"0.0.0.0:9100\"\ndatabase_path = \"sessions.db\"\n\n[persistence]\nmax_attempts = 5\n\n[session]\ninput_timeout_secs = 300"
        )
        .unwrap();

        let config = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.gateway.bind_addr, "0.0.0.0:9100");
        assert_eq!(config.gateway.database_path, Some(PathBuf::from("sessions.db")));
        assert_eq!(config.gateway.max_connections, 1000);
        assert_eq!(config.persistence.max_attempts, 5);
        assert_eq!(config.persistence.initial_backoff_ms, 100);
        assert_eq!(config.session.input_timeout_secs, Some(300));
    }
}
