use std::path::PathBuf;

const APP_DIR: &str = ".flowscribe";

/// 数据目录（~/.flowscribe），无法获取主目录时回退到当前目录
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(APP_DIR))
}

/// 默认配置文件路径
pub fn default_config_path() -> PathBuf {
    data_dir().join("config.toml")
}
