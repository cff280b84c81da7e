//! 日志系统配置
//!
//! 控制台输出 + 可选的文件持久化（按天滚动），启动时清理过期日志

use crate::config::LogConfig;
use chrono::Local;
use std::fs;
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "media-ingest";

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// 环境变量 `RUST_LOG` 优先于配置中的级别。
/// 全局订阅器已存在时（例如被宿主程序初始化过）保持原样。
///
/// # Arguments
/// * `config` - 日志配置
///
/// # Returns
/// * `LogGuard` - 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(true);

    let file_appender = if config.enabled {
        build_file_appender(&config.log_dir)
    } else {
        None
    };

    match file_appender {
        Some(appender) => {
            let (non_blocking, file_guard) = tracing_appender::non_blocking(appender);

            // 文件输出层（不带 ANSI 颜色）
            let file_layer = fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
                .with_ansi(false)
                .with_writer(non_blocking);

            if let Err(e) = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .try_init()
            {
                eprintln!("日志订阅器已存在，跳过初始化: {}", e);
            }

            info!(
                "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}",
                config.log_dir, config.retention_days, config.level
            );

            cleanup_old_logs(&config.log_dir, config.retention_days);

            LogGuard {
                _file_guard: Some(file_guard),
            }
        }
        None => {
            if let Err(e) = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init()
            {
                eprintln!("日志订阅器已存在，跳过初始化: {}", e);
            }

            info!("日志系统初始化完成（仅控制台输出）");

            LogGuard { _file_guard: None }
        }
    }
}

/// 创建按天滚动的文件写入器
///
/// 文件名格式: media-ingest.YYYY-MM-DD.log，失败时回退到仅控制台输出
fn build_file_appender(log_dir: &Path) -> Option<RollingFileAppender> {
    if let Err(e) = fs::create_dir_all(log_dir) {
        eprintln!("创建日志目录失败: {:?}, 错误: {}", log_dir, e);
        return None;
    }

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(log_dir)
    {
        Ok(appender) => Some(appender),
        Err(e) => {
            eprintln!("创建日志文件失败: {}, 回退到仅控制台输出", e);
            None
        }
    }
}

/// 清理过期日志文件，返回删除数量
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted_count = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(file_date) = path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(extract_date_from_filename)
        else {
            continue;
        };

        if today.signed_duration_since(file_date) > retention {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e);
            } else {
                deleted_count += 1;
                tracing::debug!("已删除过期日志文件: {:?}", path);
            }
        }
    }

    if deleted_count > 0 {
        info!("已清理 {} 个过期日志文件", deleted_count);
    }
    deleted_count
}

/// 从文件名中提取日期: media-ingest.YYYY-MM-DD.log -> YYYY-MM-DD
fn extract_date_from_filename(filename: &str) -> Option<chrono::NaiveDate> {
    let name = filename
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_prefix('.')?
        .strip_suffix(".log")?;
    chrono::NaiveDate::parse_from_str(name, "%Y-%m-%d").ok()
}
