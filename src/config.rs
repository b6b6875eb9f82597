//! 命令行参数与节点启动配置
//! CLI arguments and persisted node configuration

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use serde_json::Value;

use crate::error::NodeError;

/// sentinel-node 命令行参数
#[derive(Parser, Debug)]
#[command(name = "sentinel-node", version, about = "On-device sensor-to-inference node runtime")]
pub struct Args {
    /// 节点配置文件 (JSON), 进程启动时按序重放为 create 请求
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 日志过滤器 (tracing env-filter 语法)
    #[arg(long, default_value = "info")]
    pub log: String,
}

/// 启动时装载的流水线描述
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

/// 单个节点实例的启动描述
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub autostart: bool,
}

pub fn load_pipeline(path: &Path) -> Result<PipelineConfig, NodeError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        NodeError::ResourceUnavailable(format!("config file {}: {e}", path.display()))
    })?;
    serde_json::from_str(&text)
        .map_err(|e| NodeError::ConfigInvalid(format!("config file {}: {e}", path.display())))
}

// ========== JSON 配置取值辅助 ==========

pub fn opt_bool(v: &Value, key: &str, default: bool) -> bool {
    v.get(key).and_then(Value::as_bool).unwrap_or(default)
}

pub fn opt_u32(v: &Value, key: &str, default: u32) -> u32 {
    v.get(key)
        .and_then(Value::as_u64)
        .map(|n| n as u32)
        .unwrap_or(default)
}

pub fn opt_f32(v: &Value, key: &str) -> Option<f32> {
    v.get(key).and_then(Value::as_f64).map(|n| n as f32)
}

pub fn opt_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

pub fn opt_string_array(v: &Value, key: &str) -> Vec<String> {
    v.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// 分界线点表: 整数数组, 允许混入浮点 (向下取整)
pub fn opt_i16_array(v: &Value, key: &str) -> Option<Vec<i16>> {
    v.get(key).and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_f64)
            .map(|n| n as i16)
            .collect()
    })
}
