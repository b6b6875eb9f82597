//! 节点运行时错误分类
//! Error taxonomy for the node runtime

use thiserror::Error;

/// 节点生命周期与数据通路的统一错误类型
/// Unified error type for node lifecycle and data-path operations
#[derive(Debug, Error)]
pub enum NodeError {
    /// 配置缺失或格式错误
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// 底层设备/文件/模型无法打开
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// 启动时声明的上游节点无法解析
    #[error("dependency missing: {0}")]
    DependencyMissing(String),

    /// 控制命令或操作不被该节点支持
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// 线程/内存等系统资源耗尽
    #[error("allocation failed: {0}")]
    AllocationFailed(String),
}

impl NodeError {
    /// 应答消息中的稳定数字错误码 (0 = OK)
    pub fn code(&self) -> u32 {
        match self {
            NodeError::ConfigInvalid(_) => 1,
            NodeError::ResourceUnavailable(_) => 2,
            NodeError::DependencyMissing(_) => 3,
            NodeError::Unsupported(_) => 4,
            NodeError::AllocationFailed(_) => 5,
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(NodeError::ConfigInvalid("x".into()).code(), 1);
        assert_eq!(NodeError::ResourceUnavailable("x".into()).code(), 2);
        assert_eq!(NodeError::DependencyMissing("x".into()).code(), 3);
        assert_eq!(NodeError::Unsupported("x".into()).code(), 4);
        assert_eq!(NodeError::AllocationFailed("x".into()).code(), 5);
    }
}
