//! 检测数据结构定义
//! Data structures for detection results

/// 单个检测框 (归一化中心点坐标, 0..1)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    /// 中心点 x
    pub x: f32,
    /// 中心点 y
    pub y: f32,
    pub w: f32,
    pub h: f32,
    /// 置信度 (0..1)
    pub score: f32,
    /// 类别索引
    pub target: u32,
}

impl Detection {
    pub fn new(x: f32, y: f32, w: f32, h: f32, score: f32, target: u32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            score,
            target,
        }
    }
}

/// 单帧耗时统计 (毫秒)
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Perf {
    pub preprocess: f32,
    pub inference: f32,
    pub postprocess: f32,
}
