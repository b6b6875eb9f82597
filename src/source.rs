//! 采集源接口与内建测试图样源
//! Capture source interface and built-in test-pattern source
//!
//! 真实的摄像头/解码后端在 `open` 中按 URI 方案接入; 运行时核心只
//! 依赖 `FrameSource`。内建 `pattern:` 源渲染一个按帧率节拍垂直往返
//! 运动的亮色方块, 让采集→推理→跟踪→计数全链路可以离线验证。

use std::time::{Duration, Instant};

use crate::error::NodeError;
use crate::node::frame::RawImage;

/// 采集源的几何与帧率
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// 采集协作者: `read` 阻塞到下一帧可用
pub trait FrameSource: Send {
    fn info(&self) -> SourceInfo;

    fn read(&mut self) -> Result<RawImage, NodeError>;
}

/// 按 URI 打开采集源
pub fn open(uri: &str, info: SourceInfo) -> Result<Box<dyn FrameSource>, NodeError> {
    if info.width == 0 || info.height == 0 {
        return Err(NodeError::ConfigInvalid(format!(
            "invalid capture geometry {}x{}",
            info.width, info.height
        )));
    }
    match uri.split_once(':') {
        Some(("pattern", _)) => Ok(Box::new(PatternSource::new(info))),
        _ => Err(NodeError::ResourceUnavailable(format!(
            "no capture backend for '{uri}'"
        ))),
    }
}

/// 方块垂直往返一个来回的帧数
const SWEEP_PERIOD: u64 = 120;

/// 测试图样源: 深灰背景上一个亮色方块做垂直往返运动
pub struct PatternSource {
    info: SourceInfo,
    seq: u64,
    next_due: Option<Instant>,
}

impl PatternSource {
    pub fn new(info: SourceInfo) -> Self {
        Self {
            info,
            seq: 0,
            next_due: None,
        }
    }

    /// 按配置帧率节拍, fps = 0 时不限速
    fn pace(&mut self) {
        if self.info.fps == 0 {
            return;
        }
        let interval = Duration::from_secs_f64(1.0 / f64::from(self.info.fps));
        let now = Instant::now();
        match self.next_due {
            None => self.next_due = Some(now + interval),
            Some(due) => {
                if now < due {
                    std::thread::sleep(due - now);
                }
                // 落后太多时重新对齐, 不追帧
                self.next_due = Some(Instant::now().max(due) + interval);
            }
        }
    }
}

impl FrameSource for PatternSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn read(&mut self) -> Result<RawImage, NodeError> {
        self.pace();

        let (w, h) = (self.info.width, self.info.height);
        let mut data = vec![16u8; (w * h * 3) as usize];

        // 0→1→0 的三角波相位
        let t = (self.seq % SWEEP_PERIOD) as f32 / SWEEP_PERIOD as f32;
        let phase = if t < 0.5 { t * 2.0 } else { 2.0 - t * 2.0 };

        let side = (h / 5).max(8).min(h);
        let half = side / 2;
        let cx = w / 2;
        let cy = half + (phase * (h - side) as f32) as u32;

        let x0 = cx.saturating_sub(half);
        let y0 = cy - half;
        for y in y0..(y0 + side).min(h) {
            for x in x0..(x0 + side).min(w) {
                let base = ((y * w + x) * 3) as usize;
                data[base] = 240;
                data[base + 1] = 240;
                data[base + 2] = 240;
            }
        }

        self.seq += 1;
        Ok(RawImage::rgb(w, h, data))
    }
}
