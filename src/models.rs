//! 模型接口与内建实现
//! Model interface and built-in implementations
//!
//! 推理节点通过 `Model` trait 消费结构化结果, 不关心引擎内部的张量
//! 内存管理。真实的加速器后端 (ONNX/TensorRT/NPU) 在 `load` 中按
//! URI 接入; 内建的亮度斑点检测器让流水线在没有任何硬件和模型文件
//! 的环境下也能端到端运行。

use std::time::Instant;

use fast_image_resize::images::Image;
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use ndarray::{Array3, ArrayView3};
use serde_json::Value;
use tracing::debug;

use crate::detection::{Detection, Perf};
use crate::error::NodeError;
use crate::node::frame::{PixelFormat, RawImage};

/// 运行期可调的模型参数
#[derive(Clone, Copy, Debug)]
pub enum ModelOption {
    /// 置信度阈值
    ScoreThreshold,
    /// NMS IOU 阈值
    NmsThreshold,
    /// 最大输出框数
    TopK,
}

/// 推理/后处理协作者的统一接口
pub trait Model: Send {
    fn name(&self) -> &str;

    /// 模型输入尺寸 (宽, 高)
    fn input_shape(&self) -> (u32, u32);

    fn labels(&self) -> &[String];

    fn set_option(&mut self, option: ModelOption, value: f32);

    /// 对一帧预处理后的 CHW 张量执行推理
    fn run(&mut self, input: ArrayView3<f32>) -> Result<(), NodeError>;

    /// 最近一次 `run` 的结构化结果
    fn results(&self) -> &[Detection];

    /// 最近一次 `run` 的耗时统计
    fn performance(&self) -> Perf;
}

/// 按 URI 装载模型
///
/// `builtin:blob` → 亮度斑点检测器; 其余 URI 当作模型文件路径,
/// 文件缺失报 `ResourceUnavailable`, 没有匹配后端报 `Unsupported`。
/// 模型文件旁的标签表优先于配置里的标签覆盖。
pub fn load(uri: &str, labels_override: &[String]) -> Result<Box<dyn Model>, NodeError> {
    if let Some(kind) = uri.strip_prefix("builtin:") {
        return match kind {
            "blob" => Ok(Box::new(BlobModel::new(labels_override))),
            other => Err(NodeError::Unsupported(format!(
                "unknown builtin model '{other}'"
            ))),
        };
    }
    if !std::path::Path::new(uri).exists() {
        return Err(NodeError::ResourceUnavailable(format!(
            "model file not found: {uri}"
        )));
    }
    let labels = match sidecar_labels(uri)? {
        Some(classes) => classes,
        None => labels_override.to_vec(),
    };
    debug!(uri, labels = labels.len(), "model labels resolved");
    Err(NodeError::Unsupported(format!(
        "no engine backend for model '{uri}'"
    )))
}

/// 模型旁车描述: 与模型文件同名的 `<stem>.json`, 其 `classes` 数组
/// 提供标签表。旁车缺失返回 `None`; 存在但无法解析按配置错误上报,
/// 不做静默回退。
pub fn sidecar_labels(uri: &str) -> Result<Option<Vec<String>>, NodeError> {
    let path = std::path::Path::new(uri).with_extension("json");
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path).map_err(|e| {
        NodeError::ResourceUnavailable(format!("model sidecar {}: {e}", path.display()))
    })?;
    let info: Value = serde_json::from_str(&text).map_err(|e| {
        NodeError::ConfigInvalid(format!("model sidecar {}: {e}", path.display()))
    })?;
    let labels: Vec<String> = info
        .get("classes")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok((!labels.is_empty()).then_some(labels))
}

/// 等比缩放 + 填充到方形输入, 输出归一化 CHW 张量
///
/// 图像变换协作者: 检测框因此落在模型输入坐标系里。
pub fn letterbox(img: &RawImage, side: u32) -> Result<Array3<f32>, NodeError> {
    if img.format != PixelFormat::Rgb888 {
        return Err(NodeError::Unsupported("letterbox expects RGB888".into()));
    }
    if img.width == 0 || img.height == 0 {
        return Err(NodeError::ConfigInvalid("empty frame".into()));
    }

    let scale = (side as f32 / img.width as f32).min(side as f32 / img.height as f32);
    let nw = ((img.width as f32 * scale) as u32).max(1);
    let nh = ((img.height as f32 * scale) as u32).max(1);

    let src = Image::from_vec_u8(img.width, img.height, img.data.clone(), PixelType::U8x3)
        .map_err(|e| NodeError::ConfigInvalid(format!("bad frame geometry: {e}")))?;
    let mut resized = Image::new(nw, nh, PixelType::U8x3);
    let mut resizer = Resizer::new();
    resizer
        .resize(
            &src,
            &mut resized,
            &ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear)),
        )
        .map_err(|e| NodeError::ConfigInvalid(format!("letterbox resize: {e}")))?;

    let side = side as usize;
    let (nw, nh) = (nw as usize, nh as usize);
    let top = (side - nh) / 2;
    let left = (side - nw) / 2;
    let buf = resized.buffer();

    let mut tensor = Array3::<f32>::zeros((3, side, side));
    for y in 0..nh {
        for x in 0..nw {
            let base = (y * nw + x) * 3;
            for c in 0..3 {
                tensor[[c, y + top, x + left]] = f32::from(buf[base + c]) / 255.0;
            }
        }
    }
    Ok(tensor)
}

// ========== 内建亮度斑点检测器 ==========

/// 把输入里最亮的连通区域当作一个目标的最小检测器。
/// 配合测试图样采集源使用, 或作为接入真实后端前的管路自检。
pub struct BlobModel {
    threshold: f32,
    top_k: usize,
    input: u32,
    labels: Vec<String>,
    results: Vec<Detection>,
    perf: Perf,
}

impl BlobModel {
    const DEFAULT_INPUT: u32 = 320;

    pub fn new(labels_override: &[String]) -> Self {
        let labels = if labels_override.is_empty() {
            vec!["object".to_string()]
        } else {
            labels_override.to_vec()
        };
        Self {
            threshold: 0.5,
            top_k: 1,
            input: Self::DEFAULT_INPUT,
            labels,
            results: Vec::new(),
            perf: Perf::default(),
        }
    }
}

impl Model for BlobModel {
    fn name(&self) -> &str {
        "blob"
    }

    fn input_shape(&self) -> (u32, u32) {
        (self.input, self.input)
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn set_option(&mut self, option: ModelOption, value: f32) {
        match option {
            ModelOption::ScoreThreshold => self.threshold = value.clamp(0.0, 1.0),
            ModelOption::TopK => self.top_k = (value as usize).max(1),
            // 单斑点输出没有 NMS 阶段
            ModelOption::NmsThreshold => {}
        }
    }

    fn run(&mut self, input: ArrayView3<f32>) -> Result<(), NodeError> {
        let started = Instant::now();
        let shape = input.shape();
        if shape[0] != 3 {
            return Err(NodeError::ConfigInvalid(format!(
                "expected CHW tensor with 3 channels, got {}",
                shape[0]
            )));
        }
        let (h, w) = (shape[1], shape[2]);

        let mut min_x = w;
        let mut max_x = 0usize;
        let mut min_y = h;
        let mut max_y = 0usize;
        let mut sum = 0.0f32;
        let mut hits = 0u32;

        for y in 0..h {
            for x in 0..w {
                let luma = 0.2126 * input[[0, y, x]]
                    + 0.7152 * input[[1, y, x]]
                    + 0.0722 * input[[2, y, x]];
                if luma >= self.threshold {
                    min_x = min_x.min(x);
                    max_x = max_x.max(x);
                    min_y = min_y.min(y);
                    max_y = max_y.max(y);
                    sum += luma;
                    hits += 1;
                }
            }
        }

        self.results.clear();
        // 至少 9 个命中像素才算目标, 避免噪点
        if hits >= 9 {
            let bw = (max_x - min_x + 1) as f32;
            let bh = (max_y - min_y + 1) as f32;
            self.results.push(Detection::new(
                (min_x as f32 + bw / 2.0) / w as f32,
                (min_y as f32 + bh / 2.0) / h as f32,
                bw / w as f32,
                bh / h as f32,
                (sum / hits as f32).clamp(0.0, 1.0),
                0,
            ));
            self.results.truncate(self.top_k);
        }

        self.perf = Perf {
            preprocess: 0.0,
            inference: started.elapsed().as_secs_f32() * 1000.0,
            postprocess: 0.0,
        };
        Ok(())
    }

    fn results(&self) -> &[Detection] {
        &self.results
    }

    fn performance(&self) -> Perf {
        self.perf
    }
}
