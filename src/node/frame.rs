//! 视频帧与共享引用
//! Video frames and shared frame references
//!
//! 帧由采集节点生产, 经邮箱扇出给任意数量的消费节点。发布后的帧
//! 是只读的: 引用计数通过 `Arc` 表达, 最后一个持有者释放时载荷
//! 恰好被销毁一次。需要修改像素的消费者必须先克隆。

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use fast_image_resize::images::Image;
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::error::NodeError;

/// 像素格式 (当前运行时只在 RGB888 上工作)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb888,
}

/// 原始图像载荷
#[derive(Clone)]
pub struct RawImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl RawImage {
    pub fn rgb(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            data,
            width,
            height,
            format: PixelFormat::Rgb888,
        }
    }

    /// 编码为 base64 JPEG, 用于 preview/debug 事件
    ///
    /// `target` 给定时先缩放到目标尺寸 (不保持宽高比, 与预览通道的
    /// 固定缩略图尺寸一致)。
    pub fn to_jpeg_base64(
        &self,
        target: Option<(u32, u32)>,
        quality: u8,
    ) -> Result<String, NodeError> {
        if self.format != PixelFormat::Rgb888 {
            return Err(NodeError::Unsupported("jpeg encode expects RGB888".into()));
        }

        let (buf, w, h) = match target {
            Some((tw, th)) if (tw, th) != (self.width, self.height) => {
                let src = Image::from_vec_u8(
                    self.width,
                    self.height,
                    self.data.clone(),
                    PixelType::U8x3,
                )
                .map_err(|e| NodeError::ConfigInvalid(format!("bad frame geometry: {e}")))?;
                let mut dst = Image::new(tw, th, PixelType::U8x3);
                let mut resizer = Resizer::new();
                resizer
                    .resize(
                        &src,
                        &mut dst,
                        &ResizeOptions::new()
                            .resize_alg(ResizeAlg::Convolution(FilterType::Bilinear)),
                    )
                    .map_err(|e| NodeError::ConfigInvalid(format!("preview resize: {e}")))?;
                (dst.into_vec(), tw, th)
            }
            _ => (self.data.clone(), self.width, self.height),
        };

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, quality)
            .encode(&buf, w, h, ExtendedColorType::Rgb8)
            .map_err(|e| NodeError::ConfigInvalid(format!("jpeg encode: {e}")))?;

        Ok(STANDARD.encode(&jpeg))
    }
}

/// 一帧采集数据, 发布后不可变
pub struct VideoFrame {
    pub image: RawImage,
    /// 采集节点内单调递增的帧序号
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

impl VideoFrame {
    pub fn new(image: RawImage, seq: u64) -> Self {
        Self {
            image,
            seq,
            timestamp: Utc::now(),
        }
    }
}

/// 共享帧引用: clone 即增加引用, drop 即释放;
/// 载荷在最后一个引用释放时销毁, 且只销毁一次
pub type SharedFrame = Arc<VideoFrame>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_freed_exactly_once_after_last_release() {
        let frame = Arc::new(VideoFrame::new(RawImage::rgb(2, 2, vec![0; 12]), 1));
        let a = Arc::clone(&frame); // acquire
        let b = Arc::clone(&frame); // acquire
        assert_eq!(Arc::strong_count(&frame), 3);
        drop(a);
        drop(frame);
        // 最后一个引用仍然存活, 载荷可访问
        assert_eq!(Arc::strong_count(&b), 1);
        assert_eq!(b.image.data.len(), 12);
    }

    #[test]
    fn jpeg_preview_roundtrip() {
        let img = RawImage::rgb(64, 48, vec![200; 64 * 48 * 3]);
        let b64 = img.to_jpeg_base64(Some((32, 24)), 50).unwrap();
        assert!(!b64.is_empty());
        // base64 解码后应是 JPEG 魔数
        let bytes = STANDARD.decode(b64.as_bytes()).unwrap();
        assert_eq!(&bytes[..2], &[0xff, 0xd8]);
    }
}
