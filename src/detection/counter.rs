//! 区域计数器: 统计轨迹跨越分界线的次数
//! Zone counter accumulating directional boundary-line crossings
//!
//! 分界线在 0..100 的归一化百分比坐标系中配置 (与控制协议一致),
//! 每条线维护一对方向计数。跨越判定依赖轨迹上一次所在的侧别记忆,
//! 点恰好落在线上时保持原侧别, 不计一次跨越。

use std::collections::HashMap;

use crate::error::NodeError;

/// 一条分界线 (百分比坐标)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Splitter {
    pub x1: i16,
    pub y1: i16,
    pub x2: i16,
    pub y2: i16,
}

impl Splitter {
    /// 点在线的哪一侧: 叉积符号, 0 表示在线上
    fn side_of(&self, x: f32, y: f32) -> i8 {
        let cross = (f32::from(self.x2) - f32::from(self.x1)) * (y - f32::from(self.y1))
            - (f32::from(self.y2) - f32::from(self.y1)) * (x - f32::from(self.x1));
        if cross > 0.0 {
            1
        } else if cross < 0.0 {
            -1
        } else {
            0
        }
    }
}

/// 侧别记忆的保留时长 (以 update 调用计), 超时的轨迹条目被清理
const SIDE_MEMORY_TICKS: u64 = 1024;

#[derive(Default)]
pub struct ZoneCounter {
    splitters: Vec<Splitter>,
    /// 每条线的方向计数: [正侧→负侧, 负侧→正侧]
    counts: Vec<[u32; 2]>,
    /// 轨迹 id → 每条线上一次的侧别 (0 = 尚未知)
    sides: HashMap<u32, Vec<i8>>,
    last_seen: HashMap<u32, u64>,
    tick: u64,
}

impl ZoneCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 配置分界线: 扁平点表, 每 4 个数一条线 [x1,y1,x2,y2,...]
    /// 重新配置会清空计数与侧别记忆
    pub fn set_splitter(&mut self, points: &[i16]) -> Result<(), NodeError> {
        if points.is_empty() || points.len() % 4 != 0 {
            return Err(NodeError::ConfigInvalid(format!(
                "splitter expects 4 values per line, got {}",
                points.len()
            )));
        }
        if let Some(p) = points.iter().find(|p| !(0..=100).contains(*p)) {
            return Err(NodeError::ConfigInvalid(format!(
                "splitter point {p} outside the 0..=100 percent range"
            )));
        }
        self.splitters = points
            .chunks_exact(4)
            .map(|p| Splitter {
                x1: p[0],
                y1: p[1],
                x2: p[2],
                y2: p[3],
            })
            .collect();
        self.clear();
        Ok(())
    }

    /// 当前分界线配置 (扁平点表)
    pub fn splitter(&self) -> Vec<i16> {
        self.splitters
            .iter()
            .flat_map(|s| [s.x1, s.y1, s.x2, s.y2])
            .collect()
    }

    /// 喂入一个轨迹位置 (百分比坐标)。
    /// `track = None` 表示本帧没有活跃轨迹, 只推进内部时钟, 绝不计数。
    pub fn update(&mut self, track: Option<u32>, x: f32, y: f32) {
        self.tick += 1;

        if let Some(id) = track {
            self.last_seen.insert(id, self.tick);
            let sides = self
                .sides
                .entry(id)
                .or_insert_with(|| vec![0; self.splitters.len()]);
            for (i, line) in self.splitters.iter().enumerate() {
                let side = line.side_of(x, y);
                if side == 0 {
                    continue;
                }
                let prev = sides[i];
                if prev != 0 && prev != side {
                    if prev > 0 {
                        self.counts[i][0] += 1;
                    } else {
                        self.counts[i][1] += 1;
                    }
                }
                sides[i] = side;
            }
        }

        // 周期性清理长期未出现的轨迹记忆
        if self.tick % SIDE_MEMORY_TICKS == 0 {
            let horizon = self.tick.saturating_sub(SIDE_MEMORY_TICKS);
            let last_seen = &self.last_seen;
            self.sides.retain(|id, _| {
                last_seen.get(id).copied().unwrap_or(0) > horizon
            });
            let tick = self.tick;
            self.last_seen.retain(|_, seen| tick - *seen <= SIDE_MEMORY_TICKS);
        }
    }

    /// 每条线的累计方向计数
    pub fn get(&self) -> Vec<[u32; 2]> {
        self.counts.clone()
    }

    /// 清零计数与侧别记忆, 保留分界线配置
    pub fn clear(&mut self) {
        self.counts = vec![[0, 0]; self.splitters.len()];
        self.sides.clear();
        self.last_seen.clear();
        self.tick = 0;
    }
}
