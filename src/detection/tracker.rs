//! 多目标跟踪器: 帧间身份保持
//! Multi-object tracker assigning persistent identities across frames
//!
//! 纯位置贪心匹配: 新检测按中心点距离匹配上一帧的轨迹, 距离门限内
//! 最近者胜; 等距时按输入下标升序裁决, 保证确定性。未匹配的检测
//! 铸造单调递增的新 id; 未匹配的轨迹保留有限帧数以容忍短暂遮挡。

use super::types::Detection;

/// 一条活跃轨迹
#[derive(Clone, Debug)]
pub struct Track {
    /// 跟踪器生命周期内唯一且单调递增
    pub id: u32,
    /// 最近一次匹配的中心点
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    /// 连续丢失帧数
    pub missed: u32,
    /// 被跟踪的总帧数
    pub age: u32,
}

pub struct Tracker {
    tracks: Vec<Track>,
    next_id: u32,
    /// 匹配距离门限 (归一化坐标)
    max_distance: f32,
    /// 最大允许连续丢失帧数, 超过即过期
    max_missed: u32,
}

impl Tracker {
    pub fn new(max_distance: f32, max_missed: u32) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 0,
            max_distance,
            max_missed,
        }
    }

    /// 当前活跃轨迹
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// 更新一帧检测, 返回与输入等长同序的轨迹 id 序列
    pub fn update(&mut self, detections: &[Detection]) -> Vec<u32> {
        let prev_len = self.tracks.len();
        let mut assigned: Vec<Option<usize>> = vec![None; detections.len()];
        let mut taken = vec![false; prev_len];

        // 1. 门限内的候选配对 (距离, 检测下标, 轨迹下标)
        let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
        for (di, det) in detections.iter().enumerate() {
            for (ti, track) in self.tracks.iter().enumerate() {
                let dx = det.x - track.x;
                let dy = det.y - track.y;
                let dist = (dx * dx + dy * dy).sqrt();
                if dist <= self.max_distance {
                    candidates.push((dist, di, ti));
                }
            }
        }

        // 2. 贪心分配: 距离升序, 等距时输入下标升序 (稳定裁决)
        candidates.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        for (_, di, ti) in candidates {
            if assigned[di].is_none() && !taken[ti] {
                assigned[di] = Some(ti);
                taken[ti] = true;
            }
        }

        // 3. 匹配的轨迹吸收观测, 未匹配的检测铸造新 id
        let mut ids = Vec::with_capacity(detections.len());
        for (di, det) in detections.iter().enumerate() {
            match assigned[di] {
                Some(ti) => {
                    let track = &mut self.tracks[ti];
                    track.x = det.x;
                    track.y = det.y;
                    track.w = det.w;
                    track.h = det.h;
                    track.missed = 0;
                    track.age += 1;
                    ids.push(track.id);
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(Track {
                        id,
                        x: det.x,
                        y: det.y,
                        w: det.w,
                        h: det.h,
                        missed: 0,
                        age: 1,
                    });
                    ids.push(id);
                }
            }
        }

        // 4. 本帧没有观测的旧轨迹计一次丢失, 丢失过久的过期
        for (ti, track) in self.tracks.iter_mut().take(prev_len).enumerate() {
            if !taken[ti] {
                track.missed += 1;
            }
        }
        let max_missed = self.max_missed;
        self.tracks.retain(|t| t.missed <= max_missed);

        ids
    }

    /// 清空所有轨迹并复位 id 计数 (trace 开关切换时调用)
    pub fn clear(&mut self) {
        self.tracks.clear();
        self.next_id = 0;
    }
}

impl Default for Tracker {
    fn default() -> Self {
        // 门限 0.15: 相邻帧同一目标的典型位移远小于画面的 15%
        Self::new(0.15, 30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32) -> Detection {
        Detection::new(x, y, 0.1, 0.1, 0.9, 0)
    }

    #[test]
    fn stationary_detection_keeps_its_id() {
        let mut tracker = Tracker::default();
        let first = tracker.update(&[det(0.5, 0.5)]);
        for _ in 0..20 {
            assert_eq!(tracker.update(&[det(0.5, 0.5)]), first);
        }
    }

    #[test]
    fn identity_follows_position_not_input_order() {
        let mut tracker = Tracker::default();
        let ids = tracker.update(&[det(0.2, 0.5), det(0.8, 0.5)]);
        // 两个目标在输入中交换顺序, 但各自仍在原位附近
        let swapped = tracker.update(&[det(0.81, 0.5), det(0.21, 0.5)]);
        assert_eq!(swapped[0], ids[1]);
        assert_eq!(swapped[1], ids[0]);
    }

    #[test]
    fn equal_distance_resolves_by_ascending_input_index() {
        let mut tracker = Tracker::default();
        let ids = tracker.update(&[det(0.5, 0.5)]);
        // 两个严格等距的检测竞争同一条轨迹: 下标小者继承 id
        let next = tracker.update(&[det(0.375, 0.5), det(0.625, 0.5)]);
        assert_eq!(next[0], ids[0]);
        assert_ne!(next[1], ids[0]);
    }

    #[test]
    fn track_survives_brief_occlusion_then_expires() {
        let mut tracker = Tracker::new(0.15, 3);
        let ids = tracker.update(&[det(0.4, 0.4)]);
        // 3 帧内重现: id 保持
        tracker.update(&[]);
        tracker.update(&[]);
        assert_eq!(tracker.update(&[det(0.41, 0.4)]), ids);
        // 超过保留期后重现: 铸造新 id
        for _ in 0..5 {
            tracker.update(&[]);
        }
        assert!(tracker.is_empty());
        let reborn = tracker.update(&[det(0.41, 0.4)]);
        assert_ne!(reborn, ids);
    }

    #[test]
    fn out_of_gate_detection_gets_new_id() {
        let mut tracker = Tracker::default();
        let ids = tracker.update(&[det(0.1, 0.1)]);
        let far = tracker.update(&[det(0.9, 0.9)]);
        assert_ne!(far, ids);
    }

    #[test]
    fn clear_resets_tracks_and_id_counter() {
        let mut tracker = Tracker::default();
        tracker.update(&[det(0.3, 0.3), det(0.7, 0.7)]);
        tracker.clear();
        assert!(tracker.is_empty());
        assert_eq!(tracker.update(&[det(0.3, 0.3)]), vec![0]);
    }
}
