use spire_core::{Result, SpireError};

/// `find_bucket` 的结果：命中某个池化桶，或落入“超大”哨兵。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BucketSlot {
    Pooled(usize),
    /// 请求超过所有桶的规范尺寸，需要分配一块不入池、尺寸恰好的专用块。
    Oversized,
}

impl BucketSlot {
    pub fn index(self) -> Option<usize> {
        match self {
            BucketSlot::Pooled(index) => Some(index),
            BucketSlot::Oversized => None,
        }
    }
}

/// `BucketTable` 把任意请求尺寸映射到一个规范桶尺寸，使相近尺寸的请求共享同一批原生块。
///
/// # 核心机制（How）
/// - 构造时把每个阈值向上对齐到 `alignment`，排序并去重，得到严格递增的规范尺寸序列；
/// - 查询时二分查找第一个 `canonical_size >= requested` 的桶，恰好相等时不会多向上取一档。
///
/// # 契约说明（What）
/// - **不变量**：`sizes[i] < sizes[i + 1]`，且每个尺寸都是 `alignment` 的整数倍；
/// - **退化**：阈值为空时表中没有任何池化桶，所有请求都返回 [`BucketSlot::Oversized`]。
#[derive(Clone, Debug)]
pub struct BucketTable {
    sizes: Vec<u32>,
    alignment: u32,
}

impl BucketTable {
    pub fn new(thresholds: &[u32], alignment: u32) -> Result<Self> {
        if alignment == 0 {
            return Err(SpireError::InvalidConfig {
                detail: "bucket alignment must be non-zero".to_owned(),
            });
        }
        let mut sizes = Vec::with_capacity(thresholds.len());
        for &threshold in thresholds {
            let aligned = u64::from(threshold).div_ceil(u64::from(alignment)) * u64::from(alignment);
            let aligned = u32::try_from(aligned).map_err(|_| SpireError::InvalidConfig {
                detail: format!("bucket threshold {threshold} overflows when aligned to {alignment}"),
            })?;
            // 零字节阈值对齐后仍为 0，不构成可用的桶。
            if aligned > 0 {
                sizes.push(aligned);
            }
        }
        sizes.sort_unstable();
        sizes.dedup();
        Ok(Self { sizes, alignment })
    }

    /// 查找能容纳 `requested` 字节的最小桶。
    pub fn find_bucket(&self, requested: u32) -> BucketSlot {
        let index = self.sizes.partition_point(|&size| size < requested);
        if index < self.sizes.len() {
            BucketSlot::Pooled(index)
        } else {
            BucketSlot::Oversized
        }
    }

    /// 池化桶的规范尺寸；哨兵或越界下标返回 `None`。
    pub fn canonical_size(&self, slot: BucketSlot) -> Option<u32> {
        slot.index().and_then(|index| self.sizes.get(index).copied())
    }

    /// 池化桶数量（不含哨兵）。
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn sizes(&self) -> &[u32] {
        &self.sizes
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }
}
