use serde::{Deserialize, Serialize};

/// 创建作业时遇到同名作业的处理方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CreateJobConflictAction {
    /// 保留已有作业，不做任何修改
    Ignore,
    /// 用新的作业定义覆盖已有作业
    Update,
    /// 返回 `JobAlreadyExists` 错误
    Throw,
}

/// 保存作业详情的结果
///
/// 乐观并发冲突是集群中多个实例竞争同一作业时的正常结果，不是错误。
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// 存储中的版本号已变化，或作业已被并发删除
    ConcurrentlyModified,
}

impl SaveOutcome {
    pub fn is_saved(self) -> bool {
        matches!(self, SaveOutcome::Saved)
    }
}

/// chrono 时长以毫秒整数形式序列化
pub mod duration_millis {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.num_milliseconds()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let millis = Option::<i64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::milliseconds))
    }
}
