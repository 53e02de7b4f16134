// 服务模块（会话核心之外的协作者）

pub mod power;
pub mod reachability;
pub mod storage;
