// ShellCore - SSH 会话与交互式 Shell 核心
//
// - models: 服务器档案、设置、已知主机
// - ssh: 连接、命令、Shell、会话生命周期
// - services: 存储、可达性检测、电源管理

pub mod models;
pub mod services;
pub mod ssh;
