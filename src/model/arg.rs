//! 命令行参数

use clap::Parser;

/// Tesla 仪表盘后端
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// 配置文件路径（默认 config.json）
    #[arg(short, long)]
    pub config: Option<String>,
}
