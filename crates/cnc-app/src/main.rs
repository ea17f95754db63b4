//! CNC 主机控制服务器
//!
//! 每次接受一个客户端；客户端 `exit` 时服务退出，断开时等待下一个客户端。
//! 实时子系统和寄存器总线使用仿真实现，跨会话保持位置。

use anyhow::{Context, Result};
use clap::Parser;
use cnc_core::config::MachineParameters;
use cnc_server::{
    EmulationModbusSender, EmulationRtSender, GCodeServer, ProgramExecutor, ScriptBuilder,
    SessionEnd,
};
use std::io::BufReader;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "CNC host controller server")]
struct Args {
    #[arg(short, long, help = "Machine parameters file (JSON); defaults are used when omitted")]
    machine_config: Option<PathBuf>,
    #[arg(short, long, default_value_t = 8888, help = "TCP port to listen on")]
    port: u16,
    #[arg(short, long, default_value = "0.0.0.0", help = "Address to bind")]
    bind: String,
    #[arg(short, long, help = "Enable debug logging")]
    verbose: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<MachineParameters> {
    match path {
        Some(path) => MachineParameters::from_json_file(path)
            .with_context(|| format!("loading machine parameters from {}", path.display())),
        None => {
            info!("No machine parameters file given, using defaults");
            Ok(MachineParameters::default())
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing::subscriber::set_global_default(FmtSubscriber::builder().with_max_level(level).finish())?;

    info!("Starting CNC server...");

    let config = Arc::new(load_config(args.machine_config.as_ref())?);
    let rt = Arc::new(EmulationRtSender::new(Arc::clone(&config)));
    let modbus = Arc::new(EmulationModbusSender::new());
    let builder = Arc::new(ScriptBuilder::new(Arc::clone(&config)));

    let address = format!("{}:{}", args.bind, args.port);
    let listener = TcpListener::bind(&address).with_context(|| format!("binding {}", address))?;
    info!("Listening on {}", address);

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                continue;
            }
        };
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!("Client connected: {}", peer);

        let reader = BufReader::new(stream.try_clone()?);
        let server = GCodeServer::new(
            Arc::clone(&config),
            rt.clone(),
            builder.clone(),
            ProgramExecutor::factory(rt.clone(), modbus.clone()),
            stream,
        );

        match server.run(reader) {
            Ok(SessionEnd::Exit) => {
                info!("Client {} requested exit", peer);
                break;
            }
            Ok(SessionEnd::Disconnected) => info!("Client {} disconnected", peer),
            Err(e) => error!("Session with {} failed: {}", peer, e),
        }
    }

    info!("CNC server stopped");
    Ok(())
}
